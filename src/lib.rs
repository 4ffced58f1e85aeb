pub mod bybit_api;
pub mod config;
pub mod exchange;
pub mod indicators;
pub mod journal;
pub mod position_manager;
pub mod risk_manager;
pub mod strategy;
pub mod strategy_scalp;
pub mod strategy_vote;
pub mod telegram;
pub mod trader;
pub mod types;

/// Hands dirty pages back to the OS between decision ticks.
#[cfg(feature = "jemalloc")]
pub fn jemalloc_purge() {
    use tikv_jemalloc_ctl::epoch;
    // advancing the epoch makes jemalloc evaluate its decay windows
    if let Ok(e) = epoch::mib() {
        let _ = e.advance();
    }
    log::debug!("jemalloc: epoch advanced, dirty pages scheduled for release");
}
