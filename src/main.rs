#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use tokio::sync::watch;

use xrp_trader::bybit_api::BybitClient;
use xrp_trader::config::Config;
use xrp_trader::journal::FileJournal;
use xrp_trader::telegram::{LogNotifier, Notifier, TelegramBot};
use xrp_trader::trader::{build_engine, Trader};

/// Single-position perpetual futures trader for Bybit.
#[derive(Parser, Debug)]
#[command(name = "xrp_trader", version)]
struct Cli {
    /// Force the Bybit testnet regardless of BYBIT_TESTNET.
    #[arg(long)]
    testnet: bool,

    /// Run the 5m/15m scalp strategy instead of the hourly vote.
    #[arg(long)]
    scalp: bool,

    /// Run one decision tick and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("LOG_LEVEL", "info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    // CLI flags take precedence over the environment
    if cli.scalp {
        std::env::set_var("SCALP_MODE", "true");
    }
    if cli.testnet {
        std::env::set_var("BYBIT_TESTNET", "true");
    }

    let config = Config::from_env()?;
    config.validate()?;
    log::info!(
        "Config: {} | {} | testnet={} | leverage {}x | size {}%/{}%",
        config.symbol,
        config.strategy.as_str(),
        config.testnet,
        config.risk.leverage,
        config.risk.position_size_pct,
        config.risk.high_confidence_size_pct
    );

    let client = Arc::new(BybitClient::from_config(&config)?);
    let notifier: Arc<dyn Notifier> = match TelegramBot::from_config(&config) {
        Some(bot) => Arc::new(bot),
        None => {
            log::warn!("Telegram not configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };
    let journal = Arc::new(FileJournal::new(&config.log_dir));
    let engine = build_engine(&config);

    let trader = Arc::new(Trader::new(
        config,
        client.clone(),
        client,
        notifier,
        journal,
        engine,
        Utc::now(),
    ));
    trader.startup(Utc::now()).await?;

    if cli.once {
        let outcome = trader.run_once(Utc::now()).await?;
        log::info!("Single run finished: {}", outcome.code());
        // let spawned notifications flush
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        return Ok(());
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Ctrl-C received, stopping after the in-flight tick");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                log::error!("Signal handler failed: {}", e);
                // keep the sender alive so the loops keep running
                std::future::pending::<()>().await;
            }
        }
    });

    trader.run(stop_rx).await;
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    log::info!("Trader stopped");
    Ok(())
}
