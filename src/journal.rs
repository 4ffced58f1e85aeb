//! Append-only trade, signal, equity and error journals.
//!
//! Layout under the log directory:
//! `trades/trades_YYYY-MM.jsonl`, `signals/signals_YYYY-MM-DD.jsonl`,
//! `equity/equity_YYYY-MM-DD.csv`, `errors/errors.jsonl`.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::indicators::IndicatorSnapshot;
use crate::types::{ClosedTrade, CombinedSignal, Direction};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io: {0}")]
    Io(#[from] io::Error),
    #[error("journal json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("journal csv: {0}")]
    Csv(#[from] csv::Error),
}

/// One decision tick: the signal, its inputs and what was done with it.
#[derive(Clone, Debug, Serialize)]
pub struct SignalRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub strategy: &'static str,
    pub price: f64,
    pub signal: CombinedSignal,
    pub indicators: Option<IndicatorSnapshot>,
    /// `OPEN`, `HOLD`, `DENY_<REASON>`, `SKIP_INPUT` ...
    pub decision: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EquitySnapshot {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
    pub available: f64,
    pub realized_pnl_today: f64,
    pub trades_today: u32,
    pub position: Option<Direction>,
    pub unrealized_pnl_pct: Option<f64>,
}

#[derive(Serialize)]
struct ErrorRecord<'a> {
    timestamp: DateTime<Utc>,
    context: &'a str,
    message: &'a str,
}

/// Durable sink for trading records. Writes are append-only.
pub trait TradeJournal: Send + Sync {
    fn record_trade(&self, trade: &ClosedTrade) -> Result<(), JournalError>;
    fn record_signal(&self, record: &SignalRecord) -> Result<(), JournalError>;
    fn record_equity(&self, snapshot: &EquitySnapshot) -> Result<(), JournalError>;
    fn record_error(&self, at: DateTime<Utc>, context: &str, message: &str) -> Result<(), JournalError>;
}

/// File-backed journal rooted at the log directory.
pub struct FileJournal {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileJournal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileJournal { root: root.into(), write_lock: Mutex::new(()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn trades_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.root.join("trades").join(format!("trades_{}.jsonl", at.format("%Y-%m")))
    }

    fn signals_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.root.join("signals").join(format!("signals_{}.jsonl", at.format("%Y-%m-%d")))
    }

    fn equity_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.root.join("equity").join(format!("equity_{}.csv", at.format("%Y-%m-%d")))
    }

    fn errors_path(&self) -> PathBuf {
        self.root.join("errors").join("errors.jsonl")
    }

    fn open_append(path: &Path) -> io::Result<fs::File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn append_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), JournalError> {
        let json = serde_json::to_string(value)?;
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = Self::open_append(path)?;
        writeln!(file, "{json}")?;
        file.flush()?;
        Ok(())
    }
}

impl TradeJournal for FileJournal {
    fn record_trade(&self, trade: &ClosedTrade) -> Result<(), JournalError> {
        self.append_json(&self.trades_path(trade.exit_time), trade)
    }

    fn record_signal(&self, record: &SignalRecord) -> Result<(), JournalError> {
        self.append_json(&self.signals_path(record.timestamp), record)
    }

    fn record_equity(&self, snapshot: &EquitySnapshot) -> Result<(), JournalError> {
        let path = self.equity_path(snapshot.timestamp);
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = !path.exists();
        let file = Self::open_append(&path)?;
        let mut wtr = csv::WriterBuilder::new().has_headers(fresh).from_writer(file);
        wtr.serialize(snapshot)?;
        wtr.flush()?;
        Ok(())
    }

    fn record_error(&self, at: DateTime<Utc>, context: &str, message: &str) -> Result<(), JournalError> {
        self.append_json(&self.errors_path(), &ErrorRecord { timestamp: at, context, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExitReason;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn trade(exit: DateTime<Utc>) -> ClosedTrade {
        ClosedTrade {
            id: "T-20250310-090000-000".into(),
            symbol: "XRPUSDT".into(),
            direction: Direction::Short,
            entry_price: 0.6,
            exit_price: 0.612,
            quantity: 50.0,
            leverage: 1,
            entry_time: exit - chrono::Duration::hours(3),
            exit_time: exit,
            exit_reason: ExitReason::StopLoss,
            stop_loss_price: 0.612,
            take_profit_price: 0.576,
            gross_pnl: -0.6,
            pnl_pct: -2.0,
            fee_entry: 0.0165,
            fee_exit: 0.01683,
            fee_total: 0.03333,
            net_pnl: -0.63333,
            net_pnl_pct: -2.1111,
            mfe_pct: 0.4,
            mae_pct: -2.0,
            r_multiple: -1.055,
            holding_secs: 10800,
            trailing_activated: false,
            confidence: 2,
        }
    }

    #[test]
    fn trades_append_to_monthly_file() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let journal = FileJournal::new(root);
        let exit = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        journal.record_trade(&trade(exit)).unwrap();
        journal.record_trade(&trade(exit + chrono::Duration::days(2))).unwrap();

        let text = fs::read_to_string(root.join("trades/trades_2025-03.jsonl")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let back: ClosedTrade = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(back.exit_reason, ExitReason::StopLoss);
        assert!(lines[1].contains("\"exit_reason\":\"SL_HIT\""));
    }

    #[test]
    fn equity_csv_has_single_header() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let journal = FileJournal::new(root);
        let t = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 10).unwrap();
        let snap = EquitySnapshot {
            timestamp: t,
            equity: 1000.0,
            available: 950.0,
            realized_pnl_today: 0.0,
            trades_today: 0,
            position: None,
            unrealized_pnl_pct: None,
        };
        journal.record_equity(&snap).unwrap();
        journal
            .record_equity(&EquitySnapshot { position: Some(Direction::Long), unrealized_pnl_pct: Some(0.4), ..snap })
            .unwrap();

        let text = fs::read_to_string(root.join("equity/equity_2025-03-10.csv")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,equity,available"));
        assert!(lines[2].contains("Long"));
    }

    #[test]
    fn errors_are_journaled() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let journal = FileJournal::new(root);
        let t = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        journal.record_error(t, "decision_tick", "transient error: timeout").unwrap();
        let text = fs::read_to_string(root.join("errors/errors.jsonl")).unwrap();
        assert!(text.contains("\"context\":\"decision_tick\""));
    }
}
