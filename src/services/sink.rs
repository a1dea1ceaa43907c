//! Observability sink - records order outcomes and account snapshots
//!
//! Write-only consumer at the end of the pipeline: terminal-order records
//! are appended to `<SYMBOL>_transactions_log.csv` and cumulative realized
//! PnL is tallied. Account snapshots are logged for the same consumer.

use crate::types::{AccountSnapshot, OrderRecord};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Everything the sink consumes
#[derive(Debug, Clone)]
pub enum SinkMessage {
    Order(OrderRecord),
    Account(AccountSnapshot),
}

/// CSV/log writer task
pub struct ObservabilitySink {
    symbol: String,
    log_path: PathBuf,
    cumulative_pnl: Decimal,
}

impl ObservabilitySink {
    pub fn new(symbol: &str) -> Self {
        Self::with_path(symbol, PathBuf::from(format!("{}_transactions_log.csv", symbol)))
    }

    pub fn with_path(symbol: &str, log_path: PathBuf) -> Self {
        Self {
            symbol: symbol.to_string(),
            log_path,
            cumulative_pnl: Decimal::ZERO,
        }
    }

    /// Consume messages until the channel closes (bot shutdown)
    pub async fn run(mut self, mut rx: mpsc::Receiver<SinkMessage>) {
        info!("[Sink] Logging transactions to {}", self.log_path.display());

        while let Some(msg) = rx.recv().await {
            match msg {
                SinkMessage::Order(record) => {
                    if let Some(pnl) = record.realized_pnl {
                        self.cumulative_pnl += pnl;
                        info!(
                            "[Sink] Round trip done: {} {} @ {} pnl={} cumulative={}",
                            record.side,
                            record.filled_quantity,
                            record.price,
                            pnl,
                            self.cumulative_pnl
                        );
                    }
                    if let Err(e) = self.append_record(&record) {
                        error!("[Sink] Failed to log transaction: {}", e);
                    }
                }
                SinkMessage::Account(snapshot) => {
                    info!(
                        "[Sink] Account: wallet={} available={} unrealized={}",
                        snapshot.wallet_balance,
                        snapshot.available_balance,
                        snapshot.unrealized_pnl
                    );
                }
            }
        }

        info!("[Sink] Stopped, cumulative realized PnL: {}", self.cumulative_pnl);
    }

    fn append_record(&self, record: &OrderRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("open {}", self.log_path.display()))?;

        writeln!(
            file,
            "{},{},{},{},{},{},{},{},{}",
            record.closed_at.to_rfc3339(),
            self.symbol,
            record.order_id,
            record.role,
            record.counter_order_id.as_deref().unwrap_or(""),
            record.price,
            record.filled_quantity,
            record.status,
            record
                .realized_pnl
                .map(|p| p.to_string())
                .unwrap_or_default(),
        )
        .context("write transaction row")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderRole, OrderSide, OrderState};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn record(pnl: Option<Decimal>) -> OrderRecord {
        OrderRecord {
            order_id: "200".to_string(),
            role: OrderRole::Closing,
            side: OrderSide::Sell,
            price: dec!(2501),
            quantity: dec!(0.01),
            filled_quantity: dec!(0.01),
            realized_pnl: pnl,
            status: OrderState::Filled,
            counter_order_id: Some("100".to_string()),
            opened_at: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sink_appends_csv_rows() {
        let path = std::env::temp_dir().join(format!("sink_test_{}.csv", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let sink = ObservabilitySink::with_path("ETHUSDC", path.clone());
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(sink.run(rx));

        tx.send(SinkMessage::Order(record(Some(dec!(0.01))))).await.unwrap();
        tx.send(SinkMessage::Order(record(None))).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("ETHUSDC,200,CLOSE,100,2501,0.01,FILLED,0.01"));
        assert!(lines[1].ends_with("FILLED,"));

        let _ = std::fs::remove_file(&path);
    }
}
