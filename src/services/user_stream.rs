//! User-data stream client - connects to the futures exchange for real-time
//! order events
//!
//! Maintains exactly one authenticated WebSocket to
//! `wss://fstream.binance.com/ws/<listenKey>` and decodes the loosely-typed
//! push payloads into `StreamEvent` at this boundary, so downstream code
//! never sees raw JSON. Reconnects with exponential backoff (base 1s, cap
//! 30s, jitter ±20%) and emits a `Resynced` marker after every (re)connect
//! so the controller can reconcile against a REST snapshot; the receive
//! loop itself never performs gateway I/O.

use crate::config::FuturesApi;
use crate::types::{AccountSnapshot, StreamEvent};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Raw order payload inside an ORDER_TRADE_UPDATE frame
#[derive(Debug, Deserialize)]
struct RawOrderUpdate {
    #[serde(default, rename = "s")]
    symbol: String,
    #[serde(default, rename = "c")]
    client_tag: String,
    #[serde(default, rename = "i")]
    order_id: i64,
    #[serde(default, rename = "X")]
    status: String,
    #[serde(default, rename = "z")]
    cumulative_qty: String,
    #[serde(default, rename = "ap")]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    #[serde(default, rename = "wb")]
    wallet_balance: String,
    #[serde(default, rename = "cw")]
    cross_wallet_balance: String,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    #[serde(default, rename = "up")]
    unrealized_pnl: String,
}

#[derive(Debug, Deserialize)]
struct RawAccountUpdate {
    #[serde(default, rename = "B")]
    balances: Vec<RawBalance>,
    #[serde(default, rename = "P")]
    positions: Vec<RawPosition>,
}

/// Envelope of a user-data stream frame
#[derive(Debug, Deserialize)]
struct RawStreamMessage {
    #[serde(default, rename = "e")]
    event_type: String,
    #[serde(default, rename = "o")]
    order: Option<RawOrderUpdate>,
    #[serde(default, rename = "a")]
    account: Option<RawAccountUpdate>,
}

/// User-data stream service
pub struct UserStream;

impl UserStream {
    /// Run the stream until shutdown. Auto-reconnects on disconnection or
    /// listen-key expiry, picking up the current key from `listen_key_rx`.
    pub async fn run(
        symbol: String,
        mut listen_key_rx: watch::Receiver<String>,
        event_tx: mpsc::Sender<StreamEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("[Stream] Starting for {}", symbol);

        let mut delay = BACKOFF_BASE;
        loop {
            if *shutdown_rx.borrow() {
                info!("[Stream] Shutdown signal received");
                break;
            }

            let listen_key = listen_key_rx.borrow_and_update().clone();
            match Self::connect_and_listen(
                &symbol,
                &listen_key,
                &event_tx,
                &mut listen_key_rx,
                &mut shutdown_rx,
            )
            .await
            {
                Ok(clean) => {
                    if clean {
                        // Healthy session that ended; start the backoff over
                        delay = BACKOFF_BASE;
                    }
                    info!("[Stream] Connection closed. Reconnecting...");
                }
                Err(e) => {
                    warn!("[Stream] Error: {}. Reconnecting...", e);
                }
            }

            // Wait for the backoff delay OR shutdown
            tokio::select! {
                _ = sleep(with_jitter(delay)) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("[Stream] Shutdown during reconnect delay");
                        break;
                    }
                }
            }
            delay = (delay * 2).min(BACKOFF_CAP);
        }

        info!("[Stream] Stopped");
    }

    /// One connection's lifetime. Returns Ok(true) if the session was
    /// established and later closed, Ok(false)/Err if it never got healthy.
    async fn connect_and_listen(
        symbol: &str,
        listen_key: &str,
        event_tx: &mpsc::Sender<StreamEvent>,
        listen_key_rx: &mut watch::Receiver<String>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        let url = FuturesApi::stream_url(listen_key);
        let (ws_stream, _) = connect_async(&url)
            .await
            .context("Failed to connect to user-data stream")?;

        info!("[Stream] Connected for {}", symbol);

        let (mut write, mut read) = ws_stream.split();

        // Events may have been missed while disconnected; ask the controller
        // to reconcile against a snapshot before trusting the live view
        let _ = event_tx.send(StreamEvent::Resynced).await;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = decode_message(&text, symbol) {
                                let expired = event == StreamEvent::StreamExpired;
                                if event_tx.send(event).await.is_err() {
                                    return Ok(true); // controller gone
                                }
                                if expired {
                                    info!("[Stream] Listen key expired, reconnecting");
                                    return Ok(true);
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) => {
                            info!("[Stream] Server closed connection");
                            return Ok(true);
                        }
                        Some(Err(e)) => {
                            warn!("[Stream] WebSocket error: {}", e);
                            return Ok(false);
                        }
                        Some(Ok(_)) => {}
                        None => return Ok(true),
                    }
                }
                _ = listen_key_rx.changed() => {
                    // Keepalive rotated the key; the old connection is doomed
                    info!("[Stream] Listen key rotated, reconnecting");
                    return Ok(true);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return Ok(true);
                    }
                }
            }
        }
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or(Decimal::ZERO)
}

/// Map one wire frame to a domain event. Frames for other symbols, unknown
/// event types, and order statuses the bot does not track map to `None`.
fn decode_message(text: &str, symbol: &str) -> Option<StreamEvent> {
    let msg: RawStreamMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("[Stream] Undecodable frame: {}", e);
            return None;
        }
    };

    match msg.event_type.as_str() {
        "ORDER_TRADE_UPDATE" => {
            let order = msg.order?;
            if order.symbol != symbol {
                return None;
            }
            let order_id = order.order_id.to_string();
            let client_tag = order.client_tag;
            match order.status.as_str() {
                "NEW" => Some(StreamEvent::OrderAccepted { order_id, client_tag }),
                "PARTIALLY_FILLED" => Some(StreamEvent::OrderPartiallyFilled {
                    order_id,
                    client_tag,
                    cumulative_qty: parse_decimal(&order.cumulative_qty),
                    avg_price: parse_decimal(&order.avg_price),
                }),
                "FILLED" => Some(StreamEvent::OrderFilled {
                    order_id,
                    client_tag,
                    cumulative_qty: parse_decimal(&order.cumulative_qty),
                    avg_price: parse_decimal(&order.avg_price),
                }),
                "CANCELED" | "EXPIRED" => {
                    Some(StreamEvent::OrderCanceled { order_id, client_tag })
                }
                other => {
                    debug!("[Stream] Ignoring order status {}", other);
                    None
                }
            }
        }
        "ACCOUNT_UPDATE" => {
            let account = msg.account?;
            let wallet: Decimal = account
                .balances
                .iter()
                .map(|b| parse_decimal(&b.wallet_balance))
                .sum();
            let available: Decimal = account
                .balances
                .iter()
                .map(|b| parse_decimal(&b.cross_wallet_balance))
                .sum();
            let unrealized: Decimal = account
                .positions
                .iter()
                .map(|p| parse_decimal(&p.unrealized_pnl))
                .sum();
            Some(StreamEvent::AccountUpdate(AccountSnapshot {
                wallet_balance: wallet,
                unrealized_pnl: unrealized,
                available_balance: available,
            }))
        }
        "listenKeyExpired" => Some(StreamEvent::StreamExpired),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_decode_fill() {
        let frame = r#"{"e":"ORDER_TRADE_UPDATE","E":1,"o":{"s":"ETHUSDC","c":"scalp-1",
            "i":8886774,"S":"BUY","X":"FILLED","q":"0.010","z":"0.010","ap":"2500.50"}}"#;
        let event = decode_message(frame, "ETHUSDC").unwrap();
        assert_eq!(
            event,
            StreamEvent::OrderFilled {
                order_id: "8886774".to_string(),
                client_tag: "scalp-1".to_string(),
                cumulative_qty: dec!(0.010),
                avg_price: dec!(2500.50),
            }
        );
    }

    #[test]
    fn test_decode_partial_fill() {
        let frame = r#"{"e":"ORDER_TRADE_UPDATE","o":{"s":"ETHUSDC","c":"scalp-2",
            "i":42,"X":"PARTIALLY_FILLED","q":"0.010","z":"0.004","ap":"2500.00"}}"#;
        let event = decode_message(frame, "ETHUSDC").unwrap();
        assert!(matches!(event, StreamEvent::OrderPartiallyFilled { cumulative_qty, .. }
            if cumulative_qty == dec!(0.004)));
    }

    #[test]
    fn test_decode_cancel_and_expiry_statuses() {
        for status in ["CANCELED", "EXPIRED"] {
            let frame = format!(
                r#"{{"e":"ORDER_TRADE_UPDATE","o":{{"s":"ETHUSDC","c":"t","i":7,"X":"{}"}}}}"#,
                status
            );
            let event = decode_message(&frame, "ETHUSDC").unwrap();
            assert!(matches!(event, StreamEvent::OrderCanceled { .. }));
        }
    }

    #[test]
    fn test_decode_filters_other_symbols() {
        let frame = r#"{"e":"ORDER_TRADE_UPDATE","o":{"s":"BTCUSDT","c":"t","i":7,"X":"FILLED",
            "z":"1","ap":"60000"}}"#;
        assert!(decode_message(frame, "ETHUSDC").is_none());
    }

    #[test]
    fn test_decode_listen_key_expired() {
        let frame = r#"{"e":"listenKeyExpired"}"#;
        assert_eq!(decode_message(frame, "ETHUSDC"), Some(StreamEvent::StreamExpired));
    }

    #[test]
    fn test_decode_account_update() {
        let frame = r#"{"e":"ACCOUNT_UPDATE","a":{"B":[{"a":"USDC","wb":"1000.5","cw":"900.0"}],
            "P":[{"s":"ETHUSDC","up":"-3.25"}]}}"#;
        let event = decode_message(frame, "ETHUSDC").unwrap();
        let StreamEvent::AccountUpdate(snapshot) = event else {
            panic!("expected account update");
        };
        assert_eq!(snapshot.wallet_balance, dec!(1000.5));
        assert_eq!(snapshot.available_balance, dec!(900.0));
        assert_eq!(snapshot.unrealized_pnl, dec!(-3.25));
    }

    #[test]
    fn test_decode_ignores_unknown_frames() {
        assert!(decode_message(r#"{"e":"MARGIN_CALL"}"#, "ETHUSDC").is_none());
        assert!(decode_message("not json", "ETHUSDC").is_none());
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..100 {
            let d = with_jitter(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12));
        }
    }
}
