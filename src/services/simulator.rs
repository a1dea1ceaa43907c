//! Dry-run gateway
//!
//! Stands in for the live venue when `--dry-run` is set: accepts orders,
//! assigns ids, and feeds synthetic acceptance/fill events back through the
//! same event channel the real stream client uses, so the whole lifecycle
//! (including reconciliation) runs end to end without touching the
//! exchange.

use crate::types::{AccountSnapshot, OrderSide, OrderSnapshot, StreamEvent};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use super::gateway::{BookTicker, Gateway, PlacedOrder};
use super::gateway_error::GatewayError;

struct SimState {
    event_tx: mpsc::Sender<StreamEvent>,
    next_id: AtomicI64,
    /// Orders resting on the simulated book
    open: Mutex<HashMap<String, OrderSnapshot>>,
    /// Terminal orders, kept so `fetch_order` can report final fills
    done: Mutex<HashMap<String, OrderSnapshot>>,
}

/// Simulated venue: every order is accepted immediately and fully filled at
/// its limit price after `fill_delay`, unless cancelled first.
pub struct SimulatorGateway {
    state: Arc<SimState>,
    fill_delay: Duration,
    book: BookTicker,
}

impl SimulatorGateway {
    pub fn new(event_tx: mpsc::Sender<StreamEvent>) -> Self {
        Self::with_behavior(
            event_tx,
            Duration::from_secs(2),
            BookTicker {
                bid: dec!(2500.00),
                ask: dec!(2500.01),
            },
        )
    }

    pub fn with_behavior(
        event_tx: mpsc::Sender<StreamEvent>,
        fill_delay: Duration,
        book: BookTicker,
    ) -> Self {
        Self {
            state: Arc::new(SimState {
                event_tx,
                next_id: AtomicI64::new(1),
                open: Mutex::new(HashMap::new()),
                done: Mutex::new(HashMap::new()),
            }),
            fill_delay,
            book,
        }
    }

    fn accept(
        &self,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        client_tag: &str,
    ) -> PlacedOrder {
        let order_id = self
            .state
            .next_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        let snapshot = OrderSnapshot {
            order_id: order_id.clone(),
            client_tag: client_tag.to_string(),
            side,
            price,
            quantity,
            executed_quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
        };
        self.state
            .open
            .lock()
            .expect("simulator lock poisoned")
            .insert(order_id.clone(), snapshot);

        info!(
            "[Sim] Order accepted: id={} {} {} @ {}",
            order_id, side, quantity, price
        );

        // Acceptance then fill arrive asynchronously, like the real stream
        let state = self.state.clone();
        let fill_delay = self.fill_delay;
        let id = order_id.clone();
        let tag = client_tag.to_string();
        tokio::spawn(async move {
            let _ = state
                .event_tx
                .send(StreamEvent::OrderAccepted {
                    order_id: id.clone(),
                    client_tag: tag.clone(),
                })
                .await;

            tokio::time::sleep(fill_delay).await;

            // Cancelled in the meantime?
            let filled = {
                let mut open = state.open.lock().expect("simulator lock poisoned");
                open.remove(&id).map(|mut snap| {
                    snap.executed_quantity = snap.quantity;
                    snap.avg_price = snap.price;
                    state
                        .done
                        .lock()
                        .expect("simulator lock poisoned")
                        .insert(id.clone(), snap.clone());
                    snap
                })
            };
            if let Some(snap) = filled {
                let _ = state
                    .event_tx
                    .send(StreamEvent::OrderFilled {
                        order_id: id,
                        client_tag: tag,
                        cumulative_qty: snap.quantity,
                        avg_price: snap.price,
                    })
                    .await;
            }
        });

        PlacedOrder {
            order_id,
            accepted_at: Utc::now(),
        }
    }
}

#[async_trait]
impl Gateway for SimulatorGateway {
    async fn place_opening_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        client_tag: &str,
    ) -> Result<PlacedOrder, GatewayError> {
        Ok(self.accept(side, price, quantity, client_tag))
    }

    async fn place_closing_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        client_tag: &str,
    ) -> Result<PlacedOrder, GatewayError> {
        Ok(self.accept(side, price, quantity, client_tag))
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        let removed = {
            let mut open = self.state.open.lock().expect("simulator lock poisoned");
            open.remove(order_id)
        };
        match removed {
            Some(snap) => {
                self.state
                    .done
                    .lock()
                    .expect("simulator lock poisoned")
                    .insert(order_id.to_string(), snap.clone());
                let _ = self
                    .state
                    .event_tx
                    .send(StreamEvent::OrderCanceled {
                        order_id: order_id.to_string(),
                        client_tag: snap.client_tag,
                    })
                    .await;
                Ok(())
            }
            None => Err(GatewayError::Rejected {
                code: -2011,
                reason: "Unknown order sent.".to_string(),
            }),
        }
    }

    async fn fetch_open_orders(&self, _symbol: &str) -> Result<Vec<OrderSnapshot>, GatewayError> {
        Ok(self
            .state
            .open
            .lock()
            .expect("simulator lock poisoned")
            .values()
            .cloned()
            .collect())
    }

    async fn fetch_order(
        &self,
        _symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderSnapshot>, GatewayError> {
        let open = self.state.open.lock().expect("simulator lock poisoned");
        if let Some(snap) = open.get(order_id) {
            return Ok(Some(snap.clone()));
        }
        drop(open);
        Ok(self
            .state
            .done
            .lock()
            .expect("simulator lock poisoned")
            .get(order_id)
            .cloned())
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, GatewayError> {
        Ok(AccountSnapshot {
            wallet_balance: dec!(10000),
            unrealized_pnl: Decimal::ZERO,
            available_balance: dec!(10000),
        })
    }

    async fn book_ticker(&self, _symbol: &str) -> Result<BookTicker, GatewayError> {
        Ok(self.book)
    }

    async fn create_listen_key(&self) -> Result<String, GatewayError> {
        Ok("simulated-listen-key".to_string())
    }

    async fn renew_listen_key(&self, _listen_key: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}
