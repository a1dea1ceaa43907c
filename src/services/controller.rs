//! Scalping controller
//!
//! The single task that owns the reconciliation core. Applies stream
//! events, runs the staleness sweep, opens a new post-only order whenever a
//! slot is free and the inter-order wait has elapsed, and executes every
//! decision the core emits through the gateway with bounded retry. All
//! order-state mutation funnels through this loop; other tasks only talk to
//! it over channels.

use crate::config::Config;
use crate::types::{Decision, Order, OrderSide, StreamEvent};
use anyhow::{bail, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::gateway::{BookTicker, Gateway};
use super::reconciler::ReconciliationCore;
use super::retry::{with_retry, RetryConfig};
use super::sink::SinkMessage;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const ACCOUNT_POLL_EVERY: u32 = 60; // ticks
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Chooses the opening limit price from the current top of book. The exact
/// level is a strategy concern; implementations must return a non-crossing
/// (maker) price.
pub trait PriceSelector: Send + Sync {
    fn opening_price(&self, book: &BookTicker, side: OrderSide) -> Decimal;
}

/// Joins the queue at the touch: best bid for buys, best ask for sells.
/// Non-crossing by construction.
pub struct QueueAtTouch;

impl PriceSelector for QueueAtTouch {
    fn opening_price(&self, book: &BookTicker, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => book.bid,
            OrderSide::Sell => book.ask,
        }
    }
}

/// Rests `offset` away from the touch, deeper into the book
pub struct OffsetFromTouch {
    pub offset: Decimal,
}

impl PriceSelector for OffsetFromTouch {
    fn opening_price(&self, book: &BookTicker, side: OrderSide) -> Decimal {
        match side {
            OrderSide::Buy => book.bid - self.offset,
            OrderSide::Sell => book.ask + self.offset,
        }
    }
}

/// Orchestration loop around the reconciliation core
pub struct Controller {
    config: Config,
    gateway: Arc<dyn Gateway>,
    core: ReconciliationCore,
    price_selector: Box<dyn PriceSelector>,
    retry: RetryConfig,
    sink_tx: mpsc::Sender<SinkMessage>,
    last_submission: Option<Instant>,
    /// Cancels that exhausted their retries, tried again on the next tick.
    /// No order may sit non-terminal without a directive still pending.
    failed_cancels: Vec<String>,
}

impl Controller {
    pub fn new(
        config: Config,
        gateway: Arc<dyn Gateway>,
        price_selector: Box<dyn PriceSelector>,
        sink_tx: mpsc::Sender<SinkMessage>,
    ) -> Self {
        let core = ReconciliationCore::new(config.max_orders, config.stale_after);
        let retry = RetryConfig::new(config.retry_count, config.retry_delay);
        Self {
            config,
            gateway,
            core,
            price_selector,
            retry,
            sink_tx,
            last_submission: None,
            failed_cancels: Vec::new(),
        }
    }

    /// Run until shutdown. Returns an error only on fatal gateway failures
    /// (bad credentials), which must halt the whole bot.
    pub async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<StreamEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        // The live view is rebuilt from the exchange at every start; nothing
        // is persisted across restarts
        self.resync().await?;

        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks: u32 = 0;

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(event) => self.on_event(event).await?,
                        None => {
                            error!("[Controller] Event channel closed unexpectedly");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.core.expire_stale(Utc::now());
                    self.execute_decisions().await?;
                    self.retry_failed_cancels().await?;
                    self.maybe_open().await?;

                    ticks = ticks.wrapping_add(1);
                    if ticks % ACCOUNT_POLL_EVERY == 0 {
                        self.poll_account().await;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("[Controller] Shutdown signal received");
                        break;
                    }
                }
            }
        }

        self.shutdown(&mut event_rx).await
    }

    async fn on_event(&mut self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::Resynced => self.resync().await?,
            StreamEvent::AccountUpdate(snapshot) => {
                let _ = self.sink_tx.send(SinkMessage::Account(snapshot)).await;
            }
            // The stream client reconnects on its own; a Resynced marker
            // follows once it does
            StreamEvent::StreamExpired => {}
            other => {
                self.core.apply(&other);
                self.execute_decisions().await?;
            }
        }
        Ok(())
    }

    /// Open a new post-only order if a slot is free and the inter-order
    /// wait has elapsed
    async fn maybe_open(&mut self) -> Result<()> {
        if !self.core.has_capacity() {
            return Ok(());
        }
        if let Some(last) = self.last_submission {
            if last.elapsed() < self.config.wait_time {
                return Ok(());
            }
        }

        let book = match with_retry(&self.retry, "book_ticker", || {
            self.gateway.book_ticker(&self.config.symbol)
        })
        .await
        {
            Ok(book) => book,
            Err(e) if e.is_fatal() => bail!(e),
            Err(e) => {
                warn!("[Controller] Could not fetch top of book: {}", e);
                return Ok(());
            }
        };

        let side = self.config.direction;
        let price = self.price_selector.opening_price(&book, side);
        let tag = new_client_tag();
        let order = Order::new_opening(tag.clone(), side, price, self.config.quantity);
        if !self.core.register_opening(order) {
            return Ok(());
        }
        self.last_submission = Some(Instant::now());

        info!(
            "[Controller] Placing opening order: {} {} @ {} ({} slots occupied)",
            side,
            self.config.quantity,
            price,
            self.core.occupied_slots()
        );

        let result = with_retry(&self.retry, "place_opening_order", || {
            self.gateway.place_opening_order(
                &self.config.symbol,
                side,
                price,
                self.config.quantity,
                &tag,
            )
        })
        .await;

        match result {
            Ok(placed) => self.core.acknowledge(&tag, &placed.order_id),
            Err(e) => {
                warn!("[Controller] Opening order failed: {}", e);
                self.core.placement_failed(&tag);
                self.execute_decisions().await?;
                if e.is_fatal() {
                    bail!(e);
                }
            }
        }
        Ok(())
    }

    /// Drain and execute core decisions, repeating until executing them
    /// stops producing new ones
    async fn execute_decisions(&mut self) -> Result<()> {
        loop {
            let decisions = self.core.drain_decisions();
            if decisions.is_empty() {
                return Ok(());
            }
            for decision in decisions {
                match decision {
                    Decision::SpawnClosingOrder {
                        parent_id,
                        side,
                        quantity,
                        fill_price,
                    } => {
                        self.spawn_closing(parent_id, side, quantity, fill_price)
                            .await?
                    }
                    Decision::CancelOrder { order_id } => self.cancel(order_id).await?,
                    Decision::SlotFreed { record } => {
                        let _ = self.sink_tx.send(SinkMessage::Order(record)).await;
                    }
                }
            }
        }
    }

    /// Place the closing order for a filled opening order, offset by the
    /// take-profit from the fill price
    async fn spawn_closing(
        &mut self,
        parent_id: String,
        side: OrderSide,
        quantity: Decimal,
        fill_price: Decimal,
    ) -> Result<()> {
        let price = match side {
            OrderSide::Sell => fill_price + self.config.take_profit,
            OrderSide::Buy => fill_price - self.config.take_profit,
        };
        let tag = new_client_tag();
        let order = Order::new_closing(tag.clone(), side, price, quantity, parent_id.clone());
        self.core.register_closing(order);

        info!(
            "[Controller] Placing closing order for {}: {} {} @ {}",
            parent_id, side, quantity, price
        );

        let result = with_retry(&self.retry, "place_closing_order", || {
            self.gateway
                .place_closing_order(&self.config.symbol, side, price, quantity, &tag)
        })
        .await;

        match result {
            Ok(placed) => self.core.acknowledge(&tag, &placed.order_id),
            Err(e) => {
                error!(
                    "[Controller] Closing order for {} failed: {}",
                    parent_id, e
                );
                self.core.placement_failed(&tag);
                if e.is_fatal() {
                    bail!(e);
                }
            }
        }
        Ok(())
    }

    async fn cancel(&mut self, order_id: String) -> Result<()> {
        let result = with_retry(&self.retry, "cancel_order", || {
            self.gateway.cancel_order(&self.config.symbol, &order_id)
        })
        .await;
        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => bail!(e),
            Err(e) if e.is_retryable() => {
                // Retries exhausted; keep the directive alive across ticks
                warn!("[Controller] Cancel of {} failed: {}; will retry", order_id, e);
                self.failed_cancels.push(order_id);
            }
            Err(e) => {
                // Usually -2011: the order filled or vanished before the
                // cancel landed. The pending stream event or the next
                // resync settles its true state.
                warn!("[Controller] Cancel of {} not accepted: {}", order_id, e);
            }
        }
        Ok(())
    }

    async fn retry_failed_cancels(&mut self) -> Result<()> {
        for order_id in std::mem::take(&mut self.failed_cancels) {
            self.cancel(order_id).await?;
        }
        Ok(())
    }

    /// Rebuild the live view from the exchange after a stream gap or at
    /// startup. The open-orders snapshot catches up resting orders; any
    /// order of ours missing from it is resolved with a per-order fetch.
    async fn resync(&mut self) -> Result<()> {
        let snapshot = match with_retry(&self.retry, "fetch_open_orders", || {
            self.gateway.fetch_open_orders(&self.config.symbol)
        })
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_fatal() => bail!(e),
            Err(e) => {
                warn!("[Controller] Reconciliation fetch failed: {}", e);
                return Ok(());
            }
        };

        let missing = self.core.reconcile(&snapshot);
        for order_id in missing {
            match with_retry(&self.retry, "fetch_order", || {
                self.gateway.fetch_order(&self.config.symbol, &order_id)
            })
            .await
            {
                Ok(fetched) => self.core.resolve_missing(&order_id, fetched.as_ref()),
                Err(e) if e.is_fatal() => bail!(e),
                Err(e) => warn!(
                    "[Controller] Could not resolve missing order {}: {}",
                    order_id, e
                ),
            }
        }
        self.execute_decisions().await
    }

    async fn poll_account(&mut self) {
        match self.gateway.account_snapshot().await {
            Ok(snapshot) => {
                let _ = self.sink_tx.send(SinkMessage::Account(snapshot)).await;
            }
            Err(e) => warn!("[Controller] Account snapshot failed: {}", e),
        }
    }

    /// Graceful shutdown: cancel every resting order, then drain the event
    /// stream until everything is confirmed terminal or the timeout runs out
    async fn shutdown(mut self, event_rx: &mut mpsc::Receiver<StreamEvent>) -> Result<()> {
        let ids = self.core.cancellable_order_ids();
        info!("[Controller] Shutting down, cancelling {} open orders", ids.len());
        for order_id in ids {
            self.cancel(order_id).await?;
        }

        let drain = async {
            while !self.core.is_idle() {
                match event_rx.recv().await {
                    Some(StreamEvent::Resynced) | Some(StreamEvent::StreamExpired) => {}
                    Some(event) => {
                        self.core.apply(&event);
                        self.execute_decisions().await?;
                    }
                    None => break,
                }
            }
            Ok::<(), anyhow::Error>(())
        };
        match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await {
            Ok(result) => result?,
            Err(_) => warn!(
                "[Controller] Shutdown drain timed out with {} orders still live",
                self.core.live_orders().len()
            ),
        }

        info!("[Controller] Stopped");
        Ok(())
    }
}

/// Correlation token for newClientOrderId; stays inside the exchange's
/// 36-character limit
fn new_client_tag() -> String {
    format!("sc-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::gateway::PlacedOrder;
    use crate::services::gateway_error::GatewayError;
    use crate::services::simulator::SimulatorGateway;
    use crate::types::{AccountSnapshot, OrderRole, OrderSnapshot, OrderState};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_config(max_orders: usize) -> Config {
        Config {
            api_key: None,
            api_secret: None,
            symbol: "ETHUSDC".to_string(),
            quantity: dec!(0.01),
            take_profit: dec!(1),
            direction: OrderSide::Buy,
            max_orders,
            wait_time: Duration::from_millis(0),
            retry_count: 3,
            retry_delay: Duration::from_millis(10),
            stale_after: Duration::from_secs(120),
            dry_run: true,
        }
    }

    struct Harness {
        sink_rx: mpsc::Receiver<SinkMessage>,
        shutdown_tx: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    fn start(config: Config, gateway: Arc<dyn Gateway>, event_rx: mpsc::Receiver<StreamEvent>) -> Harness {
        let (sink_tx, sink_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = Controller::new(config, gateway, Box::new(QueueAtTouch), sink_tx);
        let handle = tokio::spawn(controller.run(event_rx, shutdown_rx));
        Harness {
            sink_rx,
            shutdown_tx,
            handle,
        }
    }

    async fn next_order_record(harness: &mut Harness) -> crate::types::OrderRecord {
        loop {
            match harness.sink_rx.recv().await.expect("sink channel open") {
                SinkMessage::Order(record) => return record,
                SinkMessage::Account(_) => {}
            }
        }
    }

    #[test]
    fn test_price_selectors() {
        let book = BookTicker {
            bid: dec!(2500.00),
            ask: dec!(2500.01),
        };
        assert_eq!(QueueAtTouch.opening_price(&book, OrderSide::Buy), dec!(2500.00));
        assert_eq!(QueueAtTouch.opening_price(&book, OrderSide::Sell), dec!(2500.01));

        let deep = OffsetFromTouch { offset: dec!(0.50) };
        assert_eq!(deep.opening_price(&book, OrderSide::Buy), dec!(2499.50));
        assert_eq!(deep.opening_price(&book, OrderSide::Sell), dec!(2500.51));
    }

    #[tokio::test]
    async fn test_dry_run_round_trip() {
        let (event_tx, event_rx) = mpsc::channel(64);
        let gateway = Arc::new(SimulatorGateway::with_behavior(
            event_tx,
            Duration::from_millis(20),
            BookTicker {
                bid: dec!(2500.00),
                ask: dec!(2500.01),
            },
        ));
        let mut harness = start(test_config(1), gateway, event_rx);

        // Opening BUY fills at 2500, closing SELL at 2501 fills, slot frees
        let record = next_order_record(&mut harness).await;
        assert_eq!(record.role, OrderRole::Closing);
        assert_eq!(record.side, OrderSide::Sell);
        assert_eq!(record.price, dec!(2501.00));
        assert_eq!(record.status, OrderState::Filled);
        assert_eq!(record.realized_pnl, Some(dec!(0.0100))); // (2501-2500)*0.01

        harness.shutdown_tx.send(true).unwrap();
        harness.handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_slot_cap_and_shutdown_cancels_resting_orders() {
        let (event_tx, event_rx) = mpsc::channel(64);
        // Fills take a minute; orders rest on the simulated book
        let gateway = Arc::new(SimulatorGateway::with_behavior(
            event_tx,
            Duration::from_secs(60),
            BookTicker {
                bid: dec!(2500.00),
                ask: dec!(2500.01),
            },
        ));
        let mut harness = start(test_config(2), gateway.clone(), event_rx);

        // Give the controller a few ticks to submit
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let resting = gateway.fetch_open_orders("ETHUSDC").await.unwrap();
        assert_eq!(resting.len(), 2); // never exceeds max_orders

        let shutdown_started = Instant::now();
        harness.shutdown_tx.send(true).unwrap();
        // Both resting orders get cancelled and their slots freed
        let a = next_order_record(&mut harness).await;
        let b = next_order_record(&mut harness).await;
        assert!(a.status == OrderState::Canceled && b.status == OrderState::Canceled);
        harness.handle.await.unwrap().unwrap();

        assert!(gateway.fetch_open_orders("ETHUSDC").await.unwrap().is_empty());
        // The drain ends on the cancel confirmations, not on its timeout;
        // this only holds while the event stream outlives the controller
        assert!(shutdown_started.elapsed() < SHUTDOWN_DRAIN_TIMEOUT);
    }

    /// Gateway wrapper that fails the first N placements with a transient
    /// error, for the retry-no-duplicate property
    struct FlakyGateway {
        inner: SimulatorGateway,
        failures_left: AtomicU32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Gateway for FlakyGateway {
        async fn place_opening_order(
            &self,
            symbol: &str,
            side: OrderSide,
            price: Decimal,
            quantity: Decimal,
            client_tag: &str,
        ) -> Result<PlacedOrder, GatewayError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(GatewayError::Transient("connection reset".to_string()));
            }
            self.inner
                .place_opening_order(symbol, side, price, quantity, client_tag)
                .await
        }

        async fn place_closing_order(
            &self,
            symbol: &str,
            side: OrderSide,
            price: Decimal,
            quantity: Decimal,
            client_tag: &str,
        ) -> Result<PlacedOrder, GatewayError> {
            self.inner
                .place_closing_order(symbol, side, price, quantity, client_tag)
                .await
        }

        async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
            self.inner.cancel_order(symbol, order_id).await
        }

        async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OrderSnapshot>, GatewayError> {
            self.inner.fetch_open_orders(symbol).await
        }

        async fn fetch_order(
            &self,
            symbol: &str,
            order_id: &str,
        ) -> Result<Option<OrderSnapshot>, GatewayError> {
            self.inner.fetch_order(symbol, order_id).await
        }

        async fn account_snapshot(&self) -> Result<AccountSnapshot, GatewayError> {
            self.inner.account_snapshot().await
        }

        async fn book_ticker(&self, symbol: &str) -> Result<BookTicker, GatewayError> {
            self.inner.book_ticker(symbol).await
        }

        async fn create_listen_key(&self) -> Result<String, GatewayError> {
            self.inner.create_listen_key().await
        }

        async fn renew_listen_key(&self, listen_key: &str) -> Result<(), GatewayError> {
            self.inner.renew_listen_key(listen_key).await
        }
    }

    #[tokio::test]
    async fn test_transient_failures_retried_without_duplicate_orders() {
        let (event_tx, event_rx) = mpsc::channel(64);
        let gateway = Arc::new(FlakyGateway {
            inner: SimulatorGateway::with_behavior(
                event_tx,
                Duration::from_secs(60),
                BookTicker {
                    bid: dec!(2500.00),
                    ask: dec!(2500.01),
                },
            ),
            failures_left: AtomicU32::new(2),
            attempts: AtomicU32::new(0),
        });
        let mut harness = start(test_config(1), gateway.clone(), event_rx);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        // Two transient failures, then one success; a single order resting
        assert_eq!(gateway.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(gateway.inner.fetch_open_orders("ETHUSDC").await.unwrap().len(), 1);

        harness.shutdown_tx.send(true).unwrap();
        let record = next_order_record(&mut harness).await;
        assert_eq!(record.status, OrderState::Canceled);
        harness.handle.await.unwrap().unwrap();
    }
}
