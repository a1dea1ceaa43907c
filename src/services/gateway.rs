//! Exchange gateway abstraction
//!
//! Synchronous request/response surface of the exchange: order placement,
//! cancellation, snapshots, and listen-key management. Implemented by the
//! live futures client and by the dry-run simulator; the trait is what lets
//! `--dry-run` swap the venue out without touching the controller.

use crate::types::{AccountSnapshot, OrderSide, OrderSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::gateway_error::GatewayError;

/// Acknowledgement of a successful order placement
#[derive(Debug, Clone)]
pub struct PlacedOrder {
    pub order_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Current best bid/ask
#[derive(Debug, Clone, Copy)]
pub struct BookTicker {
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Request/response wrapper around the exchange. Stateless apart from the
/// HTTP client; every call runs on the caller's task and must never be
/// invoked from the stream client's receive loop.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Place a post-only limit order that opens a position slot
    async fn place_opening_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        client_tag: &str,
    ) -> Result<PlacedOrder, GatewayError>;

    /// Place a reduce-only limit order that closes a filled opening order
    async fn place_closing_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        client_tag: &str,
    ) -> Result<PlacedOrder, GatewayError>;

    /// Cancel a resting order
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError>;

    /// All of this account's open orders on `symbol`
    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OrderSnapshot>, GatewayError>;

    /// Final state of a single order, `None` if the exchange no longer
    /// knows it. Used to resolve orders that vanished during a stream gap.
    async fn fetch_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderSnapshot>, GatewayError>;

    /// Account balances for the observability sink
    async fn account_snapshot(&self) -> Result<AccountSnapshot, GatewayError>;

    /// Current top of book for `symbol`
    async fn book_ticker(&self, symbol: &str) -> Result<BookTicker, GatewayError>;

    /// Create a user-data stream session token
    async fn create_listen_key(&self) -> Result<String, GatewayError>;

    /// Renew the stream session token before it expires
    async fn renew_listen_key(&self, listen_key: &str) -> Result<(), GatewayError>;
}
