//! Core types for the futures scalping bot

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side of the closing order paired with this side
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(format!("invalid side: {}", other)),
        }
    }
}

/// Whether an order opens a position slot or closes one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderRole {
    Opening,
    Closing,
}

impl fmt::Display for OrderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderRole::Opening => write!(f, "OPEN"),
            OrderRole::Closing => write!(f, "CLOSE"),
        }
    }
}

/// Lifecycle state of a tracked order.
///
/// `Expired` means the staleness sweep has requested cancellation and the
/// order is waiting for the exchange to confirm it; it only becomes
/// `Canceled` once the confirmation event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OrderState {
    Submitting,
    Open,
    PartiallyFilled,
    Filled,
    ClosingPlaced,
    Closed,
    Canceled,
    Expired,
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderState::Submitting => "SUBMITTING",
            OrderState::Open => "OPEN",
            OrderState::PartiallyFilled => "PARTIALLY_FILLED",
            OrderState::Filled => "FILLED",
            OrderState::ClosingPlaced => "CLOSING_PLACED",
            OrderState::Closed => "CLOSED",
            OrderState::Canceled => "CANCELED",
            OrderState::Expired => "EXPIRED",
        };
        write!(f, "{}", s)
    }
}

/// One exchange order tracked by the bot.
///
/// `client_tag` is assigned before the placement request goes out, because
/// the first stream event for an order can arrive before the REST
/// acknowledgement returns. The exchange id is empty until the order is
/// acknowledged or matched by tag from an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Exchange-assigned id, set on acknowledgement
    pub id: String,
    /// Bot-assigned correlation token
    pub client_tag: String,
    pub role: OrderRole,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Cumulative filled quantity, clamped at `quantity`
    pub filled_quantity: Decimal,
    /// Average fill price reported by the exchange
    pub avg_fill_price: Option<Decimal>,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// For closing orders, the exchange id of the opening order they close
    pub parent_id: Option<String>,
}

impl Order {
    pub fn new_opening(client_tag: String, side: OrderSide, price: Decimal, quantity: Decimal) -> Self {
        Self::new(client_tag, OrderRole::Opening, side, price, quantity, None)
    }

    pub fn new_closing(
        client_tag: String,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        parent_id: String,
    ) -> Self {
        Self::new(client_tag, OrderRole::Closing, side, price, quantity, Some(parent_id))
    }

    fn new(
        client_tag: String,
        role: OrderRole,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        parent_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            client_tag,
            role,
            side,
            price,
            quantity,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            state: OrderState::Submitting,
            created_at: now,
            last_update: now,
            parent_id,
        }
    }

    /// Whether this order can never change state again.
    ///
    /// `Filled` is terminal for closing orders only; a filled opening order
    /// still moves through `ClosingPlaced` to `Closed`.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            OrderState::Closed | OrderState::Canceled => true,
            OrderState::Filled => self.role == OrderRole::Closing,
            _ => false,
        }
    }

    /// Quantity still resting on the book
    pub fn remaining(&self) -> Decimal {
        self.quantity - self.filled_quantity
    }
}

/// A decoded event from the user-data stream.
///
/// The stream client maps the exchange's loosely-typed payloads into this
/// closed set at the connection boundary, so the reconciliation core never
/// touches raw JSON. Per-order ordering is preserved from the wire; no
/// ordering across different orders is assumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    OrderAccepted {
        order_id: String,
        client_tag: String,
    },
    OrderPartiallyFilled {
        order_id: String,
        client_tag: String,
        cumulative_qty: Decimal,
        avg_price: Decimal,
    },
    OrderFilled {
        order_id: String,
        client_tag: String,
        cumulative_qty: Decimal,
        avg_price: Decimal,
    },
    OrderCanceled {
        order_id: String,
        client_tag: String,
    },
    AccountUpdate(AccountSnapshot),
    /// The exchange invalidated the listen key; the stream must reconnect
    StreamExpired,
    /// Client-generated marker: the stream (re)connected and events may have
    /// been missed, so the controller must reconcile against a REST snapshot
    Resynced,
}

/// A directive emitted by the reconciliation core and consumed exactly once
/// by the controller. The core itself never performs I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// An opening order filled; place the paired closing order
    SpawnClosingOrder {
        parent_id: String,
        side: OrderSide,
        quantity: Decimal,
        fill_price: Decimal,
    },
    /// An order went stale; ask the exchange to cancel it
    CancelOrder { order_id: String },
    /// A position slot was released; `record` describes the finished order
    SlotFreed { record: OrderRecord },
}

/// Terminal-order record handed to the observability sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub role: OrderRole,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    /// Realized PnL for the round trip, present on closing-order records
    pub realized_pnl: Option<Decimal>,
    pub status: OrderState,
    /// Id of the paired order, when one exists
    pub counter_order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Periodic account state for dashboard consumption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub wallet_balance: Decimal,
    pub unrealized_pnl: Decimal,
    pub available_balance: Decimal,
}

/// One row of the exchange's open-orders snapshot, used to reconcile the
/// in-memory view after a stream gap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderSnapshot {
    pub order_id: String,
    pub client_tag: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub executed_quantity: Decimal,
    pub avg_price: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_side_parse() {
        assert_eq!("buy".parse::<OrderSide>().unwrap(), OrderSide::Buy);
        assert_eq!("SELL".parse::<OrderSide>().unwrap(), OrderSide::Sell);
        assert!("hold".parse::<OrderSide>().is_err());
    }

    #[test]
    fn test_filled_terminal_only_for_closing() {
        let mut opening = Order::new_opening("a".into(), OrderSide::Buy, dec!(2500), dec!(0.01));
        opening.state = OrderState::Filled;
        assert!(!opening.is_terminal());

        let mut closing =
            Order::new_closing("b".into(), OrderSide::Sell, dec!(2501), dec!(0.01), "1".into());
        closing.state = OrderState::Filled;
        assert!(closing.is_terminal());
    }

    #[test]
    fn test_remaining() {
        let mut order = Order::new_opening("a".into(), OrderSide::Buy, dec!(2500), dec!(0.05));
        order.filled_quantity = dec!(0.02);
        assert_eq!(order.remaining(), dec!(0.03));
    }
}
