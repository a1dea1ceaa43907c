//! Binance Futures Scalping Bot Library
//!
//! A limit-order scalping bot for Binance USD-M futures. Post-only opening
//! orders are placed at the touch; each fill spawns a reduce-only
//! take-profit order on the opposite side, and every round trip frees its
//! position slot for the next one. The in-memory order view is reconciled
//! against the exchange after any user-data stream gap, so the exchange
//! always wins on disagreement.

pub mod config;
pub mod services;
pub mod types;

pub use config::{Config, FuturesApi};
pub use services::{
    BinanceFutures, Controller, Gateway, GatewayError, Keepalive, ObservabilitySink,
    QueueAtTouch, ReconciliationCore, SimulatorGateway, SinkMessage, UserStream,
};
pub use types::{Decision, Order, OrderRecord, OrderRole, OrderSide, OrderState, StreamEvent};
