pub mod binance;
pub mod controller;
pub mod gateway;
pub mod gateway_error;
pub mod keepalive;
pub mod reconciler;
pub mod retry;
pub mod simulator;
pub mod sink;
pub mod user_stream;

pub use binance::BinanceFutures;
pub use controller::{Controller, OffsetFromTouch, PriceSelector, QueueAtTouch};
pub use gateway::{BookTicker, Gateway, PlacedOrder};
pub use gateway_error::GatewayError;
pub use keepalive::Keepalive;
pub use reconciler::ReconciliationCore;
pub use retry::{with_retry, RetryConfig};
pub use simulator::SimulatorGateway;
pub use sink::{ObservabilitySink, SinkMessage};
pub use user_stream::UserStream;
