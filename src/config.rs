//! Configuration management for the scalping bot

use crate::types::OrderSide;
use anyhow::Result;
use rust_decimal::Decimal;
use std::env;
use std::time::Duration;

/// Bot configuration: trading parameters from the CLI, credentials from the
/// environment
#[derive(Debug, Clone)]
pub struct Config {
    /// Futures API key (not required in dry-run mode)
    pub api_key: Option<String>,

    /// Futures API secret (not required in dry-run mode)
    pub api_secret: Option<String>,

    /// Trading pair symbol, e.g. ETHUSDC
    pub symbol: String,

    /// Quantity per opening order, in base asset
    pub quantity: Decimal,

    /// Take-profit offset added to the opening fill price, in quote asset
    pub take_profit: Decimal,

    /// Side of the opening orders; closing orders take the opposite side
    pub direction: OrderSide,

    /// Maximum number of concurrently occupied position slots
    pub max_orders: usize,

    /// Minimum time between opening-order submissions
    pub wait_time: Duration,

    /// How many times a transient gateway failure is retried
    pub retry_count: u32,

    /// Spacing between retries
    pub retry_delay: Duration,

    /// Age past which an unfilled order is cancelled
    pub stale_after: Duration,

    /// Route all gateway calls to the simulator
    pub dry_run: bool,
}

impl Config {
    /// Build the configuration from CLI parameters, pulling credentials
    /// from the environment (`API_KEY` / `API_SECRET`, `.env` supported).
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        symbol: String,
        quantity: Decimal,
        take_profit: Decimal,
        direction: OrderSide,
        max_orders: usize,
        wait_time_secs: u64,
        retry_count: u32,
        retry_delay_ms: u64,
        stale_secs: u64,
        dry_run: bool,
    ) -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let api_key = env::var("API_KEY").ok().filter(|s| !s.is_empty());
        let api_secret = env::var("API_SECRET").ok().filter(|s| !s.is_empty());

        let config = Self {
            api_key,
            api_secret,
            symbol: symbol.to_uppercase(),
            quantity,
            take_profit,
            direction,
            max_orders,
            wait_time: Duration::from_secs(wait_time_secs),
            retry_count,
            retry_delay: Duration::from_millis(retry_delay_ms),
            stale_after: Duration::from_secs(stale_secs),
            dry_run,
        };
        config.validate()?;
        Ok(config)
    }

    /// Side of the closing orders
    pub fn close_side(&self) -> OrderSide {
        self.direction.opposite()
    }

    fn validate(&self) -> Result<()> {
        if !self.dry_run && (self.api_key.is_none() || self.api_secret.is_none()) {
            anyhow::bail!("API_KEY and API_SECRET environment variables must be set for live trading");
        }
        if self.quantity <= Decimal::ZERO {
            anyhow::bail!("quantity must be positive");
        }
        if self.take_profit <= Decimal::ZERO {
            anyhow::bail!("take-profit must be positive");
        }
        if self.max_orders == 0 {
            anyhow::bail!("max-orders must be at least 1");
        }
        Ok(())
    }
}

/// Binance USD-M futures endpoints
pub struct FuturesApi;

impl FuturesApi {
    pub const REST_BASE: &'static str = "https://fapi.binance.com";
    pub const WS_BASE: &'static str = "wss://fstream.binance.com/ws";

    pub fn stream_url(listen_key: &str) -> String {
        format!("{}/{}", Self::WS_BASE, listen_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_config(dry_run: bool) -> Result<Config> {
        Config::load(
            "ethusdc".to_string(),
            dec!(0.01),
            dec!(1),
            OrderSide::Buy,
            5,
            30,
            3,
            1000,
            120,
            dry_run,
        )
    }

    #[test]
    fn test_symbol_uppercased() {
        let config = base_config(true).unwrap();
        assert_eq!(config.symbol, "ETHUSDC");
    }

    #[test]
    fn test_close_side_opposes_direction() {
        let config = base_config(true).unwrap();
        assert_eq!(config.close_side(), OrderSide::Sell);
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let result = Config::load(
            "ETHUSDC".to_string(),
            Decimal::ZERO,
            dec!(1),
            OrderSide::Buy,
            5,
            30,
            3,
            1000,
            120,
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_stream_url() {
        assert_eq!(
            FuturesApi::stream_url("abc123"),
            "wss://fstream.binance.com/ws/abc123"
        );
    }
}
