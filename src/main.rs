//! Binance Futures Scalping Bot CLI
//!
//! Places post-only limit orders at the touch and pairs every fill with a
//! reduce-only take-profit order.

use anyhow::{Context, Result};
use binance_scalper::services::{
    with_retry, BinanceFutures, Controller, Gateway, Keepalive, ObservabilitySink, QueueAtTouch,
    RetryConfig, SimulatorGateway, UserStream,
};
use binance_scalper::types::OrderSide;
use binance_scalper::Config;
use clap::Parser;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "binance-scalper")]
#[command(about = "Limit-order scalping bot for Binance USD-M futures")]
#[command(version)]
struct Cli {
    /// Trading pair symbol
    #[arg(short, long, default_value = "ETHUSDC")]
    symbol: String,

    /// Quantity per opening order, in base asset
    #[arg(short, long, default_value = "0.01")]
    quantity: Decimal,

    /// Take-profit offset from the fill price, in quote asset
    #[arg(short, long, default_value = "1")]
    take_profit: Decimal,

    /// Side of the opening orders (BUY or SELL)
    #[arg(short, long, default_value = "BUY")]
    direction: OrderSide,

    /// Maximum number of concurrently occupied position slots
    #[arg(short, long, default_value = "75")]
    max_orders: usize,

    /// Minimum seconds between opening-order submissions
    #[arg(short, long, default_value = "30")]
    wait_time: u64,

    /// Retries for transient exchange failures
    #[arg(long, default_value = "3")]
    retry_count: u32,

    /// Delay between retries, in milliseconds
    #[arg(long, default_value = "1000")]
    retry_delay_ms: u64,

    /// Seconds before an unfilled opening order is cancelled
    #[arg(long, default_value = "120")]
    stale_secs: u64,

    /// Trade against the built-in simulator instead of the live exchange
    #[arg(long)]
    dry_run: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let config = Config::load(
        cli.symbol,
        cli.quantity,
        cli.take_profit,
        cli.direction,
        cli.max_orders,
        cli.wait_time,
        cli.retry_count,
        cli.retry_delay_ms,
        cli.stale_secs,
        cli.dry_run,
    )?;

    info!(
        "Starting scalper: {} {} x{} tp={} max_orders={} wait={}s{}",
        config.direction,
        config.symbol,
        config.quantity,
        config.take_profit,
        config.max_orders,
        config.wait_time.as_secs(),
        if config.dry_run { " [DRY RUN]" } else { "" }
    );

    let (event_tx, event_rx) = mpsc::channel(256);
    let (sink_tx, sink_rx) = mpsc::channel(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // The stream gets its own signal: it must stay connected through the
    // controller's shutdown drain so cancel/fill confirmations still arrive,
    // and only closes once the controller has finished.
    let (stream_shutdown_tx, stream_shutdown_rx) = watch::channel(false);

    let sink = ObservabilitySink::new(&config.symbol);
    let sink_handle = tokio::spawn(sink.run(sink_rx));

    let gateway: Arc<dyn Gateway> = if config.dry_run {
        Arc::new(SimulatorGateway::new(event_tx.clone()))
    } else {
        let (api_key, api_secret) = match (&config.api_key, &config.api_secret) {
            (Some(key), Some(secret)) => (key.clone(), secret.clone()),
            _ => anyhow::bail!("live trading requires API credentials"),
        };
        let gateway = Arc::new(BinanceFutures::new(api_key, api_secret)?);

        // Live mode needs the user-data stream and its keepalive
        let retry = RetryConfig::new(config.retry_count, config.retry_delay);
        let listen_key = with_retry(&retry, "create_listen_key", || gateway.create_listen_key())
            .await
            .context("could not obtain a listen key")?;
        let (listen_key_tx, listen_key_rx) = watch::channel(listen_key);

        tokio::spawn(UserStream::run(
            config.symbol.clone(),
            listen_key_rx,
            event_tx.clone(),
            stream_shutdown_rx.clone(),
        ));
        tokio::spawn(Keepalive::run(
            gateway.clone(),
            listen_key_tx,
            shutdown_rx.clone(),
        ));
        gateway
    };

    let controller = Controller::new(config, gateway, Box::new(QueueAtTouch), sink_tx);
    let mut controller_handle = tokio::spawn(controller.run(event_rx, shutdown_rx));

    tokio::select! {
        result = &mut controller_handle => {
            // The controller only returns on its own for fatal errors
            match result {
                Ok(Ok(())) => info!("Controller exited"),
                Ok(Err(e)) => error!("Controller failed: {}", e),
                Err(e) => error!("Controller task panicked: {}", e),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
            match controller_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Shutdown error: {}", e),
                Err(e) => error!("Controller task panicked: {}", e),
            }
        }
    }

    // The drain is over (or timed out); now the stream and keepalive can stop
    let _ = shutdown_tx.send(true);
    let _ = stream_shutdown_tx.send(true);

    // The controller held the only sink sender; once it is gone the sink
    // drains its queue and stops
    drop(event_tx);
    let _ = sink_handle.await;

    Ok(())
}
