//! Session keepalive task
//!
//! Listen keys expire 60 minutes after the last renewal; this task renews
//! every 30 minutes. If renewal fails the key is
//! assumed lost: a fresh one is created and published over the watch
//! channel, which makes the stream client drop its connection and
//! reconnect with the new key.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use super::gateway::Gateway;
use super::retry::{with_retry, RetryConfig};

const RENEW_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub struct Keepalive;

impl Keepalive {
    pub async fn run(
        gateway: Arc<dyn Gateway>,
        listen_key_tx: watch::Sender<String>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let retry = RetryConfig::default();
        let mut ticker = tokio::time::interval(RENEW_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("[Keepalive] Shutdown signal received");
                        break;
                    }
                    continue;
                }
            }

            let current = listen_key_tx.borrow().clone();
            match gateway.renew_listen_key(&current).await {
                Ok(()) => info!("[Keepalive] Listen key renewed"),
                Err(e) => {
                    warn!("[Keepalive] Renewal failed ({}), requesting a new key", e);
                    match with_retry(&retry, "create_listen_key", || gateway.create_listen_key())
                        .await
                    {
                        Ok(new_key) => {
                            info!("[Keepalive] New listen key issued");
                            let _ = listen_key_tx.send(new_key);
                        }
                        Err(e) => {
                            // The stream will hit StreamExpired and the next
                            // tick tries again; nothing else to do here
                            warn!("[Keepalive] Could not obtain a new listen key: {}", e);
                        }
                    }
                }
            }
        }

        info!("[Keepalive] Stopped");
    }
}
