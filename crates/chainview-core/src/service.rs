//! Service loop — keeps every view caught up as the indexer advances.
//!
//! ```text
//! new_block ─┐
//! poll tick ─┼─► sweep ─► catch_up(view) × N   (one task per view)
//! start ─────┘
//! reorg ─────► handle_reorg(height)
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::{NotificationBus, Subscription};
use crate::engine::ViewEngine;
use crate::error::ViewError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReorgNotice {
    block_height: u64,
}

/// Parse a reorg notification payload: `{"blockHeight": n}`.
pub fn parse_reorg_payload(payload: &str) -> Result<u64, ViewError> {
    let notice: ReorgNotice = serde_json::from_str(payload)?;
    Ok(notice.block_height)
}

pub struct ViewService {
    engine: Arc<ViewEngine>,
    bus: Arc<dyn NotificationBus>,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ViewService {
    pub fn new(engine: Arc<ViewEngine>, bus: Arc<dyn NotificationBus>) -> Self {
        Self {
            engine,
            bus,
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Sweep once, then follow the bus and a fallback poll until [`Self::shutdown`].
    pub async fn start(&mut self) -> Result<(), ViewError> {
        if self.is_running() {
            return Ok(());
        }
        let config = self.engine.config().clone();

        sweep(&self.engine).await;

        let new_blocks = self.bus.subscribe(&config.new_block_channel).await?;
        let reorgs = self.bus.subscribe(&config.reorg_channel).await?;
        let (stop_tx, stop_rx) = watch::channel(false);

        self.tasks.push(tokio::spawn(follow_new_blocks(
            self.engine.clone(),
            new_blocks,
            stop_rx.clone(),
        )));
        self.tasks.push(tokio::spawn(follow_reorgs(
            self.engine.clone(),
            reorgs,
            stop_rx.clone(),
        )));
        self.tasks.push(tokio::spawn(poll(
            self.engine.clone(),
            Duration::from_millis(config.poll_interval_ms.max(1)),
            stop_rx,
        )));
        self.shutdown = Some(stop_tx);

        info!(
            new_block_channel = %config.new_block_channel,
            reorg_channel = %config.reorg_channel,
            poll_interval_ms = config.poll_interval_ms,
            "View service started"
        );
        Ok(())
    }

    /// Unsubscribe from both channels and stop polling. Work already running
    /// for a notification finishes first.
    pub async fn shutdown(&mut self) {
        let Some(stop) = self.shutdown.take() else {
            return;
        };
        let _ = stop.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Service task ended abnormally");
            }
        }
        info!("View service stopped");
    }
}

async fn sweep(engine: &Arc<ViewEngine>) {
    if let Err(e) = engine.catch_up_all().await {
        error!(error = %e, "Catch-up sweep failed");
    }
}

async fn follow_new_blocks(engine: Arc<ViewEngine>, mut sub: Subscription, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            msg = sub.recv() => match msg {
                Some(payload) => {
                    debug!(payload = %payload, "New block notification");
                    sweep(&engine).await;
                }
                None => {
                    warn!(channel = sub.channel_name(), "Notification channel closed");
                    break;
                }
            },
        }
    }
    sub.unsubscribe();
}

async fn follow_reorgs(engine: Arc<ViewEngine>, mut sub: Subscription, mut stop: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            msg = sub.recv() => match msg {
                Some(payload) => match parse_reorg_payload(&payload) {
                    Ok(height) => match engine.handle_reorg(height).await {
                        Ok(outcome) => info!(
                            height,
                            repaired = outcome.repaired.len(),
                            failed = outcome.failed.len(),
                            "Reorg handled"
                        ),
                        Err(e) => error!(height, error = %e, "Reorg handling failed"),
                    },
                    Err(e) => warn!(payload = %payload, error = %e, "Ignoring malformed reorg notification"),
                },
                None => {
                    warn!(channel = sub.channel_name(), "Notification channel closed");
                    break;
                }
            },
        }
    }
    sub.unsubscribe();
}

async fn poll(engine: Arc<ViewEngine>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = ticker.tick() => sweep(&engine).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorg_payload() {
        assert_eq!(parse_reorg_payload(r#"{"blockHeight": 101}"#).unwrap(), 101);
        assert!(parse_reorg_payload(r#"{"height": 101}"#).is_err());
        assert!(parse_reorg_payload("101").is_err());
    }
}
