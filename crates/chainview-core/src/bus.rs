//! Notification bus — new-block and reorg signals from the indexer.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::ViewError;

/// Buffered notifications per subscription.
const SUBSCRIPTION_BUFFER: usize = 256;

/// A publish/subscribe channel carrying string payloads.
#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, ViewError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ViewError>;
}

/// A live subscription. Payloads are forwarded by a background task that
/// stops on [`Subscription::unsubscribe`] or drop.
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<String>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a receiver fed by `task`.
    pub fn new(channel: impl Into<String>, rx: mpsc::Receiver<String>, task: JoinHandle<()>) -> Self {
        Self {
            channel: channel.into(),
            rx,
            task: Some(task),
        }
    }

    /// A bounded channel and the sender a forwarding task should feed.
    pub fn channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
        mpsc::channel(SUBSCRIPTION_BUFFER)
    }

    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    /// The next payload; `None` once the bus side has closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─── In-memory bus ───────────────────────────────────────────────────────────

/// In-process bus over one tokio broadcast channel per channel name.
pub struct MemoryBus {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(1_024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationBus for MemoryBus {
    async fn subscribe(&self, channel: &str) -> Result<Subscription, ViewError> {
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = Subscription::channel();
        let name = channel.to_string();
        let task = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(channel = %name, skipped = n, "Subscriber lagged; notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(channel, rx, task))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), ViewError> {
        // No subscribers is not an error.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber_of_the_channel() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("new_block").await.unwrap();
        let mut b = bus.subscribe("new_block").await.unwrap();
        let mut other = bus.subscribe("reorg").await.unwrap();

        bus.publish("new_block", "101").await.unwrap();
        assert_eq!(a.recv().await.as_deref(), Some("101"));
        assert_eq!(b.recv().await.as_deref(), Some("101"));

        bus.publish("reorg", r#"{"blockHeight":5}"#).await.unwrap();
        assert_eq!(other.recv().await.as_deref(), Some(r#"{"blockHeight":5}"#));
        assert_eq!(other.channel_name(), "reorg");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = MemoryBus::new();
        bus.publish("nobody", "x").await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribed_channel_stops_forwarding() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("new_block").await.unwrap();
        sub.unsubscribe();
        bus.publish("new_block", "1").await.unwrap();
    }
}
