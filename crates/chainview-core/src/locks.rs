//! Per-view locks serializing catch-up, reindex, and reorg repair.
//!
//! Process-local: two engine instances over one database do not see each
//! other's locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Default)]
pub struct ViewLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ViewLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// The lock for `name` if nobody holds it.
    pub fn try_acquire(&self, name: &str) -> Option<OwnedMutexGuard<()>> {
        self.handle(name).try_lock_owned().ok()
    }

    /// Wait for the lock for `name`.
    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        self.handle(name).lock_owned().await
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.handle(name).try_lock().is_err()
    }

    /// Drop the entry for a deleted view.
    pub fn forget(&self, name: &str) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_is_exclusive_per_name() {
        let locks = ViewLocks::new();
        let guard = locks.try_acquire("a").unwrap();
        assert!(locks.try_acquire("a").is_none());
        assert!(locks.try_acquire("b").is_some());
        assert!(locks.is_locked("a"));
        drop(guard);
        assert!(locks.try_acquire("a").is_some());
    }

    #[tokio::test]
    async fn acquire_waits_for_holder() {
        let locks = Arc::new(ViewLocks::new());
        let guard = locks.acquire("a").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.acquire("a").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
