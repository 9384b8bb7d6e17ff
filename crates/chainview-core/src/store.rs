//! Storage abstraction for the view engine.
//!
//! One `ViewStore` serves three roles: read-only access to the indexer's chain
//! tables, the view registry, and the per-view namespaces. Implementations are
//! `InMemoryStore` and `PostgresStore` in `chainview-storage`.

use async_trait::async_trait;

use crate::error::ViewError;
use crate::sql::{DdlStatement, Row, WriteStatement};
use crate::types::{
    Block, ChainEvent, IndexProgress, ProgressUpdate, RegisteredView, Transaction,
    ViewRegistration, ViewStatus,
};

/// Backing store for chain reads, the registry, and derived tables.
#[async_trait]
pub trait ViewStore: Send + Sync {
    // ─── Chain (read-only) ───────────────────────────────────────────────────

    /// The block at `height`, canonical or not.
    async fn block_at(&self, height: u64) -> Result<Option<Block>, ViewError>;

    /// Transactions at `height`, in block order.
    async fn transactions_at(&self, height: u64) -> Result<Vec<Transaction>, ViewError>;

    /// Events at `height`, ordered by transaction then event index.
    async fn events_at(&self, height: u64) -> Result<Vec<ChainEvent>, ViewError>;

    /// Indexer progress for `network`; `None` before the indexer has run.
    async fn index_progress(&self, network: &str) -> Result<Option<IndexProgress>, ViewError>;

    // ─── Registry ────────────────────────────────────────────────────────────

    async fn get_view(&self, name: &str) -> Result<Option<RegisteredView>, ViewError>;

    /// All registered views, optionally restricted to one status, ordered by name.
    async fn list_views(&self, status: Option<ViewStatus>) -> Result<Vec<RegisteredView>, ViewError>;

    /// Execute `ddl` and upsert the registry row in one transaction.
    /// Returns the view id.
    async fn deploy(&self, ddl: &[DdlStatement], registration: &ViewRegistration)
        -> Result<i64, ViewError>;

    /// Apply a progress/status/health change outside any block transaction.
    async fn record_progress(&self, name: &str, update: &ProgressUpdate) -> Result<(), ViewError>;

    /// Drop the view's namespace and registry row in one transaction.
    /// Returns `false` when no such view is registered.
    async fn delete_view(&self, name: &str) -> Result<bool, ViewError>;

    // ─── Derived tables ──────────────────────────────────────────────────────

    /// Committed rows of `schema.table` matching every `filter` column.
    async fn find_rows(
        &self,
        schema: &str,
        table: &str,
        filter: &Row,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, ViewError>;

    async fn row_count(&self, schema: &str, table: &str) -> Result<u64, ViewError>;

    /// Open a write transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, ViewError>;
}

/// A write transaction. Dropping without `commit` discards every change.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Execute `statements` against `schema` in order; returns rows affected.
    async fn execute(&mut self, schema: &str, statements: &[WriteStatement]) -> Result<u64, ViewError>;

    /// Stage a registry update inside this transaction.
    async fn record_progress(&mut self, name: &str, update: &ProgressUpdate) -> Result<(), ViewError>;

    async fn commit(self: Box<Self>) -> Result<(), ViewError>;

    async fn rollback(self: Box<Self>) -> Result<(), ViewError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A store with no chain data that records what would have been written.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    pub struct NullStore {
        executed: Arc<Mutex<Vec<WriteStatement>>>,
        commits: Arc<AtomicUsize>,
    }

    impl NullStore {
        pub fn executed(&self) -> Vec<WriteStatement> {
            self.executed.lock().unwrap().clone()
        }

        pub fn commits(&self) -> usize {
            self.commits.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ViewStore for NullStore {
        async fn block_at(&self, _height: u64) -> Result<Option<Block>, ViewError> {
            Ok(None)
        }
        async fn transactions_at(&self, _height: u64) -> Result<Vec<Transaction>, ViewError> {
            Ok(vec![])
        }
        async fn events_at(&self, _height: u64) -> Result<Vec<ChainEvent>, ViewError> {
            Ok(vec![])
        }
        async fn index_progress(&self, _network: &str) -> Result<Option<IndexProgress>, ViewError> {
            Ok(None)
        }
        async fn get_view(&self, _name: &str) -> Result<Option<RegisteredView>, ViewError> {
            Ok(None)
        }
        async fn list_views(&self, _status: Option<ViewStatus>) -> Result<Vec<RegisteredView>, ViewError> {
            Ok(vec![])
        }
        async fn deploy(&self, _ddl: &[DdlStatement], _r: &ViewRegistration) -> Result<i64, ViewError> {
            Ok(1)
        }
        async fn record_progress(&self, _name: &str, _u: &ProgressUpdate) -> Result<(), ViewError> {
            Ok(())
        }
        async fn delete_view(&self, _name: &str) -> Result<bool, ViewError> {
            Ok(false)
        }
        async fn find_rows(
            &self,
            _schema: &str,
            _table: &str,
            _filter: &Row,
            _limit: Option<usize>,
        ) -> Result<Vec<Row>, ViewError> {
            Ok(vec![])
        }
        async fn row_count(&self, _schema: &str, _table: &str) -> Result<u64, ViewError> {
            Ok(0)
        }
        async fn begin(&self) -> Result<Box<dyn StoreTransaction>, ViewError> {
            Ok(Box::new(RecordingTx {
                executed: self.executed.clone(),
                commits: self.commits.clone(),
            }))
        }
    }

    struct RecordingTx {
        executed: Arc<Mutex<Vec<WriteStatement>>>,
        commits: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl StoreTransaction for RecordingTx {
        async fn execute(&mut self, _schema: &str, statements: &[WriteStatement]) -> Result<u64, ViewError> {
            self.executed.lock().unwrap().extend_from_slice(statements);
            Ok(statements.len() as u64)
        }
        async fn record_progress(&mut self, _name: &str, _u: &ProgressUpdate) -> Result<(), ViewError> {
            Ok(())
        }
        async fn commit(self: Box<Self>) -> Result<(), ViewError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn rollback(self: Box<Self>) -> Result<(), ViewError> {
            Ok(())
        }
    }
}
