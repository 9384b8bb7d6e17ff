//! In-memory storage backend.
//!
//! Holds the chain tables, the view registry, and every view namespace in RAM.
//! DDL and write statements are interpreted structurally rather than parsed
//! as SQL, with the constraints Postgres would enforce: unknown relations and
//! columns, `NOT NULL`, unique indexes, and `ON CONFLICT` targets.
//!
//! Useful for tests and for embedding the engine without a database. All data
//! is lost when the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use chainview_core::error::ViewError;
use chainview_core::sql::{
    ColumnDefault, ColumnSpec, DdlStatement, OnConflict, Row, SqlType, WriteStatement,
};
use chainview_core::store::{StoreTransaction, ViewStore};
use chainview_core::types::{
    Block, ChainEvent, IndexProgress, ProgressUpdate, RegisteredView, Transaction, ViewHealth,
    ViewRegistration, ViewStatus,
};

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MemIndex {
    columns: Vec<String>,
    unique: bool,
}

#[derive(Debug, Clone, Default)]
struct MemTable {
    columns: Vec<ColumnSpec>,
    rows: Vec<Row>,
    next_id: i64,
    /// Indexes by name. Names are unique across the namespace.
    indexes: IndexMap<String, MemIndex>,
}

impl MemTable {
    fn unique_keys(&self) -> impl Iterator<Item = &Vec<String>> {
        self.indexes.values().filter(|i| i.unique).map(|i| &i.columns)
    }
}

type Namespace = IndexMap<String, MemTable>;

#[derive(Debug, Clone, Default)]
struct State {
    blocks: BTreeMap<u64, Block>,
    transactions: BTreeMap<u64, Vec<Transaction>>,
    events: BTreeMap<u64, Vec<ChainEvent>>,
    progress: HashMap<String, IndexProgress>,
    views: BTreeMap<String, RegisteredView>,
    next_view_id: i64,
    namespaces: HashMap<String, Namespace>,
}

/// In-memory [`ViewStore`].
///
/// Cheaply cloneable; clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    // ─── Chain fixtures ──────────────────────────────────────────────────────

    /// Insert or replace the block at `block.height`.
    pub fn insert_block(&self, block: Block) {
        self.state().blocks.insert(block.height, block);
    }

    /// Mark the block at `height` as orphaned.
    pub fn set_canonical(&self, height: u64, canonical: bool) {
        if let Some(block) = self.state().blocks.get_mut(&height) {
            block.canonical = canonical;
        }
    }

    pub fn insert_transaction(&self, tx: Transaction) {
        self.state()
            .transactions
            .entry(tx.block_height)
            .or_default()
            .push(tx);
    }

    pub fn insert_event(&self, event: ChainEvent) {
        self.state()
            .events
            .entry(event.block_height)
            .or_default()
            .push(event);
    }

    /// Drop every transaction and event at `height` (the indexer replacing a block).
    pub fn clear_height(&self, height: u64) {
        let mut state = self.state();
        state.transactions.remove(&height);
        state.events.remove(&height);
    }

    pub fn set_index_progress(&self, network: &str, progress: IndexProgress) {
        self.state().progress.insert(network.to_string(), progress);
    }

    // ─── Inspection ──────────────────────────────────────────────────────────

    /// Every row of `schema.table` in insertion order; empty if it does not exist.
    pub fn rows(&self, schema: &str, table: &str) -> Vec<Row> {
        self.state()
            .namespaces
            .get(schema)
            .and_then(|ns| ns.get(table))
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn has_schema(&self, schema: &str) -> bool {
        self.state().namespaces.contains_key(schema)
    }

    /// Column names of `schema.table`, in table order.
    pub fn columns(&self, schema: &str, table: &str) -> Vec<String> {
        self.state()
            .namespaces
            .get(schema)
            .and_then(|ns| ns.get(table))
            .map(|t| t.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ─── ViewStore impl ──────────────────────────────────────────────────────────

#[async_trait]
impl ViewStore for InMemoryStore {
    async fn block_at(&self, height: u64) -> Result<Option<Block>, ViewError> {
        Ok(self.state().blocks.get(&height).cloned())
    }

    async fn transactions_at(&self, height: u64) -> Result<Vec<Transaction>, ViewError> {
        Ok(self
            .state()
            .transactions
            .get(&height)
            .cloned()
            .unwrap_or_default())
    }

    async fn events_at(&self, height: u64) -> Result<Vec<ChainEvent>, ViewError> {
        let state = self.state();
        let Some(events) = state.events.get(&height) else {
            return Ok(vec![]);
        };
        // Order by transaction position in the block, then event index.
        let order: HashMap<&str, usize> = state
            .transactions
            .get(&height)
            .map(|txs| {
                txs.iter()
                    .enumerate()
                    .map(|(i, tx)| (tx.tx_id.as_str(), i))
                    .collect()
            })
            .unwrap_or_default();
        let mut events = events.clone();
        events.sort_by_key(|e| {
            (
                order.get(e.tx_id.as_str()).copied().unwrap_or(usize::MAX),
                e.event_index,
            )
        });
        Ok(events)
    }

    async fn index_progress(&self, network: &str) -> Result<Option<IndexProgress>, ViewError> {
        Ok(self.state().progress.get(network).copied())
    }

    async fn get_view(&self, name: &str) -> Result<Option<RegisteredView>, ViewError> {
        Ok(self.state().views.get(name).cloned())
    }

    async fn list_views(&self, status: Option<ViewStatus>) -> Result<Vec<RegisteredView>, ViewError> {
        Ok(self
            .state()
            .views
            .values()
            .filter(|v| status.map_or(true, |s| v.status == s))
            .cloned()
            .collect())
    }

    async fn deploy(
        &self,
        ddl: &[DdlStatement],
        registration: &ViewRegistration,
    ) -> Result<i64, ViewError> {
        let mut state = self.state();
        let mut namespaces = state.namespaces.clone();
        for statement in ddl {
            apply_ddl(&mut namespaces, statement)?;
        }
        state.namespaces = namespaces;

        let ts = now();
        let name = registration.definition.name.clone();
        let id = match state.views.get(&name) {
            Some(existing) => existing.id,
            None => {
                state.next_view_id += 1;
                state.next_view_id
            }
        };
        let previous = state.views.remove(&name);
        let (last_processed_block, health, created_at) = match previous {
            Some(prev) if !registration.reset_progress => {
                (prev.last_processed_block, prev.health, prev.created_at)
            }
            Some(prev) => (0, ViewHealth::default(), prev.created_at),
            None => (0, ViewHealth::default(), ts),
        };
        state.views.insert(
            name.clone(),
            RegisteredView {
                id,
                name,
                version: registration.definition.version,
                status: registration.status,
                definition: Some(registration.definition.clone()),
                schema_hash: registration.schema_hash.clone(),
                handler_path: registration.handler_path.clone(),
                schema_name: registration.schema_name.clone(),
                last_processed_block,
                health,
                created_at,
                updated_at: ts,
            },
        );
        Ok(id)
    }

    async fn record_progress(&self, name: &str, update: &ProgressUpdate) -> Result<(), ViewError> {
        let mut state = self.state();
        let view = state
            .views
            .get_mut(name)
            .ok_or_else(|| ViewError::ViewNotFound(name.to_string()))?;
        apply_progress(view, update);
        Ok(())
    }

    async fn delete_view(&self, name: &str) -> Result<bool, ViewError> {
        let mut state = self.state();
        let Some(view) = state.views.remove(name) else {
            return Ok(false);
        };
        state.namespaces.remove(&view.schema_name);
        Ok(true)
    }

    async fn find_rows(
        &self,
        schema: &str,
        table: &str,
        filter: &Row,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, ViewError> {
        let state = self.state();
        let t = table_ref(&state.namespaces, schema, table)?;
        check_columns(t, schema, table, filter.keys())?;
        Ok(t.rows
            .iter()
            .filter(|row| matches(row, filter))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn row_count(&self, schema: &str, table: &str) -> Result<u64, ViewError> {
        let state = self.state();
        Ok(table_ref(&state.namespaces, schema, table)?.rows.len() as u64)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, ViewError> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            working: HashMap::new(),
            progress: Vec::new(),
            failed: false,
        }))
    }
}

// ─── Transactions ────────────────────────────────────────────────────────────

/// Writes go to private copies of the namespaces they touch; commit installs
/// those copies and applies staged registry updates under one lock.
///
/// Namespaces are owned by one view each and the engine serializes work per
/// view, so installing copies wholesale does not lose concurrent writes.
struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    working: HashMap<String, Namespace>,
    progress: Vec<(String, ProgressUpdate)>,
    /// Set after a failed statement; like Postgres, the transaction is then unusable.
    failed: bool,
}

impl MemoryTransaction {
    fn ensure_usable(&self) -> Result<(), ViewError> {
        if self.failed {
            return Err(ViewError::Storage(
                "current transaction is aborted, commands ignored until end of transaction block".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn execute(&mut self, schema: &str, statements: &[WriteStatement]) -> Result<u64, ViewError> {
        self.ensure_usable()?;
        if !self.working.contains_key(schema) {
            let ns = lock(&self.state)
                .namespaces
                .get(schema)
                .cloned()
                .ok_or_else(|| ViewError::Storage(format!("schema \"{schema}\" does not exist")))?;
            self.working.insert(schema.to_string(), ns);
        }
        let Some(ns) = self.working.get_mut(schema) else {
            return Ok(0);
        };

        let mut affected = 0;
        for statement in statements {
            match apply_write(ns, schema, statement) {
                Ok(n) => affected += n,
                Err(e) => {
                    self.failed = true;
                    return Err(e);
                }
            }
        }
        Ok(affected)
    }

    async fn record_progress(&mut self, name: &str, update: &ProgressUpdate) -> Result<(), ViewError> {
        self.ensure_usable()?;
        self.progress.push((name.to_string(), update.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), ViewError> {
        self.ensure_usable()?;
        let mut state = lock(&self.state);
        if let Some((missing, _)) = self
            .progress
            .iter()
            .find(|(name, _)| !state.views.contains_key(name))
        {
            return Err(ViewError::ViewNotFound(missing.clone()));
        }
        let MemoryTransaction {
            working, progress, ..
        } = *self;
        for (schema, ns) in working {
            state.namespaces.insert(schema, ns);
        }
        for (name, update) in &progress {
            if let Some(view) = state.views.get_mut(name) {
                apply_progress(view, update);
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), ViewError> {
        Ok(())
    }
}

// ─── Interpretation ──────────────────────────────────────────────────────────

fn apply_progress(view: &mut RegisteredView, update: &ProgressUpdate) {
    let ts = now();
    if let Some(status) = update.status {
        view.status = status;
    }
    if let Some(height) = update.last_processed_block {
        view.last_processed_block = height;
    }
    view.health.total_processed += update.processed_delta;
    view.health.total_errors += update.errors_delta;
    if let Some(err) = &update.last_error {
        view.health.last_error = Some(err.clone());
        view.health.last_error_at = Some(ts);
    }
    view.updated_at = ts;
}

fn apply_ddl(namespaces: &mut HashMap<String, Namespace>, statement: &DdlStatement) -> Result<(), ViewError> {
    match statement {
        DdlStatement::CreateSchema { schema } => {
            namespaces.entry(schema.clone()).or_default();
        }
        DdlStatement::DropSchema { schema } => {
            namespaces.remove(schema);
        }
        DdlStatement::CreateTable {
            schema,
            table,
            columns,
        } => {
            let ns = namespaces
                .get_mut(schema)
                .ok_or_else(|| ViewError::Storage(format!("schema \"{schema}\" does not exist")))?;
            ns.entry(table.clone()).or_insert_with(|| MemTable {
                columns: columns.clone(),
                ..Default::default()
            });
        }
        DdlStatement::AddColumn {
            schema,
            table,
            column,
        } => {
            let t = table_mut(namespaces, schema, table)?;
            if t.columns.iter().any(|c| c.name == column.name) {
                return Ok(());
            }
            let fill = match &column.default {
                Some(default) => default_value(default),
                None if column.nullable || t.rows.is_empty() => Value::Null,
                None => {
                    return Err(ViewError::Storage(format!(
                        "column \"{}\" of relation \"{schema}.{table}\" contains null values",
                        column.name
                    )))
                }
            };
            for row in &mut t.rows {
                row.insert(column.name.clone(), fill.clone());
            }
            t.columns.push(column.clone());
        }
        DdlStatement::CreateIndex {
            schema,
            table,
            name,
            columns,
            unique,
        } => {
            let exists = namespaces
                .get(schema)
                .is_some_and(|ns| ns.values().any(|t| t.indexes.contains_key(name)));
            let t = table_mut(namespaces, schema, table)?;
            check_columns(t, schema, table, columns.iter())?;
            if exists {
                return Ok(());
            }
            if *unique {
                let mut seen: Vec<Vec<&Value>> = Vec::new();
                for row in &t.rows {
                    let key: Vec<&Value> = columns.iter().map(|c| row.get(c).unwrap_or(&Value::Null)).collect();
                    if seen.contains(&key) {
                        return Err(ViewError::Storage(format!(
                            "could not create unique index on \"{schema}.{table}\": duplicate key"
                        )));
                    }
                    seen.push(key);
                }
            }
            t.indexes.insert(
                name.clone(),
                MemIndex {
                    columns: columns.clone(),
                    unique: *unique,
                },
            );
        }
        DdlStatement::DropIndex { schema, name } => {
            if let Some(ns) = namespaces.get_mut(schema) {
                for t in ns.values_mut() {
                    t.indexes.shift_remove(name);
                }
            }
        }
    }
    Ok(())
}

fn apply_write(ns: &mut Namespace, schema: &str, statement: &WriteStatement) -> Result<u64, ViewError> {
    let table = statement.table();
    let t = ns
        .get_mut(table)
        .ok_or_else(|| missing_relation(schema, table))?;
    match statement {
        WriteStatement::Insert {
            row, on_conflict, ..
        } => insert(t, schema, table, row, on_conflict.as_ref()),
        WriteStatement::Update { filter, set, .. } => {
            check_columns(t, schema, table, filter.keys().chain(set.keys()))?;
            let mut n = 0;
            for existing in t.rows.iter_mut().filter(|r| matches(r, filter)) {
                for (k, v) in set {
                    existing.insert(k.clone(), v.clone());
                }
                n += 1;
            }
            Ok(n)
        }
        WriteStatement::Delete { filter, .. } => {
            check_columns(t, schema, table, filter.keys())?;
            let before = t.rows.len();
            t.rows.retain(|r| !matches(r, filter));
            Ok((before - t.rows.len()) as u64)
        }
    }
}

fn insert(
    t: &mut MemTable,
    schema: &str,
    table: &str,
    row: &Row,
    on_conflict: Option<&OnConflict>,
) -> Result<u64, ViewError> {
    check_columns(t, schema, table, row.keys())?;

    let mut full = Row::new();
    for col in &t.columns {
        let value = match row.get(&col.name) {
            Some(v) => v.clone(),
            None if col.ty == SqlType::Serial => Value::from(t.next_id + 1),
            None => col.default.as_ref().map(default_value).unwrap_or(Value::Null),
        };
        if value.is_null() && !col.nullable && !col.primary_key {
            return Err(ViewError::Storage(format!(
                "null value in column \"{}\" of relation \"{schema}.{table}\" violates not-null constraint",
                col.name
            )));
        }
        full.insert(col.name.clone(), value);
    }

    if let Some(conflict) = on_conflict {
        if !t.unique_keys().any(|u| same_set(u, &conflict.key)) {
            return Err(ViewError::Storage(format!(
                "there is no unique or exclusion constraint matching the ON CONFLICT specification on \"{schema}.{table}\""
            )));
        }
        if let Some(existing) = t.rows.iter_mut().find(|r| key_eq(r, &full, &conflict.key)) {
            if conflict.update.is_empty() {
                return Ok(0);
            }
            for col in &conflict.update {
                if let Some(v) = full.get(col) {
                    existing.insert(col.clone(), v.clone());
                }
            }
            return Ok(1);
        }
    }

    for unique in t.unique_keys() {
        if t.rows.iter().any(|r| key_eq(r, &full, unique)) {
            return Err(ViewError::Storage(format!(
                "duplicate key value violates unique constraint on \"{schema}.{table}\" ({})",
                unique.join(", ")
            )));
        }
    }
    t.next_id += 1;
    t.rows.push(full);
    Ok(1)
}

fn default_value(default: &ColumnDefault) -> Value {
    match default {
        ColumnDefault::Literal(v) => v.clone(),
        ColumnDefault::Now => Value::String(chrono::Utc::now().to_rfc3339()),
    }
}

fn table_ref<'a>(
    namespaces: &'a HashMap<String, Namespace>,
    schema: &str,
    table: &str,
) -> Result<&'a MemTable, ViewError> {
    namespaces
        .get(schema)
        .and_then(|ns| ns.get(table))
        .ok_or_else(|| missing_relation(schema, table))
}

fn table_mut<'a>(
    namespaces: &'a mut HashMap<String, Namespace>,
    schema: &str,
    table: &str,
) -> Result<&'a mut MemTable, ViewError> {
    namespaces
        .get_mut(schema)
        .and_then(|ns| ns.get_mut(table))
        .ok_or_else(|| missing_relation(schema, table))
}

fn missing_relation(schema: &str, table: &str) -> ViewError {
    ViewError::Storage(format!("relation \"{schema}.{table}\" does not exist"))
}

fn check_columns<'a>(
    t: &MemTable,
    schema: &str,
    table: &str,
    mut names: impl Iterator<Item = &'a String>,
) -> Result<(), ViewError> {
    match names.find(|n| !t.columns.iter().any(|c| &c.name == *n)) {
        Some(unknown) => Err(ViewError::Storage(format!(
            "column \"{unknown}\" of relation \"{schema}.{table}\" does not exist"
        ))),
        None => Ok(()),
    }
}

/// SQL-style filter match: `NULL` filter values match `IS NULL`.
fn matches(row: &Row, filter: &Row) -> bool {
    filter
        .iter()
        .all(|(k, v)| row.get(k).unwrap_or(&Value::Null) == v)
}

fn key_eq(a: &Row, b: &Row, key: &[String]) -> bool {
    key.iter().all(|c| {
        let (x, y) = (a.get(c).unwrap_or(&Value::Null), b.get(c).unwrap_or(&Value::Null));
        // NULLs are distinct under a unique index.
        !x.is_null() && x == y
    })
}

fn same_set(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|c| b.contains(c))
}
