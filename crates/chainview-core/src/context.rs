//! Execution context — the write buffer and read handle a handler works through.
//!
//! A fresh context is built per block per view. Writes are deferred as
//! [`WriteOp`]s and compiled into [`WriteStatement`]s by [`ExecutionContext::flush`],
//! which the block processor calls inside its store transaction. Reads go
//! straight to the store and only see committed rows.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::definition::ViewDefinition;
use crate::error::ViewError;
use crate::sql::{OnConflict, Row, WriteStatement, COL_BLOCK_HEIGHT, COL_CREATED_AT, COL_TX_ID};
use crate::store::{StoreTransaction, ViewStore};
use crate::types::{Block, Transaction};

/// Block metadata visible to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMeta {
    pub height: u64,
    pub hash: String,
    pub timestamp: i64,
    pub burn_block_height: u64,
}

impl From<&Block> for BlockMeta {
    fn from(block: &Block) -> Self {
        Self {
            height: block.height,
            hash: block.hash.clone(),
            timestamp: block.timestamp,
            burn_block_height: block.burn_block_height,
        }
    }
}

/// Transaction metadata of the payload currently being handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxMeta {
    pub tx_id: String,
    pub tx_type: String,
    pub sender: String,
    pub status: String,
    pub contract_id: Option<String>,
    pub function_name: Option<String>,
}

impl From<&Transaction> for TxMeta {
    fn from(tx: &Transaction) -> Self {
        Self {
            tx_id: tx.tx_id.clone(),
            tx_type: tx.tx_type.clone(),
            sender: tx.sender.clone(),
            status: tx.status.clone(),
            contract_id: tx.contract_id.clone(),
            function_name: tx.function_name.clone(),
        }
    }
}

/// A deferred write. Inserts capture the transaction id at buffer time.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        table: String,
        row: Row,
        tx_id: String,
    },
    Update {
        table: String,
        filter: Row,
        set: Row,
    },
    Delete {
        table: String,
        filter: Row,
    },
    /// Insert that resolves conflicts on a declared unique key.
    UpsertWithKey {
        table: String,
        key: Vec<String>,
        row: Row,
        tx_id: String,
    },
    /// Upsert on a column set with no matching unique key: a plain insert.
    UpsertFallback {
        table: String,
        row: Row,
        tx_id: String,
    },
}

/// Per-block, per-view handle given to handlers.
pub struct ExecutionContext {
    store: Arc<dyn ViewStore>,
    view: String,
    schema_name: String,
    definition: Arc<ViewDefinition>,
    block: BlockMeta,
    tx: Option<TxMeta>,
    pending: Vec<WriteOp>,
}

impl ExecutionContext {
    pub fn new(
        store: Arc<dyn ViewStore>,
        definition: Arc<ViewDefinition>,
        schema_name: impl Into<String>,
        block: BlockMeta,
    ) -> Self {
        Self {
            store,
            view: definition.name.clone(),
            schema_name: schema_name.into(),
            definition,
            block,
            tx: None,
            pending: Vec::new(),
        }
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn block(&self) -> &BlockMeta {
        &self.block
    }

    pub fn tx(&self) -> Option<&TxMeta> {
        self.tx.as_ref()
    }

    /// Set the transaction subsequent inserts are stamped with.
    pub fn set_tx(&mut self, tx: TxMeta) {
        self.tx = Some(tx);
    }

    /// Buffered writes, in call order.
    pub fn pending(&self) -> &[WriteOp] {
        &self.pending
    }

    // ─── Writes ──────────────────────────────────────────────────────────────

    pub fn insert(&mut self, table: &str, row: Value) -> Result<(), ViewError> {
        self.check_table(table)?;
        let row = user_row(table, row)?;
        let tx_id = self.current_tx_id(table)?;
        self.pending.push(WriteOp::Insert {
            table: table.to_string(),
            row,
            tx_id,
        });
        Ok(())
    }

    /// Update rows matching `filter` with the columns of `set`.
    pub fn update(&mut self, table: &str, filter: Value, set: Value) -> Result<(), ViewError> {
        self.check_table(table)?;
        let filter = object(table, filter)?;
        let set = user_row(table, set)?;
        self.pending.push(WriteOp::Update {
            table: table.to_string(),
            filter,
            set,
        });
        Ok(())
    }

    pub fn delete(&mut self, table: &str, filter: Value) -> Result<(), ViewError> {
        self.check_table(table)?;
        let filter = object(table, filter)?;
        self.pending.push(WriteOp::Delete {
            table: table.to_string(),
            filter,
        });
        Ok(())
    }

    /// Insert `key ∪ row`, replacing the non-key columns of an existing row
    /// with the same key. Requires a unique key over exactly `key`'s columns;
    /// without one the row is inserted as-is.
    pub fn upsert(&mut self, table: &str, key: Value, row: Value) -> Result<(), ViewError> {
        self.check_table(table)?;
        let key = user_row(table, key)?;
        let mut merged = key.clone();
        merged.extend(user_row(table, row)?);
        let tx_id = self.current_tx_id(table)?;

        let key_columns: Vec<String> = key.keys().cloned().collect();
        let group = self
            .definition
            .schema
            .get(table)
            .and_then(|def| def.unique_key_for(&key_columns))
            .cloned();

        let op = match group {
            Some(key) => WriteOp::UpsertWithKey {
                table: table.to_string(),
                key,
                row: merged,
                tx_id,
            },
            None => {
                warn!(
                    view = %self.view,
                    table,
                    key = ?key_columns,
                    "No unique key matches upsert columns; inserting without conflict handling"
                );
                WriteOp::UpsertFallback {
                    table: table.to_string(),
                    row: merged,
                    tx_id,
                }
            }
        };
        self.pending.push(op);
        Ok(())
    }

    // ─── Reads ───────────────────────────────────────────────────────────────

    /// First committed row of `table` matching `filter`.
    pub async fn find_one(&self, table: &str, filter: Value) -> Result<Option<Row>, ViewError> {
        Ok(self.find_many(table, filter, Some(1)).await?.into_iter().next())
    }

    /// Committed rows of `table` matching `filter`.
    pub async fn find_many(
        &self,
        table: &str,
        filter: Value,
        limit: Option<usize>,
    ) -> Result<Vec<Row>, ViewError> {
        self.check_table(table)?;
        let filter = object(table, filter)?;
        self.store
            .find_rows(&self.schema_name, table, &filter, limit)
            .await
    }

    // ─── Flush ───────────────────────────────────────────────────────────────

    /// Execute every buffered write, inside `tx` when given or a transaction
    /// of its own otherwise. Returns the number of writes executed.
    pub async fn flush(&mut self, tx: Option<&mut dyn StoreTransaction>) -> Result<usize, ViewError> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let statements = self.compile();
        let count = statements.len();
        match tx {
            Some(tx) => {
                tx.execute(&self.schema_name, &statements).await?;
            }
            None => {
                let mut own = self.store.begin().await?;
                if let Err(e) = own.execute(&self.schema_name, &statements).await {
                    if let Err(rb) = own.rollback().await {
                        warn!(view = %self.view, error = %rb, "Rollback after failed flush failed");
                    }
                    return Err(e);
                }
                own.commit().await?;
            }
        }
        self.pending.clear();
        Ok(count)
    }

    /// Number of buffered writes; pair with [`Self::discard_from`].
    pub(crate) fn mark(&self) -> usize {
        self.pending.len()
    }

    /// Drop writes buffered after `mark`.
    pub(crate) fn discard_from(&mut self, mark: usize) {
        self.pending.truncate(mark);
    }

    fn compile(&self) -> Vec<WriteStatement> {
        let created_at = Value::String(chrono::Utc::now().to_rfc3339());
        let height = Value::from(self.block.height);
        let stamp = |mut row: Row, tx_id: &str| {
            row.insert(COL_BLOCK_HEIGHT.into(), height.clone());
            row.insert(COL_TX_ID.into(), Value::String(tx_id.to_string()));
            row.insert(COL_CREATED_AT.into(), created_at.clone());
            row
        };

        self.pending
            .iter()
            .map(|op| match op {
                WriteOp::Insert { table, row, tx_id }
                | WriteOp::UpsertFallback { table, row, tx_id } => WriteStatement::Insert {
                    table: table.clone(),
                    row: stamp(row.clone(), tx_id),
                    on_conflict: None,
                },
                WriteOp::UpsertWithKey {
                    table,
                    key,
                    row,
                    tx_id,
                } => {
                    let update = row
                        .keys()
                        .filter(|c| !key.contains(c) && !c.starts_with('_'))
                        .cloned()
                        .collect();
                    WriteStatement::Insert {
                        table: table.clone(),
                        row: stamp(row.clone(), tx_id),
                        on_conflict: Some(OnConflict {
                            key: key.clone(),
                            update,
                        }),
                    }
                }
                WriteOp::Update { table, filter, set } => WriteStatement::Update {
                    table: table.clone(),
                    filter: filter.clone(),
                    set: set.clone(),
                },
                WriteOp::Delete { table, filter } => WriteStatement::Delete {
                    table: table.clone(),
                    filter: filter.clone(),
                },
            })
            .collect()
    }

    fn check_table(&self, table: &str) -> Result<(), ViewError> {
        if self.definition.schema.contains_key(table) {
            return Ok(());
        }
        let valid = self
            .definition
            .schema
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        Err(ViewError::UnknownTable {
            table: table.to_string(),
            valid,
        })
    }

    fn current_tx_id(&self, table: &str) -> Result<String, ViewError> {
        self.tx
            .as_ref()
            .map(|tx| tx.tx_id.clone())
            .ok_or_else(|| ViewError::MissingTxContext {
                table: table.to_string(),
            })
    }
}

fn object(table: &str, value: Value) -> Result<Row, ViewError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ViewError::InvalidRow {
            table: table.to_string(),
            reason: format!("expected a JSON object, got {other}"),
        }),
    }
}

/// An object whose columns are all user columns.
fn user_row(table: &str, value: Value) -> Result<Row, ViewError> {
    let row = object(table, value)?;
    if let Some(col) = row.keys().find(|c| c.starts_with('_')) {
        return Err(ViewError::InvalidRow {
            table: table.to_string(),
            reason: format!("system column '{col}' is populated automatically"),
        });
    }
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ColumnDef, ColumnType, Source, TableDef};
    use crate::store::testing::NullStore;
    use serde_json::json;

    fn definition() -> Arc<ViewDefinition> {
        let mut schema = crate::definition::TableSchema::new();
        schema.insert(
            "balances".into(),
            TableDef::new()
                .column("address", ColumnDef::new(ColumnType::Principal))
                .column("amount", ColumnDef::new(ColumnType::Uint))
                .column("memo", ColumnDef::new(ColumnType::Text).nullable())
                .unique_key(&["address"]),
        );
        schema.insert(
            "transfers".into(),
            TableDef::new().column("amount", ColumnDef::new(ColumnType::Uint)),
        );
        Arc::new(ViewDefinition {
            name: "balances".into(),
            version: 1,
            description: None,
            sources: vec![Source::tx_type("token_transfer")],
            schema,
        })
    }

    fn ctx() -> (ExecutionContext, Arc<NullStore>) {
        let store = Arc::new(NullStore::default());
        let block = BlockMeta {
            height: 42,
            hash: "0xb".into(),
            timestamp: 1_700_000_000,
            burn_block_height: 800_000,
        };
        (
            ExecutionContext::new(store.clone(), definition(), "view_balances", block),
            store,
        )
    }

    fn tx_meta(id: &str) -> TxMeta {
        TxMeta {
            tx_id: id.into(),
            tx_type: "token_transfer".into(),
            sender: "SP1".into(),
            status: "success".into(),
            contract_id: None,
            function_name: None,
        }
    }

    #[test]
    fn unknown_table_names_valid_tables() {
        let (mut ctx, _) = ctx();
        ctx.set_tx(tx_meta("0x1"));
        let err = ctx.insert("nope", json!({"amount": 1})).unwrap_err();
        match err {
            ViewError::UnknownTable { table, valid } => {
                assert_eq!(table, "nope");
                assert_eq!(valid, "balances, transfers");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn insert_requires_tx_context() {
        let (mut ctx, _) = ctx();
        let err = ctx.insert("transfers", json!({"amount": 1})).unwrap_err();
        assert!(matches!(err, ViewError::MissingTxContext { .. }));
        // Deletes do not need one.
        ctx.delete("transfers", json!({"amount": 1})).unwrap();
    }

    #[test]
    fn rows_must_be_objects_without_system_columns() {
        let (mut ctx, _) = ctx();
        ctx.set_tx(tx_meta("0x1"));
        assert!(matches!(
            ctx.insert("transfers", json!([1, 2])).unwrap_err(),
            ViewError::InvalidRow { .. }
        ));
        assert!(matches!(
            ctx.insert("transfers", json!({"amount": 1, "_tx_id": "x"})).unwrap_err(),
            ViewError::InvalidRow { .. }
        ));
    }

    #[test]
    fn insert_captures_tx_id_at_buffer_time() {
        let (mut ctx, _) = ctx();
        ctx.set_tx(tx_meta("0x1"));
        ctx.insert("transfers", json!({"amount": 1})).unwrap();
        ctx.set_tx(tx_meta("0x2"));
        ctx.insert("transfers", json!({"amount": 2})).unwrap();

        let compiled = ctx.compile();
        let tx_ids: Vec<_> = compiled
            .iter()
            .map(|s| match s {
                WriteStatement::Insert { row, .. } => row[COL_TX_ID].clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(tx_ids, vec![json!("0x1"), json!("0x2")]);
        match &compiled[0] {
            WriteStatement::Insert { row, .. } => {
                assert_eq!(row[COL_BLOCK_HEIGHT], json!(42));
                assert!(row[COL_CREATED_AT].is_string());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn upsert_with_matching_unique_key() {
        let (mut ctx, _) = ctx();
        ctx.set_tx(tx_meta("0x1"));
        ctx.upsert("balances", json!({"address": "SP1"}), json!({"amount": 5}))
            .unwrap();
        assert!(matches!(ctx.pending()[0], WriteOp::UpsertWithKey { .. }));

        match &ctx.compile()[0] {
            WriteStatement::Insert {
                on_conflict: Some(conflict),
                row,
                ..
            } => {
                assert_eq!(conflict.key, vec!["address".to_string()]);
                assert_eq!(conflict.update, vec!["amount".to_string()]);
                assert_eq!(row["address"], json!("SP1"));
            }
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn upsert_key_only_compiles_to_do_nothing() {
        let (mut ctx, _) = ctx();
        ctx.set_tx(tx_meta("0x1"));
        ctx.upsert("balances", json!({"address": "SP1"}), json!({}))
            .unwrap();
        match &ctx.compile()[0] {
            WriteStatement::Insert {
                on_conflict: Some(conflict),
                ..
            } => assert!(conflict.update.is_empty()),
            other => panic!("unexpected statement: {other:?}"),
        }
    }

    #[test]
    fn upsert_without_unique_key_falls_back_to_insert() {
        let (mut ctx, _) = ctx();
        ctx.set_tx(tx_meta("0x1"));
        ctx.upsert("transfers", json!({"amount": 1}), json!({}))
            .unwrap();
        assert!(matches!(ctx.pending()[0], WriteOp::UpsertFallback { .. }));
        assert!(matches!(
            ctx.compile()[0],
            WriteStatement::Insert {
                on_conflict: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn flush_executes_in_given_transaction() {
        let (mut ctx, store) = ctx();
        assert_eq!(ctx.flush(None).await.unwrap(), 0);

        ctx.set_tx(tx_meta("0x1"));
        ctx.insert("transfers", json!({"amount": 1})).unwrap();
        ctx.delete("transfers", json!({"amount": 0})).unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(ctx.flush(Some(&mut *tx)).await.unwrap(), 2);
        assert!(ctx.pending().is_empty());
        assert_eq!(store.executed().len(), 2);
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn flush_without_transaction_commits_its_own() {
        let (mut ctx, store) = ctx();
        ctx.set_tx(tx_meta("0x1"));
        ctx.insert("transfers", json!({"amount": 1})).unwrap();
        assert_eq!(ctx.flush(None).await.unwrap(), 1);
        assert_eq!(store.commits(), 1);
    }
}
