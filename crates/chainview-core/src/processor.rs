//! Block processor — applies one block to one view.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::context::{BlockMeta, ExecutionContext};
use crate::definition::ViewDefinition;
use crate::error::ViewError;
use crate::handler::HandlerSet;
use crate::matcher::match_sources;
use crate::runner::{self, RunOptions};
use crate::sql::{Row, WriteStatement, COL_BLOCK_HEIGHT};
use crate::store::{StoreTransaction, ViewStore};
use crate::types::{ProgressUpdate, RegisteredView};

/// A registered view with its definition and handlers resolved.
#[derive(Debug, Clone)]
pub struct LoadedView {
    pub registered: RegisteredView,
    pub definition: Arc<ViewDefinition>,
    pub handlers: Arc<HandlerSet>,
}

impl LoadedView {
    pub fn name(&self) -> &str {
        &self.registered.name
    }

    pub fn schema_name(&self) -> &str {
        &self.registered.schema_name
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOptions {
    /// Leave the watermark and health counters to the caller.
    pub skip_progress_update: bool,
    /// Delete the view's rows at this height first (reorg repair).
    pub rollback_first: bool,
}

impl ProcessOptions {
    pub fn repair() -> Self {
        Self {
            skip_progress_update: true,
            rollback_first: true,
        }
    }

    pub fn replay() -> Self {
        Self {
            skip_progress_update: true,
            rollback_first: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockOutcome {
    pub matched: usize,
    pub processed: u64,
    pub errors: u64,
    /// The block was missing or non-canonical; nothing was applied.
    pub skipped: bool,
    /// The handler error threshold was reached; nothing was applied.
    pub tripped: bool,
    pub last_error: Option<String>,
}

impl BlockOutcome {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// Apply block `height` to `view`.
pub async fn process_block(
    store: &Arc<dyn ViewStore>,
    config: &EngineConfig,
    view: &LoadedView,
    height: u64,
    options: ProcessOptions,
) -> Result<BlockOutcome, ViewError> {
    let name = view.name();
    let block = match store.block_at(height).await? {
        Some(block) if block.canonical => block,
        found => {
            debug!(
                view = name,
                height,
                reason = if found.is_some() { "non-canonical" } else { "missing" },
                "Skipping block"
            );
            if options.rollback_first {
                let mut tx = store.begin().await?;
                if let Err(e) = tx.execute(view.schema_name(), &rollback_statements(view, height)).await {
                    abort(tx, name).await;
                    return Err(e);
                }
                tx.commit().await?;
            }
            return Ok(BlockOutcome::skipped());
        }
    };

    let transactions = store.transactions_at(height).await?;
    let events = store.events_at(height).await?;
    let matched = match_sources(&view.definition.sources, &transactions, &events);

    let mut tx = store.begin().await?;
    if options.rollback_first {
        if let Err(e) = tx.execute(view.schema_name(), &rollback_statements(view, height)).await {
            abort(tx, name).await;
            return Err(e);
        }
    }

    let mut outcome = BlockOutcome {
        matched: matched.len(),
        ..Default::default()
    };

    if !matched.is_empty() {
        let mut ctx = ExecutionContext::new(
            store.clone(),
            view.definition.clone(),
            view.schema_name(),
            BlockMeta::from(&block),
        );
        let run = runner::run(
            name,
            &view.handlers,
            &matched,
            &mut ctx,
            RunOptions {
                error_threshold: config.error_threshold,
            },
        )
        .await;
        outcome.processed = run.processed;
        outcome.errors = run.errors;
        outcome.last_error = run.last_error.clone();

        if run.tripped {
            tx.rollback().await?;
            outcome.tripped = true;
            if !options.skip_progress_update {
                store
                    .record_progress(
                        name,
                        &ProgressUpdate::default().with_counts(run.processed, run.errors, run.last_error),
                    )
                    .await?;
            }
            warn!(view = name, height, errors = outcome.errors, "Block rolled back; will retry on next catch-up");
            return Ok(outcome);
        }

        if let Err(e) = ctx.flush(Some(&mut *tx)).await {
            abort(tx, name).await;
            return Err(e);
        }
    }

    if !options.skip_progress_update {
        let update = ProgressUpdate::advance(height).with_counts(
            outcome.processed,
            outcome.errors,
            outcome.last_error.clone(),
        );
        if let Err(e) = tx.record_progress(name, &update).await {
            abort(tx, name).await;
            return Err(e);
        }
    }
    tx.commit().await?;

    debug!(
        view = name,
        height,
        matched = outcome.matched,
        processed = outcome.processed,
        errors = outcome.errors,
        "Block applied"
    );

    if config.row_count_sample_interval > 0 && height % config.row_count_sample_interval == 0 {
        sample_row_counts(store, config, view).await;
    }
    Ok(outcome)
}

/// Delete every row the view derived from `height`.
fn rollback_statements(view: &LoadedView, height: u64) -> Vec<WriteStatement> {
    let mut filter = Row::new();
    filter.insert(COL_BLOCK_HEIGHT.into(), Value::from(height));
    view.definition
        .schema
        .keys()
        .map(|table| WriteStatement::Delete {
            table: table.clone(),
            filter: filter.clone(),
        })
        .collect()
}

async fn abort(tx: Box<dyn StoreTransaction>, view: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(view, error = %e, "Rollback failed");
    }
}

async fn sample_row_counts(store: &Arc<dyn ViewStore>, config: &EngineConfig, view: &LoadedView) {
    for table in view.definition.schema.keys() {
        match store.row_count(view.schema_name(), table).await {
            Ok(rows) if rows > config.row_count_warn_threshold => warn!(
                view = view.name(),
                table = %table,
                rows,
                threshold = config.row_count_warn_threshold,
                "Table is unusually large"
            ),
            Ok(_) => {}
            Err(e) => debug!(view = view.name(), table = %table, error = %e, "Row count sample failed"),
        }
    }
}
