//! Reindex driver — rebuilds a view from scratch over a block range.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::deployer::rebuild_ddl;
use crate::definition::ViewDefinition;
use crate::engine::ViewEngine;
use crate::error::ViewError;
use crate::processor::{LoadedView, ProcessOptions};
use crate::schema;
use crate::sql::{validate_identifier, DdlStatement};
use crate::types::{ProgressUpdate, ViewRegistration, ViewStatus};

#[derive(Debug, Clone, Default)]
pub struct ReindexOptions {
    /// First height to replay; defaults to 1.
    pub from_block: Option<u64>,
    /// Last height to replay; defaults to the indexer's contiguous tip.
    pub to_block: Option<u64>,
    /// Move the view to another namespace.
    pub schema_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexOutcome {
    /// Heights replayed, skipped ones included.
    pub blocks: u64,
    pub processed: u64,
    pub errors: u64,
}

/// Drop and rebuild the registered view named by `definition`, then replay
/// the requested range. Waits for any in-flight catch-up of the view.
pub async fn reindex(
    engine: &ViewEngine,
    definition: &ViewDefinition,
    options: &ReindexOptions,
) -> Result<ReindexOutcome, ViewError> {
    definition.validate()?;
    let name = definition.name.as_str();
    let store = engine.store();
    let registered = store
        .get_view(name)
        .await?
        .ok_or_else(|| ViewError::ViewNotFound(name.to_string()))?;

    let _guard = engine.locks().acquire(name).await;

    let result = async {
        let handlers = engine.loader().load(&registered.handler_path).await?;
        let schema_name = options
            .schema_name
            .clone()
            .unwrap_or_else(|| registered.schema_name.clone());
        validate_identifier("schema", &schema_name)?;

        let generated = schema::generate(&definition.schema, &schema_name)?;
        let mut ddl = rebuild_ddl(&generated);
        if schema_name != registered.schema_name {
            ddl.insert(
                0,
                DdlStatement::DropSchema {
                    schema: registered.schema_name.clone(),
                },
            );
        }
        store
            .deploy(
                &ddl,
                &ViewRegistration {
                    definition: definition.clone(),
                    schema_hash: generated.hash.clone(),
                    handler_path: registered.handler_path.clone(),
                    schema_name: schema_name.clone(),
                    status: ViewStatus::Reindexing,
                    reset_progress: true,
                },
            )
            .await?;

        let view = LoadedView {
            registered: store
                .get_view(name)
                .await?
                .ok_or_else(|| ViewError::ViewNotFound(name.to_string()))?,
            definition: Arc::new(definition.clone()),
            handlers,
        };
        replay(engine, &view, options).await
    }
    .await;

    if let Err(e) = &result {
        error!(view = name, error = %e, "Reindex failed");
        let update = ProgressUpdate::status(ViewStatus::Error).with_counts(0, 0, Some(e.to_string()));
        if let Err(record) = store.record_progress(name, &update).await {
            warn!(view = name, error = %record, "Could not mark view as errored");
        }
    }
    result
}

async fn replay(
    engine: &ViewEngine,
    view: &LoadedView,
    options: &ReindexOptions,
) -> Result<ReindexOutcome, ViewError> {
    let name = view.name();
    let store = engine.store();
    let config = engine.config();

    let from = options.from_block.unwrap_or(1).max(1);
    let to = match options.to_block {
        Some(to) => to,
        None => store
            .index_progress(&config.network)
            .await?
            .map(|p| p.last_contiguous_block)
            .unwrap_or(0),
    };
    info!(view = name, from, to, "Reindexing");

    let mut outcome = ReindexOutcome::default();
    let mut last_error = None;
    for height in from..=to {
        let block = engine.process_block(view, height, ProcessOptions::replay()).await?;
        outcome.blocks += 1;
        outcome.processed += block.processed;
        outcome.errors += block.errors;
        if block.last_error.is_some() {
            last_error = block.last_error;
        }
        if block.tripped {
            warn!(view = name, height, errors = block.errors, "Error threshold reached; block left empty");
        }
        if config.reindex_checkpoint_interval > 0 && outcome.blocks % config.reindex_checkpoint_interval == 0 {
            store
                .record_progress(
                    name,
                    &ProgressUpdate {
                        last_processed_block: Some(height),
                        ..Default::default()
                    },
                )
                .await?;
            info!(view = name, height, to, "Reindex progress");
        }
    }

    let final_height = if to >= from { to } else { from - 1 };
    store
        .record_progress(
            name,
            &ProgressUpdate::advance(final_height).with_counts(outcome.processed, outcome.errors, last_error),
        )
        .await?;
    info!(
        view = name,
        blocks = outcome.blocks,
        processed = outcome.processed,
        errors = outcome.errors,
        "Reindex finished"
    );
    Ok(outcome)
}
