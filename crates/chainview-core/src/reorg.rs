//! Reorg driver — repairs views after the block at a height was replaced.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::engine::ViewEngine;
use crate::error::ViewError;
use crate::processor::ProcessOptions;
use crate::types::{ProgressUpdate, ViewStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgOutcome {
    /// Views whose rows at the height were rebuilt.
    pub repaired: Vec<String>,
    pub failed: Vec<String>,
}

/// Rebuild every active view's rows at `height`.
///
/// Views that have not reached `height` are left to catch-up. Each view waits
/// for its in-flight catch-up to finish first. A failing view does not stop
/// the others.
pub async fn handle_reorg(engine: &ViewEngine, height: u64) -> Result<ReorgOutcome, ViewError> {
    let views = engine.store().list_views(Some(ViewStatus::Active)).await?;
    let affected: Vec<String> = views
        .into_iter()
        .filter(|v| v.definition.is_some() && v.last_processed_block >= height)
        .map(|v| v.name)
        .collect();
    info!(height, views = affected.len(), "Handling reorg");

    let mut outcome = ReorgOutcome::default();
    for name in affected {
        match repair(engine, &name, height).await {
            Ok(()) => outcome.repaired.push(name),
            Err(e) => {
                error!(view = %name, height, error = %e, "Reorg repair failed");
                outcome.failed.push(name);
            }
        }
    }
    Ok(outcome)
}

async fn repair(engine: &ViewEngine, name: &str, height: u64) -> Result<(), ViewError> {
    let _guard = engine.locks().acquire(name).await;
    let view = engine.load_view(name).await?;
    let block = engine
        .process_block(&view, height, ProcessOptions::repair())
        .await?;
    if block.tripped {
        return Err(ViewError::Other(format!(
            "error threshold reached while reprocessing block {height}: {}",
            block.last_error.unwrap_or_default()
        )));
    }
    if block.processed > 0 || block.errors > 0 {
        engine
            .store()
            .record_progress(
                name,
                &ProgressUpdate::default().with_counts(block.processed, block.errors, block.last_error),
            )
            .await?;
    }
    if block.skipped {
        warn!(view = %name, height, "Replacement block not available; rows at height removed");
    }
    Ok(())
}
