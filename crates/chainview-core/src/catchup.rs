//! Catch-up driver — replays a view from its watermark to the indexer's
//! contiguous tip.

use tracing::{debug, error, info, warn};

use crate::engine::ViewEngine;
use crate::error::ViewError;
use crate::processor::{LoadedView, ProcessOptions};
use crate::types::{ProgressUpdate, ViewStatus};

/// Bring `view` up to date. Returns the number of blocks applied.
///
/// A catch-up already running for the same view makes this a no-op that
/// returns 0. Replay stops early, without error, at the first block that was
/// skipped or rolled back so that the watermark never jumps a gap.
pub async fn catch_up(engine: &ViewEngine, view: &LoadedView) -> Result<u64, ViewError> {
    let name = view.name();
    let Some(_guard) = engine.locks().try_acquire(name) else {
        debug!(view = name, "Catch-up already in flight; skipping");
        return Ok(0);
    };

    match replay(engine, view).await {
        Ok(blocks) => Ok(blocks),
        Err(e) => {
            error!(view = name, error = %e, "Catch-up failed");
            let update = ProgressUpdate::status(ViewStatus::Error).with_counts(0, 0, Some(e.to_string()));
            if let Err(record) = engine.store().record_progress(name, &update).await {
                warn!(view = name, error = %record, "Could not mark view as errored");
            }
            Err(e)
        }
    }
}

async fn replay(engine: &ViewEngine, view: &LoadedView) -> Result<u64, ViewError> {
    let name = view.name();
    let store = engine.store();
    let config = engine.config();

    // The snapshot in `view` may predate a reorg repair or another catch-up.
    let current = store
        .get_view(name)
        .await?
        .ok_or_else(|| ViewError::ViewNotFound(name.to_string()))?;
    if current.status != ViewStatus::Active {
        debug!(view = name, status = %current.status, "View not active; skipping catch-up");
        return Ok(0);
    }

    let target = store
        .index_progress(&config.network)
        .await?
        .map(|p| p.last_contiguous_block)
        .unwrap_or(0);
    let start = current.last_processed_block + 1;
    if start > target {
        return Ok(0);
    }
    info!(view = name, from = start, to = target, "Catching up");

    let mut applied = 0u64;
    for height in start..=target {
        let outcome = engine
            .process_block(view, height, ProcessOptions::default())
            .await?;
        if outcome.skipped {
            warn!(view = name, height, "Block unavailable; pausing catch-up");
            break;
        }
        if outcome.tripped {
            warn!(view = name, height, errors = outcome.errors, "Error threshold reached; pausing catch-up");
            break;
        }
        applied += 1;
        if config.progress_log_interval > 0 && applied % config.progress_log_interval == 0 {
            info!(view = name, height, target, applied, "Catch-up progress");
        }
    }

    info!(view = name, applied, "Catch-up finished");
    Ok(applied)
}
