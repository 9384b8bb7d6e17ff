//! `ViewEngine` — the public entry point tying store, handlers, and drivers together.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::catchup;
use crate::config::EngineConfig;
use crate::definition::ViewDefinition;
use crate::deployer::{self, DeployOptions, DeployOutcome};
use crate::error::ViewError;
use crate::handler::HandlerLoader;
use crate::locks::ViewLocks;
use crate::processor::{self, BlockOutcome, LoadedView, ProcessOptions};
use crate::reindex::{self, ReindexOptions, ReindexOutcome};
use crate::reorg::{self, ReorgOutcome};
use crate::store::ViewStore;
use crate::types::{ProgressUpdate, RegisteredView, ViewStatus};

/// Result of one catch-up sweep over every active view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Views a catch-up was attempted for.
    pub views: usize,
    /// Blocks applied across all views.
    pub blocks: u64,
    /// Views whose handlers failed to load or whose catch-up failed.
    pub failed: Vec<String>,
}

pub struct ViewEngine {
    store: Arc<dyn ViewStore>,
    loader: Arc<dyn HandlerLoader>,
    config: EngineConfig,
    locks: ViewLocks,
}

impl ViewEngine {
    pub fn new(store: Arc<dyn ViewStore>, loader: Arc<dyn HandlerLoader>, config: EngineConfig) -> Self {
        Self {
            store,
            loader,
            config,
            locks: ViewLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ViewStore> {
        &self.store
    }

    pub fn loader(&self) -> &Arc<dyn HandlerLoader> {
        &self.loader
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn locks(&self) -> &ViewLocks {
        &self.locks
    }

    // ─── Deploy / reindex ────────────────────────────────────────────────────

    /// Create, migrate, or rebuild a view. Waits for an in-flight catch-up.
    pub async fn deploy_schema(
        &self,
        definition: &ViewDefinition,
        handler_path: &str,
        options: &DeployOptions,
    ) -> Result<DeployOutcome, ViewError> {
        let _guard = self.locks.acquire(&definition.name).await;
        deployer::deploy(self.store.as_ref(), definition, handler_path, options).await
    }

    pub async fn reindex_view(
        &self,
        definition: &ViewDefinition,
        options: &ReindexOptions,
    ) -> Result<ReindexOutcome, ViewError> {
        reindex::reindex(self, definition, options).await
    }

    // ─── Processing ──────────────────────────────────────────────────────────

    /// Resolve a registered view's definition and handlers. A handler load
    /// failure marks the view `error`.
    pub async fn load_view(&self, name: &str) -> Result<LoadedView, ViewError> {
        let registered = self
            .store
            .get_view(name)
            .await?
            .ok_or_else(|| ViewError::ViewNotFound(name.to_string()))?;
        let definition = registered
            .definition
            .clone()
            .ok_or_else(|| ViewError::invalid(format!("view '{name}' has no recorded definition")))?;

        let handlers = match self.loader.load(&registered.handler_path).await {
            Ok(handlers) => handlers,
            Err(e) => {
                error!(view = name, path = %registered.handler_path, error = %e, "Handler load failed");
                let update = ProgressUpdate::status(ViewStatus::Error).with_counts(0, 0, Some(e.to_string()));
                if let Err(record) = self.store.record_progress(name, &update).await {
                    warn!(view = name, error = %record, "Could not mark view as errored");
                }
                return Err(e);
            }
        };

        Ok(LoadedView {
            registered,
            definition: Arc::new(definition),
            handlers,
        })
    }

    pub async fn process_block(
        &self,
        view: &LoadedView,
        height: u64,
        options: ProcessOptions,
    ) -> Result<BlockOutcome, ViewError> {
        processor::process_block(&self.store, &self.config, view, height, options).await
    }

    pub async fn catch_up(&self, view: &LoadedView) -> Result<u64, ViewError> {
        catchup::catch_up(self, view).await
    }

    /// Catch up every active view, each on its own task.
    pub async fn catch_up_all(self: &Arc<Self>) -> Result<SweepReport, ViewError> {
        let views = self.store.list_views(Some(ViewStatus::Active)).await?;
        let mut report = SweepReport {
            views: views.len(),
            ..Default::default()
        };

        let mut tasks = Vec::with_capacity(views.len());
        for registered in views {
            let name = registered.name;
            let view = match self.load_view(&name).await {
                Ok(view) => view,
                Err(_) => {
                    report.failed.push(name);
                    continue;
                }
            };
            let engine = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                let result = engine.catch_up(&view).await;
                (name, result)
            }));
        }

        for joined in join_all(tasks).await {
            match joined {
                Ok((_, Ok(blocks))) => report.blocks += blocks,
                Ok((name, Err(e))) => {
                    warn!(view = %name, error = %e, "Catch-up failed during sweep");
                    report.failed.push(name);
                }
                Err(e) => error!(error = %e, "Catch-up task panicked"),
            }
        }
        if report.blocks > 0 || !report.failed.is_empty() {
            info!(views = report.views, blocks = report.blocks, failed = report.failed.len(), "Sweep finished");
        }
        Ok(report)
    }

    pub async fn handle_reorg(&self, height: u64) -> Result<ReorgOutcome, ViewError> {
        reorg::handle_reorg(self, height).await
    }

    // ─── Registry ────────────────────────────────────────────────────────────

    pub async fn view_status(&self, name: &str) -> Result<Option<RegisteredView>, ViewError> {
        self.store.get_view(name).await
    }

    pub async fn list_views(&self, status: Option<ViewStatus>) -> Result<Vec<RegisteredView>, ViewError> {
        self.store.list_views(status).await
    }

    /// Drop a view's namespace and registry row. Waits for an in-flight catch-up.
    pub async fn delete_view(&self, name: &str) -> Result<bool, ViewError> {
        let deleted = {
            let _guard = self.locks.acquire(name).await;
            self.store.delete_view(name).await?
        };
        self.locks.forget(name);
        if deleted {
            info!(view = name, "View deleted");
        }
        Ok(deleted)
    }
}
