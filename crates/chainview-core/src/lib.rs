//! chainview-core — materialized views over a blockchain event log.
//!
//! # Architecture
//!
//! ```text
//! ViewService ──► ViewEngine
//!   (bus, poll)      ├── deployer      (generate / diff / migrate DDL)
//!                    ├── catchup       (watermark → contiguous tip)
//!                    ├── reindex       (drop, recreate, replay range)
//!                    ├── reorg         (delete + reapply one height)
//!                    └── processor     (one block, one view, one transaction)
//!                          ├── matcher       (sources → matched txs/events)
//!                          ├── runner        (HandlerSet dispatch, error threshold)
//!                          └── context       (deferred writes → WriteStatements)
//!
//! ViewStore: memory / Postgres (chainview-storage)
//! ```

pub mod bus;
pub mod catchup;
pub mod config;
pub mod context;
pub mod definition;
pub mod deployer;
pub mod engine;
pub mod error;
pub mod handler;
pub mod locks;
pub mod matcher;
pub mod processor;
pub mod reindex;
pub mod reorg;
pub mod runner;
pub mod schema;
pub mod service;
pub mod sql;
pub mod store;
pub mod types;

pub use bus::{MemoryBus, NotificationBus, Subscription};
pub use config::EngineConfig;
pub use context::{BlockMeta, ExecutionContext, TxMeta, WriteOp};
pub use definition::{ColumnDef, ColumnType, Source, TableDef, TableSchema, ViewDefinition};
pub use deployer::{DeployAction, DeployOptions, DeployOutcome};
pub use engine::{SweepReport, ViewEngine};
pub use error::ViewError;
pub use handler::{
    handler_fn, HandlerLoader, HandlerPayload, HandlerSet, StaticHandlerLoader, ViewHandler,
};
pub use matcher::{match_sources, MatchedTx};
pub use processor::{BlockOutcome, LoadedView, ProcessOptions};
pub use reindex::{ReindexOptions, ReindexOutcome};
pub use reorg::ReorgOutcome;
pub use runner::{RunOptions, RunOutcome};
pub use schema::{GeneratedSchema, SchemaDiff};
pub use service::ViewService;
pub use sql::{DdlStatement, Row, WriteStatement};
pub use store::{StoreTransaction, ViewStore};
pub use types::{
    Block, ChainEvent, EventData, IndexProgress, ProgressUpdate, RegisteredView, Transaction,
    ViewHealth, ViewRegistration, ViewStatus,
};
