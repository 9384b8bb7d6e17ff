//! chainview-storage — storage backends for ChainView.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - `postgres` — PostgreSQL via `sqlx`, plus a `LISTEN`/`NOTIFY` notification bus

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "memory")]
pub use memory::InMemoryStore;

#[cfg(feature = "postgres")]
pub use postgres::{PgNotificationBus, PostgresOptions, PostgresStore};
