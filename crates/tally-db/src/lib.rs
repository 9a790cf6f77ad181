//! Persistence layer for the Tally back office.
//!
//! The whole database lives in memory as a single SQLite image. Mutations
//! arm a debounced write-back that snapshots the image into the backing
//! file, so a burst of writes costs one disk write. Boot loads the file,
//! runs the embedded migrations, seeds reference rows and flushes once
//! before the store is handed out.
//!
//! # Design decisions
//!
//! - **One connection behind a reentrant lock**: statements, transactions
//!   and the write-back thread serialize on it, so a snapshot never sees a
//!   half-applied transaction and a transaction body can issue statements
//!   on the same thread.
//! - **Atomic snapshot**: the image is backed up into a sibling temporary
//!   file and renamed over the backing file. A crash mid-flush leaves the
//!   previous image intact.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` and applied in order, each tracked by name.

mod engine;
mod error;
mod migrations;
mod seed;
mod statement;
mod store;
mod transaction;
mod writeback;

pub use engine::{Engine, FlushOutcome};
pub use error::StoreError;
pub use migrations::{run_migrations, MigrationError};
pub use seed::{
    hash_password, verify_password, SeedConfig, SeedReport, DEFAULT_ADMIN_ID, DEFAULT_CATEGORIES,
};
pub use statement::{Row, RunResult, Statement};
pub use store::{Store, StoreConfig};
pub use writeback::{FlushTarget, WriteBack, WriteBackStats};
