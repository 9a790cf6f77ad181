//! Error types for the persistence core.

use std::path::PathBuf;

use rusqlite::types::FromSqlError;
use thiserror::Error;

use crate::migrations::MigrationError;

/// Errors surfaced by [`Store`](crate::Store) and its components.
///
/// `Io`, `Corrupt` and `Migration` are boot-fatal when returned from
/// [`Store::open`](crate::Store::open); everything else is a per-call error
/// the caller maps to a user-facing failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file exists but could not be read, or the flushed image
    /// could not be written.
    #[error("i/o error on {path}: {source}")]
    Io {
        /// The file being read or written.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The backing file is not a valid database image.
    #[error("database image at {path} is corrupt: {detail}")]
    Corrupt {
        /// The backing file.
        path: PathBuf,
        /// What SQLite reported.
        detail: String,
    },

    /// A statement failed. Propagated unmodified from SQLite.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// Bringing the schema forward failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// A row did not contain the requested column.
    #[error("no such column in row: {0}")]
    NoSuchColumn(String),

    /// A column value could not be converted to the requested type.
    #[error("column '{column}' has an incompatible type: {source}")]
    ColumnType {
        /// The column name.
        column: String,
        /// The conversion failure.
        source: FromSqlError,
    },

    /// A flush was requested from inside the calling thread's own open
    /// transaction.
    #[error("cannot flush the database image while a transaction is open")]
    FlushInTransaction,

    /// The asynchronous boot task did not run to completion.
    #[error("database boot task failed: {0}")]
    BootTask(String),

    /// The write-back thread could not be started.
    #[error("failed to start write-back thread: {0}")]
    Spawn(std::io::Error),

    /// The write-back thread has stopped.
    #[error("write-back scheduler is not running")]
    SchedulerStopped,
}
