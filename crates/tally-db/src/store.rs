//! The store: the single data-access surface handed to the rest of the
//! process.
//!
//! A [`Store`] only exists once boot has finished: the image is loaded,
//! migrations have run, reference rows are seeded and the result is on
//! disk. There is no "not ready" state to guard against.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{Engine, FlushOutcome};
use crate::error::StoreError;
use crate::migrations::run_migrations;
use crate::seed::{seed, SeedConfig};
use crate::statement::Statement;
use crate::writeback::{WriteBack, WriteBackStats};

/// Boot configuration for a [`Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Backing file. `None` keeps the image in memory only.
    pub path: Option<PathBuf>,
    /// Debounce delay of the write-back scheduler.
    pub flush_delay: Duration,
    /// Reference rows inserted on every boot.
    pub seed: SeedConfig,
}

impl StoreConfig {
    /// Default debounce delay.
    pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(100);

    /// A store without a backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            flush_delay: Self::DEFAULT_FLUSH_DELAY,
            seed: SeedConfig::default(),
        }
    }

    /// A store backed by the file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::in_memory()
        }
    }

    /// Overrides the debounce delay.
    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    /// Overrides the seed configuration.
    pub fn with_seed(mut self, seed: SeedConfig) -> Self {
        self.seed = seed;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Handle to the embedded database.
///
/// `Store` is `Send + Sync`; share it behind an `Arc`.
pub struct Store {
    engine: Arc<Engine>,
    writeback: WriteBack,
}

impl Store {
    /// Boots the store on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// See [`Store::open`]. Returns `StoreError::BootTask` if the boot task
    /// was cancelled or panicked.
    pub async fn initialize(config: StoreConfig) -> Result<Self, StoreError> {
        tokio::task::spawn_blocking(move || Self::open(config))
            .await
            .map_err(|e| StoreError::BootTask(e.to_string()))?
    }

    /// Boots the store on the calling thread: load or create the image,
    /// migrate, seed, flush.
    ///
    /// # Errors
    ///
    /// Any error is fatal to boot: an unreadable or corrupt image, a failed
    /// migration or seed, or a failed first flush.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let engine = Arc::new(Engine::open(config.path.as_deref())?);

        {
            let conn = engine.lock();
            let applied = run_migrations(&conn)?;
            if applied > 0 {
                tracing::info!(count = applied, "applied database migrations");
            }
        }

        let writeback = WriteBack::start(Arc::clone(&engine), config.flush_delay)?;
        let store = Self { engine, writeback };

        let report = seed(&store, &config.seed)?;
        tracing::info!(
            admin_id = report.admin_id,
            inserted = report.inserted,
            "seeded reference rows"
        );

        store.flush_now()?;
        Ok(store)
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Arms the write-back scheduler after a mutation. Inside a coordinator
    /// transaction the commit arms it instead.
    pub(crate) fn note_mutation(&self) {
        if !self.engine.in_transaction_on_current_thread() {
            self.writeback.request_flush();
        }
    }

    pub(crate) fn writeback(&self) -> &WriteBack {
        &self.writeback
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.engine.path()
    }

    /// Runs raw SQL, possibly several `;`-separated statements, without
    /// parameters. Always arms the write-back scheduler, also on failure:
    /// statements before the failing one are already committed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Sqlite` unmodified from SQLite.
    pub fn execute(&self, sql: &str) -> Result<(), StoreError> {
        let result = self.engine.lock().execute_batch(sql);
        self.note_mutation();
        Ok(result?)
    }

    /// Compiles `sql` into a one-shot [`Statement`].
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Sqlite` if the SQL does not compile.
    pub fn prepare(&self, sql: &str) -> Result<Statement<'_>, StoreError> {
        self.engine.lock().prepare(sql)?;
        Ok(Statement::new(self, sql))
    }

    /// Schedules a flush as if a mutation had happened.
    pub fn request_flush(&self) {
        self.writeback.request_flush();
    }

    /// Persists the image now, without waiting for the debounce delay. A
    /// pending scheduled flush is satisfied by this one.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::FlushInTransaction` when called inside the
    /// calling thread's own transaction, or the flush error.
    pub fn flush_now(&self) -> Result<FlushOutcome, StoreError> {
        if self.engine.in_transaction_on_current_thread() {
            return Err(StoreError::FlushInTransaction);
        }
        match self.writeback.flush_and_wait() {
            Err(StoreError::SchedulerStopped) => self.engine.flush(),
            other => other,
        }
    }

    /// Whether a scheduled flush has not run yet.
    pub fn is_flush_pending(&self) -> bool {
        self.writeback.is_pending()
    }

    /// Write-back counters, including the last background flush error.
    pub fn write_back_stats(&self) -> WriteBackStats {
        self.writeback.stats()
    }

    /// Drains any pending flush and stops the write-back scheduler.
    ///
    /// Statements still work afterwards but are only persisted by
    /// [`Store::flush_now`].
    ///
    /// # Errors
    ///
    /// Returns `StoreError::FlushInTransaction` when called inside the
    /// calling thread's own transaction, or the error of the draining flush.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.engine.in_transaction_on_current_thread() {
            return Err(StoreError::FlushInTransaction);
        }
        self.writeback.shutdown()
    }
}
