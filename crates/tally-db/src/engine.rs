//! The engine handle: one in-memory SQLite image, loaded from and flushed to
//! a single backing file.
//!
//! The image lives in an in-memory connection for the whole process
//! lifetime. Boot copies the backing file into it with SQLite's online
//! backup API; every flush copies the whole image back out to a sibling
//! temporary file and renames it over the backing file, so a crash during a
//! flush leaves the previous image intact.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use rusqlite::backup::Progress;
use rusqlite::{Connection, DatabaseName};

use crate::error::StoreError;

/// Length of the SQLite database file header.
const HEADER_LEN: usize = 100;

/// Magic string at the start of every SQLite database file.
const HEADER_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// What a call to [`Engine::flush`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The image was written to the backing file.
    Written {
        /// Size of the backing file after the write.
        bytes: u64,
    },
    /// The connection is inside an open transaction; nothing was written.
    Deferred,
    /// The engine has no backing file.
    Unbacked,
}

/// Owner of the single mutable database image.
///
/// The connection sits behind a re-entrant lock: a statement holds it for
/// its own duration, a coordinator transaction holds it for the whole scope
/// and statements issued inside the scope re-enter it.
pub struct Engine {
    conn: ReentrantMutex<Connection>,
    path: Option<PathBuf>,
    tx_owner: Mutex<Option<ThreadId>>,
}

impl Engine {
    /// Opens the engine, loading the image at `path` if the file exists.
    ///
    /// With `path == None` the image is purely in memory and flushing is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the file exists but cannot be read and
    /// `StoreError::Corrupt` if it is not a valid database image. Neither
    /// falls back to an empty image.
    pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;

        match path {
            Some(p) if p.exists() => {
                load_image(&mut conn, p)?;
                tracing::info!(path = %p.display(), "loaded database image");
            }
            Some(p) => {
                tracing::info!(path = %p.display(), "no database image found, starting empty");
            }
            None => {
                tracing::debug!("opening unbacked in-memory database image");
            }
        }

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self {
            conn: ReentrantMutex::new(conn),
            path: path.map(Path::to_path_buf),
            tx_owner: Mutex::new(None),
        })
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Locks the connection for the calling thread.
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Marks the calling thread as the owner of an open coordinator
    /// transaction. Must be called with the connection lock held.
    pub(crate) fn set_transaction_owner(&self, owner: Option<ThreadId>) {
        *self.tx_owner.lock() = owner;
    }

    /// Whether the calling thread is inside a coordinator transaction.
    pub(crate) fn in_transaction_on_current_thread(&self) -> bool {
        *self.tx_owner.lock() == Some(thread::current().id())
    }

    /// Serializes the whole image and replaces the backing file with it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the temporary file cannot be created or
    /// renamed and `StoreError::Sqlite` if the export itself fails.
    pub fn flush(&self) -> Result<FlushOutcome, StoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(FlushOutcome::Unbacked);
        };

        let conn = self.conn.lock();
        if !conn.is_autocommit() {
            tracing::debug!(path = %path.display(), "transaction open, deferring flush");
            return Ok(FlushOutcome::Deferred);
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = flush_tmp_path(path);
        match fs::remove_file(&tmp) {
            Ok(()) => tracing::warn!(path = %tmp.display(), "removed stale flush file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(StoreError::Io { path: tmp, source }),
        }

        conn.backup(DatabaseName::Main, &tmp, None)?;
        drop(conn);

        fs::rename(&tmp, path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let bytes = fs::metadata(path).map(|m| m.len()).unwrap_or_default();
        tracing::debug!(path = %path.display(), bytes, "flushed database image");

        Ok(FlushOutcome::Written { bytes })
    }
}

fn flush_tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".flush-tmp");
    PathBuf::from(name)
}

/// Copies the image at `path` into the empty in-memory `conn`.
fn load_image(conn: &mut Connection, path: &Path) -> Result<(), StoreError> {
    let corrupt = |detail: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        detail,
    };

    let mut header = Vec::with_capacity(HEADER_LEN);
    File::open(path)
        .and_then(|f| f.take(HEADER_LEN as u64).read_to_end(&mut header))
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    // SQLite treats a zero-length file as an empty database.
    if header.is_empty() {
        return Ok(());
    }
    if header.len() < HEADER_LEN || &header[..16] != HEADER_MAGIC {
        return Err(corrupt("file is not a database image".to_string()));
    }

    // An in-memory backup destination cannot change its page size, so it
    // has to match the source before anything is copied.
    let page_size = match u16::from_be_bytes([header[16], header[17]]) {
        1 => 65_536,
        n => u32::from(n),
    };
    conn.execute_batch(&format!("PRAGMA page_size = {page_size};"))?;

    conn.restore(DatabaseName::Main, path, None::<fn(Progress)>)
        .map_err(|e| corrupt(e.to_string()))?;

    let check: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| corrupt(e.to_string()))?;
    if check != "ok" {
        return Err(corrupt(check));
    }

    Ok(())
}
