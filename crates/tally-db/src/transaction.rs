//! Transaction coordinator.
//!
//! A transaction holds the engine lock for its whole scope, so neither the
//! write-back thread nor any other thread can observe its intermediate
//! state. Statements issued inside the scope re-enter the lock on the same
//! thread. Only one level is supported: a nested `BEGIN` fails in SQLite.

use std::thread;

use rusqlite::Connection;

use crate::engine::Engine;
use crate::error::StoreError;
use crate::store::Store;

/// Rolls back on drop unless the transaction already ended, which also
/// covers a panicking closure.
struct Scope<'a> {
    engine: &'a Engine,
    conn: &'a Connection,
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        self.engine.set_transaction_owner(None);
        if !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!("transaction rollback failed: {}", e);
            }
        }
    }
}

impl Store {
    /// Wraps `f` in a transaction and returns a callable that runs it.
    ///
    /// Each call issues `BEGIN`, runs `f`, then commits and arms the
    /// write-back scheduler if `f` returned `Ok`, or rolls back and returns
    /// the original error if it returned `Err`.
    ///
    /// ```ignore
    /// let transfer = store.transaction(|| {
    ///     debit.run(params![amount, from])?;
    ///     credit.run(params![amount, to])?;
    ///     Ok::<_, StoreError>(())
    /// });
    /// transfer()?;
    /// ```
    pub fn transaction<'s, F, T, E>(&'s self, mut f: F) -> impl FnMut() -> Result<T, E> + 's
    where
        F: FnMut() -> Result<T, E> + 's,
        T: 's,
        E: From<StoreError> + 's,
    {
        move || self.run_transaction(&mut f)
    }

    /// Runs `f` in a transaction immediately.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or the `BEGIN`/`COMMIT` failure converted
    /// into `E`.
    pub fn in_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<StoreError>,
    {
        self.run_transaction(f)
    }

    fn run_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<StoreError>,
    {
        let engine = self.engine();
        let conn = engine.lock();

        conn.execute_batch("BEGIN")
            .map_err(|e| E::from(StoreError::from(e)))?;

        let scope = Scope {
            engine,
            conn: &*conn,
        };
        engine.set_transaction_owner(Some(thread::current().id()));

        let value = f()?;

        conn.execute_batch("COMMIT")
            .map_err(|e| E::from(StoreError::from(e)))?;
        drop(scope);
        drop(conn);

        self.writeback().request_flush();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Store, StoreConfig, StoreError};
    use std::panic::{self, AssertUnwindSafe};
    use std::time::Duration;
    use tempfile::TempDir;

    fn store() -> Store {
        let store = Store::open(StoreConfig::in_memory()).unwrap();
        store
            .execute("CREATE TABLE ledger (id INTEGER PRIMARY KEY, amount INTEGER NOT NULL CHECK (amount > 0));")
            .unwrap();
        store
    }

    fn count(store: &Store) -> i64 {
        store
            .prepare("SELECT COUNT(*) AS n FROM ledger")
            .unwrap()
            .get([])
            .unwrap()
            .unwrap()
            .get("n")
            .unwrap()
    }

    #[derive(Debug)]
    enum TestError {
        Store(StoreError),
        Business(&'static str),
    }

    impl From<StoreError> for TestError {
        fn from(e: StoreError) -> Self {
            Self::Store(e)
        }
    }

    #[test]
    fn commit_makes_all_inserts_visible() {
        let store = store();
        let insert = store.prepare("INSERT INTO ledger (amount) VALUES (?1)").unwrap();

        let mut tx = store.transaction(|| {
            for amount in 1..=5 {
                insert.run([amount])?;
            }
            Ok::<_, StoreError>(())
        });
        tx().unwrap();

        assert_eq!(count(&store), 5);
    }

    #[test]
    fn error_rolls_back_every_insert() {
        let store = store();
        let insert = store.prepare("INSERT INTO ledger (amount) VALUES (?1)").unwrap();

        let result: Result<(), TestError> = store.in_transaction(|| {
            for amount in 1..=10 {
                insert.run([amount])?;
            }
            Err(TestError::Business("approval missing"))
        });

        assert!(matches!(result, Err(TestError::Business("approval missing"))));
        assert_eq!(count(&store), 0);
    }

    #[test]
    fn statement_error_rolls_back_earlier_statements() {
        let store = store();
        let insert = store.prepare("INSERT INTO ledger (amount) VALUES (?1)").unwrap();

        let result = store.in_transaction(|| {
            insert.run([10])?;
            insert.run([-1])?;
            Ok::<_, StoreError>(())
        });

        assert!(matches!(result, Err(StoreError::Sqlite(_))));
        assert_eq!(count(&store), 0);
    }

    #[test]
    fn panic_rolls_back() {
        let store = store();
        let insert = store.prepare("INSERT INTO ledger (amount) VALUES (?1)").unwrap();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<(), StoreError> = store.in_transaction(|| {
                insert.run([1])?;
                panic!("handler bug");
            });
        }));
        assert!(outcome.is_err());

        assert_eq!(count(&store), 0);
        store
            .in_transaction(|| insert.run([2]).map(|_| ()))
            .expect("store must be usable after a panicking transaction");
        assert_eq!(count(&store), 1);
    }

    #[test]
    fn callable_can_be_invoked_repeatedly() {
        let store = store();
        let insert = store.prepare("INSERT INTO ledger (amount) VALUES (?1)").unwrap();
        let mut next = 0;

        let mut add_pair = store.transaction(|| {
            next += 1;
            insert.run([next])?;
            insert.run([next * 100])?;
            Ok::<_, StoreError>(next)
        });

        assert_eq!(add_pair().unwrap(), 1);
        assert_eq!(add_pair().unwrap(), 2);
        drop(add_pair);
        assert_eq!(count(&store), 4);
    }

    #[test]
    fn nested_transaction_fails_without_breaking_outer() {
        let store = store();
        let insert = store.prepare("INSERT INTO ledger (amount) VALUES (?1)").unwrap();

        let result = store.in_transaction(|| {
            insert.run([1])?;
            let inner = store.in_transaction(|| insert.run([2]).map(|_| ()));
            assert!(matches!(inner, Err(StoreError::Sqlite(_))));
            Ok::<_, StoreError>(())
        });

        result.unwrap();
        assert_eq!(count(&store), 1);
    }

    #[test]
    fn commit_arms_write_back_and_rollback_does_not() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(
            StoreConfig::file(dir.path().join("tally.db")).with_flush_delay(Duration::from_secs(60)),
        )
        .unwrap();
        let insert = store
            .prepare("INSERT INTO settings (key, value) VALUES (?1, ?2)")
            .unwrap();

        let rolled_back: Result<(), StoreError> = store.in_transaction(|| {
            insert.run(["a", "1"])?;
            assert!(!store.is_flush_pending(), "statements inside a transaction do not arm");
            Err(StoreError::FlushInTransaction)
        });
        assert!(rolled_back.is_err());
        assert!(!store.is_flush_pending());

        store
            .in_transaction(|| insert.run(["b", "2"]).map(|_| ()))
            .unwrap();
        assert!(store.is_flush_pending());
    }

    #[test]
    fn flush_now_inside_transaction_is_refused() {
        let store = store();
        let result = store.in_transaction(|| store.flush_now().map(|_| ()));
        assert!(matches!(result, Err(StoreError::FlushInTransaction)));
    }
}
