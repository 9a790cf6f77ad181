//! One-shot prepared statements and row materialization.
//!
//! A [`Statement`] keeps only its SQL text. Every `run`, `get` or `all`
//! compiles a fresh cursor under the engine lock, binds one parameter set,
//! steps it and drops it before returning; nothing is cached between calls.

use std::sync::Arc;

use rusqlite::types::{FromSql, Value, ValueRef};
use rusqlite::Params;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::StoreError;
use crate::store::Store;

/// Outcome of [`Statement::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// Rowid of the most recent successful insert on the connection.
    pub last_insert_id: i64,
    /// Rows changed by the statement.
    pub changes: u64,
}

/// A materialized result row: column names in select order, each with its
/// value.
///
/// Lookups by name return the first column with that name.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    fn read(columns: &Arc<[String]>, row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let values = (0..columns.len())
            .map(|i| row.get::<_, Value>(i))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Self {
            columns: Arc::clone(columns),
            values,
        })
    }

    /// Column names in select order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Values in select order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The raw value of column `name`.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .map(|i| &self.values[i])
    }

    /// Converts column `name` to `T`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NoSuchColumn` if the row has no such column and
    /// `StoreError::ColumnType` if the value does not convert.
    pub fn get<T: FromSql>(&self, name: &str) -> Result<T, StoreError> {
        let value = self
            .value(name)
            .ok_or_else(|| StoreError::NoSuchColumn(name.to_string()))?;
        T::column_result(ValueRef::from(value)).map_err(|source| StoreError::ColumnType {
            column: name.to_string(),
            source,
        })
    }

    /// Iterates `(column, value)` pairs in select order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, &SqlValue(value))?;
        }
        map.end()
    }
}

/// Serializes a SQLite value as its natural JSON counterpart. Blobs become
/// lowercase hex strings.
struct SqlValue<'a>(&'a Value);

impl Serialize for SqlValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::Null => serializer.serialize_none(),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Real(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Blob(b) => serializer.serialize_str(&hex::encode(b)),
        }
    }
}

/// A compiled SQL statement bound to a [`Store`].
pub struct Statement<'s> {
    store: &'s Store,
    sql: String,
}

impl<'s> Statement<'s> {
    pub(crate) fn new(store: &'s Store, sql: &str) -> Self {
        Self {
            store,
            sql: sql.to_string(),
        }
    }

    /// The SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Executes the statement to completion.
    ///
    /// The last insert id and change count are read back on the same
    /// connection before the engine lock is released, so no other statement
    /// can slip in between.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Sqlite` unmodified from SQLite.
    pub fn run<P: Params>(&self, params: P) -> Result<RunResult, StoreError> {
        let conn = self.store.engine().lock();
        let mut stmt = conn.prepare(&self.sql)?;
        let readonly = stmt.readonly();
        {
            let mut rows = stmt.query(params)?;
            while rows.next()?.is_some() {}
        }
        drop(stmt);

        let (last_insert_id, changes): (i64, i64) = conn.query_row(
            "SELECT last_insert_rowid(), changes()",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        drop(conn);

        if !readonly {
            self.store.note_mutation();
        }

        Ok(RunResult {
            last_insert_id,
            changes: u64::try_from(changes).unwrap_or_default(),
        })
    }

    /// Returns the first row, or `None` if the statement yields no rows.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Sqlite` unmodified from SQLite.
    pub fn get<P: Params>(&self, params: P) -> Result<Option<Row>, StoreError> {
        let conn = self.store.engine().lock();
        let mut stmt = conn.prepare(&self.sql)?;
        let readonly = stmt.readonly();
        let columns = column_names(&stmt);

        let row = match stmt.query(params)?.next()? {
            Some(row) => Some(Row::read(&columns, row)?),
            None => None,
        };
        drop(stmt);
        drop(conn);

        if !readonly {
            self.store.note_mutation();
        }
        Ok(row)
    }

    /// Returns every row in order. There is no row cap; page with
    /// `LIMIT`/`OFFSET` in the SQL.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Sqlite` unmodified from SQLite.
    pub fn all<P: Params>(&self, params: P) -> Result<Vec<Row>, StoreError> {
        let conn = self.store.engine().lock();
        let mut stmt = conn.prepare(&self.sql)?;
        let readonly = stmt.readonly();
        let columns = column_names(&stmt);

        let mut out = Vec::new();
        {
            let mut rows = stmt.query(params)?;
            while let Some(row) = rows.next()? {
                out.push(Row::read(&columns, row)?);
            }
        }
        drop(stmt);
        drop(conn);

        if !readonly {
            self.store.note_mutation();
        }
        Ok(out)
    }
}

fn column_names(stmt: &rusqlite::Statement<'_>) -> Arc<[String]> {
    stmt.column_names()
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>()
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreConfig;
    use rusqlite::params;

    fn store() -> Store {
        let store = Store::open(StoreConfig::in_memory()).expect("store should open");
        store
            .execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL, score REAL, raw BLOB);")
            .unwrap();
        store
    }

    #[test]
    fn run_reports_last_insert_id_in_tight_loop() {
        let store = store();
        let insert = store.prepare("INSERT INTO notes (body) VALUES (?1)").unwrap();

        for i in 0..200 {
            let result = insert.run([format!("note {i}")]).unwrap();
            assert_eq!(result.changes, 1);

            let actual: i64 = store
                .prepare("SELECT id FROM notes WHERE body = ?1")
                .unwrap()
                .get([format!("note {i}")])
                .unwrap()
                .expect("row should exist")
                .get("id")
                .unwrap();
            assert_eq!(result.last_insert_id, actual);
        }
    }

    #[test]
    fn run_reports_changed_row_count() {
        let store = store();
        store
            .execute("INSERT INTO notes (body) VALUES ('a'), ('b'), ('c');")
            .unwrap();

        let result = store
            .prepare("UPDATE notes SET score = 1 WHERE body <> ?1")
            .unwrap()
            .run(["a"])
            .unwrap();
        assert_eq!(result.changes, 2);
    }

    #[test]
    fn get_with_no_match_is_none() {
        let store = store();
        let row = store
            .prepare("SELECT * FROM notes WHERE id = ?1")
            .unwrap()
            .get([42])
            .unwrap();
        assert!(row.is_none());
    }

    #[test]
    fn all_with_no_match_is_empty() {
        let store = store();
        let rows = store
            .prepare("SELECT * FROM notes WHERE id > ?1")
            .unwrap()
            .all([0])
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn all_returns_rows_in_order() {
        let store = store();
        let insert = store
            .prepare("INSERT INTO notes (body, score) VALUES (?1, ?2)")
            .unwrap();
        insert.run(params!["b", 2.0]).unwrap();
        insert.run(params!["a", 1.0]).unwrap();
        insert.run(params!["c", 3.0]).unwrap();

        let rows = store
            .prepare("SELECT body FROM notes ORDER BY score DESC")
            .unwrap()
            .all([])
            .unwrap();
        let bodies: Vec<String> = rows.iter().map(|r| r.get("body").unwrap()).collect();
        assert_eq!(bodies, vec!["c", "b", "a"]);
    }

    #[test]
    fn row_access_and_errors() {
        let store = store();
        store
            .prepare("INSERT INTO notes (body, score, raw) VALUES (?1, ?2, ?3)")
            .unwrap()
            .run(params!["hello", 1.5, vec![0xde_u8, 0xad]])
            .unwrap();

        let row = store
            .prepare("SELECT id, body, score, raw FROM notes")
            .unwrap()
            .get([])
            .unwrap()
            .unwrap();

        assert_eq!(row.columns(), ["id", "body", "score", "raw"]);
        assert_eq!(row.len(), 4);
        assert_eq!(row.get::<String>("body").unwrap(), "hello");
        assert_eq!(row.get::<f64>("score").unwrap(), 1.5);
        assert_eq!(row.value("raw"), Some(&Value::Blob(vec![0xde, 0xad])));
        assert!(matches!(
            row.get::<i64>("missing"),
            Err(StoreError::NoSuchColumn(_))
        ));
        assert!(matches!(
            row.get::<i64>("body"),
            Err(StoreError::ColumnType { .. })
        ));

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "id": 1, "body": "hello", "score": 1.5, "raw": "dead" })
        );
    }

    #[test]
    fn malformed_sql_fails_at_prepare() {
        let store = store();
        let err = store.prepare("SELEKT * FROM notes").err().expect("should fail");
        assert!(matches!(err, StoreError::Sqlite(_)));
    }

    #[test]
    fn constraint_violation_propagates() {
        let store = store();
        let err = store
            .prepare("INSERT INTO notes (body) VALUES (?1)")
            .unwrap()
            .run([Option::<String>::None])
            .unwrap_err();
        match err {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                assert_eq!(e.code, rusqlite::ErrorCode::ConstraintViolation)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn reads_do_not_arm_write_back_but_writes_do() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = StoreConfig::file(dir.path().join("tally.db"))
            .with_flush_delay(std::time::Duration::from_secs(60));
        let store = Store::open(config).unwrap();
        assert!(!store.is_flush_pending());

        store.prepare("SELECT * FROM users").unwrap().all([]).unwrap();
        assert!(!store.is_flush_pending());

        store
            .prepare("INSERT INTO settings (key, value) VALUES (?1, ?2) RETURNING key")
            .unwrap()
            .get(["theme", "dark"])
            .unwrap()
            .expect("RETURNING yields a row");
        assert!(store.is_flush_pending());
    }
}
