//! Embedded schema migration runner.
//!
//! Migrations run sequentially on every boot, tracked by name in the
//! `_tally_migrations` table. Each step runs exactly once, inside its own
//! transaction together with its tracking row, so a failed step leaves no
//! trace.
//!
//! Images written before tracking existed already contain some of the
//! schema. Additive steps adopt such images: a column that already exists
//! is recorded as applied instead of failing, and table rebuilds check the
//! stored table definition before doing any work.

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// One schema or data change.
enum Step {
    /// A batch of SQL, usually `CREATE TABLE IF NOT EXISTS`.
    Sql(&'static str),

    /// `ALTER TABLE <table> ADD COLUMN <column> <definition>`.
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },

    /// Replaces a table whose constraints SQLite cannot alter in place:
    /// rename the old table, create the new one, copy `columns`, drop the
    /// old table, then recreate `indexes`. Skipped when the stored table
    /// definition already contains `marker`.
    RebuildTable {
        table: &'static str,
        marker: &'static str,
        create_sql: &'static str,
        indexes: &'static str,
        columns: &'static [&'static str],
    },

    /// A one-time correction of row values. The SQL must stop matching
    /// once the data is correct.
    DataFix(&'static str),
}

/// A single named migration.
struct Migration {
    name: &'static str,
    step: Step,
}

const INVOICE_COLUMNS: &[&str] = &[
    "id",
    "supplier_id",
    "invoice_number",
    "issue_date",
    "due_date",
    "amount",
    "currency",
    "status",
    "notes",
    "created_by",
    "created_at",
    "updated_at",
    "fx_rate",
    "amount_base",
];

/// All migrations in order. New migrations are appended here.
const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "001_users",
        step: Step::Sql(include_str!("migrations/001_users.sql")),
    },
    Migration {
        name: "002_document_categories",
        step: Step::Sql(include_str!("migrations/002_document_categories.sql")),
    },
    Migration {
        name: "003_suppliers",
        step: Step::Sql(include_str!("migrations/003_suppliers.sql")),
    },
    Migration {
        name: "004_invoices",
        step: Step::Sql(include_str!("migrations/004_invoices.sql")),
    },
    Migration {
        name: "005_documents",
        step: Step::Sql(include_str!("migrations/005_documents.sql")),
    },
    Migration {
        name: "006_wire_transfers",
        step: Step::Sql(include_str!("migrations/006_wire_transfers.sql")),
    },
    Migration {
        name: "007_exchange_rates",
        step: Step::Sql(include_str!("migrations/007_exchange_rates.sql")),
    },
    Migration {
        name: "008_settings",
        step: Step::Sql(include_str!("migrations/008_settings.sql")),
    },
    Migration {
        name: "009_invoices_fx_rate",
        step: Step::AddColumn {
            table: "invoices",
            column: "fx_rate",
            definition: "REAL",
        },
    },
    Migration {
        name: "010_invoices_amount_base",
        step: Step::AddColumn {
            table: "invoices",
            column: "amount_base",
            definition: "REAL",
        },
    },
    Migration {
        name: "011_documents_extracted_json",
        step: Step::AddColumn {
            table: "documents",
            column: "extracted_json",
            definition: "TEXT",
        },
    },
    Migration {
        name: "012_invoices_status_partial_and_cancelled",
        step: Step::RebuildTable {
            table: "invoices",
            marker: "'partially_paid'",
            create_sql: include_str!("migrations/012_invoices_status.sql"),
            indexes: include_str!("migrations/012_invoices_status_indexes.sql"),
            columns: INVOICE_COLUMNS,
        },
    },
    Migration {
        name: "013_normalize_currency_codes",
        step: Step::DataFix(include_str!("migrations/013_normalize_currency_codes.sql")),
    },
];

/// Errors that can occur during migration execution.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A SQL statement within a migration failed.
    #[error("migration '{name}' failed: {source}")]
    ExecutionFailed {
        /// The name of the migration that failed.
        name: String,
        /// The underlying SQLite error.
        source: rusqlite::Error,
    },

    /// A table rebuild produced an inconsistent result and was rolled back.
    #[error("migration '{name}' rolled back: {reason}")]
    RebuildFailed {
        /// The name of the migration that failed.
        name: String,
        /// What was wrong.
        reason: String,
    },

    /// Failed to query migration state.
    #[error("failed to check migration state: {0}")]
    StateQuery(rusqlite::Error),
}

/// Runs all pending migrations against the given connection.
///
/// Migrations that have already been applied (tracked in `_tally_migrations`)
/// are skipped. New migrations are applied in order and recorded.
///
/// # Errors
///
/// Returns `MigrationError` if any migration fails to execute or if the
/// migration tracking table cannot be queried. Either is fatal to boot.
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    run_migrations_from_list(conn, MIGRATIONS)
}

fn run_migrations_from_list(
    conn: &Connection,
    migrations: &[Migration],
) -> Result<usize, MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _tally_migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| MigrationError::ExecutionFailed {
        name: "_tally_migrations_bootstrap".to_string(),
        source: e,
    })?;

    let mut applied = 0;

    for migration in migrations {
        let already_applied: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM _tally_migrations WHERE name = ?1",
                [migration.name],
                |row| row.get(0),
            )
            .map_err(MigrationError::StateQuery)?;

        if already_applied {
            tracing::debug!(
                migration = migration.name,
                "migration already applied, skipping"
            );
            continue;
        }

        tracing::info!(migration = migration.name, "applying migration");

        if matches!(migration.step, Step::RebuildTable { .. }) {
            apply_rebuild(conn, migration)?;
        } else {
            apply(conn, migration)?;
        }

        applied += 1;
    }

    Ok(applied)
}

fn apply(conn: &Connection, migration: &Migration) -> Result<(), MigrationError> {
    let failed = |source: rusqlite::Error| MigrationError::ExecutionFailed {
        name: migration.name.to_string(),
        source,
    };

    let tx = conn.unchecked_transaction().map_err(failed)?;

    match &migration.step {
        Step::Sql(sql) | Step::DataFix(sql) => tx.execute_batch(sql).map_err(failed)?,
        Step::AddColumn {
            table,
            column,
            definition,
        } => add_column(&tx, table, column, definition).map_err(failed)?,
        Step::RebuildTable {
            table,
            marker,
            create_sql,
            indexes,
            columns,
        } => {
            rebuild_table(&tx, table, marker, create_sql, indexes, columns).map_err(failed)?;

            let violations = foreign_key_violations(&tx).map_err(failed)?;
            if violations > 0 {
                return Err(MigrationError::RebuildFailed {
                    name: migration.name.to_string(),
                    reason: format!("{violations} foreign key violation(s) after rebuilding {table}"),
                });
            }
        }
    }

    tx.execute(
        "INSERT INTO _tally_migrations (name) VALUES (?1)",
        [migration.name],
    )
    .map_err(failed)?;

    tx.commit().map_err(failed)
}

/// Applies a rebuild step with foreign key enforcement off and legacy
/// rename semantics on, so that tables referencing the rebuilt table keep
/// pointing at its original name. Both settings are only honored outside a
/// transaction and are restored afterwards.
fn apply_rebuild(conn: &Connection, migration: &Migration) -> Result<(), MigrationError> {
    let failed = |source: rusqlite::Error| MigrationError::ExecutionFailed {
        name: migration.name.to_string(),
        source,
    };

    let foreign_keys: bool = conn
        .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
        .map_err(MigrationError::StateQuery)?;

    conn.execute_batch("PRAGMA foreign_keys = OFF; PRAGMA legacy_alter_table = ON;")
        .map_err(failed)?;

    let result = apply(conn, migration);

    let restore = format!(
        "PRAGMA legacy_alter_table = OFF; PRAGMA foreign_keys = {};",
        if foreign_keys { "ON" } else { "OFF" }
    );
    conn.execute_batch(&restore).map_err(failed)?;

    result
}

fn add_column(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    match conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition};")) {
        Ok(()) => Ok(()),
        Err(e) if is_already_exists(&e) => {
            tracing::debug!(table, column, "column already present, adopting");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn rebuild_table(
    conn: &Connection,
    table: &str,
    marker: &str,
    create_sql: &str,
    indexes: &str,
    columns: &[&str],
) -> rusqlite::Result<()> {
    let current: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;

    let Some(current) = current else {
        tracing::debug!(table, "table missing, creating with target schema");
        conn.execute_batch(create_sql)?;
        return conn.execute_batch(indexes);
    };

    if current.contains(marker) {
        tracing::debug!(table, "table already has target definition, adopting");
        return Ok(());
    }

    let old = format!("{table}__old");
    let cols = columns.join(", ");

    conn.execute_batch(&format!("ALTER TABLE {table} RENAME TO {old};"))?;
    conn.execute_batch(create_sql)?;
    let copied = conn.execute(
        &format!("INSERT INTO {table} ({cols}) SELECT {cols} FROM {old}"),
        [],
    )?;
    carry_autoincrement(conn, &old, table)?;
    conn.execute_batch(&format!("DROP TABLE {old};"))?;
    conn.execute_batch(indexes)?;

    tracing::info!(table, rows = copied, "rebuilt table");
    Ok(())
}

/// Keeps the AUTOINCREMENT high-water mark of a rebuilt table, so ids of
/// deleted rows are not handed out again.
fn carry_autoincrement(conn: &Connection, old: &str, table: &str) -> rusqlite::Result<()> {
    let has_sequence: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence')",
        [],
        |row| row.get(0),
    )?;
    if !has_sequence {
        return Ok(());
    }

    let old_seq: Option<i64> = conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = ?1",
            [old],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(seq) = old_seq {
        conn.execute(
            "INSERT INTO sqlite_sequence (name, seq)
             SELECT ?2, ?1 WHERE NOT EXISTS (SELECT 1 FROM sqlite_sequence WHERE name = ?2)",
            params![seq, table],
        )?;
        conn.execute(
            "UPDATE sqlite_sequence SET seq = ?1 WHERE name = ?2 AND seq < ?1",
            params![seq, table],
        )?;
    }

    Ok(())
}

fn foreign_key_violations(conn: &Connection) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while rows.next()?.is_some() {
        count += 1;
    }
    Ok(count)
}

/// Whether `err` says the column or table being created already exists.
fn is_already_exists(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => {
            msg.contains("duplicate column name") || msg.contains("already exists")
        }
        _ => false,
    }
}
