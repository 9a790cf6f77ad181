//! Reference rows every deployment needs: the default administrator, the
//! default document categories and default settings.
//!
//! Seeding runs on every boot after migrations. Every insert is keyed by a
//! natural unique key and skipped when the row exists, so re-running it is
//! a no-op.

use rusqlite::params;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::Store;

/// Id the administrator receives when seeded into an empty image.
pub const DEFAULT_ADMIN_ID: i64 = 1;

/// Document categories offered out of the box.
pub const DEFAULT_CATEGORIES: &[&str] = &["Invoice", "Receipt", "Contract", "Bank statement", "Other"];

const DEFAULT_SETTINGS: &[(&str, &str)] = &[("base_currency", "EUR")];

/// Credentials for the default administrator.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedConfig {
    /// Username of the default administrator.
    #[serde(default = "default_admin_username")]
    pub admin_username: String,

    /// Initial password of the default administrator. Only used when the
    /// account is created.
    #[serde(default = "default_admin_password")]
    pub admin_password: String,
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_admin_password() -> String {
    "admin".to_string()
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            admin_username: default_admin_username(),
            admin_password: default_admin_password(),
        }
    }
}

/// What a seeding pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    /// Id of the administrator account.
    pub admin_id: i64,
    /// Rows inserted by this pass.
    pub inserted: u64,
}

/// Inserts missing reference rows in one transaction.
///
/// # Errors
///
/// Returns `StoreError::Sqlite` if any insert fails; nothing is inserted in
/// that case.
pub fn seed(store: &Store, config: &SeedConfig) -> Result<SeedReport, StoreError> {
    store.in_transaction(|| {
        let mut inserted = 0;

        let existing = store
            .prepare("SELECT id FROM users WHERE username = ?1")?
            .get([&config.admin_username])?;

        let admin_id = match existing {
            Some(row) => row.get("id")?,
            None => {
                let created = store
                    .prepare(
                        "INSERT INTO users (username, password_hash, role) VALUES (?1, ?2, 'admin')",
                    )?
                    .run(params![
                        config.admin_username,
                        hash_password(&config.admin_password)
                    ])?;
                tracing::info!(
                    username = %config.admin_username,
                    id = created.last_insert_id,
                    "created default administrator"
                );
                inserted += created.changes;
                created.last_insert_id
            }
        };

        let category = store.prepare(
            "INSERT INTO document_categories (name) VALUES (?1) ON CONFLICT(name) DO NOTHING",
        )?;
        for name in DEFAULT_CATEGORIES {
            inserted += category.run([name])?.changes;
        }

        let setting = store.prepare(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO NOTHING",
        )?;
        for (key, value) in DEFAULT_SETTINGS {
            inserted += setting.run([key, value])?.changes;
        }

        Ok(SeedReport { admin_id, inserted })
    })
}

/// Hashes `password` with a fresh random salt as `sha256$<salt>$<hex>`.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let digest = salted_digest(&salt, password);
    format!("sha256${salt}${digest}")
}

/// Checks `password` against a hash produced by [`hash_password`].
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("sha256"), Some(salt), Some(digest)) => salted_digest(salt, password) == digest,
        _ => false,
    }
}

fn salted_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreConfig;

    fn count(store: &Store, sql: &str) -> i64 {
        store
            .prepare(sql)
            .unwrap()
            .get([])
            .unwrap()
            .unwrap()
            .get("n")
            .unwrap()
    }

    #[test]
    fn boot_seeds_admin_with_known_id() {
        let store = Store::open(StoreConfig::in_memory()).unwrap();

        let admin = store
            .prepare("SELECT id, role, password_hash FROM users WHERE username = 'admin'")
            .unwrap()
            .get([])
            .unwrap()
            .expect("admin should exist");
        assert_eq!(admin.get::<i64>("id").unwrap(), DEFAULT_ADMIN_ID);
        assert_eq!(admin.get::<String>("role").unwrap(), "admin");
        assert!(verify_password(
            "admin",
            &admin.get::<String>("password_hash").unwrap()
        ));

        assert_eq!(
            count(&store, "SELECT COUNT(*) AS n FROM document_categories"),
            DEFAULT_CATEGORIES.len() as i64
        );
        assert_eq!(count(&store, "SELECT COUNT(*) AS n FROM settings"), 1);
    }

    #[test]
    fn reseeding_inserts_nothing() {
        let store = Store::open(StoreConfig::in_memory()).unwrap();

        let report = seed(&store, &SeedConfig::default()).unwrap();
        assert_eq!(
            report,
            SeedReport {
                admin_id: DEFAULT_ADMIN_ID,
                inserted: 0
            }
        );
        assert_eq!(count(&store, "SELECT COUNT(*) AS n FROM users"), 1);
    }

    #[test]
    fn seeding_keeps_existing_rows_and_fills_gaps() {
        let store = Store::open(StoreConfig::in_memory()).unwrap();
        store
            .execute(
                "DELETE FROM document_categories WHERE name = 'Receipt';
                 UPDATE settings SET value = 'CHF' WHERE key = 'base_currency';",
            )
            .unwrap();

        let report = seed(&store, &SeedConfig::default()).unwrap();
        assert_eq!(report.inserted, 1);

        let currency: String = store
            .prepare("SELECT value FROM settings WHERE key = 'base_currency'")
            .unwrap()
            .get([])
            .unwrap()
            .unwrap()
            .get("value")
            .unwrap();
        assert_eq!(currency, "CHF", "existing settings must not be overwritten");
    }

    #[test]
    fn custom_admin_username() {
        let config = StoreConfig::in_memory().with_seed(SeedConfig {
            admin_username: "ops".to_string(),
            admin_password: "s3cret".to_string(),
        });
        let store = Store::open(config).unwrap();

        let hash: String = store
            .prepare("SELECT password_hash FROM users WHERE username = 'ops'")
            .unwrap()
            .get([])
            .unwrap()
            .unwrap()
            .get("password_hash")
            .unwrap();
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("admin", &hash));
    }

    #[test]
    fn password_hashes_are_salted() {
        let a = hash_password("same");
        let b = hash_password("same");
        assert_ne!(a, b);
        assert!(verify_password("same", &a));
        assert!(verify_password("same", &b));
        assert!(!verify_password("same", "plaintext"));
    }
}
