//! SQLite registry of apps, their domains and their ports
//!
//! The database handle is opened once at startup and passed down explicitly.
//! Each app has at most one domain and one port; the port is kept as text,
//! the way operators enter it.

use crate::reconcile::BindingSource;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Mutex::new(conn),
        };

        db.run_migrations()?;
        Ok(db)
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }

            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: apps, domains, ports
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS apps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                type TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS domains (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                domain TEXT NOT NULL UNIQUE,
                app_id INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (app_id) REFERENCES apps(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS app_ports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                port TEXT NOT NULL,
                app_id INTEGER NOT NULL,
                domain_id INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (app_id) REFERENCES apps(id) ON DELETE CASCADE,
                FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE SET NULL
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    /// Migration v2: one domain and one port per app
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: single binding per app");

        conn.execute_batch(r#"
            -- Keep the newest row per app before adding the constraint
            DELETE FROM domains WHERE id NOT IN (SELECT MAX(id) FROM domains GROUP BY app_id);
            DELETE FROM app_ports WHERE id NOT IN (SELECT MAX(id) FROM app_ports GROUP BY app_id);

            CREATE UNIQUE INDEX IF NOT EXISTS idx_domains_app ON domains(app_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_app_ports_app ON app_ports(app_id);

            INSERT INTO schema_migrations (version) VALUES (2);
        "#)?;

        Ok(())
    }

    /// Schema version currently applied
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("Failed to read schema version")
    }

    // ==================== App Operations ====================

    /// Create a new app, returning its id
    pub fn create_app(&self, name: &str, app_type: Option<&str>) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO apps (name, type) VALUES (?1, ?2)",
            params![name, app_type],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get an app by id
    pub fn get_app(&self, id: i64) -> Result<Option<AppRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, type, created_at, updated_at FROM apps WHERE id = ?1",
            params![id],
            AppRecord::from_row,
        )
        .optional()
        .context("Failed to get app")
    }

    /// List all apps, oldest first
    pub fn list_apps(&self) -> Result<Vec<AppRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, name, type, created_at, updated_at FROM apps ORDER BY id",
        )?;

        let apps = stmt
            .query_map([], AppRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(apps)
    }

    /// Delete an app along with its domain and port
    pub fn delete_app(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM apps WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    /// Create an app with its domain and port in one transaction
    pub fn register_app(
        &self,
        name: &str,
        app_type: Option<&str>,
        domain: &str,
        port: &str,
    ) -> Result<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO apps (name, type) VALUES (?1, ?2)",
            params![name, app_type],
        )?;
        let app_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO domains (domain, app_id) VALUES (?1, ?2)",
            params![domain, app_id],
        )?;
        let domain_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO app_ports (port, app_id, domain_id) VALUES (?1, ?2, ?3)",
            params![port, app_id, domain_id],
        )?;

        tx.commit()?;
        info!(app_id, name, domain, port, "App registered");
        Ok(app_id)
    }

    // ==================== Domain Operations ====================

    /// Set the app's domain, replacing any previous one. Returns the domain id.
    pub fn set_domain(&self, app_id: i64, domain: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO domains (domain, app_id) VALUES (?1, ?2)
             ON CONFLICT(app_id) DO UPDATE SET
                domain = excluded.domain,
                updated_at = datetime('now')",
            params![domain, app_id],
        )?;
        conn.query_row(
            "SELECT id FROM domains WHERE app_id = ?1",
            params![app_id],
            |row| row.get(0),
        )
        .context("Failed to read domain id")
    }

    /// Get the app's domain
    pub fn domain_for_app(&self, app_id: i64) -> Result<Option<DomainRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, domain, app_id, created_at, updated_at FROM domains WHERE app_id = ?1",
            params![app_id],
            |row| {
                Ok(DomainRecord {
                    id: row.get(0)?,
                    domain: row.get(1)?,
                    app_id: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .optional()
        .context("Failed to get domain")
    }

    // ==================== Port Operations ====================

    /// Set the app's port, linked to its current domain. Returns the port row id.
    pub fn set_port(&self, app_id: i64, port: &str) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO app_ports (port, app_id, domain_id)
             VALUES (?1, ?2, (SELECT id FROM domains WHERE app_id = ?2))
             ON CONFLICT(app_id) DO UPDATE SET
                port = excluded.port,
                domain_id = excluded.domain_id,
                updated_at = datetime('now')",
            params![port, app_id],
        )?;
        conn.query_row(
            "SELECT id FROM app_ports WHERE app_id = ?1",
            params![app_id],
            |row| row.get(0),
        )
        .context("Failed to read port id")
    }

    /// Get the app's port
    pub fn port_for_app(&self, app_id: i64) -> Result<Option<AppPortRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, port, app_id, domain_id, created_at, updated_at
             FROM app_ports WHERE app_id = ?1",
            params![app_id],
            |row| {
                Ok(AppPortRecord {
                    id: row.get(0)?,
                    port: row.get(1)?,
                    app_id: row.get(2)?,
                    domain_id: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            },
        )
        .optional()
        .context("Failed to get port")
    }

    /// Apps with their domain and port, for listings
    pub fn list_app_bindings(&self) -> Result<Vec<AppBinding>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT a.id, a.name, a.type, d.domain, p.port
             FROM apps a
             LEFT JOIN domains d ON d.app_id = a.id
             LEFT JOIN app_ports p ON p.app_id = a.id
             ORDER BY a.id",
        )?;

        let bindings = stmt
            .query_map([], |row| {
                Ok(AppBinding {
                    app_id: row.get(0)?,
                    name: row.get(1)?,
                    app_type: row.get(2)?,
                    domain: row.get(3)?,
                    port: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(bindings)
    }
}

impl BindingSource for Database {
    fn lookup_domain(&self, app_id: i64) -> Result<Option<String>> {
        Ok(self.domain_for_app(app_id)?.map(|record| record.domain))
    }

    fn lookup_port(&self, app_id: i64) -> Result<Option<String>> {
        Ok(self.port_for_app(app_id)?.map(|record| record.port))
    }

    fn app_ids(&self) -> Result<Vec<i64>> {
        Ok(self.list_apps()?.into_iter().map(|app| app.id).collect())
    }
}

/// Whether an error came from a UNIQUE or foreign key constraint
pub fn is_constraint_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(failure, _))
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

// ==================== Record Types ====================

/// App record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub app_type: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl AppRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            app_type: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}

/// Domain record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainRecord {
    pub id: i64,
    pub domain: String,
    pub app_id: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Port record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppPortRecord {
    pub id: i64,
    pub port: String,
    pub app_id: i64,
    pub domain_id: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// An app joined with its domain and port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppBinding {
    pub app_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub app_type: Option<String>,
    pub domain: Option<String>,
    pub port: Option<String>,
}
