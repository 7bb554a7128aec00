//! SQLite database for users and proxy configurations
//!
//! Holds the source of truth for routes. Caddy's live config is derived
//! from the `proxy_configs` table by the reconciler.

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

const CONFIG_COLUMNS: &str = "c.id, c.name, c.domain, c.target_url, c.path, c.enabled, c.created_at,
    c.updated_at, c.creator_id, c.sync_status, c.sync_error, c.synced_at";

/// Timestamp format used for every stored date
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Whether an error was caused by a UNIQUE/PRIMARY KEY constraint
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    })
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
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

        // WAL lets the reconcile loop read while a handler writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
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
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

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

    /// Migration v1: users and proxy configurations
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT,
                email TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS proxy_configs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                domain TEXT NOT NULL,
                target_url TEXT NOT NULL,
                path TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                creator_id TEXT NOT NULL,
                FOREIGN KEY (creator_id) REFERENCES users(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_proxy_configs_creator ON proxy_configs(creator_id);
            CREATE INDEX IF NOT EXISTS idx_proxy_configs_created ON proxy_configs(created_at DESC);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    /// Migration v2: Caddy sync tracking
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: sync status");

        conn.execute_batch(r#"
            ALTER TABLE proxy_configs ADD COLUMN sync_status TEXT NOT NULL DEFAULT 'pending';
            ALTER TABLE proxy_configs ADD COLUMN sync_error TEXT;
            ALTER TABLE proxy_configs ADD COLUMN synced_at TEXT;

            CREATE INDEX IF NOT EXISTS idx_proxy_configs_enabled ON proxy_configs(enabled);

            INSERT INTO schema_migrations (version) VALUES (2);
        "#)?;

        Ok(())
    }

    // ==================== User Operations ====================

    pub fn count_users(&self) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .context("Failed to count users")
    }

    pub fn create_user(&self, user: &UserRecord) -> Result<()> {
        let conn = self.conn.lock();
        insert_user(&conn, user)
    }

    pub fn get_user(&self, id: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, email, password_hash, is_admin, created_at, updated_at
             FROM users WHERE id = ?1",
            params![id],
            row_to_user,
        )
        .optional()
        .context("Failed to get user")
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, name, email, password_hash, is_admin, created_at, updated_at
             FROM users WHERE email = ?1",
            params![email],
            row_to_user,
        )
        .optional()
        .context("Failed to get user by email")
    }

    pub fn update_user_password(&self, id: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
            params![password_hash, now_timestamp(), id],
        )?;
        Ok(rows > 0)
    }

    /// Create the first admin and a starter config in one transaction.
    ///
    /// Returns `false` without writing anything when a user already exists.
    pub fn complete_setup(&self, admin: &UserRecord, sample: &ProxyConfigRecord) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let users: i64 = tx.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        if users > 0 {
            return Ok(false);
        }

        insert_user(&tx, admin)?;
        insert_proxy_config(&tx, sample)?;
        tx.commit()?;

        Ok(true)
    }

    // ==================== Proxy Config Operations ====================

    pub fn create_proxy_config(&self, config: &ProxyConfigRecord) -> Result<()> {
        let conn = self.conn.lock();
        insert_proxy_config(&conn, config)
    }

    pub fn get_proxy_config(&self, id: &str) -> Result<Option<ProxyConfigRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM proxy_configs c WHERE c.id = ?1", CONFIG_COLUMNS),
            params![id],
            row_to_config,
        )
        .optional()
        .context("Failed to get proxy config")
    }

    /// Get a config together with a summary of its creator
    pub fn get_proxy_config_with_creator(&self, id: &str) -> Result<Option<ProxyConfigWithCreator>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {}, u.id, u.name, u.email
                 FROM proxy_configs c JOIN users u ON u.id = c.creator_id
                 WHERE c.id = ?1",
                CONFIG_COLUMNS
            ),
            params![id],
            row_to_config_with_creator,
        )
        .optional()
        .context("Failed to get proxy config")
    }

    /// All configs with creators, newest first
    pub fn list_proxy_configs_with_creator(&self) -> Result<Vec<ProxyConfigWithCreator>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {}, u.id, u.name, u.email
             FROM proxy_configs c JOIN users u ON u.id = c.creator_id
             ORDER BY c.created_at DESC, c.rowid DESC",
            CONFIG_COLUMNS
        ))?;

        let configs = stmt
            .query_map([], row_to_config_with_creator)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(configs)
    }

    /// Every config, oldest first; the reconciler's snapshot
    pub fn list_proxy_configs(&self) -> Result<Vec<ProxyConfigRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM proxy_configs c ORDER BY c.created_at, c.rowid",
            CONFIG_COLUMNS
        ))?;

        let configs = stmt
            .query_map([], row_to_config)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(configs)
    }

    /// Overwrite the editable fields of a config and reset its sync state
    pub fn update_proxy_config(&self, id: &str, update: &ProxyConfigUpdate) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE proxy_configs
             SET name = ?1, domain = ?2, target_url = ?3, path = ?4, enabled = ?5,
                 updated_at = ?6, sync_status = 'pending', sync_error = NULL
             WHERE id = ?7",
            params![
                update.name,
                update.domain,
                update.target_url,
                update.path,
                update.enabled,
                now_timestamp(),
                id
            ],
        )?;
        Ok(rows > 0)
    }

    pub fn delete_proxy_config(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM proxy_configs WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn mark_sync_failed(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE proxy_configs SET sync_status = 'failed', sync_error = ?1 WHERE id = ?2",
            params![error, id],
        )?;
        Ok(())
    }

    /// Mark the configs a reconcile pushed as synced. A row only counts if
    /// it is unchanged since the snapshot, so edits made while the push was
    /// in flight stay pending.
    pub fn mark_synced(&self, snapshot: &[ProxyConfigRecord], synced_at: &str) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut rows = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE proxy_configs SET sync_status = 'synced', sync_error = NULL, synced_at = ?1
                 WHERE id = ?2 AND updated_at = ?3",
            )?;
            for config in snapshot {
                rows += stmt.execute(params![synced_at, config.id, config.updated_at])?;
            }
        }
        tx.commit()?;
        Ok(rows)
    }

    /// Count configs per sync status (for the dashboard)
    pub fn count_by_sync_status(&self) -> Result<SyncCounts> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(enabled), 0),
                    COALESCE(SUM(CASE WHEN sync_status = 'synced' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN sync_status = 'pending' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN sync_status = 'failed' THEN 1 ELSE 0 END), 0)
             FROM proxy_configs",
            [],
            |row| {
                Ok(SyncCounts {
                    total: row.get(0)?,
                    enabled: row.get(1)?,
                    synced: row.get(2)?,
                    pending: row.get(3)?,
                    failed: row.get(4)?,
                })
            },
        )
        .context("Failed to count configs")
    }
}

fn insert_user(conn: &Connection, user: &UserRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO users (id, name, email, password_hash, is_admin, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            user.id,
            user.name,
            user.email,
            user.password_hash,
            user.is_admin,
            user.created_at,
            user.updated_at
        ],
    )?;
    Ok(())
}

fn insert_proxy_config(conn: &Connection, config: &ProxyConfigRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO proxy_configs
            (id, name, domain, target_url, path, enabled, created_at, updated_at, creator_id, sync_status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            config.id,
            config.name,
            config.domain,
            config.target_url,
            config.path,
            config.enabled,
            config.created_at,
            config.updated_at,
            config.creator_id,
            config.sync_status.as_str()
        ],
    )?;
    Ok(())
}

fn row_to_user(row: &Row) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        is_admin: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn row_to_config(row: &Row) -> rusqlite::Result<ProxyConfigRecord> {
    let status: String = row.get(9)?;
    Ok(ProxyConfigRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        domain: row.get(2)?,
        target_url: row.get(3)?,
        path: row.get(4)?,
        enabled: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        creator_id: row.get(8)?,
        sync_status: SyncStatus::from_str(&status).unwrap_or_default(),
        sync_error: row.get(10)?,
        synced_at: row.get(11)?,
    })
}

fn row_to_config_with_creator(row: &Row) -> rusqlite::Result<ProxyConfigWithCreator> {
    Ok(ProxyConfigWithCreator {
        config: row_to_config(row)?,
        creator: CreatorSummary {
            id: row.get(12)?,
            name: row.get(13)?,
            email: row.get(14)?,
        },
    })
}

// ==================== Record Types ====================

/// Whether a config's current state has reached Caddy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }
}

/// User record from database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub id: String,
    pub name: Option<String>,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl UserRecord {
    /// New user with a fresh id and timestamps
    pub fn new(name: Option<String>, email: &str, password_hash: String, is_admin: bool) -> Self {
        let now = now_timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            email: email.to_string(),
            password_hash,
            is_admin,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Proxy configuration record from database
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfigRecord {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub target_url: String,
    pub path: Option<String>,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
    pub creator_id: String,
    pub sync_status: SyncStatus,
    pub sync_error: Option<String>,
    pub synced_at: Option<String>,
}

impl ProxyConfigRecord {
    /// New pending config with a generated id
    pub fn new(update: ProxyConfigUpdate, creator_id: &str) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), update, creator_id)
    }

    pub fn with_id(id: String, update: ProxyConfigUpdate, creator_id: &str) -> Self {
        let now = now_timestamp();
        Self {
            id,
            name: update.name,
            domain: update.domain,
            target_url: update.target_url,
            path: update.path,
            enabled: update.enabled,
            created_at: now.clone(),
            updated_at: now,
            creator_id: creator_id.to_string(),
            sync_status: SyncStatus::Pending,
            sync_error: None,
            synced_at: None,
        }
    }
}

/// Editable fields of a proxy config
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfigUpdate {
    pub name: String,
    pub domain: String,
    pub target_url: String,
    pub path: Option<String>,
    pub enabled: bool,
}

/// Public part of a user attached to a config
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreatorSummary {
    pub id: String,
    pub name: Option<String>,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfigWithCreator {
    #[serde(flatten)]
    pub config: ProxyConfigRecord,
    pub creator: CreatorSummary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncCounts {
    pub total: i64,
    pub enabled: i64,
    pub synced: i64,
    pub pending: i64,
    pub failed: i64,
}
