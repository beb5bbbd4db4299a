//! SQLite database implementation for persistent storage

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::core::layout::{FsLayout, InstanceLocator, InstancePaths};
use crate::core::{Instance, InstanceStatus, Settings};
use crate::error::{IoContext, ManagerError, Result};

/// Prefix of references into the secrets table
const SECRET_REF_PREFIX: &str = "secret:";

/// One row of the instance history
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HistoryEvent {
    pub event_type: String,
    pub event_time: String,
    pub details: Option<String>,
}

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
    /// Identifies this store for lock naming
    scope: String,
}

impl Database {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).at(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;

        info!("Database opened at {:?}", path);
        let scope = std::fs::canonicalize(path)
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .to_string();
        Ok(Self {
            conn: Mutex::new(conn),
            scope,
        })
    }

    /// Private in-memory database, used by tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            scope: format!("memory-{}", Uuid::new_v4()),
        })
    }

    /// Get the default database file path
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| ManagerError::Io {
                path: PathBuf::from("~"),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no data or home directory for this user",
                ),
            })?
            .join("foundry-instance-manager");
        Ok(data_dir.join("fim.db"))
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| ManagerError::CorruptRecord {
            name: "database".to_string(),
            reason: format!("connection lock poisoned: {}", e),
        })
    }

    /// Initialize database schema
    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            -- Settings table
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Instances table
            CREATE TABLE IF NOT EXISTS instances (
                name TEXT PRIMARY KEY,
                version TEXT NOT NULL,
                port INTEGER NOT NULL UNIQUE,
                proxy_port INTEGER,
                admin_key_ref TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                base_dir TEXT NOT NULL,
                environment TEXT NOT NULL DEFAULT '[]',
                image TEXT
            );

            -- Admin keys, referenced from instances.admin_key_ref
            CREATE TABLE IF NOT EXISTS secrets (
                id TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- Instance history
            CREATE TABLE IF NOT EXISTS instance_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_name TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_time TEXT NOT NULL,
                details TEXT
            );
            "#,
        )?;

        // Stores created before custom images were supported lack the column
        let has_image: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('instances') WHERE name = 'image'",
            [],
            |row| row.get(0),
        )?;
        if !has_image {
            conn.execute_batch("ALTER TABLE instances ADD COLUMN image TEXT;")?;
            info!("Added image column to instances table");
        }

        debug!("Database schema initialized");
        Ok(())
    }

    // === Settings ===

    /// Load settings from database
    pub fn load_settings(&self) -> Result<Option<Settings>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = 'app_settings'")?;
        let result: Option<String> = stmt.query_row([], |row| row.get(0)).optional()?;

        match result {
            Some(json) => {
                let mut settings: Settings = serde_json::from_str(&json)?;
                // Validate and fix any invalid values after deserialization
                settings.validate();
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Save settings to database
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let conn = self.conn()?;
        let json = serde_json::to_string(settings)?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('app_settings', ?1)",
            params![json],
        )?;
        debug!("Settings saved");
        Ok(())
    }

    // === Instances ===

    /// Insert a new instance record; the name and port must be unused
    pub fn insert_instance(&self, instance: &Instance) -> Result<()> {
        let conn = self.conn()?;
        let environment = serde_json::to_string(&instance.environment)?;

        let inserted = conn.execute(
            r#"
            INSERT INTO instances
            (name, version, port, proxy_port, admin_key_ref, status, created_at, base_dir, environment, image)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                instance.name,
                instance.version,
                instance.port,
                instance.proxy_port,
                instance.admin_key_ref,
                instance.status.label(),
                instance.created_at.to_rfc3339(),
                instance.base_dir.to_string_lossy().to_string(),
                environment,
                instance.custom_image,
            ],
        );

        match inserted {
            Ok(_) => {
                debug!("Instance {} saved", instance.name);
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, msg))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                let msg = msg.unwrap_or_default();
                if msg.contains("instances.port") {
                    Err(ManagerError::PortInUse {
                        port: instance.port,
                        owner: "another instance".to_string(),
                    })
                } else {
                    Err(ManagerError::DuplicateInstance(instance.name.clone()))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load one instance record
    pub fn get_instance(&self, name: &str) -> Result<Option<Instance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, version, port, proxy_port, admin_key_ref, status, created_at, base_dir, environment, image FROM instances WHERE name = ?1",
        )?;
        let row = stmt.query_row(params![name], read_row).optional()?;
        row.map(decode_row).transpose()
    }

    /// Load all instances from database, ordered by name
    pub fn load_all_instances(&self) -> Result<Vec<Instance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, version, port, proxy_port, admin_key_ref, status, created_at, base_dir, environment, image FROM instances ORDER BY name",
        )?;
        let rows = stmt.query_map([], read_row)?;

        let mut result = Vec::new();
        for row in rows {
            match decode_row(row?) {
                Ok(instance) => result.push(instance),
                Err(e) => {
                    error!("Skipping unreadable instance record: {}", e);
                    continue;
                }
            }
        }
        Ok(result)
    }

    /// Update instance status
    pub fn update_instance_status(&self, name: &str, status: InstanceStatus) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE instances SET status = ?1 WHERE name = ?2",
            params![status.label(), name],
        )?;
        if changed == 0 {
            return Err(ManagerError::InstanceNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Update the recorded application version
    pub fn update_instance_version(&self, name: &str, version: &str) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE instances SET version = ?1 WHERE name = ?2",
            params![version, name],
        )?;
        if changed == 0 {
            return Err(ManagerError::InstanceNotFound(name.to_string()));
        }
        Ok(())
    }

    /// Delete an instance from database; returns whether a row existed
    pub fn delete_instance(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute("DELETE FROM instances WHERE name = ?1", params![name])?;
        debug!("Instance {} deleted", name);
        Ok(changed > 0)
    }

    /// Name of the instance already claiming `port` as its port or proxy port
    pub fn find_port_owner(&self, port: u16) -> Result<Option<String>> {
        let conn = self.conn()?;
        let owner = conn
            .query_row(
                "SELECT name FROM instances WHERE port = ?1 OR proxy_port = ?1 ORDER BY name LIMIT 1",
                params![port],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    // === Secrets ===

    /// Store a secret and return the reference to keep in the instance record
    pub fn save_secret(&self, value: &str) -> Result<String> {
        let conn = self.conn()?;
        let id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO secrets (id, value) VALUES (?1, ?2)",
            params![id, value],
        )?;
        Ok(format!("{}{}", SECRET_REF_PREFIX, id))
    }

    /// Resolve a secret reference
    pub fn load_secret(&self, reference: &str) -> Result<Option<String>> {
        let Some(id) = reference.strip_prefix(SECRET_REF_PREFIX) else {
            return Ok(None);
        };
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM secrets WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn delete_secret(&self, reference: &str) -> Result<()> {
        if let Some(id) = reference.strip_prefix(SECRET_REF_PREFIX) {
            let conn = self.conn()?;
            conn.execute("DELETE FROM secrets WHERE id = ?1", params![id])?;
        }
        Ok(())
    }

    // === History ===

    /// Record an instance event
    pub fn record_instance_event(
        &self,
        instance_name: &str,
        event_type: &str,
        details: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO instance_history (instance_name, event_type, event_time, details)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                instance_name,
                event_type,
                Utc::now().to_rfc3339(),
                details,
            ],
        )?;
        Ok(())
    }

    /// Get instance history, newest first
    pub fn get_instance_history(&self, instance_name: &str) -> Result<Vec<HistoryEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_type, event_time, details FROM instance_history WHERE instance_name = ?1 ORDER BY id DESC",
        )?;

        let history = stmt.query_map(params![instance_name], |row| {
            Ok(HistoryEvent {
                event_type: row.get(0)?,
                event_time: row.get(1)?,
                details: row.get(2)?,
            })
        })?;

        let mut result = Vec::new();
        for event in history {
            result.push(event?);
        }

        Ok(result)
    }

    /// Clean up old history entries
    pub fn cleanup_history(&self, retention_days: u32) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0); // Keep forever
        }

        let conn = self.conn()?;
        let cutoff = Utc::now()
            - chrono::TimeDelta::try_days(retention_days as i64)
                .unwrap_or_else(|| chrono::TimeDelta::days(30));
        let count = conn.execute(
            "DELETE FROM instance_history WHERE event_time < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        debug!("Cleaned up {} old history entries", count);
        Ok(count)
    }
}

impl InstanceLocator for Database {
    fn locate(&self, name: &str) -> Result<InstancePaths> {
        let record = self
            .get_instance(name)?
            .ok_or_else(|| ManagerError::InstanceNotFound(name.to_string()))?;
        let paths = FsLayout::new(&record.base_dir).instance(name);
        if let Some(missing) = paths.missing_dir() {
            return Err(ManagerError::CorruptRecord {
                name: name.to_string(),
                reason: format!(
                    "directory {} is missing; start the instance to rebuild it",
                    missing.display()
                ),
            });
        }
        Ok(paths)
    }

    fn scope(&self) -> &str {
        &self.scope
    }
}

type RawRow = (
    String,
    String,
    u16,
    Option<u16>,
    Option<String>,
    String,
    String,
    String,
    String,
    Option<String>,
);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn decode_row(raw: RawRow) -> Result<Instance> {
    let (name, version, port, proxy_port, admin_key_ref, status, created_at, base_dir, env, image) =
        raw;

    let corrupt = |reason: String| ManagerError::CorruptRecord {
        name: name.clone(),
        reason,
    };

    let status: InstanceStatus = status.parse().map_err(corrupt)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(format!("bad created_at: {}", e)))?;
    let environment: Vec<(String, String)> =
        serde_json::from_str(&env).map_err(|e| corrupt(format!("bad environment: {}", e)))?;

    Ok(Instance {
        name,
        version,
        port,
        proxy_port,
        admin_key_ref,
        status,
        created_at,
        base_dir: PathBuf::from(base_dir),
        custom_image: image,
        environment,
    })
}
