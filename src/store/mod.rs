use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

/// Session cache in SQLite plus JSON blobs on disk.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    data_dir: PathBuf,
    cache_dir: PathBuf,
}

impl Store {
    /// Open (or create) the SQLite cache at `path`
    pub fn open(path: &str, data_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn, data_dir.into(), cache_dir.into())
    }

    #[cfg(test)]
    pub fn open_in_memory(root: &Path) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, root.join("data"), root.join("cache"))
    }

    fn with_connection(conn: Connection, data_dir: PathBuf, cache_dir: PathBuf) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
            data_dir,
            cache_dir,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store connection poisoned"))
    }

    // ── Key/value cache ──────────────────────────────────────────────────────

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT value FROM cache WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).context("decoding cached value"))
            .transpose()
    }

    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cache (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value.to_string(), Utc::now()],
        )?;
        Ok(())
    }

    // ── JSON files ───────────────────────────────────────────────────────────

    /// `None` when the file does not exist.
    pub async fn read(&self, path: &Path) -> Result<Option<Value>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("decoding {}", path.display()))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub async fn write(&self, path: &Path, data: &Value) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec(data)?;
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Competition rotation of one user.
    pub fn user_data_path(&self, username: &str) -> PathBuf {
        self.data_dir.join(format!("{}.json", username))
    }

    /// Archive of one completed league.
    pub fn league_path(&self, game_id: u32, username: &str, league: u32) -> PathBuf {
        self.cache_dir
            .join(game_id.to_string())
            .join(format!("{}_{}.json", username, league))
    }
}
