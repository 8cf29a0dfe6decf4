use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::models::{JobMatch, ThreadMap};

pub const MATCHES_KEY: &str = "mailtrix_matches";
pub const THREADS_KEY: &str = "mailtrix_threads";
pub const PENDING_KEY: &str = "mailtrix_pending";
pub const PENDING_THREADS_KEY: &str = "mailtrix_pending_threads";

/// Durable local storage: a key-value table of JSON documents.
pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open_at(&path)
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        let db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "mailtrix") {
            Ok(proj_dirs.data_dir().join("mailtrix.db"))
        } else {
            Ok(PathBuf::from("mailtrix.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        // The relay and the dashboard may share one file.
        self.conn.busy_timeout(Duration::from_secs(5))?;
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )?;
        Ok(())
    }

    // --- Raw key-value access ---

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed to read '{}'", key))
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        put_with(&self.conn, key, value).with_context(|| format!("Failed to write '{}'", key))
    }

    // --- Store state ---

    /// Reads the job-match collection. Missing or unreadable data yields an
    /// empty collection.
    pub fn load_jobs(&self) -> Vec<JobMatch> {
        self.load_blob(MATCHES_KEY)
    }

    pub fn load_threads(&self) -> ThreadMap {
        self.load_blob(THREADS_KEY)
    }

    pub fn save_jobs(&self, jobs: &[JobMatch]) -> Result<()> {
        let json = serde_json::to_string(jobs).context("Failed to serialize job matches")?;
        self.put(MATCHES_KEY, &json)
    }

    pub fn save_threads(&self, threads: &ThreadMap) -> Result<()> {
        let json = serde_json::to_string(threads).context("Failed to serialize threads")?;
        self.put(THREADS_KEY, &json)
    }

    fn load_blob<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        let raw = match self.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return T::default(),
            Err(e) => {
                warn!(key, error = %format!("{:#}", e), "Failed to load from storage");
                return T::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Stored data is corrupt, starting empty");
                T::default()
            }
        }
    }

    // --- Staging area ---

    /// Appends `item` to the JSON array stored under `key`.
    pub fn stage<T: Serialize>(&self, key: &str, item: &T) -> Result<()> {
        let item = serde_json::to_value(item).context("Failed to serialize staged payload")?;
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let existing: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        let mut items: Vec<Value> = match existing {
            Some(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("Staging area '{}' is not a JSON array", key))?,
            None => Vec::new(),
        };
        items.push(item);
        put_with(&tx, key, &serde_json::to_string(&items)?)?;
        tx.commit()?;
        Ok(())
    }

    /// Removes and returns what is staged under `key`. When the staged data
    /// fails to parse it is left in place and the error is returned.
    pub fn take_staged<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let raw: Option<String> = tx
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let parsed = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse staged payloads under '{}'", key))?;
        tx.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        tx.commit()?;
        Ok(Some(parsed))
    }

    #[cfg(test)]
    pub(crate) fn break_storage(&self) {
        self.conn.execute_batch("DROP TABLE kv;").unwrap();
    }
}

fn put_with(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StagedThreadMessage;
    use serde_json::json;

    #[test]
    fn test_missing_keys_load_empty() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.load_jobs().is_empty());
        assert!(db.load_threads().is_empty());
    }

    #[test]
    fn test_corrupt_blob_loads_empty() {
        let db = Database::open_in_memory().unwrap();
        db.put(MATCHES_KEY, "{not json").unwrap();
        db.put(THREADS_KEY, "[1, 2, 3]").unwrap();
        assert!(db.load_jobs().is_empty());
        assert!(db.load_threads().is_empty());
    }

    #[test]
    fn test_save_and_load_jobs() {
        let db = Database::open_in_memory().unwrap();
        let mut job = JobMatch::new("J1");
        job.job_title = Some("Senior Java Developer".to_string());
        db.save_jobs(&[job.clone()]).unwrap();
        assert_eq!(db.load_jobs(), vec![job]);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mailtrix.db");
        {
            let db = Database::open_at(&path).unwrap();
            db.save_jobs(&[JobMatch::new("J1")]).unwrap();
        }
        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.path(), path.as_path());
        assert_eq!(db.load_jobs()[0].job_id, "J1");
    }

    #[test]
    fn test_put_overwrites() {
        let db = Database::open_in_memory().unwrap();
        db.put("k", "1").unwrap();
        db.put("k", "2").unwrap();
        assert_eq!(db.get("k").unwrap().as_deref(), Some("2"));
        assert_eq!(db.get("missing").unwrap(), None);
    }

    #[test]
    fn test_stage_appends_in_order_and_take_clears() {
        let db = Database::open_in_memory().unwrap();
        db.stage(PENDING_KEY, &json!({ "job_id": "J1" })).unwrap();
        db.stage(PENDING_KEY, &json!({ "job_id": "J2" })).unwrap();

        let staged: Vec<Value> = db.take_staged(PENDING_KEY).unwrap().unwrap();
        assert_eq!(staged, vec![json!({ "job_id": "J1" }), json!({ "job_id": "J2" })]);
        assert_eq!(db.get(PENDING_KEY).unwrap(), None);
        assert!(db.take_staged::<Vec<Value>>(PENDING_KEY).unwrap().is_none());
    }

    #[test]
    fn test_take_staged_leaves_unparseable_data() {
        let db = Database::open_in_memory().unwrap();
        db.stage(PENDING_THREADS_KEY, &json!({ "job_id": "J1" })).unwrap();

        let result = db.take_staged::<Vec<StagedThreadMessage>>(PENDING_THREADS_KEY);
        assert!(result.is_err());
        assert!(db.get(PENDING_THREADS_KEY).unwrap().is_some());
    }

    #[test]
    fn test_save_fails_on_broken_storage() {
        let db = Database::open_in_memory().unwrap();
        db.break_storage();
        assert!(db.save_jobs(&[]).is_err());
        assert!(db.load_jobs().is_empty());
    }
}
