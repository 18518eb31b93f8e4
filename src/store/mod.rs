//! Durable job records (SQLite).
//!
//! One `jobs` row per (owner, name), plus an `owners` table tracking activity
//! for inactivity reaping. All access goes through a single connection behind
//! a mutex; statements are short and run inline.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::backend::HandleRef;
use crate::utils::current_timestamp;

pub type JobId = i64;
pub type OwnerId = i64;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sql(rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown job id {0}")]
    UnknownId(JobId),

    #[error("owner {owner} already has a job named '{name}'")]
    Duplicate { owner: OwnerId, name: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}

/// A persisted job. The log buffer is kept out of this struct and read
/// through [`JobStore::log_buffer`].
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub owner: OwnerId,
    pub name: String,
    pub safe_name: String,
    pub entry_path: Option<PathBuf>,
    pub dependencies: Vec<String>,
    pub running: bool,
    pub backend_handle: Option<HandleRef>,
    pub auto_restart: bool,
    pub created_at: u64,
}

/// Typed partial update of a job row. `None` leaves a column untouched.
///
/// Setting `running` to false always clears `backend_handle`.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub entry_path: Option<Option<PathBuf>>,
    pub dependencies: Option<Vec<String>>,
    pub running: Option<bool>,
    pub backend_handle: Option<Option<HandleRef>>,
    pub auto_restart: Option<bool>,
}

impl JobUpdate {
    pub fn started(handle: HandleRef) -> Self {
        Self {
            running: Some(true),
            backend_handle: Some(Some(handle)),
            ..Default::default()
        }
    }

    pub fn stopped() -> Self {
        Self {
            running: Some(false),
            backend_handle: Some(None),
            ..Default::default()
        }
    }

    pub fn entry(path: PathBuf) -> Self {
        Self {
            entry_path: Some(Some(path)),
            ..Default::default()
        }
    }

    pub fn auto_restart(enabled: bool) -> Self {
        Self {
            auto_restart: Some(enabled),
            ..Default::default()
        }
    }

    pub fn dependencies(deps: Vec<String>) -> Self {
        Self {
            dependencies: Some(deps),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StoreCounts {
    pub owners: u64,
    pub jobs: u64,
    pub running: u64,
}

const JOB_COLUMNS: &str = "id, owner_id, name, safe_name, entry_path, dependencies, running, \
                           backend_handle, auto_restart, created_at";

pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Open (creating if needed) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.migrate()?;
        tracing::info!("Job store opened at {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves nothing half-applied in SQLite.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn migrate(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS owners (
              owner_id INTEGER PRIMARY KEY,
              username TEXT,
              created_at INTEGER NOT NULL,
              last_active INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              owner_id INTEGER NOT NULL,
              name TEXT NOT NULL,
              safe_name TEXT NOT NULL,
              entry_path TEXT,
              dependencies TEXT NOT NULL DEFAULT '[]',
              running INTEGER NOT NULL DEFAULT 0,
              backend_handle TEXT,
              log_buffer TEXT NOT NULL DEFAULT '',
              auto_restart INTEGER NOT NULL DEFAULT 0,
              created_at INTEGER NOT NULL,
              UNIQUE (owner_id, name)
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_running ON jobs(running);
            "#,
        )?;
        Ok(())
    }

    // ── Owners ──────────────────────────────────────────────

    /// Register the owner if new and refresh its `last_active`.
    pub fn touch_owner(&self, owner: OwnerId, username: Option<&str>) -> Result<(), StoreError> {
        let now = current_timestamp() as i64;
        self.conn().execute(
            "INSERT INTO owners (owner_id, username, created_at, last_active)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(owner_id) DO UPDATE SET
               last_active = excluded.last_active,
               username = COALESCE(excluded.username, owners.username)",
            params![owner, username, now],
        )?;
        Ok(())
    }

    /// Backdate an owner's activity. Used by maintenance tooling and tests.
    pub fn set_last_active(&self, owner: OwnerId, timestamp: u64) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE owners SET last_active = ?1 WHERE owner_id = ?2",
            params![timestamp as i64, owner],
        )?;
        Ok(())
    }

    /// Owners whose last activity is older than `cutoff` (unix seconds).
    pub fn inactive_owners(&self, cutoff: u64) -> Result<Vec<OwnerId>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT owner_id FROM owners WHERE last_active < ?1 ORDER BY owner_id")?;
        let rows = stmt.query_map(params![cutoff as i64], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<OwnerId>, _>>()?)
    }

    /// Remove an owner and all of its job rows. Returns the number of jobs removed.
    pub fn delete_owner(&self, owner: OwnerId) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let jobs = tx.execute("DELETE FROM jobs WHERE owner_id = ?1", params![owner])?;
        tx.execute("DELETE FROM owners WHERE owner_id = ?1", params![owner])?;
        tx.commit()?;
        Ok(jobs)
    }

    // ── Jobs ────────────────────────────────────────────────

    pub fn create_job(
        &self,
        owner: OwnerId,
        name: &str,
        safe_name: &str,
    ) -> Result<Job, StoreError> {
        let now = current_timestamp();
        let id = {
            let conn = self.conn();
            let inserted = conn.execute(
                "INSERT INTO jobs (owner_id, name, safe_name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![owner, name, safe_name, now as i64],
            );
            match inserted {
                Ok(_) => conn.last_insert_rowid(),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    return Err(StoreError::Duplicate {
                        owner,
                        name: name.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.get(id)?.ok_or(StoreError::UnknownId(id))
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS))?;
        let raw = stmt.query_row(params![id], RawJob::from_row).optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    pub fn find_by_name(&self, owner: OwnerId, name: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE owner_id = ?1 AND name = ?2",
            JOB_COLUMNS
        ))?;
        let raw = stmt.query_row(params![owner, name], RawJob::from_row).optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    pub fn list_by_owner(&self, owner: OwnerId) -> Result<Vec<Job>, StoreError> {
        self.query_jobs(
            &format!("SELECT {} FROM jobs WHERE owner_id = ?1 ORDER BY id", JOB_COLUMNS),
            params![owner],
        )
    }

    pub fn running_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.query_jobs(
            &format!("SELECT {} FROM jobs WHERE running = 1 ORDER BY id", JOB_COLUMNS),
            [],
        )
    }

    fn query_jobs<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, RawJob::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawJob::into_job).collect()
    }

    /// Apply a typed update. Unknown ids are an error.
    pub fn update(&self, id: JobId, update: &JobUpdate) -> Result<(), StoreError> {
        let mut sets: Vec<&'static str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(entry) = &update.entry_path {
            sets.push("entry_path = ?");
            values.push(match entry {
                Some(path) => Value::Text(path.to_string_lossy().into_owned()),
                None => Value::Null,
            });
        }
        if let Some(deps) = &update.dependencies {
            sets.push("dependencies = ?");
            values.push(Value::Text(serde_json::to_string(deps)?));
        }
        if let Some(running) = update.running {
            sets.push("running = ?");
            values.push(Value::Integer(running as i64));
        }
        let handle = match (update.running, &update.backend_handle) {
            (Some(false), _) => Some(None),
            (_, handle) => handle.clone(),
        };
        if let Some(handle) = handle {
            sets.push("backend_handle = ?");
            values.push(match handle {
                Some(h) => Value::Text(h.to_string()),
                None => Value::Null,
            });
        }
        if let Some(auto_restart) = update.auto_restart {
            sets.push("auto_restart = ?");
            values.push(Value::Integer(auto_restart as i64));
        }

        if sets.is_empty() {
            return match self.exists(id)? {
                true => Ok(()),
                false => Err(StoreError::UnknownId(id)),
            };
        }

        values.push(Value::Integer(id));
        let sql = format!("UPDATE jobs SET {} WHERE id = ?", sets.join(", "));
        let changed = self.conn().execute(&sql, params_from_iter(values))?;
        if changed == 0 {
            return Err(StoreError::UnknownId(id));
        }
        Ok(())
    }

    fn exists(&self, id: JobId) -> Result<bool, StoreError> {
        let found = self
            .conn()
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", params![id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Delete a job row. Returns whether a row was removed.
    pub fn delete(&self, id: JobId) -> Result<bool, StoreError> {
        let changed = self.conn().execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    pub fn log_buffer(&self, id: JobId) -> Result<String, StoreError> {
        self.conn()
            .query_row("SELECT log_buffer FROM jobs WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?
            .ok_or(StoreError::UnknownId(id))
    }

    pub fn set_log_buffer(&self, id: JobId, text: &str) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE jobs SET log_buffer = ?1 WHERE id = ?2",
            params![text, id],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownId(id));
        }
        Ok(())
    }

    pub fn counts(&self) -> Result<StoreCounts, StoreError> {
        let conn = self.conn();
        let owners: i64 = conn.query_row("SELECT COUNT(*) FROM owners", [], |r| r.get(0))?;
        let (jobs, running): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(running), 0) FROM jobs",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok(StoreCounts {
            owners: owners as u64,
            jobs: jobs as u64,
            running: running as u64,
        })
    }
}

/// Row as stored, before decoding the text columns.
struct RawJob {
    id: JobId,
    owner: OwnerId,
    name: String,
    safe_name: String,
    entry_path: Option<String>,
    dependencies: String,
    running: bool,
    backend_handle: Option<String>,
    auto_restart: bool,
    created_at: i64,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            name: row.get(2)?,
            safe_name: row.get(3)?,
            entry_path: row.get(4)?,
            dependencies: row.get(5)?,
            running: row.get(6)?,
            backend_handle: row.get(7)?,
            auto_restart: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let backend_handle = match self.backend_handle.as_deref() {
            Some(s) => match s.parse::<HandleRef>() {
                Ok(h) => Some(h),
                Err(e) => {
                    tracing::warn!("Job {}: ignoring stored handle: {}", self.id, e);
                    None
                }
            },
            None => None,
        };
        Ok(Job {
            id: self.id,
            owner: self.owner,
            name: self.name,
            safe_name: self.safe_name,
            entry_path: self.entry_path.map(PathBuf::from),
            dependencies: serde_json::from_str(&self.dependencies)?,
            running: self.running,
            backend_handle,
            auto_restart: self.auto_restart,
            created_at: self.created_at.max(0) as u64,
        })
    }
}
