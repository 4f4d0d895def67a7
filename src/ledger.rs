//! Append-only record of cities whose raw value has been committed.
//!
//! A key is appended only after the database commit for that city, so a
//! crash between the two steps causes one idempotent re-fetch rather than a
//! lost city.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{AppError, AppResult};

pub trait ProgressLedger: Send + Sync {
    /// Every key marked done so far; empty when nothing was recorded yet.
    fn loaded_keys(&self) -> AppResult<HashSet<String>>;

    fn contains(&self, key: &str) -> AppResult<bool> {
        Ok(self.loaded_keys()?.contains(key))
    }

    fn mark_done(&self, key: &str) -> AppResult<()> {
        self.mark_all_done(&[key])
    }

    fn mark_all_done(&self, keys: &[&str]) -> AppResult<()>;
}

/// One key per line in a plain-text file.
pub struct FileLedger {
    path: PathBuf,
}

impl FileLedger {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ProgressLedger for FileLedger {
    fn loaded_keys(&self) -> AppResult<HashSet<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(HashSet::new()),
            Err(err) => Err(AppError::Io(err)),
        }
    }

    fn mark_all_done(&self, keys: &[&str]) -> AppResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut buffer = String::new();
        for key in keys {
            let key = key.trim();
            if key.is_empty() || key.contains('\n') {
                return Err(AppError::Parse(format!("invalid ledger key: {key:?}")));
            }
            buffer.push_str(key);
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes())?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }
}

/// Ledger rows in the `ingest_progress` table, scoped by job name.
pub struct TableLedger {
    db: Arc<Mutex<Connection>>,
    job: String,
}

impl TableLedger {
    pub fn new(db: Arc<Mutex<Connection>>, job: impl Into<String>) -> Self {
        Self {
            db,
            job: job.into(),
        }
    }
}

impl ProgressLedger for TableLedger {
    fn loaded_keys(&self) -> AppResult<HashSet<String>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare("SELECT geoname_id FROM ingest_progress WHERE job = ?1")?;
        let keys = stmt
            .query_map([&self.job], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(keys)
    }

    fn contains(&self, key: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let found = conn
            .query_row(
                "SELECT 1 FROM ingest_progress WHERE job = ?1 AND geoname_id = ?2",
                params![self.job, key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn mark_all_done(&self, keys: &[&str]) -> AppResult<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO ingest_progress (job, geoname_id) VALUES (?1, ?2)
                 ON CONFLICT(job, geoname_id) DO NOTHING",
            )?;
            for key in keys {
                stmt.execute(params![self.job, key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}
