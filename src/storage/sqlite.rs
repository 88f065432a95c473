//! SQLite storage implementation
//!
//! Records and runs live in `<data-dir>/records.db`; the checkpoint is a
//! JSON file next to it.

use crate::crawler::Record;
use crate::state::LedgerEntry;
use crate::storage::checkpoint::{read_checkpoint, write_checkpoint, Checkpoint};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{CheckpointError, RecordStore, StorageError, StorageResult};
use crate::storage::{RunRecord, RunStatus, SourceCount};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// File name of the record database inside the data directory
pub const DATABASE_FILE: &str = "records.db";

/// SQLite-backed record store
pub struct SqliteStore {
    conn: Connection,
    data_dir: PathBuf,
}

impl SqliteStore {
    /// Opens (or creates) the store in `data_dir`
    ///
    /// # Arguments
    ///
    /// * `data_dir` - Directory holding `records.db` and `checkpoint.json`
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStore)` - Successfully opened/created database
    /// * `Err(StorageError)` - Directory not writable or database unusable
    pub fn open(data_dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join(DATABASE_FILE))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn,
            data_dir: data_dir.to_path_buf(),
        })
    }

    /// Creates an in-memory database whose checkpoint goes to `data_dir` (for testing)
    #[cfg(test)]
    pub fn new_in_memory(data_dir: &Path) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn,
            data_dir: data_dir.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ===== Statistics =====

    /// Counts records grouped by source and kind
    pub fn count_by_source(&self) -> StorageResult<Vec<SourceCount>> {
        let mut stmt = self.conn.prepare(
            "SELECT source, kind, COUNT(*) FROM records GROUP BY source, kind ORDER BY source, kind",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(SourceCount {
                source: row.get(0)?,
                kind: row.get(1)?,
                count: row.get::<_, i64>(2)? as u64,
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Returns the most recent runs, newest first
    pub fn recent_runs(&self, limit: usize) -> StorageResult<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, run_id, started_at, finished_at, config_hash, status, last_checkpoint
             FROM runs ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], map_run)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Gets a run by ID
    pub fn get_run(&self, id: i64) -> StorageResult<RunRecord> {
        self.conn
            .query_row(
                "SELECT id, run_id, started_at, finished_at, config_hash, status, last_checkpoint
                 FROM runs WHERE id = ?1",
                params![id],
                map_run,
            )
            .optional()?
            .ok_or(StorageError::RunNotFound(id))
    }
}

fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        started_at: row.get(2)?,
        finished_at: row.get(3)?,
        config_hash: row.get(4)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(5)?)
            .unwrap_or(RunStatus::Failed),
        last_checkpoint: row.get::<_, Option<i64>>(6)?.map(|seq| seq as u64),
    })
}

impl RecordStore for SqliteStore {
    // ===== Records =====

    fn append(&mut self, records: &[Record]) -> StorageResult<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO records
                 (identity, source, kind, document_id, fields, observed_at, url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            for record in records {
                let fields = serde_json::to_string(&record.fields)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                written += stmt.execute(params![
                    record.identity,
                    record.source,
                    record.kind,
                    record.document_id,
                    fields,
                    record.observed_at.to_rfc3339(),
                    record.url,
                ])?;
            }
        }
        tx.commit()?;

        Ok(written)
    }

    fn contains(&self, identity: &str) -> StorageResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM records WHERE identity = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn identities(&self) -> StorageResult<Vec<LedgerEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT identity, observed_at FROM records ORDER BY observed_at, identity")?;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (identity, observed_at) = row?;
            let first_seen = DateTime::parse_from_rfc3339(&observed_at)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| {
                    StorageError::Serialization(format!(
                        "bad observed_at '{}' for {}: {}",
                        observed_at, identity, e
                    ))
                })?;
            entries.push(LedgerEntry {
                identity,
                first_seen,
            });
        }

        Ok(entries)
    }

    fn count_records(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn latest_outing_date(&self, source: &str) -> StorageResult<Option<NaiveDate>> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(json_extract(fields, '$.date_start')) FROM records
             WHERE source = ?1 AND kind = 'outings'",
            params![source],
            |row| row.get(0),
        )?;

        latest
            .map(|date| {
                NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
                    StorageError::Serialization(format!("bad date_start '{}': {}", date, e))
                })
            })
            .transpose()
    }

    // ===== Run Management =====

    fn begin_run(&mut self, run_id: &str, config_hash: &str) -> StorageResult<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO runs (run_id, started_at, config_hash, status) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, now, config_hash, RunStatus::Running.to_db_string()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn note_checkpoint(&mut self, run: i64, sequence: u64) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET last_checkpoint = ?1 WHERE id = ?2",
            params![sequence as i64, run],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run));
        }
        Ok(())
    }

    fn finish_run(&mut self, run: i64, status: RunStatus) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
            params![status.to_db_string(), now, run],
        )?;
        if updated == 0 {
            return Err(StorageError::RunNotFound(run));
        }
        Ok(())
    }

    // ===== Checkpoints =====

    fn write_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        write_checkpoint(&self.data_dir, checkpoint)
    }

    fn load_checkpoint(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        read_checkpoint(&self.data_dir)
    }
}
