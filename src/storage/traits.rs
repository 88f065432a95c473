//! Storage traits and error types
//!
//! This module defines the interface the orchestrator persists through, so
//! the pipeline can run against a fake or deliberately failing store.

use crate::crawler::Record;
use crate::state::LedgerEntry;
use crate::storage::{Checkpoint, RunStatus};
use chrono::NaiveDate;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the record store
///
/// Any of these is fatal to the run: the orchestrator stops dispatching and
/// keeps the last good checkpoint as the resume point.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors raised while writing or reading the checkpoint file
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Checkpoint {path} is unreadable: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Checkpoint format version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Durable home of records, runs and checkpoints
pub trait RecordStore: Send {
    // ===== Records =====

    /// Appends a batch of records atomically
    ///
    /// Write-if-absent per identity: records whose identity is already
    /// stored are ignored, so appending the same batch twice changes
    /// nothing. Either the whole batch is durable or none of it is.
    ///
    /// # Returns
    ///
    /// The number of records actually written
    fn append(&mut self, records: &[Record]) -> StorageResult<usize>;

    /// Checks if a record with this identity is stored
    fn contains(&self, identity: &str) -> StorageResult<bool>;

    /// Returns every stored identity with its observation time
    ///
    /// Used to rebuild the ledger on start-up.
    fn identities(&self) -> StorageResult<Vec<LedgerEntry>>;

    /// Gets total record count
    fn count_records(&self) -> StorageResult<u64>;

    /// Latest `date_start` among the outings stored for a source
    ///
    /// `None` when the source has no outing with a date yet.
    fn latest_outing_date(&self, source: &str) -> StorageResult<Option<NaiveDate>>;

    // ===== Run Management =====

    /// Creates a new run row and returns its ID
    fn begin_run(&mut self, run_id: &str, config_hash: &str) -> StorageResult<i64>;

    /// Records the sequence number of the latest durable checkpoint
    fn note_checkpoint(&mut self, run: i64, sequence: u64) -> StorageResult<()>;

    /// Closes a run with its final status
    fn finish_run(&mut self, run: i64, status: RunStatus) -> StorageResult<()>;

    // ===== Checkpoints =====

    /// Atomically replaces the checkpoint
    fn write_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    /// Loads the checkpoint, `None` if there is none yet
    fn load_checkpoint(&self) -> Result<Option<Checkpoint>, CheckpointError>;
}
