//! Checkpoint file
//!
//! A checkpoint is one JSON document holding everything needed to resume a
//! crawl: the frontier (in-flight targets first), the committed ledger
//! entries and the crawl counters. It is replaced atomically: written to a
//! uniquely named temp file in the data directory, fsynced, then renamed over
//! the old one.

use crate::crawler::FrontierSnapshot;
use crate::state::LedgerEntry;
use crate::storage::CheckpointError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// File name of the checkpoint inside the data directory
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Format version written by this build
pub const CHECKPOINT_VERSION: u32 = 1;

/// Counters carried across restarts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlCounters {
    /// Completed fetch-process cycles
    pub cycles: u64,
    /// Successful fetches
    pub fetched: u64,
    /// Records newly written to the store
    pub records_written: u64,
    /// Candidates dropped because their identity was already known
    pub duplicates: u64,
    /// Retryable failures that were rescheduled
    pub retries: u64,
    /// Targets dropped on a fatal failure
    pub skipped: u64,
    /// Candidates or bodies that could not be extracted
    pub extraction_errors: u64,
}

/// Durable snapshot of crawl state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// Monotonically increasing across runs sharing a data directory
    pub sequence: u64,
    pub written_at: DateTime<Utc>,
    pub run_id: String,
    pub config_hash: String,
    pub frontier: FrontierSnapshot,
    pub ledger: Vec<LedgerEntry>,
    #[serde(default)]
    pub counters: CrawlCounters,
}

/// Path of the checkpoint file inside `data_dir`
pub fn checkpoint_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CHECKPOINT_FILE)
}

/// Writes the checkpoint atomically
///
/// # Arguments
///
/// * `data_dir` - Directory holding the checkpoint
/// * `checkpoint` - The snapshot to persist
///
/// # Returns
///
/// * `Ok(())` - The new checkpoint is durable
/// * `Err(CheckpointError)` - The previous checkpoint (if any) is untouched
pub fn write_checkpoint(data_dir: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let path = checkpoint_path(data_dir);
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| CheckpointError::Io { path, source }
    };

    let mut tmp = NamedTempFile::new_in(data_dir).map_err(io_err(data_dir))?;
    let tmp_path = tmp.path().to_path_buf();
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer(&mut writer, checkpoint)?;
        writer.flush().map_err(io_err(&tmp_path))?;
    }
    tmp.as_file_mut().sync_all().map_err(io_err(&tmp_path))?;

    // On failure the temp file is dropped, and removed, with the error
    tmp.persist(&path).map_err(|e| CheckpointError::Io {
        path: path.clone(),
        source: e.error,
    })?;

    // Make the rename itself durable
    if let Err(e) = File::open(data_dir).and_then(|dir| dir.sync_all()) {
        tracing::warn!(
            dir = %data_dir.display(),
            error = %e,
            "Failed to sync data directory after writing the checkpoint"
        );
    }

    Ok(())
}

/// Reads the checkpoint, `Ok(None)` if the file does not exist
pub fn read_checkpoint(data_dir: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
    let path = checkpoint_path(data_dir);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(CheckpointError::Io { path, source }),
    };

    let checkpoint: Checkpoint =
        serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;

    if checkpoint.version != CHECKPOINT_VERSION {
        return Err(CheckpointError::UnsupportedVersion {
            found: checkpoint.version,
            expected: CHECKPOINT_VERSION,
        });
    }

    Ok(Some(checkpoint))
}
