//! Storage module for persisting crawl data
//!
//! This module handles everything that must survive a restart:
//! - The SQLite record store (write-if-absent appends keyed by identity)
//! - Run tracking
//! - The atomic checkpoint file

mod checkpoint;
mod schema;
mod sqlite;
mod traits;

pub use checkpoint::{
    checkpoint_path, read_checkpoint, write_checkpoint, Checkpoint, CrawlCounters,
    CHECKPOINT_FILE, CHECKPOINT_VERSION,
};
pub use sqlite::{SqliteStore, DATABASE_FILE};
pub use traits::{CheckpointError, RecordStore, StorageError, StorageResult};

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub run_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub config_hash: String,
    pub status: RunStatus,
    pub last_checkpoint: Option<u64>,
}

/// Number of stored records for one source and kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCount {
    pub source: String,
    pub kind: String,
    pub count: u64,
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Still crawling, or the process died
    Running,
    /// Frontier drained
    Completed,
    /// Stopped by a shutdown signal after a final checkpoint
    Interrupted,
    /// Halted on a persistence error
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_db_string())
    }
}
