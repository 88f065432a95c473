//! Statistics generation from the data directory
//!
//! This module provides functionality for extracting and displaying
//! what a crawl has stored so far, without touching the network.

use crate::storage::{read_checkpoint, RecordStore, RunRecord, SourceCount, SqliteStore};
use crate::ScraperError;
use chrono::{DateTime, Utc};
use std::io::{self, Write};

/// Number of runs listed by `--stats`
const RECENT_RUNS: usize = 5;

/// Where the next run would resume
#[derive(Debug, Clone)]
pub struct CheckpointSummary {
    pub sequence: u64,
    pub written_at: DateTime<Utc>,
    pub run_id: String,
    pub pending: usize,
    pub visited: usize,
    pub ledger: usize,
}

/// Data directory statistics summary
#[derive(Debug, Clone)]
pub struct DataStatistics {
    /// Total number of stored records
    pub total_records: u64,

    /// Record counts per source and kind
    pub by_source: Vec<SourceCount>,

    /// Latest runs, newest first
    pub recent_runs: Vec<RunRecord>,

    /// Current checkpoint, if any
    pub checkpoint: Option<CheckpointSummary>,
}

/// Loads statistics from the store and the checkpoint next to it
///
/// # Arguments
///
/// * `store` - The opened record store
///
/// # Returns
///
/// * `Ok(DataStatistics)` - Successfully loaded statistics
/// * `Err(ScraperError)` - Database or checkpoint unreadable
pub fn load_statistics(store: &SqliteStore) -> Result<DataStatistics, ScraperError> {
    let checkpoint = read_checkpoint(store.data_dir())?.map(|checkpoint| CheckpointSummary {
        sequence: checkpoint.sequence,
        written_at: checkpoint.written_at,
        run_id: checkpoint.run_id,
        pending: checkpoint.frontier.pending.len(),
        visited: checkpoint.frontier.visited.len(),
        ledger: checkpoint.ledger.len(),
    });

    Ok(DataStatistics {
        total_records: store.count_records()?,
        by_source: store.count_by_source()?,
        recent_runs: store.recent_runs(RECENT_RUNS)?,
        checkpoint,
    })
}

/// Writes statistics in a human-readable layout
pub fn write_statistics<W: Write>(stats: &DataStatistics, out: &mut W) -> io::Result<()> {
    writeln!(out, "=== Scraper Statistics ===\n")?;

    writeln!(out, "Records: {}", stats.total_records)?;
    for count in &stats.by_source {
        let percentage = if stats.total_records > 0 {
            (count.count as f64 / stats.total_records as f64) * 100.0
        } else {
            0.0
        };
        writeln!(
            out,
            "  {} / {}: {} ({:.1}%)",
            count.source, count.kind, count.count, percentage
        )?;
    }
    writeln!(out)?;

    match &stats.checkpoint {
        Some(checkpoint) => {
            writeln!(out, "Checkpoint #{}:", checkpoint.sequence)?;
            writeln!(out, "  Written at: {}", checkpoint.written_at.to_rfc3339())?;
            writeln!(out, "  By run: {}", checkpoint.run_id)?;
            writeln!(out, "  Pending targets: {}", checkpoint.pending)?;
            writeln!(out, "  Visited targets: {}", checkpoint.visited)?;
            writeln!(out, "  Ledger entries: {}", checkpoint.ledger)?;
        }
        None => writeln!(out, "Checkpoint: none (next run starts from the seeds)")?,
    }
    writeln!(out)?;

    if !stats.recent_runs.is_empty() {
        writeln!(out, "Recent Runs:")?;
        for run in &stats.recent_runs {
            let checkpoint = run
                .last_checkpoint
                .map_or_else(|| "-".to_string(), |seq| format!("#{}", seq));
            writeln!(
                out,
                "  {} [{}] started {}, finished {}, checkpoint {}",
                run.run_id,
                run.status,
                run.started_at,
                run.finished_at.as_deref().unwrap_or("-"),
                checkpoint
            )?;
        }
    }

    Ok(())
}

/// Prints statistics to stdout
pub fn print_statistics(stats: &DataStatistics) {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = write_statistics(stats, &mut out) {
        tracing::warn!(error = %e, "Failed to print statistics");
    }
}
