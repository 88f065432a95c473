//! Output module for reporting on the data directory
//!
//! This module handles:
//! - Collecting record counts, recent runs and the checkpoint position
//! - Printing them for `--stats`

pub mod stats;

pub use stats::{load_statistics, print_statistics, write_statistics, CheckpointSummary, DataStatistics};
