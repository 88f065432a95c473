//! State module for tracking crawl progress
//!
//! # Components
//!
//! - `CycleState`: Where a single fetch-process cycle is in the pipeline
//! - `HostState`: Per-host request slots, server-imposed pauses and robots.txt cache
//! - `Ledger`: Identities already committed to the record store

mod cycle_state;
mod host_state;
mod ledger;

// Re-export main types
pub use cycle_state::CycleState;
pub use host_state::HostState;
pub use ledger::{Ledger, LedgerEntry};
