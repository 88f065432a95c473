//! Crawler module: the fetch-dedupe-persist pipeline
//!
//! This module contains the core crawling logic, including:
//! - Targets and records
//! - The crawl frontier
//! - HTTP fetching with politeness and retry classification
//! - Record extraction from API and HTML pages
//! - Overall crawl coordination

mod coordinator;
mod extractor;
mod fetcher;
mod frontier;
mod target;

pub use coordinator::{run_crawl, Coordinator, CrawlReport, StartMode};
pub use extractor::{Extraction, Extractor, Extractors};
pub use fetcher::{
    backoff_delay, build_http_client, enforce_attempt_budget, parse_retry_after, FetchResult,
    FetchSettings, Fetcher, HttpFetcher, MAX_RETRY_AFTER,
};
pub use frontier::{Frontier, FrontierSnapshot, Lease};
pub use target::{identity_for, Cursor, Record, Target};
