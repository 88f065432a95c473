//! c2c-scraper: a polite, resumable listings scraper
//!
//! This crate implements the fetch-dedupe-persist pipeline that pulls listing
//! pages from a C2C source, extracts records, filters out listings that were
//! already committed, and writes new ones into a local data directory that
//! survives crashes and restarts.

pub mod config;
pub mod crawler;
pub mod output;
pub mod robots;
pub mod state;
pub mod storage;
pub mod url;

use thiserror::Error;

/// Main error type for c2c-scraper operations
#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persistence error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] storage::CheckpointError),

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crawl halted: {reason} (resume point: {})", describe_checkpoint(*.last_checkpoint))]
    Halted {
        reason: String,
        last_checkpoint: Option<u64>,
    },
}

fn describe_checkpoint(sequence: Option<u64>) -> String {
    match sequence {
        Some(seq) => format!("checkpoint #{}", seq),
        None => "no checkpoint, next run starts from the seeds".to_string(),
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid host pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid CSS selector '{selector}': {message}")]
    InvalidSelector { selector: String, message: String },
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing host in URL")]
    MissingHost,

    #[error("Malformed URL: {0}")]
    Malformed(String),
}

/// Retryable transport failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("HTTP {status}")]
    Status { status: u16 },

    #[error("Request timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Failed to read response body: {0}")]
    Body(String),

    #[error("Request failed: {0}")]
    Other(String),
}

/// Non-retryable fetch failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FatalFetchError {
    #[error("HTTP {status}")]
    Status { status: u16 },

    #[error("Malformed URL: {0}")]
    MalformedUrl(String),

    #[error("Disallowed by robots.txt")]
    RobotsDenied,

    #[error("Gave up after {attempts} attempts, last error: {last}")]
    AttemptsExhausted {
        attempts: u32,
        last: TransportError,
    },
}

/// Errors raised while extracting records from a page body
///
/// A candidate-level error skips that candidate only; a body-level error
/// skips the page.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("Body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Unexpected body shape: {0}")]
    UnexpectedShape(String),

    #[error("Candidate #{index} is missing required field '{field}'")]
    MissingField { index: usize, field: String },

    #[error("Unknown source '{0}'")]
    UnknownSource(String),
}

/// Result type alias for c2c-scraper operations
pub type Result<T> = std::result::Result<T, ScraperError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Coordinator, FetchResult, Record, Target};
pub use state::{CycleState, Ledger};
pub use url::{extract_host, normalize_url};
