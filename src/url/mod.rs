//! URL handling module for c2c-scraper
//!
//! This module provides URL normalization (visited-marker keys), host
//! extraction (per-host throttling and record identities) and wildcard host
//! matching (source scope).

mod domain;
mod matcher;
mod normalize;

// Re-export main functions
pub use domain::{api_root, extract_host};
pub use matcher::{host_allowed, matches_wildcard};
pub use normalize::normalize_url;
