//! Integration tests
//!
//! These tests use wiremock to create mock HTTP servers and drive the
//! whole fetch-dedupe-persist pipeline end-to-end.

mod common;
mod crawl_tests;
mod fetch_tests;
