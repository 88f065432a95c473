//! Shared fixtures

use c2c_scraper::config::{
    CheckpointConfig, Config, CrawlerConfig, OutputConfig, SourceConfig, SourceFormat,
    UserAgentConfig,
};
use serde_json::{json, Value};
use std::path::Path;
use wiremock::MockServer;

/// Creates a test configuration with one `c2c-api` source
pub fn create_test_config(data_dir: &Path, seeds: Vec<String>) -> Config {
    Config {
        crawler: CrawlerConfig {
            max_depth: 5,
            workers: 4,
            min_request_interval: 5, // Very short for testing
            max_attempts: 5,
            request_timeout: 5,
            backoff_base: 5,
            backoff_max: 50,
            shutdown_grace: 2,
            respect_robots: false,
            update_margin_days: 7,
        },
        checkpoint: CheckpointConfig {
            interval_secs: 3600,
            interval_cycles: 1,
        },
        user_agent: UserAgentConfig {
            crawler_name: "TestBot".to_string(),
            crawler_version: "1.0.0".to_string(),
            contact_url: "https://example.com/contact".to_string(),
            contact_email: "test@example.com".to_string(),
        },
        output: OutputConfig {
            data_dir: data_dir.to_path_buf(),
        },
        sources: vec![SourceConfig {
            name: "c2c".to_string(),
            format: SourceFormat::C2cApi,
            seeds,
            page_size: 2,
            follow_associations: false,
            allowed_hosts: Vec::new(),
            preferred_lang: "fr".to_string(),
            html: None,
        }],
    }
}

/// `host:port` of the mock server, as used in record identities
pub fn server_host(server: &MockServer) -> String {
    let url = url::Url::parse(&server.uri()).expect("Failed to parse base URL");
    format!(
        "{}:{}",
        url.host_str().expect("Failed to extract host"),
        url.port().expect("Mock server has an explicit port")
    )
}

/// A c2c-api listing page
pub fn listing(total: u64, ids: &[u64]) -> Value {
    let documents: Vec<_> = ids
        .iter()
        .map(|id| {
            json!({
                "document_id": id,
                "activities": ["ice_climbing"],
                "locales": [{"lang": "fr", "title": format!("Voie {}", id)}]
            })
        })
        .collect();
    json!({"total": total, "documents": documents})
}

/// Number of requests the server saw for `path`
pub async fn requests_to(server: &MockServer, path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == path)
        .count()
}
