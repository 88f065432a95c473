//! End-to-end crawls against a mock source

use crate::common::{create_test_config, listing, requests_to, server_host};
use c2c_scraper::config::{HtmlSelectors, SourceConfig, SourceFormat};
use c2c_scraper::crawler::{Coordinator, CrawlReport, StartMode};
use c2c_scraper::storage::{checkpoint_path, read_checkpoint, RecordStore, RunStatus, SqliteStore};
use c2c_scraper::{Config, ScraperError};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_page(server: &MockServer, offset: u64, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/routes"))
        .and(query_param("offset", offset.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn crawl(config: Config, mode: StartMode) -> Result<CrawlReport, ScraperError> {
    let mut coordinator =
        Coordinator::new(config, "test-hash".to_string(), mode, CancellationToken::new())?;
    coordinator.run().await
}

/// Config with a single HTML source seeded at `/board`
fn board_config(data_dir: &std::path::Path, server: &MockServer) -> Config {
    let mut config = create_test_config(data_dir, vec![]);
    let mut fields = BTreeMap::new();
    fields.insert("name".to_string(), ".name".to_string());
    config.sources = vec![SourceConfig {
        name: "board".to_string(),
        format: SourceFormat::Html,
        seeds: vec![format!("{}/board", server.uri())],
        page_size: 100,
        follow_associations: false,
        allowed_hosts: Vec::new(),
        preferred_lang: "fr".to_string(),
        html: Some(HtmlSelectors {
            listing: "li.listing".to_string(),
            id_attribute: "data-id".to_string(),
            next: Some("a.next".to_string()),
            fields,
        }),
    }];
    config
}

#[tokio::test]
async fn test_full_crawl_api_source() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
        .mount(&server)
        .await;
    mount_page(&server, 0, listing(3, &[1, 2])).await;
    mount_page(&server, 2, listing(3, &[3])).await;

    let mut config = create_test_config(dir.path(), vec![format!("{}/routes", server.uri())]);
    config.crawler.respect_robots = true;

    let report = crawl(config, StartMode::Resume).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counters.records_written, 3);
    assert_eq!(requests_to(&server, "/robots.txt").await, 1);

    let store = SqliteStore::open(dir.path()).unwrap();
    assert_eq!(store.count_records().unwrap(), 3);
    let host = server_host(&server);
    for id in 1..=3 {
        assert!(store.contains(&format!("{}/routes/{}", host, id)).unwrap());
    }

    let runs = store.recent_runs(5).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
    assert_eq!(runs[0].last_checkpoint, report.last_checkpoint);
}

#[tokio::test]
async fn test_restart_before_checkpoint_does_not_duplicate() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let seeds = vec![format!("{}/routes", server.uri())];

    // First run: A yields {1, 2}, then B is never fetched successfully
    mount_page(&server, 0, listing(3, &[1, 2])).await;
    crawl(create_test_config(dir.path(), seeds.clone()), StartMode::Resume)
        .await
        .unwrap();

    // Forced restart before any checkpoint: only the appended records survive
    std::fs::remove_file(checkpoint_path(dir.path())).unwrap();

    server.reset().await;
    mount_page(&server, 0, listing(3, &[1, 2])).await;
    mount_page(&server, 2, listing(3, &[3])).await;

    let report = crawl(create_test_config(dir.path(), seeds), StartMode::Resume)
        .await
        .unwrap();

    assert_eq!(requests_to(&server, "/routes").await, 2);
    assert_eq!(report.counters.records_written, 1);
    assert_eq!(report.counters.duplicates, 2);

    let store = SqliteStore::open(dir.path()).unwrap();
    assert_eq!(store.count_records().unwrap(), 3);
    assert!(store
        .contains(&format!("{}/routes/3", server_host(&server)))
        .unwrap());
}

#[tokio::test]
async fn test_resume_redoes_pending_targets_only() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let seeds = vec![format!("{}/routes", server.uri())];

    // B fails fatally in the first run, so nothing is pending afterwards
    mount_page(&server, 0, listing(3, &[1, 2])).await;
    let first = crawl(create_test_config(dir.path(), seeds.clone()), StartMode::Resume)
        .await
        .unwrap();
    assert_eq!(first.counters.skipped, 1);

    server.reset().await;
    let second = crawl(create_test_config(dir.path(), seeds.clone()), StartMode::Resume)
        .await
        .unwrap();
    assert_eq!(requests_to(&server, "/routes").await, 0);
    assert_eq!(second.pending, 0);

    // --fresh starts over from the seeds but keeps deduplicating
    mount_page(&server, 0, listing(3, &[1, 2])).await;
    mount_page(&server, 2, listing(3, &[3])).await;
    let fresh = crawl(create_test_config(dir.path(), seeds), StartMode::Fresh)
        .await
        .unwrap();
    assert_eq!(fresh.counters.records_written, 1);
    assert!(fresh.last_checkpoint > second.last_checkpoint);
}

fn outings(total: u64, dates: &[(u64, &str)]) -> serde_json::Value {
    let documents: Vec<_> = dates
        .iter()
        .map(|(id, date)| serde_json::json!({"document_id": id, "date_start": date}))
        .collect();
    serde_json::json!({"total": total, "documents": documents})
}

#[tokio::test]
async fn test_update_recrawls_recent_outings() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let seeds = vec![
        format!("{}/outings?act=ice_climbing", server.uri()),
        format!("{}/routes", server.uri()),
    ];

    Mock::given(method("GET"))
        .and(path("/outings"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(outings(2, &[(1, "2024-03-01"), (2, "2024-03-20")])),
        )
        .mount(&server)
        .await;
    mount_page(&server, 0, listing(1, &[7])).await;
    let first = crawl(create_test_config(dir.path(), seeds.clone()), StartMode::Resume)
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.counters.records_written, 3);

    // Only the date window is served; an unfiltered outings request would 404
    server.reset().await;
    let today = chrono::Utc::now().date_naive().format("%Y-%m-%d");
    Mock::given(method("GET"))
        .and(path("/outings"))
        .and(query_param("act", "ice_climbing"))
        .and(query_param("date", format!("2024-03-13,{}", today)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(outings(2, &[(2, "2024-03-20"), (3, "2024-03-25")])),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_page(&server, 0, listing(1, &[7])).await;

    let update = crawl(create_test_config(dir.path(), seeds), StartMode::Update)
        .await
        .unwrap();
    assert_eq!(update.status, RunStatus::Completed);
    assert_eq!(update.counters.records_written, 1);
    assert_eq!(update.counters.duplicates, 2);
    assert_eq!(update.counters.skipped, 0);

    let requests = server.received_requests().await.unwrap_or_default();
    let route_request = requests
        .iter()
        .find(|r| r.url.path() == "/routes")
        .expect("routes seed was crawled");
    assert!(!route_request.url.query_pairs().any(|(k, _)| k == "date"));

    let store = SqliteStore::open(dir.path()).unwrap();
    assert_eq!(store.count_records().unwrap(), 4);
}

#[tokio::test]
async fn test_update_without_stored_outings_crawls_every_date() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/outings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(outings(1, &[(1, "2024-03-01")])))
        .mount(&server)
        .await;

    let seeds = vec![format!("{}/outings", server.uri())];
    let report = crawl(create_test_config(dir.path(), seeds), StartMode::Update)
        .await
        .unwrap();
    assert_eq!(report.counters.records_written, 1);

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].url.query_pairs().any(|(k, _)| k == "date"));
}

#[tokio::test]
async fn test_retries_until_success() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/routes"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    mount_page(&server, 0, listing(2, &[1, 2])).await;

    let config = create_test_config(dir.path(), vec![format!("{}/routes", server.uri())]);
    let report = crawl(config, StartMode::Resume).await.unwrap();

    assert_eq!(requests_to(&server, "/routes").await, 4);
    assert_eq!(report.counters.retries, 3);
    assert_eq!(report.counters.records_written, 2);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/routes"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    mount_page(&server, 0, listing(2, &[1, 2])).await;

    let mut config = create_test_config(dir.path(), vec![format!("{}/routes", server.uri())]);
    config.crawler.max_attempts = 2;
    let report = crawl(config, StartMode::Resume).await.unwrap();

    assert_eq!(requests_to(&server, "/routes").await, 2);
    assert_eq!(report.counters.skipped, 1);
    assert_eq!(report.counters.records_written, 0);
}

#[tokio::test]
async fn test_retry_after_is_honored() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/routes"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_page(&server, 0, listing(1, &[1])).await;

    let config = create_test_config(dir.path(), vec![format!("{}/routes", server.uri())]);
    let started = Instant::now();
    let report = crawl(config, StartMode::Resume).await.unwrap();

    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(report.counters.records_written, 1);
}

#[tokio::test]
async fn test_depth_guard() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    for offset in [0, 2, 4, 6] {
        mount_page(&server, offset, listing(100, &[offset + 1, offset + 2])).await;
    }

    let mut config = create_test_config(dir.path(), vec![format!("{}/routes", server.uri())]);
    config.crawler.max_depth = 2;
    let report = crawl(config, StartMode::Resume).await.unwrap();

    // Pages at depth 0, 1 and 2
    assert_eq!(requests_to(&server, "/routes").await, 3);
    assert_eq!(report.counters.records_written, 6);
}

#[tokio::test]
async fn test_concurrent_duplicate_listings() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    // Four feeds that all list the same documents
    let mut seeds = Vec::new();
    for feed in ["a", "b", "c", "d"] {
        Mock::given(method("GET"))
            .and(path("/routes"))
            .and(query_param("feed", feed))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(listing(2, &[10, 11]))
                    .set_delay(Duration::from_millis(20)),
            )
            .mount(&server)
            .await;
        seeds.push(format!("{}/routes?feed={}", server.uri(), feed));
    }

    let mut config = create_test_config(dir.path(), seeds);
    config.crawler.min_request_interval = 0;
    let report = crawl(config, StartMode::Resume).await.unwrap();

    assert_eq!(report.counters.fetched, 4);
    assert_eq!(report.counters.records_written, 2);
    assert_eq!(report.counters.duplicates, 6);

    let store = SqliteStore::open(dir.path()).unwrap();
    assert_eq!(store.count_records().unwrap(), 2);
}

#[tokio::test]
async fn test_robots_disallow_skips_target() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /routes"),
        )
        .mount(&server)
        .await;
    mount_page(&server, 0, listing(1, &[1])).await;

    let mut config = create_test_config(dir.path(), vec![format!("{}/routes", server.uri())]);
    config.crawler.respect_robots = true;
    let report = crawl(config, StartMode::Resume).await.unwrap();

    assert_eq!(requests_to(&server, "/routes").await, 0);
    assert_eq!(report.counters.skipped, 1);
}

#[tokio::test]
async fn test_html_source() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/board"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<ul><li class="listing" data-id="x3"><b class="name">Third</b></li></ul>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/board"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<ul>
                 <li class="listing" data-id="x1"><b class="name">First</b></li>
                 <li class="listing" data-id="x2"><b class="name">Second</b></li>
               </ul>
               <a class="next" href="/board?page=2">next</a>"#,
        ))
        .mount(&server)
        .await;

    let config = board_config(dir.path(), &server);
    let report = crawl(config, StartMode::Resume).await.unwrap();
    assert_eq!(report.counters.records_written, 3);

    let store = SqliteStore::open(dir.path()).unwrap();
    assert!(store
        .contains(&format!("{}/board/x3", server_host(&server)))
        .unwrap());
}

#[tokio::test]
async fn test_html_listing_repeated_on_path_paginated_page() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/board/page/2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<ul><li class="listing" data-id="x1"><b class="name">First</b></li></ul>"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/board"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<ul><li class="listing" data-id="x1"><b class="name">First</b></li></ul>
               <a class="next" href="/board/page/2">next</a>"#,
        ))
        .mount(&server)
        .await;

    let report = crawl(board_config(dir.path(), &server), StartMode::Resume)
        .await
        .unwrap();

    assert_eq!(requests_to(&server, "/board/page/2").await, 1);
    assert_eq!(report.counters.records_written, 1);
    assert_eq!(report.counters.duplicates, 1);

    let store = SqliteStore::open(dir.path()).unwrap();
    assert_eq!(store.count_records().unwrap(), 1);
}

#[tokio::test]
async fn test_shutdown_keeps_pending_work() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/routes"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(listing(10, &[1, 2]))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let mut config = create_test_config(dir.path(), vec![format!("{}/routes", server.uri())]);
    config.crawler.shutdown_grace = 0;

    let cancel = CancellationToken::new();
    let mut coordinator =
        Coordinator::new(config, "test-hash".to_string(), StartMode::Resume, cancel.clone()).unwrap();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let report = coordinator.run().await.unwrap();
    assert_eq!(report.status, RunStatus::Interrupted);

    // The aborted seed is the first thing the next run does
    let checkpoint = read_checkpoint(dir.path()).unwrap().unwrap();
    assert_eq!(checkpoint.frontier.pending.len(), 1);
    assert_eq!(checkpoint.frontier.pending[0].depth, 0);
    assert!(checkpoint.frontier.visited.is_empty());
}
