//! HttpFetcher against a mock server

use crate::common::create_test_config;
use c2c_scraper::crawler::{
    build_http_client, FetchResult, FetchSettings, Fetcher, HttpFetcher, Target, MAX_RETRY_AFTER,
};
use c2c_scraper::{FatalFetchError, TransportError};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fetcher(respect_robots: bool) -> HttpFetcher {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(dir.path(), Vec::new());
    config.crawler.respect_robots = respect_robots;
    let client = build_http_client(&config.user_agent, config.crawler.timeout()).unwrap();
    HttpFetcher::new(client, FetchSettings::from_config(&config))
}

fn target(server: &MockServer, route: &str) -> Target {
    Target::seed("c2c", &format!("{}{}", server.uri(), route)).unwrap()
}

#[tokio::test]
async fn test_success_sends_user_agent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/routes/1"))
        .and(header(
            "user-agent",
            "TestBot/1.0.0 (+https://example.com/contact; test@example.com)",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .expect(1)
        .mount(&server)
        .await;

    match fetcher(false).fetch(&target(&server, "/routes/1")).await {
        FetchResult::Success { body, status, .. } => {
            assert_eq!(status, 200);
            assert_eq!(body, "{}");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_not_found_is_fatal() {
    let server = MockServer::start().await;

    let result = fetcher(false).fetch(&target(&server, "/routes/404")).await;
    assert!(matches!(
        result,
        FetchResult::FatalFailure {
            error: FatalFetchError::Status { status: 404 }
        }
    ));
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    match fetcher(false).fetch(&target(&server, "/routes")).await {
        FetchResult::RetryableFailure { error, retry_after } => {
            assert_eq!(error, TransportError::Status { status: 500 });
            // backoff-base for the first attempt
            assert_eq!(retry_after, Duration::from_millis(5));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_too_many_requests_pauses_host() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/routes"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let fetcher = fetcher(false);
    match fetcher.fetch(&target(&server, "/routes")).await {
        FetchResult::RetryableFailure { retry_after, .. } => {
            assert_eq!(retry_after, Duration::from_secs(1));
        }
        other => panic!("unexpected result: {:?}", other),
    }

    // Any other request to the same host waits out the pause
    let started = Instant::now();
    let result = fetcher.fetch(&target(&server, "/outings")).await;
    assert!(matches!(result, FetchResult::Success { .. }));
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_oversized_retry_after_is_clamped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(429).insert_header("Retry-After", "18446744073709551615"),
        )
        .mount(&server)
        .await;

    match fetcher(false).fetch(&target(&server, "/routes")).await {
        FetchResult::RetryableFailure { error, retry_after } => {
            assert_eq!(error, TransportError::Status { status: 429 });
            assert_eq!(retry_after, MAX_RETRY_AFTER);
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_attempt_budget_turns_retry_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    // Attempts 0..=3 of 5 may still be retried, attempt 4 is the last
    let mut last = target(&server, "/routes");
    for _ in 0..4 {
        last = last.retry();
    }
    assert_eq!(last.attempt, 4);

    match fetcher(false).fetch(&last).await {
        FetchResult::FatalFailure {
            error: FatalFetchError::AttemptsExhausted { attempts, last },
        } => {
            assert_eq!(attempts, 5);
            assert_eq!(last, TransportError::Status { status: 503 });
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_robots_denied_without_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("User-agent: TestBot\nDisallow: /private\n"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/routes"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .expect(1)
        .mount(&server)
        .await;

    let fetcher = fetcher(true);
    let denied = fetcher.fetch(&target(&server, "/private/1")).await;
    assert!(matches!(
        denied,
        FetchResult::FatalFailure {
            error: FatalFetchError::RobotsDenied
        }
    ));

    // robots.txt is cached for the host
    let allowed = fetcher.fetch(&target(&server, "/routes")).await;
    assert!(matches!(allowed, FetchResult::Success { .. }));
}

#[tokio::test]
async fn test_missing_robots_allows_everything() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/routes"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let result = fetcher(true).fetch(&target(&server, "/routes")).await;
    assert!(matches!(result, FetchResult::Success { .. }));
}
