//! HTTP fetcher implementation
//!
//! This module handles all outbound requests for the crawler, including:
//! - Building the HTTP client with the crawler's user agent
//! - A global cap on in-flight requests and per-host request slots
//! - robots.txt checks
//! - Classification of every outcome into success, retryable or fatal

use crate::config::{Config, UserAgentConfig};
use crate::crawler::Target;
use crate::robots::{fetch_robots, CachedRobots, RobotsRules};
use crate::state::HostState;
use crate::{FatalFetchError, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{redirect::Policy, Client, StatusCode};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use url::Url;

/// Result of a fetch operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    /// 2xx response with its body
    Success {
        body: String,
        status: u16,
        /// URL after redirects
        final_url: Url,
    },

    /// Transient failure; try again after `retry_after`
    RetryableFailure {
        error: TransportError,
        retry_after: Duration,
    },

    /// The target will never succeed
    FatalFailure { error: FatalFetchError },
}

/// Longest pause a `Retry-After` header can impose
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Anything that can turn a target into a fetch result
///
/// The orchestrator only talks to this trait, so tests drive the pipeline
/// with scripted fakes.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, target: &Target) -> FetchResult;
}

/// Converts a retryable failure into a fatal one once the attempt budget is spent
///
/// `target.attempt` is zero-based: a retryable failure of attempt
/// `max_attempts - 1` becomes `AttemptsExhausted`.
pub fn enforce_attempt_budget(result: FetchResult, target: &Target, max_attempts: u32) -> FetchResult {
    match result {
        FetchResult::RetryableFailure { error, .. } if target.attempt + 1 >= max_attempts => {
            FetchResult::FatalFailure {
                error: FatalFetchError::AttemptsExhausted {
                    attempts: target.attempt + 1,
                    last: error,
                },
            }
        }
        other => other,
    }
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(31));
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Parses a `Retry-After` header (delay-seconds or HTTP-date)
///
/// A date in the past yields `Duration::ZERO`. Anything longer than
/// [`MAX_RETRY_AFTER`] is clamped to it.
pub fn parse_retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    let delay = match value.parse::<u64>() {
        Ok(secs) => Duration::from_secs(secs),
        Err(_) => {
            let date = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
            (date - now).to_std().unwrap_or(Duration::ZERO)
        }
    };
    Some(delay.min(MAX_RETRY_AFTER))
}

/// Builds an HTTP client with proper configuration
///
/// # Arguments
///
/// * `config` - The user agent configuration
/// * `timeout` - Whole-request timeout
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Failed to build client
pub fn build_http_client(config: &UserAgentConfig, timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.header_value())
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .redirect(Policy::limited(5))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Knobs of the HTTP fetcher
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Maximum number of requests in flight at once
    pub max_in_flight: usize,
    /// Minimum time between requests to one host
    pub min_interval: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub respect_robots: bool,
    /// Product token matched against robots.txt groups
    pub robots_agent: String,
}

impl FetchSettings {
    pub fn from_config(config: &Config) -> Self {
        let crawler = &config.crawler;
        Self {
            max_in_flight: crawler.workers as usize,
            min_interval: crawler.min_interval(),
            max_attempts: crawler.max_attempts,
            backoff_base: Duration::from_millis(crawler.backoff_base),
            backoff_max: Duration::from_millis(crawler.backoff_max),
            respect_robots: crawler.respect_robots,
            robots_agent: config.user_agent.crawler_name.clone(),
        }
    }
}

/// The production fetcher: reqwest behind a semaphore and per-host slots
pub struct HttpFetcher {
    client: Client,
    permits: Semaphore,
    hosts: Mutex<HashMap<String, HostState>>,
    settings: FetchSettings,
}

impl HttpFetcher {
    pub fn new(client: Client, settings: FetchSettings) -> Self {
        Self {
            client,
            permits: Semaphore::new(settings.max_in_flight.max(1)),
            hosts: Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// Runs `f` on the state of `host`, creating it on first use
    fn with_host<R>(&self, host: &str, f: impl FnOnce(&mut HostState) -> R) -> R {
        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(self.settings.min_interval));
        f(state)
    }

    /// Waits for the host's next request slot
    async fn wait_for_slot(&self, host: &str) {
        let (wait, paused) = self.with_host(host, |state| {
            let now = Instant::now();
            (state.reserve_slot(now), state.is_blocked(now))
        });
        if paused {
            tracing::debug!(host, wait_ms = wait.as_millis() as u64, "Host paused by the server, waiting");
        } else if !wait.is_zero() {
            tracing::trace!(host, wait_ms = wait.as_millis() as u64, "Waiting for host slot");
        }
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Returns robots.txt rules for the host, fetching them when stale
    async fn robots_for(&self, url: &Url, host: &str) -> RobotsRules {
        if let Some(rules) = self.with_host(host, |state| {
            (!state.needs_robots())
                .then(|| state.robots.as_ref().map(|cached| cached.rules.clone()))
                .flatten()
        }) {
            return rules;
        }

        self.wait_for_slot(host).await;
        tracing::debug!(host, "Fetching robots.txt");
        let rules = fetch_robots(&self.client, url).await;

        let agent = &self.settings.robots_agent;
        self.with_host(host, |state| {
            if let Some(delay) = rules.crawl_delay(agent) {
                if delay > state.interval {
                    tracing::info!(host, delay_ms = delay.as_millis() as u64, "Honoring robots.txt crawl-delay");
                }
                state.apply_crawl_delay(delay);
            }
            state.robots = Some(CachedRobots::new(rules.clone()));
        });

        rules
    }

    fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.settings.backoff_base, self.settings.backoff_max)
    }

    /// Sends one request and classifies the outcome
    async fn request(&self, url: &Url, host: &str, target: &Target) -> FetchResult {
        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => return self.classify_error(e, target),
        };

        let status = response.status();
        let final_url = response.url().clone();

        if status.is_success() {
            return match response.text().await {
                Ok(body) => FetchResult::Success {
                    body,
                    status: status.as_u16(),
                    final_url,
                },
                Err(e) => FetchResult::RetryableFailure {
                    error: TransportError::Body(e.to_string()),
                    retry_after: self.backoff(target.attempt),
                },
            };
        }

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let hint = parse_retry_after(response.headers(), Utc::now());
            if let Some(hint) = hint {
                if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
                    tracing::warn!(host, status = status.as_u16(), pause_ms = hint.as_millis() as u64, "Host asked us to back off");
                    if let Some(until) = Instant::now().checked_add(hint) {
                        self.with_host(host, |state| state.block_until(until));
                    }
                }
            }

            return FetchResult::RetryableFailure {
                error: TransportError::Status {
                    status: status.as_u16(),
                },
                retry_after: hint.unwrap_or_else(|| self.backoff(target.attempt)),
            };
        }

        FetchResult::FatalFailure {
            error: FatalFetchError::Status {
                status: status.as_u16(),
            },
        }
    }

    fn classify_error(&self, error: reqwest::Error, target: &Target) -> FetchResult {
        if error.is_builder() {
            return FetchResult::FatalFailure {
                error: FatalFetchError::MalformedUrl(error.to_string()),
            };
        }

        let transport = if error.is_timeout() {
            TransportError::Timeout
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else if error.is_body() || error.is_decode() {
            TransportError::Body(error.to_string())
        } else {
            TransportError::Other(error.to_string())
        };

        FetchResult::RetryableFailure {
            error: transport,
            retry_after: self.backoff(target.attempt),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, target: &Target) -> FetchResult {
        let url = target.request_url();
        let Some(host) = target.host() else {
            return FetchResult::FatalFailure {
                error: FatalFetchError::MalformedUrl(format!("{} has no host", url)),
            };
        };

        if self.settings.respect_robots {
            let rules = self.robots_for(&url, &host).await;
            if !rules.allows(url.as_str(), &self.settings.robots_agent) {
                return FetchResult::FatalFailure {
                    error: FatalFetchError::RobotsDenied,
                };
            }
        }

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return FetchResult::RetryableFailure {
                    error: TransportError::Other("fetcher is shutting down".to_string()),
                    retry_after: self.backoff(target.attempt),
                }
            }
        };

        self.wait_for_slot(&host).await;

        tracing::debug!(url = %url, attempt = target.attempt, "Fetching");
        let result = self.request(&url, &host, target).await;
        enforce_attempt_budget(result, target, self.settings.max_attempts)
    }
}
