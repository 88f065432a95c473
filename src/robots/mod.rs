//! Robots.txt handling module
//!
//! Rules are fetched once per host and cached for a day in the host's
//! politeness state (see `state::HostState`).

mod cache;
mod parser;

pub use cache::{CachedRobots, ROBOTS_TTL_HOURS};
pub use parser::{RobotsRules, MAX_CRAWL_DELAY};

use reqwest::Client;
use url::Url;

/// Fetches robots.txt for the origin of `url`
///
/// A missing file (4xx) allows everything. An unreachable host or a 5xx
/// also allows everything: the listing request itself will then fail and go
/// through the normal retry path.
///
/// # Arguments
///
/// * `client` - The shared HTTP client (carries the user agent)
/// * `url` - Any URL on the host
///
/// # Returns
///
/// The parsed rules, never an error
pub async fn fetch_robots(client: &Client, url: &Url) -> RobotsRules {
    let mut robots_url = url.clone();
    robots_url.set_path("/robots.txt");
    robots_url.set_query(None);
    robots_url.set_fragment(None);

    let response = match client.get(robots_url.clone()).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(url = %robots_url, error = %e, "robots.txt unreachable, allowing all");
            return RobotsRules::allow_all();
        }
    };

    let status = response.status();
    if !status.is_success() {
        tracing::debug!(url = %robots_url, status = status.as_u16(), "No robots.txt, allowing all");
        return RobotsRules::allow_all();
    }

    match response.text().await {
        Ok(body) => RobotsRules::parse(&body),
        Err(e) => {
            tracing::warn!(url = %robots_url, error = %e, "Failed to read robots.txt, allowing all");
            RobotsRules::allow_all()
        }
    }
}
