//! Robots.txt rules
//!
//! Allow/Disallow matching is delegated to the robotstxt crate; `Crawl-delay`
//! is not part of its matcher, so the groups are scanned here.

use robotstxt::DefaultMatcher;
use std::time::Duration;

/// Longest `Crawl-delay` honored
pub const MAX_CRAWL_DELAY: Duration = Duration::from_secs(60 * 60);

/// Robots.txt content for one host
#[derive(Debug, Clone)]
pub struct RobotsRules {
    /// Raw body; `None` means everything is allowed
    body: Option<String>,
}

impl RobotsRules {
    /// Wraps a fetched robots.txt body
    pub fn parse(body: &str) -> Self {
        if body.trim().is_empty() {
            return Self::allow_all();
        }
        Self {
            body: Some(body.to_string()),
        }
    }

    /// Rules used when the host has no robots.txt or it could not be fetched
    pub fn allow_all() -> Self {
        Self { body: None }
    }

    /// Checks if `url` may be fetched by `agent`
    ///
    /// # Arguments
    ///
    /// * `url` - Absolute URL or path of the request
    /// * `agent` - Product token of the crawler (e.g. `c2c-scraper`)
    pub fn allows(&self, url: &str, agent: &str) -> bool {
        match &self.body {
            None => true,
            Some(body) => {
                let mut matcher = DefaultMatcher::default();
                matcher.one_agent_allowed_by_robots(body, agent, url)
            }
        }
    }

    /// Returns the `Crawl-delay` that applies to `agent`
    ///
    /// A group naming the agent wins over the `*` group.
    pub fn crawl_delay(&self, agent: &str) -> Option<Duration> {
        let body = self.body.as_ref()?;
        let agent = agent.to_lowercase();

        let mut group: Vec<String> = Vec::new();
        let mut in_rules = false;
        let mut specific = None;
        let mut wildcard = None;

        for line in body.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "user-agent" => {
                    // A user-agent line after rules starts a new group
                    if in_rules {
                        group.clear();
                        in_rules = false;
                    }
                    group.push(value.to_lowercase());
                }
                "crawl-delay" => {
                    in_rules = true;
                    let Some(delay) = value
                        .parse::<f64>()
                        .ok()
                        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                    else {
                        continue;
                    };
                    let delay = delay.min(MAX_CRAWL_DELAY);
                    if group.iter().any(|ua| ua != "*" && agent.contains(ua.as_str())) {
                        specific = Some(delay);
                    } else if group.iter().any(|ua| ua == "*") {
                        wildcard = Some(delay);
                    }
                }
                _ => in_rules = true,
            }
        }

        specific.or(wildcard)
    }
}
