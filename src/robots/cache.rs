use crate::robots::RobotsRules;
use chrono::{DateTime, Duration, Utc};

/// How long fetched robots.txt rules are trusted
pub const ROBOTS_TTL_HOURS: i64 = 24;

/// Robots.txt rules together with the time they were fetched
#[derive(Debug, Clone)]
pub struct CachedRobots {
    pub rules: RobotsRules,
    pub fetched_at: DateTime<Utc>,
}

impl CachedRobots {
    /// Wraps rules fetched just now
    pub fn new(rules: RobotsRules) -> Self {
        Self {
            rules,
            fetched_at: Utc::now(),
        }
    }

    /// Checks if the rules are older than the TTL
    pub fn is_stale(&self) -> bool {
        Utc::now() - self.fetched_at > Duration::hours(ROBOTS_TTL_HOURS)
    }
}
