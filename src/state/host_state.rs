use crate::robots::CachedRobots;
use std::time::{Duration, Instant};

/// Tracks politeness state for one host
///
/// Request slots are handed out in order: each caller reserves the earliest
/// slot that respects both the host interval and any server-imposed pause,
/// then sleeps until it. Reservation happens under the owner's lock, the
/// sleep does not.
#[derive(Debug, Clone)]
pub struct HostState {
    /// Minimum time between two requests to this host
    pub interval: Duration,

    /// Earliest instant the next request may start
    pub next_slot: Option<Instant>,

    /// Server asked us to back off (429/503 with a hint) until this instant
    pub blocked_until: Option<Instant>,

    /// Cached robots.txt rules for this host
    pub robots: Option<CachedRobots>,
}

impl HostState {
    /// Creates a new HostState with the configured minimum interval
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: None,
            blocked_until: None,
            robots: None,
        }
    }

    /// Reserves the next request slot and returns how long to wait for it
    ///
    /// # Arguments
    ///
    /// * `now` - The current time instant
    ///
    /// # Returns
    ///
    /// `Duration::ZERO` if the request may start immediately, otherwise the
    /// delay until the reserved slot.
    pub fn reserve_slot(&mut self, now: Instant) -> Duration {
        let mut slot = now;
        if let Some(next) = self.next_slot {
            slot = slot.max(next);
        }
        if let Some(blocked) = self.blocked_until {
            slot = slot.max(blocked);
        }

        self.next_slot = Some(slot + self.interval);
        slot.saturating_duration_since(now)
    }

    /// Pauses the whole host until `until`
    ///
    /// A later pause never shortens an earlier one.
    pub fn block_until(&mut self, until: Instant) {
        self.blocked_until = Some(match self.blocked_until {
            Some(existing) => existing.max(until),
            None => until,
        });
    }

    /// Returns true if the host is currently paused
    pub fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.map_or(false, |until| until > now)
    }

    /// Raises the interval to a robots.txt `Crawl-delay`
    ///
    /// The configured interval is a floor, so a smaller delay is ignored.
    pub fn apply_crawl_delay(&mut self, delay: Duration) {
        if delay > self.interval {
            self.interval = delay;
        }
    }

    /// Checks if the cached robots.txt is missing or stale
    pub fn needs_robots(&self) -> bool {
        self.robots.as_ref().map_or(true, |cached| cached.is_stale())
    }
}
