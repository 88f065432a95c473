//! Crawl frontier
//!
//! FIFO queue of pending targets plus visited markers. A target leaves the
//! queue the moment it is dispatched and becomes an in-flight lease; it only
//! comes back if it is reissued as a retry or its cycle was abandoned.

use crate::crawler::Target;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};

/// A dispatched target, identified by its ticket until settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub ticket: u64,
    pub target: Target,
}

/// Serializable frontier state stored in checkpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierSnapshot {
    /// Pending targets in pop order; in-flight targets come first
    pub pending: Vec<Target>,
    /// Visited markers of settled targets
    pub visited: Vec<String>,
}

/// Queue of pending targets
#[derive(Debug)]
pub struct Frontier {
    queue: VecDeque<Target>,
    visited: HashSet<String>,
    in_flight: BTreeMap<u64, Target>,
    next_ticket: u64,
    max_depth: u32,
}

impl Frontier {
    /// Creates an empty frontier
    ///
    /// # Arguments
    ///
    /// * `max_depth` - Targets deeper than this are never queued nor dispatched
    pub fn new(max_depth: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            visited: HashSet::new(),
            in_flight: BTreeMap::new(),
            next_ticket: 0,
            max_depth,
        }
    }

    /// Rebuilds a frontier from a checkpoint
    ///
    /// Popping the restored frontier yields the snapshot's pending targets in
    /// the same order.
    pub fn restore(snapshot: FrontierSnapshot, max_depth: u32) -> Self {
        Self {
            queue: snapshot.pending.into(),
            visited: snapshot.visited.into_iter().collect(),
            in_flight: BTreeMap::new(),
            next_ticket: 0,
            max_depth,
        }
    }

    /// Appends a target to the back of the queue
    ///
    /// # Returns
    ///
    /// * `true` - The target was queued
    /// * `false` - It is deeper than `max_depth` or its URL was already visited
    pub fn push(&mut self, target: Target) -> bool {
        if target.depth > self.max_depth {
            tracing::debug!(url = %target.url, depth = target.depth, "Not queueing target beyond max depth");
            return false;
        }
        if self.visited.contains(&target.visit_key()) {
            return false;
        }
        self.queue.push_back(target);
        true
    }

    /// Dispatches the next target
    ///
    /// Targets already visited (queued twice before the first was dispatched)
    /// or deeper than `max_depth` are dropped on the way.
    pub fn pop(&mut self) -> Option<Lease> {
        while let Some(target) = self.queue.pop_front() {
            if target.depth > self.max_depth {
                tracing::debug!(url = %target.url, depth = target.depth, "Dropping target beyond max depth");
                continue;
            }
            if !self.mark_visited(&target) {
                continue;
            }

            let ticket = self.next_ticket;
            self.next_ticket += 1;
            self.in_flight.insert(ticket, target.clone());
            return Some(Lease { ticket, target });
        }
        None
    }

    /// Marks a target's URL as visited
    ///
    /// # Returns
    ///
    /// * `true` - It was not visited before
    /// * `false` - It already was
    pub fn mark_visited(&mut self, target: &Target) -> bool {
        self.visited.insert(target.visit_key())
    }

    /// Ends an in-flight lease
    pub fn settle(&mut self, ticket: u64) -> Option<Target> {
        self.in_flight.remove(&ticket)
    }

    /// Queues a retry of a visited target
    ///
    /// The visited marker is cleared so the retry can be dispatched.
    pub fn reissue(&mut self, target: Target) {
        self.visited.remove(&target.visit_key());
        self.queue.push_back(target);
    }

    /// Returns every unsettled lease to the front of the queue
    ///
    /// Used when cycles were abandoned at shutdown. Their original dispatch
    /// order is kept.
    ///
    /// # Returns
    ///
    /// The number of targets requeued
    pub fn requeue_in_flight(&mut self) -> usize {
        let abandoned = std::mem::take(&mut self.in_flight);
        let count = abandoned.len();
        for (_, target) in abandoned.into_iter().rev() {
            self.visited.remove(&target.visit_key());
            self.queue.push_front(target);
        }
        count
    }

    /// Captures the frontier for a checkpoint
    ///
    /// In-flight targets are listed first and their visited markers are
    /// left out, so a resumed crawl redoes them before anything else.
    pub fn snapshot(&self) -> FrontierSnapshot {
        let in_flight_keys: HashSet<String> =
            self.in_flight.values().map(Target::visit_key).collect();

        let pending = self
            .in_flight
            .values()
            .chain(self.queue.iter())
            .cloned()
            .collect();

        let mut visited: Vec<String> = self
            .visited
            .iter()
            .filter(|key| !in_flight_keys.contains(*key))
            .cloned()
            .collect();
        visited.sort();

        FrontierSnapshot { pending, visited }
    }

    /// Number of queued targets
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of unsettled leases
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// True if nothing is queued and nothing is in flight
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty()
    }

    /// Number of distinct targets dispatched so far
    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }
}
