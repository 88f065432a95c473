//! Deduplication ledger
//!
//! The ledger is the set of record identities already committed to the
//! store. Novelty is decided by identity alone: a listing whose fields
//! changed upstream is still not new.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One committed identity and when it was first seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub identity: String,
    pub first_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Claimed by a cycle whose append has not completed yet
    Pending(DateTime<Utc>),
    /// Durable in the record store
    Committed(DateTime<Utc>),
}

/// Lock-guarded identity map shared by all workers
///
/// `reserve` is the atomic `is_new` + claim used by the pipeline: of any
/// number of concurrent callers for the same identity exactly one gets
/// `true`. The claim becomes a commitment with `confirm` once the append is
/// durable, or is dropped with `release` when the append failed.
#[derive(Debug, Default)]
pub struct Ledger {
    slots: Mutex<HashMap<String, Slot>>,
}

impl Ledger {
    /// Creates an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a ledger whose entries are all committed
    pub fn from_entries(entries: impl IntoIterator<Item = LedgerEntry>) -> Self {
        let ledger = Self::new();
        ledger.restore(entries);
        ledger
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // Every critical section leaves the map consistent, so a poisoned
        // lock still guards valid data.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true if the identity is neither committed nor reserved
    pub fn is_new(&self, identity: &str) -> bool {
        !self.lock().contains_key(identity)
    }

    /// Commits an identity directly
    ///
    /// Committing a present identity is a no-op and keeps its original
    /// first-seen timestamp. A pending reservation is promoted.
    ///
    /// # Returns
    ///
    /// * `true` - The identity was not committed before
    /// * `false` - It already was
    pub fn commit(&self, identity: &str, timestamp: DateTime<Utc>) -> bool {
        let mut slots = self.lock();
        match slots.get(identity).copied() {
            Some(Slot::Committed(_)) => false,
            Some(Slot::Pending(first_seen)) => {
                slots.insert(identity.to_string(), Slot::Committed(first_seen));
                true
            }
            None => {
                slots.insert(identity.to_string(), Slot::Committed(timestamp));
                true
            }
        }
    }

    /// Atomically checks novelty and claims the identity
    ///
    /// # Returns
    ///
    /// * `true` - The caller owns the identity and must `confirm` or `release` it
    /// * `false` - It is committed or claimed by someone else
    pub fn reserve(&self, identity: &str, timestamp: DateTime<Utc>) -> bool {
        let mut slots = self.lock();
        if slots.contains_key(identity) {
            return false;
        }
        slots.insert(identity.to_string(), Slot::Pending(timestamp));
        true
    }

    /// Turns reservations into commitments after a durable append
    pub fn confirm<S: AsRef<str>>(&self, identities: &[S]) {
        let mut slots = self.lock();
        for identity in identities {
            if let Some(slot) = slots.get_mut(identity.as_ref()) {
                if let Slot::Pending(first_seen) = *slot {
                    *slot = Slot::Committed(first_seen);
                }
            }
        }
    }

    /// Drops reservations whose append failed
    ///
    /// Committed identities are left untouched.
    pub fn release<S: AsRef<str>>(&self, identities: &[S]) {
        let mut slots = self.lock();
        for identity in identities {
            if matches!(slots.get(identity.as_ref()), Some(Slot::Pending(_))) {
                slots.remove(identity.as_ref());
            }
        }
    }

    /// Returns the committed entries, ordered by first-seen time then identity
    ///
    /// Pending reservations are excluded: their records may not be durable
    /// yet, so a checkpoint must not claim them.
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        let slots = self.lock();
        let mut entries: Vec<LedgerEntry> = slots
            .iter()
            .filter_map(|(identity, slot)| match slot {
                Slot::Committed(first_seen) => Some(LedgerEntry {
                    identity: identity.clone(),
                    first_seen: *first_seen,
                }),
                Slot::Pending(_) => None,
            })
            .collect();
        entries.sort_by(|a, b| {
            a.first_seen
                .cmp(&b.first_seen)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        entries
    }

    /// Commits every entry, keeping existing first-seen timestamps
    pub fn restore(&self, entries: impl IntoIterator<Item = LedgerEntry>) {
        let mut slots = self.lock();
        for entry in entries {
            slots
                .entry(entry.identity)
                .and_modify(|slot| {
                    if let Slot::Pending(first_seen) = *slot {
                        *slot = Slot::Committed(first_seen);
                    }
                })
                .or_insert(Slot::Committed(entry.first_seen));
        }
    }

    /// Number of committed identities
    pub fn len(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Committed(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of outstanding reservations
    pub fn pending(&self) -> usize {
        self.lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Pending(_)))
            .count()
    }
}
