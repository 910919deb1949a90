//! Cross-run duplicate suppression.
//!
//! [`DedupState`] is the plain mapping that travels inside the snapshot;
//! [`DedupStore`] is the run-local, single-writer view over it. Entries are
//! only ever added, or evicted on load once they fall outside the retention
//! horizon.

use crate::article::Candidate;
use crate::utils::retention_horizon;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

/// Serializable dedup state: article id to first-seen timestamp.
pub type DedupState = BTreeMap<String, DateTime<Utc>>;

/// Set of article ids already accepted for notification.
#[derive(Debug, Clone, Default)]
pub struct DedupStore {
    entries: DedupState,
}

impl DedupStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrates a store from a snapshot, dropping entries older than `keep_days`.
    ///
    /// Returns the store and the number of evicted entries. A horizon past
    /// the representable date range keeps everything.
    pub fn load(state: &DedupState, now: DateTime<Utc>, keep_days: u32) -> (Self, usize) {
        let horizon = retention_horizon(now, keep_days);
        let entries: DedupState = state
            .iter()
            .filter(|(_, first_seen)| horizon.is_none_or(|h| **first_seen >= h))
            .map(|(id, ts)| (id.clone(), *ts))
            .collect();
        let evicted = state.len() - entries.len();
        (Self { entries }, evicted)
    }

    /// Returns true if `id` was already recorded.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Returns when `id` was first recorded.
    pub fn first_seen(&self, id: &str) -> Option<DateTime<Utc>> {
        self.entries.get(id).copied()
    }

    /// Records `id` as seen at `timestamp`.
    ///
    /// Existing entries keep their original timestamp. Returns true if the id was new.
    pub fn record(&mut self, id: &str, timestamp: DateTime<Utc>) -> bool {
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries.insert(id.to_string(), timestamp);
        true
    }

    /// Exports the current state for persistence.
    pub fn export(&self) -> DedupState {
        self.entries.clone()
    }

    /// Number of recorded ids.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keeps only candidates whose id was never recorded.
    ///
    /// Duplicates inside the batch itself (the same article listed on two
    /// pages) are collapsed to their first occurrence.
    pub fn filter_new(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        let mut seen_in_batch = HashSet::new();
        candidates
            .into_iter()
            .filter(|c| !self.contains(&c.id) && seen_in_batch.insert(c.id.clone()))
            .collect()
    }
}

/// Unions two states. For ids present in both, the earlier timestamp wins.
pub fn merge(a: &DedupState, b: &DedupState) -> DedupState {
    let mut merged = a.clone();
    for (id, ts) in b {
        merged
            .entry(id.clone())
            .and_modify(|existing| {
                if *ts < *existing {
                    *existing = *ts;
                }
            })
            .or_insert(*ts);
    }
    merged
}
