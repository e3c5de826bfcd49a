//! Vector-clock algebra: pure functions over `ClientId -> Counter` maps.
//!
//! Comparison must always run against the *full*, unpruned clock. Pruning
//! happens only once a clock is about to be persisted. Doing it in the other
//! order turns EQUAL/GREATER comparisons into CONCURRENT ones and causes the
//! sibling-explosion failure mode this module exists to avoid.

use crate::client_id::ClientId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Recommended bound on the number of entries retained in a persisted clock.
pub const DEFAULT_MAX_VC_SIZE: usize = 20;

/// A mapping from client id to a monotone per-client counter. Missing keys
/// read as zero.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<ClientId, u64>);

/// The result of comparing two vector clocks under the partial order they
/// induce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    Equal,
    Less,
    Greater,
    Concurrent,
}

impl VectorClock {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, client_id: &ClientId) -> u64 {
        self.0.get(client_id).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&ClientId, u64)> {
        self.0.iter().map(|(k, v)| (k, *v))
    }

    /// Returns a new clock with `client_id`'s counter incremented by one
    /// (starting from zero if absent). All other entries are unchanged.
    pub fn increment(&self, client_id: &ClientId) -> VectorClock {
        let mut next = self.0.clone();
        *next.entry(client_id.clone()).or_insert(0) += 1;
        VectorClock(next)
    }

    /// Pointwise maximum of two clocks.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.0.clone();
        for (client_id, counter) in &other.0 {
            let entry = merged.entry(client_id.clone()).or_insert(0);
            *entry = (*entry).max(*counter);
        }
        VectorClock(merged)
    }

    /// Compares two clocks under the causal partial order.
    ///
    /// - EQUAL iff every key in the union reads equal.
    /// - LESS iff every key reads self <= other and at least one is strict.
    /// - GREATER symmetric.
    /// - Otherwise CONCURRENT.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_greater = false;
        let mut other_greater = false;

        let all_keys = self.0.keys().chain(other.0.keys());
        let mut seen = std::collections::BTreeSet::new();
        for key in all_keys {
            if !seen.insert(key) {
                continue;
            }
            let a = self.get(key);
            let b = other.get(key);
            match a.cmp(&b) {
                std::cmp::Ordering::Greater => self_greater = true,
                std::cmp::Ordering::Less => other_greater = true,
                std::cmp::Ordering::Equal => {}
            }
        }

        match (self_greater, other_greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Greater,
            (false, true) => ClockOrdering::Less,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// Evicts the lowest-counter entries until at most `max_size` remain.
    ///
    /// If `preserve` is set and would otherwise be evicted, the lowest
    /// retained entry is evicted in its place instead so the preserved
    /// client's counter always survives pruning. This is required so the
    /// import filter's same-client rule (§4.4 rule 3) remains sound even
    /// after asymmetric pruning on different devices.
    pub fn prune(&self, max_size: usize, preserve: Option<&ClientId>) -> VectorClock {
        if self.0.len() <= max_size {
            return self.clone();
        }

        let mut entries: Vec<(ClientId, u64)> =
            self.0.iter().map(|(k, v)| (k.clone(), *v)).collect();
        // Sort descending by counter; ties broken by client id for determinism.
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut kept: Vec<(ClientId, u64)> = entries.into_iter().take(max_size).collect();

        if let Some(preserve_id) = preserve {
            let already_kept = kept.iter().any(|(id, _)| id == preserve_id);
            if !already_kept {
                if let Some(preserve_counter) = self.0.get(preserve_id).copied() {
                    // Evict the lowest-counter retained entry (last, since
                    // `kept` is sorted descending) and splice the preserved
                    // client in.
                    kept.pop();
                    kept.push((preserve_id.clone(), preserve_counter));
                }
            }
        }

        VectorClock(kept.into_iter().collect())
    }
}
