//! Presence tracking for Ripple channels.
//!
//! The server is authoritative: a full-state frame replaces the local map
//! wholesale, and diff frames are folded in strictly in arrival order.
//! [`merge`] is the pure diff-merge function; [`Presence`] is the per-channel
//! map it is applied to.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Opaque metadata record for one presence entry.
pub type PresenceMeta = Value;

/// Presence map: key to its ordered metadata records.
///
/// A key present in the map always has a non-empty metadata list.
pub type PresenceState = HashMap<String, Vec<PresenceMeta>>;

/// Incremental joins/leaves update to a presence map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    /// Metadata records appended per key.
    #[serde(default)]
    pub joins: HashMap<String, Vec<PresenceMeta>>,
    /// Metadata records removed per key.
    #[serde(default)]
    pub leaves: HashMap<String, Vec<PresenceMeta>>,
}

impl PresenceDiff {
    /// Check whether the diff changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

/// Merge a diff into a presence map.
///
/// Leaves are applied before joins within the same diff: each listed leave
/// meta removes one matching record from its key's list, and a key whose
/// list empties is deleted; join metas are then appended in order, creating
/// keys as needed. Folding diffs in arrival order is equivalent to
/// recomputing from a fresh full-state snapshot.
#[must_use]
pub fn merge(mut state: PresenceState, diff: &PresenceDiff) -> PresenceState {
    for (key, metas) in &diff.leaves {
        if let Some(list) = state.get_mut(key) {
            for meta in metas {
                if let Some(position) = list.iter().position(|m| m == meta) {
                    list.remove(position);
                }
            }
            if list.is_empty() {
                state.remove(key);
            }
        }
    }

    for (key, metas) in &diff.joins {
        state
            .entry(key.clone())
            .or_default()
            .extend(metas.iter().cloned());
    }

    state
}

/// Presence map for one channel.
#[derive(Debug, Default)]
pub struct Presence {
    state: PresenceState,
}

impl Presence {
    /// Create an empty presence map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the map wholesale from a full-state frame.
    pub fn replace(&mut self, state: PresenceState) {
        debug!(members = state.len(), "Presence state replaced");
        self.state = state;
    }

    /// Fold one diff into the map.
    pub fn apply(&mut self, diff: &PresenceDiff) {
        self.state = merge(std::mem::take(&mut self.state), diff);
    }

    /// Get the number of present keys.
    #[must_use]
    pub fn count(&self) -> usize {
        self.state.len()
    }

    /// Check whether a key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.state.contains_key(key)
    }

    /// Get the metadata records for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[PresenceMeta]> {
        self.state.get(key).map(Vec::as_slice)
    }

    /// Get a snapshot of the full map.
    #[must_use]
    pub fn snapshot(&self) -> PresenceState {
        self.state.clone()
    }

    /// Check whether the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}
