// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client-side mirror of the registry.
//!
//! The mirror is written by the update subscriber (steady state) and the
//! snapshot requester (startup); the sequence guard makes their interleaving
//! safe. `last_applied` starts unset so the stream's very first frame,
//! sequence 0, is accepted.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::debug;

use crate::frame::UpdateFrame;
use crate::origin::OriginId;

/// What applying one live frame did to the mirror.
#[derive(Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Watchdog frame; the mirror is untouched.
    Heartbeat,
    /// Frame was fresh and applied. `value_set` is false for tombstones.
    Applied { value_set: bool },
    /// Sequence at or below the last applied one; dropped.
    Stale,
}

#[derive(Default)]
struct MirrorInner {
    entries: BTreeMap<String, String>,
    origins: HashMap<OriginId, String>,
    last_applied: Option<u64>,
}

/// Local eventually-consistent copy of the server's registry.
pub struct MirrorStore {
    inner: Mutex<MirrorInner>,
}

impl MirrorStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MirrorInner::default()),
        }
    }

    /// Apply one frame from the live update stream.
    ///
    /// Heartbeats never touch the sequence guard. A data frame applies only
    /// when its sequence exceeds the last applied one; stale duplicates are
    /// the expected residue of at-least-once retransmission and are dropped
    /// at debug level.
    pub fn apply_update(&self, frame: &UpdateFrame) -> ApplyOutcome {
        if frame.is_heartbeat() {
            return ApplyOutcome::Heartbeat;
        }

        let mut inner = self.inner.lock();

        if let Some(last) = inner.last_applied {
            if frame.sequence <= last {
                debug!(
                    key = %frame.key,
                    sequence = frame.sequence,
                    last_applied = last,
                    "stale update dropped"
                );
                return ApplyOutcome::Stale;
            }
        }
        inner.last_applied = Some(frame.sequence);

        if frame.value.is_empty() {
            inner.entries.remove(&frame.key);
            ApplyOutcome::Applied { value_set: false }
        } else {
            inner
                .entries
                .insert(frame.key.clone(), frame.value.clone());
            if let Some(origin) = frame.origin {
                inner.origins.insert(origin, frame.key.clone());
            }
            ApplyOutcome::Applied { value_set: true }
        }
    }

    /// Merge a completed snapshot in one step. The sequence guard is left
    /// alone: live updates that raced ahead stay ahead.
    pub fn merge_snapshot(
        &self,
        entries: BTreeMap<String, String>,
        origins: HashMap<OriginId, String>,
    ) -> usize {
        let merged = entries.len();
        let mut inner = self.inner.lock();
        inner.entries.extend(entries);
        inner.origins.extend(origins);
        merged
    }

    /// True when `key` is bound to `origin` in the reverse index.
    pub fn key_owned_by(&self, key: &str, origin: OriginId) -> bool {
        self.inner
            .lock()
            .origins
            .get(&origin)
            .is_some_and(|owned| owned == key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub fn entries(&self) -> BTreeMap<String, String> {
        self.inner.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_applied(&self) -> Option<u64> {
        self.inner.lock().last_applied
    }
}

impl Default for MirrorStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Staging area for one snapshot attempt.
///
/// Entries accumulate until the terminator arrives; a receive timeout resets
/// the attempt so a partial snapshot is never merged.
#[derive(Default)]
pub struct SnapshotAccumulator {
    entries: BTreeMap<String, String>,
    origins: HashMap<OriginId, String>,
}

impl SnapshotAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one snapshot entry. Tombstones cannot meaningfully appear in a
    /// first merge and are skipped.
    pub fn absorb(&mut self, frame: &UpdateFrame) {
        if frame.value.is_empty() {
            return;
        }
        self.entries
            .insert(frame.key.clone(), frame.value.clone());
        if let Some(origin) = frame.origin {
            self.origins.insert(origin, frame.key.clone());
        }
    }

    /// Discard the attempt after an incomplete stream.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.origins.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge the completed attempt into the mirror, returning the entry count.
    pub fn merge_into(self, mirror: &MirrorStore) -> usize {
        mirror.merge_snapshot(self.entries, self.origins)
    }
}

/// Self-map entries not yet echoed back through the update stream.
///
/// A self entry is unsynced when the mirror lacks the key (and the entry is
/// not a tombstone), or holds a different value for a key this client's own
/// origin owns. The ownership check keeps a client whose claim lost the
/// duplicate-key race from clobbering the winner forever.
pub fn unsynced_entries(
    self_map: &BTreeMap<String, String>,
    mirror: &MirrorStore,
    own_origin: OriginId,
) -> Vec<(String, String)> {
    self_map
        .iter()
        .filter(|(key, value)| match mirror.get(key) {
            None => !value.is_empty(),
            Some(current) => {
                current != **value && mirror.key_owned_by(key, own_origin)
            }
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(key: &str, sequence: u64, value: &str) -> UpdateFrame {
        UpdateFrame::new(key, sequence, None, value)
    }

    #[test]
    fn test_first_frame_sequence_zero_applies() {
        let mirror = MirrorStore::new();
        let outcome = mirror.apply_update(&update("k", 0, "v"));
        assert_eq!(outcome, ApplyOutcome::Applied { value_set: true });
        assert_eq!(mirror.get("k"), Some("v".to_string()));
        assert_eq!(mirror.last_applied(), Some(0));
    }

    #[test]
    fn test_duplicate_frame_is_noop() {
        let mirror = MirrorStore::new();
        let frame = update("k", 3, "v");

        assert_eq!(
            mirror.apply_update(&frame),
            ApplyOutcome::Applied { value_set: true }
        );
        assert_eq!(mirror.apply_update(&frame), ApplyOutcome::Stale);
        assert_eq!(mirror.len(), 1);
        assert_eq!(mirror.last_applied(), Some(3));
    }

    #[test]
    fn test_out_of_order_frame_rejected() {
        let mirror = MirrorStore::new();
        mirror.apply_update(&update("k", 5, "new"));

        assert_eq!(mirror.apply_update(&update("k", 4, "old")), ApplyOutcome::Stale);
        assert_eq!(mirror.get("k"), Some("new".to_string()));
        // The guard itself must not regress either.
        assert_eq!(mirror.last_applied(), Some(5));
    }

    #[test]
    fn test_heartbeat_leaves_guard_alone() {
        let mirror = MirrorStore::new();
        mirror.apply_update(&update("k", 7, "v"));

        assert_eq!(
            mirror.apply_update(&UpdateFrame::heartbeat()),
            ApplyOutcome::Heartbeat
        );
        assert_eq!(mirror.last_applied(), Some(7));
        assert_eq!(mirror.len(), 1);
    }

    #[test]
    fn test_tombstone_erases_without_callback_value() {
        let mirror = MirrorStore::new();
        mirror.apply_update(&update("k", 1, "v"));

        let outcome = mirror.apply_update(&update("k", 2, ""));
        assert_eq!(outcome, ApplyOutcome::Applied { value_set: false });
        assert!(mirror.is_empty());
    }

    #[test]
    fn test_update_records_origin() {
        let mirror = MirrorStore::new();
        let origin = OriginId::random();
        mirror.apply_update(&UpdateFrame::new("k", 1, Some(origin), "v"));

        assert!(mirror.key_owned_by("k", origin));
        assert!(!mirror.key_owned_by("other", origin));
    }

    #[test]
    fn test_accumulator_reset_discards_partial() {
        let mut acc = SnapshotAccumulator::new();
        acc.absorb(&update("a", 9, "1"));
        acc.absorb(&update("b", 9, "2"));
        assert_eq!(acc.len(), 2);

        acc.reset();
        assert!(acc.is_empty());

        acc.absorb(&update("c", 9, "3"));
        let mirror = MirrorStore::new();
        assert_eq!(acc.merge_into(&mirror), 1);
        assert_eq!(mirror.entries().keys().collect::<Vec<_>>(), vec!["c"]);
    }

    #[test]
    fn test_accumulator_skips_tombstones() {
        let mut acc = SnapshotAccumulator::new();
        acc.absorb(&update("gone", 9, ""));
        assert!(acc.is_empty());
    }

    #[test]
    fn test_merge_preserves_sequence_guard() {
        let mirror = MirrorStore::new();
        mirror.apply_update(&update("live", 12, "v"));

        let mut acc = SnapshotAccumulator::new();
        acc.absorb(&update("boot", 9, "w"));
        acc.merge_into(&mirror);

        assert_eq!(mirror.len(), 2);
        assert_eq!(mirror.last_applied(), Some(12));
    }

    #[test]
    fn test_unsynced_missing_key() {
        let mirror = MirrorStore::new();
        let own = OriginId::random();
        let mut self_map = BTreeMap::new();
        self_map.insert("k".to_string(), "v".to_string());

        assert_eq!(
            unsynced_entries(&self_map, &mirror, own),
            vec![("k".to_string(), "v".to_string())]
        );

        // Once the update round-trips, nothing is left to resend.
        mirror.apply_update(&UpdateFrame::new("k", 1, Some(own), "v"));
        assert!(unsynced_entries(&self_map, &mirror, own).is_empty());
    }

    #[test]
    fn test_unsynced_tombstone_absent_is_synced() {
        let mirror = MirrorStore::new();
        let own = OriginId::random();
        let mut self_map = BTreeMap::new();
        self_map.insert("gone".to_string(), String::new());

        assert!(unsynced_entries(&self_map, &mirror, own).is_empty());
    }

    #[test]
    fn test_unsynced_pending_tombstone_resends() {
        let mirror = MirrorStore::new();
        let own = OriginId::random();
        mirror.apply_update(&UpdateFrame::new("k", 1, Some(own), "v"));

        let mut self_map = BTreeMap::new();
        self_map.insert("k".to_string(), String::new());

        assert_eq!(
            unsynced_entries(&self_map, &mirror, own),
            vec![("k".to_string(), String::new())]
        );
    }

    #[test]
    fn test_unsynced_respects_foreign_ownership() {
        let mirror = MirrorStore::new();
        let own = OriginId::random();
        let winner = OriginId::random();

        // The key round-tripped under someone else's origin with a different
        // value: this client lost the claim race and must not keep resending.
        mirror.apply_update(&UpdateFrame::new("k", 1, Some(winner), "theirs"));

        let mut self_map = BTreeMap::new();
        self_map.insert("k".to_string(), "mine".to_string());

        assert!(unsynced_entries(&self_map, &mirror, own).is_empty());
    }
}
