// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Authoritative registry store (server side).
//!
//! Entries, the origin reverse index, the dirty list and the publish
//! sequence form one consistency unit behind a single mutex: the collector
//! task is the only writer, the snapshot and publisher tasks take
//! point-in-time copies. The raw maps are never exposed.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::frame::UpdateFrame;
use crate::origin::OriginId;

#[derive(Default)]
struct StoreInner {
    entries: BTreeMap<String, String>,
    /// origin -> key; one binding per origin, first registration wins.
    origins: HashMap<OriginId, String>,
    /// Keys changed since the last publish flush, in change order.
    dirty: Vec<String>,
    sequence: u64,
}

impl StoreInner {
    /// First origin owning `key`, if any. Linear scan; registries are small.
    fn origin_of(&self, key: &str) -> Option<OriginId> {
        self.origins
            .iter()
            .find(|(_, owned)| owned.as_str() == key)
            .map(|(origin, _)| *origin)
    }

    fn put(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
        self.dirty.push(key.to_string());
    }

    /// An empty value marks the key for removal; the entry is physically
    /// purged only once the publisher has flushed the tombstone, so a late
    /// duplicate remove cannot resurrect the key under a new origin.
    fn remove(&mut self, key: &str) {
        self.entries.insert(key.to_string(), String::new());
        self.dirty.push(key.to_string());
    }
}

/// Shared server-side key/value store.
pub struct RegistryStore {
    inner: Mutex<StoreInner>,
}

impl RegistryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Insert or update an entry and mark it for publish.
    pub fn put(&self, key: &str, value: &str) {
        self.inner.lock().put(key, value);
    }

    /// Mark an entry for removal and publish of its tombstone.
    pub fn remove(&self, key: &str) {
        self.inner.lock().remove(key);
    }

    /// Apply one client submission (collector contract).
    ///
    /// A non-empty origin registers on first sight unless the key is already
    /// owned by a different origin; that claim is dropped with a warning,
    /// but the value change still applies. First writer wins on races.
    pub fn accept_submission(&self, frame: &UpdateFrame) {
        let mut inner = self.inner.lock();

        if let Some(origin) = frame.origin {
            if !inner.origins.contains_key(&origin) {
                let owned_elsewhere = inner
                    .origins
                    .values()
                    .any(|owned| owned.as_str() == frame.key);

                if owned_elsewhere {
                    warn!(
                        key = %frame.key,
                        origin = %origin,
                        "key already registered by another origin, claim dropped"
                    );
                } else {
                    inner.origins.insert(origin, frame.key.clone());
                }
            }
        }

        if frame.value.is_empty() {
            inner.remove(&frame.key);
        } else {
            inner.put(&frame.key, &frame.value);
        }

        debug!(
            key = %frame.key,
            tombstone = frame.value.is_empty(),
            entries = inner.entries.len(),
            "submission applied"
        );
    }

    /// Flush the dirty list into publishable frames.
    ///
    /// Each dirty key gets its own sequence number so subscribers can tell
    /// exactly which updates they have seen. Tombstoned entries are purged
    /// here, once their deletion frame exists. Atomic under the store lock.
    pub fn drain_dirty(&self) -> Vec<UpdateFrame> {
        let mut inner = self.inner.lock();

        let dirty = std::mem::take(&mut inner.dirty);
        let mut frames = Vec::with_capacity(dirty.len());

        for key in dirty {
            let value = inner.entries.get(&key).cloned().unwrap_or_default();
            let origin = inner.origin_of(&key);
            let sequence = inner.sequence;
            inner.sequence += 1;

            if value.is_empty() {
                inner.entries.remove(&key);
            }

            frames.push(UpdateFrame::new(key, sequence, origin, value));
        }

        frames
    }

    /// Point-in-time copy of every entry as snapshot frames, plus the
    /// sequence to stamp on the terminator. Copy-then-iterate: concurrent
    /// collector mutations are invisible to one snapshot response. The
    /// sequence advances once per snapshot served.
    pub fn snapshot_frames(&self) -> (Vec<UpdateFrame>, u64) {
        let mut inner = self.inner.lock();

        let sequence = inner.sequence;
        let frames = inner
            .entries
            .iter()
            .map(|(key, value)| {
                UpdateFrame::new(key.clone(), sequence, inner.origin_of(key), value.clone())
            })
            .collect();
        inner.sequence += 1;

        (frames, sequence)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Copy of the current map, tombstones included.
    pub fn entries(&self) -> BTreeMap<String, String> {
        self.inner.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new()
    }
}
