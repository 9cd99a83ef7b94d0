// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::prompb::MetricMetadata;

/// Metadata for v2 requests, keyed by metric family name.
///
/// Entries are attached to the first series of their family that goes out
/// after they were stored or changed, and skipped afterwards.
pub trait MetadataCache: Send {
    fn set(&mut self, metadata: MetricMetadata);

    /// Returns the family's metadata if it has not been sent since it last
    /// changed, and marks it as sent.
    fn take_unsent(&mut self, family: &str) -> Option<MetricMetadata>;

    /// Forgets everything so that all metadata is sent again.
    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Entry {
    metadata: MetricMetadata,
    sent: bool,
    last_used: u64,
}

/// Size-bounded cache that evicts the least recently used family.
#[derive(Debug)]
pub struct LruMetadataCache {
    entries: HashMap<String, Entry>,
    /// `last_used` to family name, oldest first.
    recency: BTreeMap<u64, String>,
    capacity: usize,
    clock: u64,
}

impl LruMetadataCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
            capacity: capacity.max(1),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, family: &str) -> Option<&mut Entry> {
        let now = self.tick();
        let entry = self.entries.get_mut(family)?;
        if let Some(name) = self.recency.remove(&entry.last_used) {
            self.recency.insert(now, name);
        }
        entry.last_used = now;
        Some(entry)
    }

    fn evict_oldest(&mut self) {
        if let Some((_, family)) = self.recency.pop_first() {
            self.entries.remove(&family);
        }
    }
}

impl MetadataCache for LruMetadataCache {
    fn set(&mut self, metadata: MetricMetadata) {
        if let Some(entry) = self.touch(&metadata.metric_family_name) {
            if entry.metadata != metadata {
                entry.metadata = metadata;
                entry.sent = false;
            }
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        let now = self.tick();
        self.recency
            .insert(now, metadata.metric_family_name.clone());
        self.entries.insert(
            metadata.metric_family_name.clone(),
            Entry {
                metadata,
                sent: false,
                last_used: now,
            },
        );
    }

    fn take_unsent(&mut self, family: &str) -> Option<MetricMetadata> {
        let entry = self.touch(family)?;
        if entry.sent {
            return None;
        }
        entry.sent = true;
        Some(entry.metadata.clone())
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Used when the cache is disabled: v2 requests then carry no metadata.
#[derive(Debug, Default)]
pub struct NoopMetadataCache;

impl MetadataCache for NoopMetadataCache {
    fn set(&mut self, _metadata: MetricMetadata) {}

    fn take_unsent(&mut self, _family: &str) -> Option<MetricMetadata> {
        None
    }

    fn clear(&mut self) {}

    fn len(&self) -> usize {
        0
    }
}
