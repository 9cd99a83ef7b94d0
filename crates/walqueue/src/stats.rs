// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stats snapshots and their synchronous fan-out.
//!
//! Every stage publishes plain snapshots into a [`StatsHub`]. Listeners run on
//! the publishing task, so they must be quick and must not block. The
//! parallelism controller and [`StatsRecorder`] are the two built-in listeners.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// Per-category outcome counts of one send attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CategoryStats {
    pub series_sent: u64,
    pub failed_samples: u64,
    pub retried_samples: u64,
    pub retried_samples_429: u64,
    pub retried_samples_5xx: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub series: CategoryStats,
    pub histogram: CategoryStats,
    pub metadata: CategoryStats,
    pub send_duration: Duration,
    /// Newest sample timestamp in the request, in seconds.
    pub newest_timestamp_seconds: i64,
    pub series_bytes: u64,
    pub metadata_bytes: u64,
}

impl NetworkStats {
    fn categories(&self) -> [&CategoryStats; 3] {
        [&self.series, &self.histogram, &self.metadata]
    }

    #[must_use]
    pub fn total_sent(&self) -> u64 {
        self.categories().iter().map(|c| c.series_sent).sum()
    }

    #[must_use]
    pub fn total_retried(&self) -> u64 {
        self.categories().iter().map(|c| c.retried_samples).sum()
    }

    #[must_use]
    pub fn total_failed(&self) -> u64 {
        self.categories().iter().map(|c| c.failed_samples).sum()
    }

    #[must_use]
    pub fn total_429(&self) -> u64 {
        self.categories().iter().map(|c| c.retried_samples_429).sum()
    }

    #[must_use]
    pub fn total_5xx(&self) -> u64 {
        self.categories().iter().map(|c| c.retried_samples_5xx).sum()
    }

    /// Any retry, failure or throttling in this snapshot.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.total_429() > 0
            || self.total_5xx() > 0
            || self.total_failed() > 0
            || self.total_retried() > 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SerializerStats {
    pub series_stored: u64,
    pub metadata_stored: u64,
    pub exemplars_stored: u64,
    pub errors: u64,
    pub newest_timestamp_seconds: i64,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParallelismStats {
    pub min: usize,
    pub max: usize,
    pub desired: usize,
}

/// Deregisters a listener. Calling it more than once is not possible since it
/// is consumed.
pub type NotificationRelease = Box<dyn FnOnce() + Send + Sync>;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    listeners: RwLock<Vec<(u64, Listener<T>)>>,
}

impl<T: 'static> Registry<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: RwLock::new(Vec::new()),
        })
    }

    fn register(self: &Arc<Self>, id: u64, listener: Listener<T>) -> NotificationRelease {
        {
            #[allow(clippy::expect_used)]
            let mut listeners = self.listeners.write().expect("lock poisoned");
            listeners.push((id, listener));
        }
        let registry: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                #[allow(clippy::expect_used)]
                let mut listeners = registry.listeners.write().expect("lock poisoned");
                listeners.retain(|(existing, _)| *existing != id);
            }
        })
    }

    fn send(&self, value: &T) {
        // Snapshot so listeners may (de)register without deadlocking.
        let listeners: Vec<Listener<T>> = {
            #[allow(clippy::expect_used)]
            let listeners = self.listeners.read().expect("lock poisoned");
            listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in listeners {
            listener(value);
        }
    }

    fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let listeners = self.listeners.read().expect("lock poisoned");
        listeners.len()
    }
}

struct HubInner {
    next_id: AtomicU64,
    serializer: Arc<Registry<SerializerStats>>,
    series_network: Arc<Registry<NetworkStats>>,
    metadata_network: Arc<Registry<NetworkStats>>,
    parallelism: Arc<Registry<ParallelismStats>>,
}

#[derive(Clone)]
pub struct StatsHub {
    inner: Arc<HubInner>,
}

impl Default for StatsHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StatsHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsHub")
            .field("serializer", &self.inner.serializer.len())
            .field("series_network", &self.inner.series_network.len())
            .field("metadata_network", &self.inner.metadata_network.len())
            .field("parallelism", &self.inner.parallelism.len())
            .finish()
    }
}

impl StatsHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                next_id: AtomicU64::new(0),
                serializer: Registry::new(),
                series_network: Registry::new(),
                metadata_network: Registry::new(),
                parallelism: Registry::new(),
            }),
        }
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register_serializer<F>(&self, f: F) -> NotificationRelease
    where
        F: Fn(&SerializerStats) + Send + Sync + 'static,
    {
        self.inner.serializer.register(self.next_id(), Arc::new(f))
    }

    pub fn register_series_network<F>(&self, f: F) -> NotificationRelease
    where
        F: Fn(&NetworkStats) + Send + Sync + 'static,
    {
        self.inner.series_network.register(self.next_id(), Arc::new(f))
    }

    pub fn register_metadata_network<F>(&self, f: F) -> NotificationRelease
    where
        F: Fn(&NetworkStats) + Send + Sync + 'static,
    {
        self.inner
            .metadata_network
            .register(self.next_id(), Arc::new(f))
    }

    pub fn register_parallelism<F>(&self, f: F) -> NotificationRelease
    where
        F: Fn(&ParallelismStats) + Send + Sync + 'static,
    {
        self.inner.parallelism.register(self.next_id(), Arc::new(f))
    }

    pub fn send_serializer_stats(&self, stats: SerializerStats) {
        self.inner.serializer.send(&stats);
    }

    pub fn send_series_network_stats(&self, stats: NetworkStats) {
        self.inner.series_network.send(&stats);
    }

    pub fn send_metadata_network_stats(&self, stats: NetworkStats) {
        self.inner.metadata_network.send(&stats);
    }

    pub fn send_parallelism_stats(&self, stats: ParallelismStats) {
        self.inner.parallelism.send(&stats);
    }
}

#[derive(Debug, Default)]
struct RecorderCounters {
    samples_sent: AtomicU64,
    histograms_sent: AtomicU64,
    metadata_sent: AtomicU64,
    failed_samples: AtomicU64,
    failed_histograms: AtomicU64,
    failed_metadata: AtomicU64,
    retried_samples: AtomicU64,
    retried_histograms: AtomicU64,
    retried_metadata: AtomicU64,
    retried_429: AtomicU64,
    retried_5xx: AtomicU64,
    sent_bytes: AtomicU64,
    metadata_bytes: AtomicU64,
    serializer_in_series: AtomicU64,
    serializer_in_metadata: AtomicU64,
    serializer_in_exemplars: AtomicU64,
    serializer_errors: AtomicU64,
    serializer_compressed_bytes: AtomicU64,
    serializer_uncompressed_bytes: AtomicU64,
    serializer_newest_seconds: AtomicI64,
    network_newest_seconds: AtomicI64,
    parallelism_min: AtomicUsize,
    parallelism_max: AtomicUsize,
    parallelism_desired: AtomicUsize,
}

impl RecorderCounters {
    fn record_network(&self, ns: &NetworkStats) {
        self.samples_sent
            .fetch_add(ns.series.series_sent, Ordering::Relaxed);
        self.histograms_sent
            .fetch_add(ns.histogram.series_sent, Ordering::Relaxed);
        self.metadata_sent
            .fetch_add(ns.metadata.series_sent, Ordering::Relaxed);
        self.failed_samples
            .fetch_add(ns.series.failed_samples, Ordering::Relaxed);
        self.failed_histograms
            .fetch_add(ns.histogram.failed_samples, Ordering::Relaxed);
        self.failed_metadata
            .fetch_add(ns.metadata.failed_samples, Ordering::Relaxed);
        self.retried_samples
            .fetch_add(ns.series.retried_samples, Ordering::Relaxed);
        self.retried_histograms
            .fetch_add(ns.histogram.retried_samples, Ordering::Relaxed);
        self.retried_metadata
            .fetch_add(ns.metadata.retried_samples, Ordering::Relaxed);
        self.retried_429.fetch_add(ns.total_429(), Ordering::Relaxed);
        self.retried_5xx.fetch_add(ns.total_5xx(), Ordering::Relaxed);
        self.sent_bytes.fetch_add(ns.series_bytes, Ordering::Relaxed);
        self.metadata_bytes
            .fetch_add(ns.metadata_bytes, Ordering::Relaxed);
        self.network_newest_seconds
            .fetch_max(ns.newest_timestamp_seconds, Ordering::Relaxed);
    }

    fn record_serializer(&self, ss: &SerializerStats) {
        self.serializer_in_series
            .fetch_add(ss.series_stored, Ordering::Relaxed);
        self.serializer_in_metadata
            .fetch_add(ss.metadata_stored, Ordering::Relaxed);
        self.serializer_in_exemplars
            .fetch_add(ss.exemplars_stored, Ordering::Relaxed);
        self.serializer_errors
            .fetch_add(ss.errors, Ordering::Relaxed);
        self.serializer_compressed_bytes
            .fetch_add(ss.compressed_bytes, Ordering::Relaxed);
        self.serializer_uncompressed_bytes
            .fetch_add(ss.uncompressed_bytes, Ordering::Relaxed);
        self.serializer_newest_seconds
            .fetch_max(ss.newest_timestamp_seconds, Ordering::Relaxed);
    }

    fn record_parallelism(&self, ps: &ParallelismStats) {
        self.parallelism_min.store(ps.min, Ordering::Relaxed);
        self.parallelism_max.store(ps.max, Ordering::Relaxed);
        self.parallelism_desired.store(ps.desired, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RecorderSnapshot {
        let serializer_newest = self.serializer_newest_seconds.load(Ordering::Relaxed);
        let network_newest = self.network_newest_seconds.load(Ordering::Relaxed);
        RecorderSnapshot {
            samples_sent: self.samples_sent.load(Ordering::Relaxed),
            histograms_sent: self.histograms_sent.load(Ordering::Relaxed),
            metadata_sent: self.metadata_sent.load(Ordering::Relaxed),
            failed_samples: self.failed_samples.load(Ordering::Relaxed),
            failed_histograms: self.failed_histograms.load(Ordering::Relaxed),
            failed_metadata: self.failed_metadata.load(Ordering::Relaxed),
            retried_samples: self.retried_samples.load(Ordering::Relaxed),
            retried_histograms: self.retried_histograms.load(Ordering::Relaxed),
            retried_metadata: self.retried_metadata.load(Ordering::Relaxed),
            retried_429: self.retried_429.load(Ordering::Relaxed),
            retried_5xx: self.retried_5xx.load(Ordering::Relaxed),
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            metadata_bytes: self.metadata_bytes.load(Ordering::Relaxed),
            serializer_in_series: self.serializer_in_series.load(Ordering::Relaxed),
            serializer_in_metadata: self.serializer_in_metadata.load(Ordering::Relaxed),
            serializer_in_exemplars: self.serializer_in_exemplars.load(Ordering::Relaxed),
            serializer_errors: self.serializer_errors.load(Ordering::Relaxed),
            serializer_compressed_bytes: self.serializer_compressed_bytes.load(Ordering::Relaxed),
            serializer_uncompressed_bytes: self
                .serializer_uncompressed_bytes
                .load(Ordering::Relaxed),
            drift_seconds: if serializer_newest > 0 && network_newest > 0 {
                serializer_newest - network_newest
            } else {
                0
            },
            parallelism: ParallelismStats {
                min: self.parallelism_min.load(Ordering::Relaxed),
                max: self.parallelism_max.load(Ordering::Relaxed),
                desired: self.parallelism_desired.load(Ordering::Relaxed),
            },
        }
    }
}

/// Running totals of everything published on a [`StatsHub`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecorderSnapshot {
    pub samples_sent: u64,
    pub histograms_sent: u64,
    pub metadata_sent: u64,
    pub failed_samples: u64,
    pub failed_histograms: u64,
    pub failed_metadata: u64,
    pub retried_samples: u64,
    pub retried_histograms: u64,
    pub retried_metadata: u64,
    pub retried_429: u64,
    pub retried_5xx: u64,
    pub sent_bytes: u64,
    pub metadata_bytes: u64,
    pub serializer_in_series: u64,
    pub serializer_in_metadata: u64,
    pub serializer_in_exemplars: u64,
    pub serializer_errors: u64,
    pub serializer_compressed_bytes: u64,
    pub serializer_uncompressed_bytes: u64,
    /// Newest serializer timestamp minus newest sent timestamp, 0 until both
    /// are known.
    pub drift_seconds: i64,
    pub parallelism: ParallelismStats,
}

impl fmt::Display for RecorderSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "samples_sent={}, histograms_sent={}, metadata_sent={}, failed={}, retried={}, retried_429={}, retried_5xx={}, sent_bytes={}, serializer_in={}, serializer_errors={}, drift_seconds={}, desired={}/{}..{}",
            self.samples_sent,
            self.histograms_sent,
            self.metadata_sent,
            self.failed_samples + self.failed_histograms + self.failed_metadata,
            self.retried_samples + self.retried_histograms + self.retried_metadata,
            self.retried_429,
            self.retried_5xx,
            self.sent_bytes,
            self.serializer_in_series,
            self.serializer_errors,
            self.drift_seconds,
            self.parallelism.desired,
            self.parallelism.min,
            self.parallelism.max
        )
    }
}

/// Listener that accumulates totals for logging. Deregisters on drop.
pub struct StatsRecorder {
    counters: Arc<RecorderCounters>,
    releases: Vec<NotificationRelease>,
}

impl StatsRecorder {
    #[must_use]
    pub fn register(hub: &StatsHub) -> Self {
        let counters = Arc::new(RecorderCounters::default());
        let mut releases = Vec::with_capacity(4);

        let c = Arc::clone(&counters);
        releases.push(hub.register_series_network(move |ns| c.record_network(ns)));
        let c = Arc::clone(&counters);
        releases.push(hub.register_metadata_network(move |ns| c.record_network(ns)));
        let c = Arc::clone(&counters);
        releases.push(hub.register_serializer(move |ss| c.record_serializer(ss)));
        let c = Arc::clone(&counters);
        releases.push(hub.register_parallelism(move |ps| c.record_parallelism(ps)));

        Self { counters, releases }
    }

    #[must_use]
    pub fn snapshot(&self) -> RecorderSnapshot {
        self.counters.snapshot()
    }
}

impl Drop for StatsRecorder {
    fn drop(&mut self) {
        for release in self.releases.drain(..) {
            release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_totals() {
        let ns = NetworkStats {
            series: CategoryStats {
                series_sent: 10,
                retried_samples: 2,
                retried_samples_429: 2,
                ..Default::default()
            },
            histogram: CategoryStats {
                series_sent: 1,
                failed_samples: 3,
                ..Default::default()
            },
            metadata: CategoryStats {
                retried_samples: 1,
                retried_samples_5xx: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(ns.total_sent(), 11);
        assert_eq!(ns.total_retried(), 3);
        assert_eq!(ns.total_failed(), 3);
        assert_eq!(ns.total_429(), 2);
        assert_eq!(ns.total_5xx(), 1);
        assert!(ns.has_errors());
        assert!(!NetworkStats::default().has_errors());
    }

    #[test]
    fn test_hub_fan_out_and_release() {
        let hub = StatsHub::new();
        let calls = Arc::new(AtomicU64::new(0));

        let c = Arc::clone(&calls);
        let first = hub.register_serializer(move |ss| {
            c.fetch_add(ss.series_stored, Ordering::Relaxed);
        });
        let c = Arc::clone(&calls);
        let second = hub.register_serializer(move |ss| {
            c.fetch_add(ss.series_stored, Ordering::Relaxed);
        });

        let stats = SerializerStats {
            series_stored: 5,
            ..Default::default()
        };
        hub.send_serializer_stats(stats);
        assert_eq!(calls.load(Ordering::Relaxed), 10);

        first();
        hub.send_serializer_stats(stats);
        assert_eq!(calls.load(Ordering::Relaxed), 15);

        second();
        hub.send_serializer_stats(stats);
        assert_eq!(calls.load(Ordering::Relaxed), 15);
    }

    #[test]
    fn test_channels_are_separate() {
        let hub = StatsHub::new();
        let series = Arc::new(AtomicU64::new(0));
        let meta = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&series);
        let _r1 = hub.register_series_network(move |ns| {
            s.fetch_add(ns.total_sent(), Ordering::Relaxed);
        });
        let m = Arc::clone(&meta);
        let _r2 = hub.register_metadata_network(move |ns| {
            m.fetch_add(ns.total_sent(), Ordering::Relaxed);
        });

        hub.send_metadata_network_stats(NetworkStats {
            metadata: CategoryStats {
                series_sent: 4,
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(series.load(Ordering::Relaxed), 0);
        assert_eq!(meta.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_release_after_hub_dropped() {
        let hub = StatsHub::new();
        let release = hub.register_parallelism(|_| {});
        drop(hub);
        release();
    }

    #[test]
    fn test_recorder_totals_and_drift() {
        let hub = StatsHub::new();
        let recorder = StatsRecorder::register(&hub);

        hub.send_serializer_stats(SerializerStats {
            series_stored: 3,
            newest_timestamp_seconds: 100,
            ..Default::default()
        });
        assert_eq!(recorder.snapshot().drift_seconds, 0);

        hub.send_series_network_stats(NetworkStats {
            series: CategoryStats {
                series_sent: 2,
                ..Default::default()
            },
            newest_timestamp_seconds: 70,
            series_bytes: 512,
            ..Default::default()
        });
        hub.send_parallelism_stats(ParallelismStats {
            min: 1,
            max: 4,
            desired: 2,
        });

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.serializer_in_series, 3);
        assert_eq!(snapshot.samples_sent, 2);
        assert_eq!(snapshot.sent_bytes, 512);
        assert_eq!(snapshot.drift_seconds, 30);
        assert_eq!(snapshot.parallelism.desired, 2);
        assert!(snapshot.to_string().contains("drift_seconds=30"));

        drop(recorder);
        assert_eq!(format!("{hub:?}").matches(": 0").count(), 4);
    }
}
