// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::datum::MetricEnvelope;

/// Free list of metric envelopes shared by decoders.
///
/// `get` hands out a cleared envelope, reusing a returned one when available.
/// Returned envelopes keep their `series` allocation so steady-state decoding
/// does not allocate.
#[derive(Clone, Debug)]
pub struct MetricPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    free: Mutex<Vec<MetricEnvelope>>,
    max_retained: usize,
    reused: AtomicU64,
    allocated: AtomicU64,
}

impl Default for MetricPool {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl MetricPool {
    #[must_use]
    pub fn new(max_retained: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                max_retained,
                reused: AtomicU64::new(0),
                allocated: AtomicU64::new(0),
            }),
        }
    }

    pub fn get(&self) -> MetricEnvelope {
        #[allow(clippy::expect_used)]
        let mut free = self.inner.free.lock().expect("lock poisoned");
        if let Some(envelope) = free.pop() {
            self.inner.reused.fetch_add(1, Ordering::Relaxed);
            envelope
        } else {
            self.inner.allocated.fetch_add(1, Ordering::Relaxed);
            MetricEnvelope::default()
        }
    }

    pub fn put(&self, mut envelope: MetricEnvelope) {
        envelope.reset();
        #[allow(clippy::expect_used)]
        let mut free = self.inner.free.lock().expect("lock poisoned");
        if free.len() < self.inner.max_retained {
            free.push(envelope);
        }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        #[allow(clippy::expect_used)]
        let free = self.inner.free.lock().expect("lock poisoned");
        free.len()
    }

    /// Number of `get` calls served from the free list.
    #[must_use]
    pub fn reused(&self) -> u64 {
        self.inner.reused.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}
