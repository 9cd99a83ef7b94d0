// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;

use crate::datum::MetricDatum;

/// Decoded items waiting for room in a write buffer. Metrics are kept per
/// shard so the same series always goes out on the same connection.
#[derive(Debug)]
pub struct Pending<M, D> {
    shards: Vec<VecDeque<M>>,
    metadata: VecDeque<D>,
}

impl<M: MetricDatum, D> Pending<M, D> {
    #[must_use]
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| VecDeque::new()).collect(),
            metadata: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, hash: u64) -> usize {
        (hash % self.shards.len() as u64) as usize
    }

    pub fn add_metric(&mut self, metric: M) {
        let shard = self.shard_for(metric.hash());
        self.shards[shard].push_back(metric);
    }

    /// Puts metrics taken out of a write buffer back in front of their shard,
    /// ahead of anything queued after them.
    pub fn requeue_metrics(&mut self, metrics: Vec<M>) {
        for metric in metrics.into_iter().rev() {
            let shard = self.shard_for(metric.hash());
            self.shards[shard].push_front(metric);
        }
    }

    pub fn add_metadata(&mut self, metadata: D) {
        self.metadata.push_back(metadata);
    }

    /// Up to `max` metrics for `shard`, oldest first.
    pub fn pull_metrics(&mut self, shard: usize, max: usize) -> Vec<M> {
        match self.shards.get_mut(shard) {
            Some(queue) => {
                let n = max.min(queue.len());
                queue.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn pull_metadata(&mut self, max: usize) -> Vec<D> {
        let n = max.min(self.metadata.len());
        self.metadata.drain(..n).collect()
    }

    #[must_use]
    pub fn total_len(&self) -> usize {
        self.shards.iter().map(VecDeque::len).sum::<usize>() + self.metadata.len()
    }

    /// Redistributes queued metrics over `shards` shards. Relative order per
    /// series is kept.
    pub fn reshard(&mut self, shards: usize) {
        let shards = shards.max(1);
        if shards == self.shards.len() {
            return;
        }
        let old = std::mem::replace(
            &mut self.shards,
            (0..shards).map(|_| VecDeque::new()).collect(),
        );
        for metric in old.into_iter().flatten() {
            self.add_metric(metric);
        }
    }
}
