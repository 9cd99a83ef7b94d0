// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching front of the queue.
//!
//! Producers push [`Signal`]s through a [`SerializerHandle`]. The
//! [`SerializerService`] appends them to a [`Format`] and hands a compressed
//! [`EncodedBatch`] to the network input once the batch is full or the flush
//! interval passed.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::batch::{Compression, EncodedBatch};
use crate::errors::{EncodeError, MailboxError};
use crate::format::{Format, Marshaller, PrometheusMarshaller, PrometheusMetric};
use crate::labels::Labels;
use crate::mailbox::{Mailbox, SyncMailbox};
use crate::stats::{SerializerStats, StatsHub};

const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

type ConfigInbox = SyncMailbox<SerializerConfig, bool>;

#[derive(Clone, Debug, PartialEq)]
pub struct SerializerConfig {
    /// Signals per batch before a flush is forced.
    pub max_signals_in_batch: usize,
    /// Longest time a non-empty batch waits before it is flushed.
    pub flush_interval: Duration,
    pub compression: Compression,
    /// Appended to every series that does not carry the label already.
    pub external_labels: Labels,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            max_signals_in_batch: 10_000,
            flush_interval: Duration::from_secs(5),
            compression: Compression::Snappy,
            external_labels: Labels::default(),
        }
    }
}

impl SerializerConfig {
    fn batch_limit(&self) -> usize {
        self.max_signals_in_batch.max(1)
    }

    fn tick_period(&self) -> Duration {
        self.flush_interval.max(MIN_FLUSH_INTERVAL)
    }
}

/// Metric family metadata as reported by a scrape.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataSignal {
    pub name: String,
    pub unit: String,
    pub help: String,
    /// Prometheus type name, `counter`, `gauge` and so on. Unknown names are
    /// sent as `unknown`.
    pub metric_type: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    Metric(PrometheusMetric),
    Metadata(MetadataSignal),
}

#[derive(Clone)]
pub struct SerializerHandle {
    input: Mailbox<Signal>,
    config_inbox: ConfigInbox,
}

impl SerializerHandle {
    pub fn send_metric(
        &self,
        cancel: &CancellationToken,
        metric: PrometheusMetric,
    ) -> Result<(), MailboxError> {
        self.input.send(cancel, Signal::Metric(metric))
    }

    pub fn send_metadata(
        &self,
        cancel: &CancellationToken,
        metadata: MetadataSignal,
    ) -> Result<(), MailboxError> {
        self.input.send(cancel, Signal::Metadata(metadata))
    }

    /// Applies `cfg` between two signals. Returns `false` if it matched the
    /// active configuration.
    pub async fn update_config(
        &self,
        cancel: &CancellationToken,
        cfg: SerializerConfig,
    ) -> Result<bool, MailboxError> {
        self.config_inbox.send(cancel, cfg).await
    }

    /// Stops accepting signals. The service drains what was queued, flushes
    /// it and exits.
    pub fn stop(&self) {
        self.input.close();
        self.config_inbox.close();
    }
}

pub struct SerializerService {
    cfg: SerializerConfig,
    format: Format,
    hub: StatsHub,
    input: Mailbox<Signal>,
    config_inbox: ConfigInbox,
    output: Mailbox<EncodedBatch>,
    stats: SerializerStats,
    last_flush: Instant,
}

impl SerializerService {
    pub fn new(
        cfg: SerializerConfig,
        hub: StatsHub,
        output: Mailbox<EncodedBatch>,
    ) -> (Self, SerializerHandle) {
        let input = Mailbox::new();
        let config_inbox = ConfigInbox::new();
        let service = Self {
            cfg,
            format: Format::new(),
            hub,
            input: input.clone(),
            config_inbox: config_inbox.clone(),
            output,
            stats: SerializerStats::default(),
            last_flush: Instant::now(),
        };
        let handle = SerializerHandle {
            input,
            config_inbox,
        };
        (service, handle)
    }

    fn new_ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.cfg.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Runs until the handle is stopped or `cancel` fires. A stop flushes the
    /// pending batch, a cancellation drops it.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!(
            "Serializer started, batching up to {} signals",
            self.cfg.batch_limit()
        );
        let mut ticker = self.new_ticker();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(
                        "Serializer cancelled with {} signals pending",
                        self.format.record_count()
                    );
                    return;
                }
                Some(mut callback) = self.config_inbox.recv() => {
                    let changed = callback.value != self.cfg;
                    if changed {
                        self.cfg = callback.value.clone();
                        ticker = self.new_ticker();
                        if self.format.record_count() >= self.cfg.batch_limit() {
                            self.flush(&cancel);
                        }
                    }
                    callback.notify(changed);
                }
                signal = self.input.recv() => match signal {
                    Some(signal) => {
                        self.append(signal);
                        if self.format.record_count() >= self.cfg.batch_limit() {
                            self.flush(&cancel);
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if self.last_flush.elapsed() >= self.cfg.flush_interval {
                        self.flush(&cancel);
                    }
                }
            }
        }

        self.flush(&cancel);
        debug!("Serializer stopped");
    }

    fn append(&mut self, signal: Signal) {
        let result = match &signal {
            Signal::Metric(metric) => self
                .format
                .add_prometheus_metric(metric, &self.cfg.external_labels)
                .map(|()| {
                    self.stats.series_stored += 1;
                    if metric.exemplar.is_some() {
                        self.stats.exemplars_stored += 1;
                    }
                    self.stats.newest_timestamp_seconds = self
                        .stats
                        .newest_timestamp_seconds
                        .max(metric.timestamp_ms / 1000);
                }),
            Signal::Metadata(md) => self
                .format
                .add_prometheus_metadata(&md.name, &md.unit, &md.help, &md.metric_type)
                .map(|()| self.stats.metadata_stored += 1),
        };
        if let Err(e) = result {
            self.stats.errors += 1;
            warn!("Dropping signal that failed to serialize: {}", e);
        }
    }

    fn flush(&mut self, cancel: &CancellationToken) {
        self.last_flush = Instant::now();
        if self.format.is_empty() {
            if self.stats.errors > 0 {
                self.hub
                    .send_serializer_stats(std::mem::take(&mut self.stats));
            }
            return;
        }

        let compression = self.cfg.compression;
        let mut uncompressed = 0;
        let mut encoded = None;
        let result = self.format.marshal(|meta, raw| {
            uncompressed = raw.len();
            encoded = Some(EncodedBatch::encode(meta, raw, compression)?);
            Ok::<(), EncodeError>(())
        });
        let mut stats = std::mem::take(&mut self.stats);
        match result.map(|()| encoded) {
            Ok(Some(batch)) => {
                stats.uncompressed_bytes = uncompressed as u64;
                stats.compressed_bytes = batch.buf.len() as u64;
                if let Err(e) = self.output.send(cancel, batch) {
                    stats.errors += 1;
                    error!("Failed to hand batch to the network: {}", e);
                }
            }
            Ok(None) => {}
            Err(EncodeError::Compress(e)) => {
                stats.errors += 1;
                error!("Failed to compress batch with {}: {}", compression, e);
            }
            Err(e) => {
                stats.errors += 1;
                error!("Failed to encode batch: {}", e);
            }
        }
        self.hub.send_serializer_stats(stats);
    }
}
