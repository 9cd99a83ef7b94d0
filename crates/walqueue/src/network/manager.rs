// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::batch::EncodedBatch;
use crate::datum::{Datum, Metadata, Metric, Record};
use crate::errors::{ConfigError, UpdateError};
use crate::format::{Format, Unmarshaller};
use crate::mailbox::{Mailbox, SyncMailbox};
use crate::network::config::ConnectionConfig;
use crate::network::http_client::build_client;
use crate::network::metadata_cache::{LruMetadataCache, MetadataCache, NoopMetadataCache};
use crate::network::parallelism::{ParallelismHandle, ParallelismService};
use crate::network::pending::Pending;
use crate::network::write::{
    build_v1_request, build_v2_request, send_with_retry, PreparedRequest, RequestKind,
    RequestTemplate, WriteBuffer,
};
use crate::network::NetworkClient;
use crate::pool::MetricPool;
use crate::prompb;
use crate::stats::StatsHub;

type ConfigInbox = SyncMailbox<ConnectionConfig, Result<bool, ConfigError>>;

const MAX_TICK: Duration = Duration::from_secs(1);
const MIN_TICK: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BufferTarget {
    Metric(usize),
    Metadata,
}

#[derive(Debug)]
struct Completion {
    generation: u64,
    target: BufferTarget,
}

fn new_metadata_cache(cfg: &ConnectionConfig) -> Box<dyn MetadataCache> {
    if cfg.remote_write_v2() && cfg.enable_metadata_cache {
        Box::new(LruMetadataCache::new(cfg.metadata_cache_size))
    } else {
        Box::new(NoopMetadataCache)
    }
}

/// The loop that owns the shards. Everything here is only touched from
/// [`Manager::run`].
struct Manager {
    cfg: Arc<ConnectionConfig>,
    template: Arc<RequestTemplate>,
    client: reqwest::Client,
    hub: StatsHub,
    input: Mailbox<EncodedBatch>,
    config_inbox: ConfigInbox,
    desired_inbox: Mailbox<usize>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    format: Format,
    pending: Pending<Metric, Metadata>,
    metric_buffers: Vec<WriteBuffer<Metric>>,
    /// Only used for v1, v2 carries metadata on the series connections.
    metadata_buffer: Option<WriteBuffer<Metadata>>,
    metadata_cache: Box<dyn MetadataCache>,
    parallelism: ParallelismHandle,
    desired: usize,
    in_flight: usize,
    /// Bumped whenever the buffers are recreated.
    generation: u64,
}

impl Manager {
    fn tick_period(&self) -> Duration {
        self.cfg.flush_interval.clamp(MIN_TICK, MAX_TICK)
    }

    fn new_ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval(self.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    fn wants_more(&self) -> bool {
        // The extra batch accounts for metadata.
        self.pending.total_len() <= self.cfg.batch_count * (self.desired + 1)
    }

    fn create_buffers(&mut self, now: Instant) {
        self.metric_buffers = (0..self.desired)
            .map(|id| WriteBuffer::new(id, self.cfg.batch_count, now))
            .collect();
        self.metadata_buffer = self
            .cfg
            .remote_write_v1()
            .then(|| WriteBuffer::new(0, self.cfg.batch_count, now));
    }

    async fn run(mut self, cancel: CancellationToken, stop: CancellationToken) {
        debug!(
            "Network manager started with {} connections to {}",
            self.desired, self.cfg.url
        );
        let mut ticker = self.new_ticker();

        loop {
            let wants_more = self.wants_more();
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = stop.cancelled() => break,
                Some(mut callback) = self.config_inbox.recv() => {
                    let cfg = callback.value.clone();
                    let desired = self.desired;
                    let result = self.update_config(cfg, desired, &cancel);
                    if let Err(e) = &result {
                        warn!("Rejected network configuration: {}", e);
                    }
                    callback.notify(result);
                    if ticker.period() != self.tick_period() {
                        ticker = self.new_ticker();
                    }
                    self.distribute_and_send(&cancel);
                }
                Some(desired) = self.desired_inbox.recv() => {
                    let cfg = (*self.cfg).clone();
                    if let Err(e) = self.update_config(cfg, desired, &cancel) {
                        debug!("Failed to apply desired connections {}: {}", desired, e);
                    }
                    self.distribute_and_send(&cancel);
                }
                Some(done) = self.completions_rx.recv() => {
                    self.finish_send(done);
                    self.distribute_and_send(&cancel);
                }
                Some(batch) = self.input.recv(), if wants_more => {
                    self.ingest(batch);
                    self.distribute_and_send(&cancel);
                }
                _ = ticker.tick() => {
                    self.distribute_and_send(&cancel);
                }
            }
        }

        debug!(
            "Network manager stopped with {} items pending and {} requests in flight",
            self.pending.total_len(),
            self.in_flight
        );
    }

    fn ingest(&mut self, batch: EncodedBatch) {
        let raw = match batch.decode() {
            Ok(raw) => raw,
            Err(e) => {
                error!("Dropping batch that failed to decode: {}", e);
                return;
            }
        };
        match self.format.unmarshal(&batch.meta, &raw) {
            Ok(records) => self.add_pending(records),
            Err(e) => error!("Dropping batch that failed to unmarshal: {}", e),
        }
    }

    fn add_pending(&mut self, records: Vec<Record>) {
        let v1 = self.cfg.remote_write_v1();
        for record in records {
            match record {
                Record::Metric(metric) => self.pending.add_metric(metric),
                Record::Metadata(metadata) if v1 => self.pending.add_metadata(metadata),
                Record::Metadata(metadata) => {
                    match prompb::MetricMetadata::decode(metadata.bytes()) {
                        Ok(md) => self.metadata_cache.set(md),
                        Err(e) => warn!("Failed to add metadata to cache: {}", e),
                    }
                }
            }
        }
    }

    fn distribute_and_send(&mut self, cancel: &CancellationToken) {
        self.distribute();
        self.check_and_send(cancel);
    }

    fn distribute(&mut self) {
        for (shard, buffer) in self.metric_buffers.iter_mut().enumerate() {
            if buffer.is_sending() || buffer.remaining_capacity() == 0 {
                continue;
            }
            buffer.add(self.pending.pull_metrics(shard, buffer.remaining_capacity()));
        }
        if let Some(buffer) = self.metadata_buffer.as_mut() {
            if !buffer.is_sending() && buffer.remaining_capacity() > 0 {
                buffer.add(self.pending.pull_metadata(buffer.remaining_capacity()));
            }
        }
    }

    fn check_and_send(&mut self, cancel: &CancellationToken) {
        let now = Instant::now();
        let flush_interval = self.cfg.flush_interval;

        for shard in 0..self.metric_buffers.len() {
            if self.in_flight >= self.desired {
                return;
            }
            if !self.metric_buffers[shard].ready(now, flush_interval) {
                continue;
            }
            let items = self.metric_buffers[shard].take_for_send(now);
            let request = if self.cfg.remote_write_v2() {
                build_v2_request(&items, self.metadata_cache.as_mut())
            } else {
                build_v1_request::<_, Metadata>(&items, &[])
            };
            // Returns the envelopes to the pool.
            drop(items);
            match request {
                Ok(request) => self.spawn_send(request, BufferTarget::Metric(shard), cancel),
                Err(e) => {
                    error!("Failed to build remote write request: {}", e);
                    self.release_buffer(BufferTarget::Metric(shard));
                }
            }
        }

        if self.in_flight >= self.desired {
            return;
        }
        let items = match self.metadata_buffer.as_mut() {
            Some(buffer) if buffer.ready(now, flush_interval) => buffer.take_for_send(now),
            _ => return,
        };
        match build_v1_request::<Metric, _>(&[], &items) {
            Ok(request) => self.spawn_send(request, BufferTarget::Metadata, cancel),
            Err(e) => {
                error!("Failed to build metadata request: {}", e);
                self.release_buffer(BufferTarget::Metadata);
            }
        }
    }

    fn spawn_send(
        &mut self,
        request: PreparedRequest,
        target: BufferTarget,
        cancel: &CancellationToken,
    ) {
        let summary = request.summary;
        if summary.series + summary.histograms + summary.metadata == 0 {
            self.release_buffer(target);
            return;
        }

        self.in_flight += 1;
        let kind = match target {
            BufferTarget::Metric(_) => RequestKind::Series,
            BufferTarget::Metadata => RequestKind::Metadata,
        };
        let client = self.client.clone();
        let template = Arc::clone(&self.template);
        let hub = self.hub.clone();
        let cancel = cancel.clone();
        let tx = self.completions_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            send_with_retry(&client, &template, request, kind, &hub, &cancel).await;
            // The manager may already be gone.
            let _ = tx.send(Completion { generation, target });
        });
    }

    fn finish_send(&mut self, done: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        // Completions of replaced buffers only free the connection.
        if done.generation == self.generation {
            self.release_buffer(done.target);
        }
    }

    fn release_buffer(&mut self, target: BufferTarget) {
        match target {
            BufferTarget::Metric(shard) => {
                if let Some(buffer) = self.metric_buffers.get_mut(shard) {
                    buffer.finish_send();
                }
            }
            BufferTarget::Metadata => {
                if let Some(buffer) = self.metadata_buffer.as_mut() {
                    buffer.finish_send();
                }
            }
        }
    }

    /// Applies `cfg` with `desired` connections. Everything that can fail
    /// happens before any state changes, so a rejected update leaves the
    /// previous configuration in place. Returns whether anything changed.
    fn update_config(
        &mut self,
        cfg: ConnectionConfig,
        desired: usize,
        cancel: &CancellationToken,
    ) -> Result<bool, ConfigError> {
        let config_changed = self.cfg.network_differs(&cfg);
        if !config_changed && desired == self.desired {
            if cfg != *self.cfg {
                self.cfg = Arc::new(cfg);
            }
            return Ok(false);
        }

        let (client, template) = if config_changed {
            cfg.validate()?;
            let client = build_client(&cfg.to_http_client_config()?)?;
            (client, Arc::new(RequestTemplate::new(&cfg)?))
        } else {
            (self.client.clone(), Arc::clone(&self.template))
        };

        let desired = if config_changed && cfg.parallelism != self.cfg.parallelism {
            self.parallelism.update_config(cfg.parallelism.clone());
            self.parallelism.desired()
        } else {
            desired.clamp(cfg.parallelism.min_connections, cfg.parallelism.max_connections)
        };

        debug!(
            "Recreating write buffers with {} connections due to configuration change",
            desired
        );
        let previous_v1 = self.cfg.remote_write_v1();
        self.cfg = Arc::new(cfg);
        self.client = client;
        self.template = template;
        self.desired = desired;
        self.generation += 1;
        self.pending.reshard(desired);

        let drained: Vec<Metric> = self
            .metric_buffers
            .iter_mut()
            .flat_map(WriteBuffer::drain)
            .collect();
        self.pending.requeue_metrics(drained);

        // A new endpoint needs all metadata again.
        if config_changed {
            self.metadata_cache = new_metadata_cache(&self.cfg);
        }
        if previous_v1 {
            if let Some(mut buffer) = self.metadata_buffer.take() {
                let drained = buffer.drain().into_iter().map(Record::Metadata).collect();
                self.add_pending(drained);
            }
        }

        self.create_buffers(Instant::now());
        self.check_and_send(cancel);
        Ok(true)
    }
}

struct ClientState {
    manager: Option<Manager>,
    parallelism: Option<ParallelismService>,
    task: Option<JoinHandle<()>>,
}

/// Prometheus remote-write client fed with encoded batches.
pub struct RemoteWriteClient {
    config_inbox: ConfigInbox,
    stop: CancellationToken,
    state: Mutex<ClientState>,
}

impl RemoteWriteClient {
    /// Validates `cfg` and prepares the sender pool. Nothing runs until
    /// [`NetworkClient::start`].
    pub fn new(
        cfg: ConnectionConfig,
        hub: StatsHub,
        input: Mailbox<EncodedBatch>,
    ) -> Result<Self, ConfigError> {
        Self::with_pool(cfg, hub, input, MetricPool::default())
    }

    pub fn with_pool(
        cfg: ConnectionConfig,
        hub: StatsHub,
        input: Mailbox<EncodedBatch>,
        pool: MetricPool,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let client = build_client(&cfg.to_http_client_config()?)?;
        let template = Arc::new(RequestTemplate::new(&cfg)?);

        let desired_inbox = Mailbox::new();
        let (parallelism_service, parallelism) =
            ParallelismService::new(cfg.parallelism.clone(), hub.clone(), desired_inbox.clone());
        let desired = parallelism.desired();
        let config_inbox = ConfigInbox::new();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let mut manager = Manager {
            metadata_cache: new_metadata_cache(&cfg),
            cfg: Arc::new(cfg),
            template,
            client,
            hub,
            input,
            config_inbox: config_inbox.clone(),
            desired_inbox,
            completions_tx,
            completions_rx,
            format: Format::with_pool(pool),
            pending: Pending::new(desired),
            metric_buffers: Vec::new(),
            metadata_buffer: None,
            parallelism,
            desired,
            in_flight: 0,
            generation: 0,
        };
        manager.create_buffers(Instant::now());

        Ok(Self {
            config_inbox,
            stop: CancellationToken::new(),
            state: Mutex::new(ClientState {
                manager: Some(manager),
                parallelism: Some(parallelism_service),
                task: None,
            }),
        })
    }
}

#[async_trait]
impl NetworkClient for RemoteWriteClient {
    fn start(&self, cancel: CancellationToken) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        let (Some(manager), Some(parallelism)) = (state.manager.take(), state.parallelism.take())
        else {
            warn!("Network client already started");
            return;
        };

        let controller_cancel = cancel.child_token();
        tokio::spawn(parallelism.run(controller_cancel.clone()));
        let stop = self.stop.clone();
        state.task = Some(tokio::spawn(async move {
            manager.run(cancel, stop).await;
            controller_cancel.cancel();
        }));
    }

    async fn stop(&self) {
        self.stop.cancel();
        self.config_inbox.close();
        let task = {
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            state.task.take()
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Network manager task failed: {}", e);
            }
        }
    }

    async fn update_config(
        &self,
        cancel: &CancellationToken,
        cfg: ConnectionConfig,
    ) -> Result<bool, UpdateError> {
        let applied = self.config_inbox.send(cancel, cfg).await?;
        Ok(applied?)
    }
}
