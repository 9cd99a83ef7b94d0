// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote-write requests: building, sending with retries and the per-shard
//! buffers that feed them.

use std::collections::HashMap;
use std::time::Duration;

use prost::Message;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{StatusCode, Url};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::datum::{Datum, MetricDatum};
use crate::errors::{ConfigError, EncodeError};
use crate::network::config::{BasicAuth, ConnectionConfig};
use crate::network::metadata_cache::MetadataCache;
use crate::prompb::{self, metric_metadata::MetricType, v2};
use crate::stats::{CategoryStats, NetworkStats, StatsHub};

const CONTENT_TYPE_V1: &str = "application/x-protobuf";
const CONTENT_TYPE_V2: &str = "application/x-protobuf;proto=io.prometheus.write.v2.Request";
const REMOTE_WRITE_VERSION_HEADER: &str = "x-prometheus-remote-write-version";
const REMOTE_WRITE_VERSION_V1: &str = "0.1.0";
const REMOTE_WRITE_VERSION_V2: &str = "2.0.0";

/// Which stats channel a request reports to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    Series,
    Metadata,
}

/// What a request carries, for stats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestSummary {
    pub series: u64,
    pub histograms: u64,
    pub metadata: u64,
    pub newest_timestamp_ms: i64,
    /// Compressed body size.
    pub bytes: u64,
}

/// A snappy-compressed request body.
#[derive(Clone, Debug)]
pub struct PreparedRequest {
    pub body: Vec<u8>,
    pub summary: RequestSummary,
}

fn compress(raw: &[u8], mut summary: RequestSummary) -> Result<PreparedRequest, EncodeError> {
    let body = snap::raw::Encoder::new()
        .compress_vec(raw)
        .map_err(|e| EncodeError::Compress(e.to_string()))?;
    summary.bytes = body.len() as u64;
    Ok(PreparedRequest { body, summary })
}

fn count_metric<M: MetricDatum>(summary: &mut RequestSummary, metric: &M) {
    if metric.is_histogram() {
        summary.histograms += 1;
    } else {
        summary.series += 1;
    }
    summary.newest_timestamp_ms = summary.newest_timestamp_ms.max(metric.timestamp_ms());
}

/// Builds a `prometheus.WriteRequest`. Undecodable records are skipped.
pub fn build_v1_request<M, D>(metrics: &[M], metadata: &[D]) -> Result<PreparedRequest, EncodeError>
where
    M: MetricDatum,
    D: Datum,
{
    let mut summary = RequestSummary::default();
    let mut request = prompb::WriteRequest {
        timeseries: Vec::with_capacity(metrics.len()),
        metadata: Vec::with_capacity(metadata.len()),
    };

    for metric in metrics {
        match prompb::TimeSeries::decode(metric.bytes()) {
            Ok(ts) => {
                count_metric(&mut summary, metric);
                request.timeseries.push(ts);
            }
            Err(e) => warn!("Dropping undecodable series: {}", e),
        }
    }
    for md in metadata {
        match prompb::MetricMetadata::decode(md.bytes()) {
            Ok(md) => {
                summary.metadata += 1;
                request.metadata.push(md);
            }
            Err(e) => warn!("Dropping undecodable metadata: {}", e),
        }
    }

    compress(&request.encode_to_vec(), summary)
}

/// Interns strings for a v2 request. Index 0 is always the empty string.
#[derive(Debug)]
struct SymbolTable {
    symbols: Vec<String>,
    index: HashMap<String, u32>,
}

impl SymbolTable {
    fn new() -> Self {
        Self {
            symbols: vec![String::new()],
            index: HashMap::from([(String::new(), 0)]),
        }
    }

    fn symbolize(&mut self, value: &str) -> u32 {
        if let Some(i) = self.index.get(value) {
            return *i;
        }
        let i = self.symbols.len() as u32;
        self.symbols.push(value.to_string());
        self.index.insert(value.to_string(), i);
        i
    }

    fn label_refs(&mut self, labels: &[prompb::Label]) -> Vec<u32> {
        let mut refs = Vec::with_capacity(labels.len() * 2);
        for label in labels {
            refs.push(self.symbolize(&label.name));
            refs.push(self.symbolize(&label.value));
        }
        refs
    }
}

/// Builds an `io.prometheus.write.v2.Request`, attaching metadata from the
/// cache to the first series of each family that still needs it.
pub fn build_v2_request<M>(
    metrics: &[M],
    cache: &mut dyn MetadataCache,
) -> Result<PreparedRequest, EncodeError>
where
    M: MetricDatum,
{
    let mut summary = RequestSummary::default();
    let mut symbols = SymbolTable::new();
    let mut timeseries = Vec::with_capacity(metrics.len());

    for metric in metrics {
        let ts = match prompb::TimeSeries::decode(metric.bytes()) {
            Ok(ts) => ts,
            Err(e) => {
                warn!("Dropping undecodable series: {}", e);
                continue;
            }
        };
        count_metric(&mut summary, metric);

        let metadata = ts
            .metric_name()
            .and_then(|name| cache.take_unsent(name))
            .map(|md| {
                summary.metadata += 1;
                let metric_type = MetricType::try_from(md.r#type).unwrap_or(MetricType::Unknown);
                v2::Metadata {
                    r#type: metric_type as i32,
                    help_ref: symbols.symbolize(&md.help),
                    unit_ref: symbols.symbolize(&md.unit),
                }
            });

        let exemplars = ts
            .exemplars
            .iter()
            .map(|e| v2::Exemplar {
                labels_refs: symbols.label_refs(&e.labels),
                value: e.value,
                timestamp: e.timestamp,
            })
            .collect();

        timeseries.push(v2::TimeSeries {
            labels_refs: symbols.label_refs(&ts.labels),
            samples: ts.samples,
            histograms: ts.histograms,
            exemplars,
            metadata,
            created_timestamp: 0,
        });
    }

    let request = v2::Request {
        symbols: symbols.symbols,
        timeseries,
    };
    compress(&request.encode_to_vec(), summary)
}

/// Everything about a request that only changes with the configuration.
#[derive(Clone, Debug)]
pub struct RequestTemplate {
    url: Url,
    headers: HeaderMap,
    basic_auth: Option<BasicAuth>,
    bearer_token: Option<String>,
    retry_backoff: Duration,
    max_retry_attempts: u32,
}

impl RequestTemplate {
    /// Custom headers go first so the protocol headers always win.
    pub fn new(cfg: &ConnectionConfig) -> Result<Self, ConfigError> {
        let url = Url::parse(&cfg.url).map_err(|e| ConfigError::InvalidUrl {
            url: cfg.url.clone(),
            reason: e.to_string(),
        })?;
        let has_auth = cfg.basic_auth.is_some() || cfg.bearer_token.is_some();

        let mut headers = HeaderMap::new();
        for (name, value) in &cfg.headers {
            let invalid = |reason: String| ConfigError::InvalidHeader {
                name: name.clone(),
                reason,
            };
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
            if has_auth && header_name == AUTHORIZATION {
                warn!("Ignoring custom Authorization header, credentials are configured");
                continue;
            }
            let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
            headers.insert(header_name, header_value);
        }

        let (content_type, version) = if cfg.remote_write_v2() {
            (CONTENT_TYPE_V2, REMOTE_WRITE_VERSION_V2)
        } else {
            (CONTENT_TYPE_V1, REMOTE_WRITE_VERSION_V1)
        };
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static(content_type),
        );
        headers.insert(
            reqwest::header::CONTENT_ENCODING,
            HeaderValue::from_static("snappy"),
        );
        headers.insert(
            HeaderName::from_static(REMOTE_WRITE_VERSION_HEADER),
            HeaderValue::from_static(version),
        );
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_str(&cfg.user_agent).map_err(|e| ConfigError::InvalidHeader {
                name: "User-Agent".to_string(),
                reason: e.to_string(),
            })?,
        );

        Ok(Self {
            url,
            headers,
            basic_auth: cfg.basic_auth.clone(),
            bearer_token: cfg.bearer_token.clone(),
            retry_backoff: cfg.retry_backoff,
            max_retry_attempts: cfg.max_retry_attempts,
        })
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Delay before the attempt following `attempt`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff + self.retry_backoff * attempt
    }

    fn request(&self, client: &reqwest::Client, body: Vec<u8>) -> reqwest::RequestBuilder {
        let mut builder = client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .body(body);
        if let Some(auth) = &self.basic_auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        } else if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Failed,
    Cancelled,
}

#[derive(Debug)]
enum Attempt {
    Success,
    Throttled,
    ServerError(StatusCode),
    Transport(reqwest::Error),
    Rejected(StatusCode),
}

impl Attempt {
    fn recoverable(&self) -> bool {
        matches!(
            self,
            Attempt::Throttled | Attempt::ServerError(_) | Attempt::Transport(_)
        )
    }
}

async fn classify(result: Result<reqwest::Response, reqwest::Error>) -> Attempt {
    let response = match result {
        Ok(response) => response,
        Err(e) => return Attempt::Transport(e),
    };
    let status = response.status();
    if status.is_success() {
        return Attempt::Success;
    }
    // Only read the body when it helps diagnosing a failure.
    let body = response.text().await.unwrap_or_default();
    debug!("Remote write returned {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS {
        Attempt::Throttled
    } else if status.is_server_error() {
        Attempt::ServerError(status)
    } else {
        Attempt::Rejected(status)
    }
}

fn attempt_stats(
    summary: &RequestSummary,
    kind: RequestKind,
    attempt: &Attempt,
    exhausted: bool,
    send_duration: Duration,
) -> NetworkStats {
    let apply = |n: u64| {
        let mut c = CategoryStats::default();
        match attempt {
            Attempt::Success => c.series_sent = n,
            Attempt::Throttled => {
                c.retried_samples = n;
                c.retried_samples_429 = n;
            }
            Attempt::ServerError(_) => {
                c.retried_samples = n;
                c.retried_samples_5xx = n;
            }
            Attempt::Transport(_) => c.retried_samples = n,
            Attempt::Rejected(_) => c.failed_samples = n,
        }
        if exhausted {
            c.failed_samples = n;
        }
        c
    };

    let mut stats = NetworkStats {
        series: apply(summary.series),
        histogram: apply(summary.histograms),
        metadata: apply(summary.metadata),
        send_duration,
        ..Default::default()
    };
    if matches!(attempt, Attempt::Success) {
        stats.newest_timestamp_seconds = summary.newest_timestamp_ms / 1000;
        match kind {
            RequestKind::Series => stats.series_bytes = summary.bytes,
            RequestKind::Metadata => stats.metadata_bytes = summary.bytes,
        }
    }
    stats
}

/// Sends `request`, retrying recoverable failures up to `max_retry_attempts`
/// times. Every attempt is reported on `hub`.
pub async fn send_with_retry(
    client: &reqwest::Client,
    template: &RequestTemplate,
    request: PreparedRequest,
    kind: RequestKind,
    hub: &StatsHub,
    cancel: &CancellationToken,
) -> SendOutcome {
    let report = |stats: NetworkStats| match kind {
        RequestKind::Series => hub.send_series_network_stats(stats),
        RequestKind::Metadata => hub.send_metadata_network_stats(stats),
    };
    let summary = request.summary;
    let builder = template.request(client, request.body);

    for attempt in 0..=template.max_retry_attempts {
        let Some(req) = builder.try_clone() else {
            error!("Unable to clone remote write request");
            return SendOutcome::Failed;
        };

        let start = Instant::now();
        let result = tokio::select! {
            result = req.send() => classify(result).await,
            () = cancel.cancelled() => return SendOutcome::Cancelled,
        };
        let last = attempt == template.max_retry_attempts;
        let exhausted = last && result.recoverable();
        report(attempt_stats(
            &summary,
            kind,
            &result,
            exhausted,
            start.elapsed(),
        ));

        match result {
            Attempt::Success => return SendOutcome::Sent,
            Attempt::Rejected(status) => {
                error!("Remote write rejected with status {}, not retrying", status);
                return SendOutcome::Failed;
            }
            other if exhausted => {
                error!(
                    "Remote write failed after {} attempts: {:?}",
                    attempt + 1,
                    other
                );
                return SendOutcome::Failed;
            }
            other => {
                let delay = template.backoff(attempt);
                debug!(
                    "Remote write attempt {} failed ({:?}), retrying in {:?}",
                    attempt + 1,
                    other,
                    delay
                );
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return SendOutcome::Cancelled,
                }
            }
        }
    }
    SendOutcome::Failed
}

/// Items waiting for one connection.
#[derive(Debug)]
pub struct WriteBuffer<T> {
    id: usize,
    items: Vec<T>,
    capacity: usize,
    sending: bool,
    last_attempted_send: Instant,
}

impl<T> WriteBuffer<T> {
    #[must_use]
    pub fn new(id: usize, capacity: usize, now: Instant) -> Self {
        Self {
            id,
            items: Vec::with_capacity(capacity),
            capacity,
            sending: false,
            last_attempted_send: now,
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.sending
    }

    #[must_use]
    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.items.len())
    }

    pub fn add(&mut self, items: impl IntoIterator<Item = T>) {
        self.items.extend(items);
    }

    /// Full, or the flush interval passed with something to send.
    #[must_use]
    pub fn ready(&self, now: Instant, flush_interval: Duration) -> bool {
        if self.sending || self.items.is_empty() {
            return false;
        }
        self.remaining_capacity() == 0
            || now.saturating_duration_since(self.last_attempted_send) > flush_interval
    }

    /// Hands the contents to a send and marks the buffer busy.
    pub fn take_for_send(&mut self, now: Instant) -> Vec<T> {
        self.sending = true;
        self.last_attempted_send = now;
        std::mem::replace(&mut self.items, Vec::with_capacity(self.capacity))
    }

    pub fn finish_send(&mut self) {
        self.sending = false;
    }

    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datum::{Metadata, Metric};
    use crate::network::metadata_cache::LruMetadataCache;
    use crate::stats::StatsHub;
    use std::sync::{Arc, Mutex};

    fn series(i: u64, name: &str, histogram: bool) -> Metric {
        let ts = prompb::TimeSeries {
            labels: vec![
                prompb::Label {
                    name: "__name__".to_string(),
                    value: name.to_string(),
                },
                prompb::Label {
                    name: "job".to_string(),
                    value: "test".to_string(),
                },
            ],
            samples: vec![prompb::Sample {
                value: i as f64,
                timestamp: 1_000 * i as i64,
            }],
            exemplars: vec![prompb::Exemplar {
                labels: vec![prompb::Label {
                    name: "trace_id".to_string(),
                    value: "abc".to_string(),
                }],
                value: 1.0,
                timestamp: 5,
            }],
            histograms: Vec::new(),
        };
        Metric::detached(i, 1_000 * i as i64, histogram, ts.encode_to_vec())
    }

    fn metadata(name: &str) -> prompb::MetricMetadata {
        prompb::MetricMetadata {
            r#type: MetricType::Gauge as i32,
            metric_family_name: name.to_string(),
            help: "help text".to_string(),
            unit: "seconds".to_string(),
        }
    }

    fn decompress(body: &[u8]) -> Vec<u8> {
        snap::raw::Decoder::new()
            .decompress_vec(body)
            .expect("decompress failed")
    }

    #[test]
    fn test_build_v1_request() {
        let metrics = vec![series(1, "up", false), series(3, "latency", true)];
        let meta = vec![Metadata::new(metadata("up").encode_to_vec())];
        let req = build_v1_request(&metrics, &meta).expect("build failed");

        assert_eq!(req.summary.series, 1);
        assert_eq!(req.summary.histograms, 1);
        assert_eq!(req.summary.metadata, 1);
        assert_eq!(req.summary.newest_timestamp_ms, 3_000);
        assert_eq!(req.summary.bytes, req.body.len() as u64);

        let wr = prompb::WriteRequest::decode(decompress(&req.body).as_slice())
            .expect("decode failed");
        assert_eq!(wr.timeseries.len(), 2);
        assert_eq!(wr.timeseries[0].metric_name(), Some("up"));
        assert_eq!(wr.metadata[0].unit, "seconds");
    }

    #[test]
    fn test_build_v1_skips_corrupt_series() {
        let metrics = vec![
            Metric::detached(1, 1, false, vec![0xff, 0xff, 0xff]),
            series(2, "up", false),
        ];
        let req = build_v1_request::<_, Metadata>(&metrics, &[]).expect("build failed");
        assert_eq!(req.summary.series, 1);
    }

    #[test]
    fn test_build_v2_request_with_sparse_metadata() {
        let mut cache = LruMetadataCache::new(10);
        cache.set(metadata("up"));
        let metrics = vec![
            series(1, "up", false),
            series(2, "up", false),
            series(3, "other", false),
        ];
        let req = build_v2_request(&metrics, &mut cache).expect("build failed");
        assert_eq!(req.summary.series, 3);
        assert_eq!(req.summary.metadata, 1);

        let request =
            v2::Request::decode(decompress(&req.body).as_slice()).expect("decode failed");
        assert_eq!(request.symbols[0], "");
        let resolve = |refs: &[u32]| -> Vec<String> {
            refs.iter()
                .map(|r| request.symbols[*r as usize].clone())
                .collect()
        };
        let first = &request.timeseries[0];
        assert_eq!(resolve(&first.labels_refs), vec!["__name__", "up", "job", "test"]);
        assert_eq!(resolve(&first.exemplars[0].labels_refs), vec!["trace_id", "abc"]);
        let md = first.metadata.expect("metadata attached");
        assert_eq!(md.r#type, MetricType::Gauge as i32);
        assert_eq!(request.symbols[md.help_ref as usize], "help text");
        assert_eq!(request.symbols[md.unit_ref as usize], "seconds");

        // Sent once per family.
        assert!(request.timeseries[1].metadata.is_none());
        assert!(request.timeseries[2].metadata.is_none());
        // Shared strings are interned once.
        assert_eq!(
            request.symbols.iter().filter(|s| s.as_str() == "job").count(),
            1
        );
    }

    #[test]
    fn test_template_headers() {
        let cfg = ConnectionConfig {
            url: "http://localhost:9009/api/v1/push".to_string(),
            user_agent: "test-client".to_string(),
            headers: [
                ("Content-Type", "text/plain"),
                ("User-Agent", "override-agent"),
                ("X-Scope-OrgID", "tenant-1"),
                ("Authorization", "Custom xyz"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            bearer_token: Some("token".to_string()),
            ..Default::default()
        };
        let template = RequestTemplate::new(&cfg).expect("template failed");
        let h = template.headers();
        assert_eq!(h["content-type"], CONTENT_TYPE_V1);
        assert_eq!(h["content-encoding"], "snappy");
        assert_eq!(h["user-agent"], "test-client");
        assert_eq!(h[REMOTE_WRITE_VERSION_HEADER], REMOTE_WRITE_VERSION_V1);
        assert_eq!(h["x-scope-orgid"], "tenant-1");
        assert!(h.get(AUTHORIZATION).is_none());

        let v2 = ConnectionConfig {
            protobuf_message: crate::network::config::ProtobufMessage::V2,
            ..cfg
        };
        let template = RequestTemplate::new(&v2).expect("template failed");
        assert_eq!(template.headers()["content-type"], CONTENT_TYPE_V2);
        assert_eq!(
            template.headers()[REMOTE_WRITE_VERSION_HEADER],
            REMOTE_WRITE_VERSION_V2
        );
    }

    #[test]
    fn test_template_rejects_bad_header() {
        let cfg = ConnectionConfig {
            url: "http://localhost".to_string(),
            headers: [("Bad Header".to_string(), "x".to_string())].into(),
            ..Default::default()
        };
        assert!(matches!(
            RequestTemplate::new(&cfg),
            Err(ConfigError::InvalidHeader { .. })
        ));
    }

    #[test]
    fn test_backoff_is_linear() {
        let cfg = ConnectionConfig {
            url: "http://localhost".to_string(),
            retry_backoff: Duration::from_millis(100),
            ..Default::default()
        };
        let template = RequestTemplate::new(&cfg).expect("template failed");
        assert_eq!(template.backoff(0), Duration::from_millis(100));
        assert_eq!(template.backoff(1), Duration::from_millis(200));
        assert_eq!(template.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_attempt_stats() {
        let summary = RequestSummary {
            series: 3,
            histograms: 1,
            metadata: 0,
            newest_timestamp_ms: 5_500,
            bytes: 42,
        };
        let ok = attempt_stats(
            &summary,
            RequestKind::Series,
            &Attempt::Success,
            false,
            Duration::ZERO,
        );
        assert_eq!(ok.total_sent(), 4);
        assert_eq!(ok.newest_timestamp_seconds, 5);
        assert_eq!(ok.series_bytes, 42);

        let throttled = attempt_stats(
            &summary,
            RequestKind::Series,
            &Attempt::Throttled,
            false,
            Duration::ZERO,
        );
        assert_eq!(throttled.total_429(), 4);
        assert_eq!(throttled.total_retried(), 4);
        assert_eq!(throttled.total_failed(), 0);
        assert_eq!(throttled.newest_timestamp_seconds, 0);

        let exhausted = attempt_stats(
            &summary,
            RequestKind::Series,
            &Attempt::ServerError(StatusCode::BAD_GATEWAY),
            true,
            Duration::ZERO,
        );
        assert_eq!(exhausted.total_5xx(), 4);
        assert_eq!(exhausted.total_failed(), 4);

        let rejected = attempt_stats(
            &summary,
            RequestKind::Metadata,
            &Attempt::Rejected(StatusCode::BAD_REQUEST),
            false,
            Duration::ZERO,
        );
        assert_eq!(rejected.total_failed(), 4);
        assert_eq!(rejected.total_retried(), 0);
        assert_eq!(rejected.metadata_bytes, 0);
    }

    #[test]
    fn test_write_buffer_readiness() {
        let start = Instant::now();
        let flush = Duration::from_secs(1);
        let mut buffer = WriteBuffer::new(0, 2, start);
        assert!(!buffer.ready(start + Duration::from_secs(5), flush));

        buffer.add([1]);
        assert!(!buffer.ready(start, flush));
        assert!(buffer.ready(start + Duration::from_secs(2), flush));

        buffer.add([2]);
        assert_eq!(buffer.remaining_capacity(), 0);
        assert!(buffer.ready(start, flush));

        assert_eq!(buffer.take_for_send(start), vec![1, 2]);
        assert!(buffer.is_sending());
        buffer.add([3]);
        assert!(!buffer.ready(start + Duration::from_secs(5), flush));
        buffer.finish_send();
        assert_eq!(buffer.drain(), vec![3]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_send_reports_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/push")
            .match_header("content-encoding", "snappy")
            .match_header("authorization", "Bearer secret")
            .with_status(204)
            .create_async()
            .await;

        let cfg = ConnectionConfig {
            url: format!("{}/api/v1/push", server.url()),
            bearer_token: Some("secret".to_string()),
            ..Default::default()
        };
        let template = RequestTemplate::new(&cfg).expect("template failed");
        let hub = StatsHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _release = hub.register_series_network(move |ns| {
            s.lock().expect("lock poisoned").push(*ns);
        });

        let request =
            build_v1_request::<_, Metadata>(&[series(2, "up", false)], &[]).expect("build failed");
        let outcome = send_with_retry(
            &reqwest::Client::new(),
            &template,
            request,
            RequestKind::Series,
            &hub,
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, SendOutcome::Sent);
        mock.assert_async().await;
        let seen = seen.lock().expect("lock poisoned");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].series.series_sent, 1);
        assert_eq!(seen[0].newest_timestamp_seconds, 2);
    }

    #[tokio::test]
    async fn test_send_cancelled_during_backoff() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(503)
            .expect_at_least(1)
            .create_async()
            .await;

        let cfg = ConnectionConfig {
            url: server.url(),
            retry_backoff: Duration::from_secs(60),
            max_retry_attempts: 5,
            ..Default::default()
        };
        let template = RequestTemplate::new(&cfg).expect("template failed");
        let hub = StatsHub::new();
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        let _release = hub.register_series_network(move |_| c.cancel());

        let request =
            build_v1_request::<_, Metadata>(&[series(1, "up", false)], &[]).expect("build failed");
        let outcome = send_with_retry(
            &reqwest::Client::new(),
            &template,
            request,
            RequestKind::Series,
            &hub,
            &cancel,
        )
        .await;
        assert_eq!(outcome, SendOutcome::Cancelled);
    }
}
