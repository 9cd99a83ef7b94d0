// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server};
use prost::Message;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use walqueue::{
    batch::EncodedBatch,
    format::PrometheusMetric,
    labels::Labels,
    mailbox::Mailbox,
    network::{ConnectionConfig, NetworkClient, ParallelismConfig, ProtobufMessage, RemoteWriteClient},
    prompb::{self, metric_metadata::MetricType},
    serializer::{MetadataSignal, SerializerConfig, SerializerHandle, SerializerService},
    stats::{NetworkStats, StatsHub},
};

struct Pipeline {
    serializer: SerializerHandle,
    client: RemoteWriteClient,
    cancel: CancellationToken,
}

impl Pipeline {
    fn start(cfg: ConnectionConfig, serializer_cfg: SerializerConfig, hub: StatsHub) -> Self {
        let batches: Mailbox<EncodedBatch> = Mailbox::new();
        let client = RemoteWriteClient::new(cfg, hub.clone(), batches.clone())
            .expect("failed to create network client");
        let (service, serializer) = SerializerService::new(serializer_cfg, hub, batches);
        let cancel = CancellationToken::new();
        client.start(cancel.clone());
        tokio::spawn(service.run(cancel.clone()));
        Self {
            serializer,
            client,
            cancel,
        }
    }

    async fn shutdown(self) {
        self.serializer.stop();
        self.client.stop().await;
        self.cancel.cancel();
    }
}

fn connection(url: String) -> ConnectionConfig {
    ConnectionConfig {
        url,
        timeout: Duration::from_secs(5),
        retry_backoff: Duration::from_millis(10),
        batch_count: 10,
        flush_interval: Duration::from_millis(50),
        parallelism: ParallelismConfig {
            min_connections: 1,
            max_connections: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn serializer_config() -> SerializerConfig {
    SerializerConfig {
        max_signals_in_batch: 100,
        flush_interval: Duration::from_millis(20),
        external_labels: Labels::from_pairs([("cluster", "eu-1")]),
        ..Default::default()
    }
}

fn sample(name: &str, ts: i64, value: f64) -> PrometheusMetric {
    PrometheusMetric::float(
        ts,
        value,
        Labels::from_pairs([("__name__", name), ("job", "node")]),
    )
}

type Bodies = Arc<Mutex<Vec<Vec<u8>>>>;

/// Records every request body the mock answers. The response body is empty.
fn capture_bodies() -> (
    Bodies,
    impl Fn(&mockito::Request) -> Vec<u8> + Send + Sync + 'static,
) {
    let bodies = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&bodies);
    let responder = move |req: &mockito::Request| {
        if let Ok(body) = req.body() {
            sink.lock().expect("lock poisoned").push(body.clone());
        }
        Vec::new()
    };
    (bodies, responder)
}

fn collect_network_stats(hub: &StatsHub) -> (Arc<Mutex<Vec<NetworkStats>>>, impl FnOnce()) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let release = hub.register_series_network(move |ns| {
        sink.lock().expect("lock poisoned").push(*ns);
    });
    (seen, release)
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

fn unsnappy(body: &[u8]) -> Vec<u8> {
    snap::raw::Decoder::new()
        .decompress_vec(body)
        .expect("body is not snappy")
}

#[tokio::test]
async fn pipeline_ships_v1_series() {
    let mut server = Server::new_async().await;
    let (bodies, responder) = capture_bodies();
    let mock = server
        .mock("POST", "/api/v1/push")
        .match_header("content-type", "application/x-protobuf")
        .match_header("content-encoding", "snappy")
        .match_header("x-prometheus-remote-write-version", "0.1.0")
        .match_header("user-agent", Matcher::Regex("^walqueue/".to_string()))
        .with_status(204)
        .with_body_from_request(responder)
        .expect_at_least(1)
        .create_async()
        .await;

    let hub = StatsHub::new();
    let (seen, release) = collect_network_stats(&hub);
    let pipeline = Pipeline::start(
        connection(format!("{}/api/v1/push", server.url())),
        serializer_config(),
        hub,
    );
    let cancel = CancellationToken::new();
    pipeline
        .serializer
        .send_metric(&cancel, sample("up", 1_000, 1.0))
        .expect("send failed");
    pipeline
        .serializer
        .send_metric(&cancel, sample("load", 2_000, 0.5))
        .expect("send failed");

    wait_until("series to be sent", || {
        seen.lock()
            .expect("lock poisoned")
            .iter()
            .map(|s| s.series.series_sent)
            .sum::<u64>()
            == 2
    })
    .await;
    pipeline.shutdown().await;
    release();
    mock.assert_async().await;

    let timeseries: Vec<prompb::TimeSeries> = bodies
        .lock()
        .expect("lock poisoned")
        .iter()
        .flat_map(|body| {
            prompb::WriteRequest::decode(unsnappy(body).as_slice())
                .expect("bad write request")
                .timeseries
        })
        .collect();
    assert_eq!(timeseries.len(), 2);
    let mut names: Vec<&str> = timeseries
        .iter()
        .filter_map(prompb::TimeSeries::metric_name)
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["load", "up"]);
    for series in &timeseries {
        let last = series.labels.last().expect("labels missing");
        assert_eq!((last.name.as_str(), last.value.as_str()), ("cluster", "eu-1"));
    }
    let newest = seen
        .lock()
        .expect("lock poisoned")
        .iter()
        .map(|s| s.newest_timestamp_seconds)
        .max();
    assert_eq!(newest, Some(2));
}

#[tokio::test]
async fn pipeline_ships_v2_with_sparse_metadata() {
    let mut server = Server::new_async().await;
    let (bodies, responder) = capture_bodies();
    let mock = server
        .mock("POST", "/api/v1/push")
        .match_header(
            "content-type",
            "application/x-protobuf;proto=io.prometheus.write.v2.Request",
        )
        .match_header("x-prometheus-remote-write-version", "2.0.0")
        .with_status(204)
        .with_body_from_request(responder)
        .expect(2)
        .create_async()
        .await;

    let hub = StatsHub::new();
    let (seen, release) = collect_network_stats(&hub);
    let cfg = ConnectionConfig {
        protobuf_message: ProtobufMessage::V2,
        enable_metadata_cache: true,
        ..connection(format!("{}/api/v1/push", server.url()))
    };
    let pipeline = Pipeline::start(cfg, serializer_config(), hub);
    let cancel = CancellationToken::new();
    pipeline
        .serializer
        .send_metadata(
            &cancel,
            MetadataSignal {
                name: "requests_total".to_string(),
                help: "Requests served.".to_string(),
                metric_type: "counter".to_string(),
                ..Default::default()
            },
        )
        .expect("send failed");
    pipeline
        .serializer
        .send_metric(&cancel, sample("requests_total", 1_000, 3.0))
        .expect("send failed");

    wait_until("first request", || {
        seen.lock()
            .expect("lock poisoned")
            .iter()
            .any(|s| s.series.series_sent > 0)
    })
    .await;

    // The family's metadata went out already and is not repeated.
    pipeline
        .serializer
        .send_metric(&cancel, sample("requests_total", 2_000, 4.0))
        .expect("send failed");
    wait_until("second request", || {
        seen.lock()
            .expect("lock poisoned")
            .iter()
            .map(|s| s.series.series_sent)
            .sum::<u64>()
            == 2
    })
    .await;
    pipeline.shutdown().await;
    release();
    mock.assert_async().await;

    let bodies = bodies.lock().expect("lock poisoned");
    assert_eq!(bodies.len(), 2);
    let first = prompb::v2::Request::decode(unsnappy(&bodies[0]).as_slice())
        .expect("bad v2 request");
    assert_eq!(first.symbols.first().map(String::as_str), Some(""));
    let series = &first.timeseries[0];
    let labels: Vec<&str> = series
        .labels_refs
        .iter()
        .map(|r| first.symbols[*r as usize].as_str())
        .collect();
    assert_eq!(
        labels,
        vec!["__name__", "requests_total", "job", "node", "cluster", "eu-1"]
    );
    let md = series.metadata.expect("metadata attached");
    assert_eq!(md.r#type, MetricType::Counter as i32);
    assert_eq!(first.symbols[md.help_ref as usize], "Requests served.");

    let second = prompb::v2::Request::decode(unsnappy(&bodies[1]).as_slice())
        .expect("bad v2 request");
    assert!(second.timeseries[0].metadata.is_none());
}

#[tokio::test]
async fn retries_are_bounded_by_max_attempts() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(503)
        .expect(3)
        .create_async()
        .await;

    let hub = StatsHub::new();
    let (seen, release) = collect_network_stats(&hub);
    let cfg = ConnectionConfig {
        max_retry_attempts: 2,
        ..connection(server.url())
    };
    let pipeline = Pipeline::start(cfg, serializer_config(), hub);
    pipeline
        .serializer
        .send_metric(&CancellationToken::new(), sample("up", 1_000, 1.0))
        .expect("send failed");

    wait_until("the request to fail", || {
        seen.lock()
            .expect("lock poisoned")
            .iter()
            .any(|s| s.series.failed_samples > 0)
    })
    .await;
    // Give a stray fourth attempt the chance to show up.
    sleep(Duration::from_millis(100)).await;
    pipeline.shutdown().await;
    release();
    mock.assert_async().await;

    let seen = seen.lock().expect("lock poisoned");
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|s| s.series.retried_samples_5xx == 1));
    assert_eq!(seen.iter().map(|s| s.series.failed_samples).sum::<u64>(), 1);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/")
        .with_status(400)
        .with_body("out of order sample")
        .expect(1)
        .create_async()
        .await;

    let hub = StatsHub::new();
    let (seen, release) = collect_network_stats(&hub);
    let pipeline = Pipeline::start(connection(server.url()), serializer_config(), hub);
    pipeline
        .serializer
        .send_metric(&CancellationToken::new(), sample("up", 1_000, 1.0))
        .expect("send failed");

    wait_until("the request to be rejected", || {
        !seen.lock().expect("lock poisoned").is_empty()
    })
    .await;
    sleep(Duration::from_millis(100)).await;
    pipeline.shutdown().await;
    release();
    mock.assert_async().await;

    let seen = seen.lock().expect("lock poisoned");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].series.failed_samples, 1);
    assert_eq!(seen[0].series.retried_samples, 0);
}

#[tokio::test]
async fn config_update_redirects_traffic() {
    let mut old_server = Server::new_async().await;
    let old = old_server
        .mock("POST", "/")
        .with_status(204)
        .expect(0)
        .create_async()
        .await;
    let mut new_server = Server::new_async().await;
    let new = new_server
        .mock("POST", "/")
        .match_header("x-scope-orgid", "tenant-1")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let hub = StatsHub::new();
    let (seen, release) = collect_network_stats(&hub);
    let pipeline = Pipeline::start(connection(old_server.url()), serializer_config(), hub);
    let cancel = CancellationToken::new();

    let mut cfg = connection(new_server.url());
    cfg.headers
        .insert("X-Scope-OrgID".to_string(), "tenant-1".to_string());
    assert!(pipeline
        .client
        .update_config(&cancel, cfg.clone())
        .await
        .expect("update failed"));
    assert!(!pipeline
        .client
        .update_config(&cancel, cfg)
        .await
        .expect("update failed"));

    pipeline
        .serializer
        .send_metric(&cancel, sample("up", 1_000, 1.0))
        .expect("send failed");
    wait_until("series to be sent", || {
        !seen.lock().expect("lock poisoned").is_empty()
    })
    .await;
    pipeline.shutdown().await;
    release();
    old.assert_async().await;
    new.assert_async().await;
}

#[tokio::test]
async fn stop_drops_batches_still_buffered() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/push")
        .with_status(204)
        .expect(0)
        .create_async()
        .await;

    let hub = StatsHub::new();
    let flushed = Arc::new(Mutex::new(0u64));
    let sink = Arc::clone(&flushed);
    let release = hub.register_serializer(move |ss| {
        *sink.lock().expect("lock poisoned") += ss.series_stored;
    });
    let mut cfg = connection(format!("{}/api/v1/push", server.url()));
    cfg.flush_interval = Duration::from_secs(60);
    let pipeline = Pipeline::start(cfg, serializer_config(), hub);

    let cancel = CancellationToken::new();
    pipeline
        .serializer
        .send_metric(&cancel, sample("up", 1_000, 1.0))
        .expect("send failed");
    pipeline.serializer.stop();
    wait_until("serializer to flush", || {
        *flushed.lock().expect("lock poisoned") == 1
    })
    .await;
    // Below batch_count and well within flush_interval, so nothing is due.
    sleep(Duration::from_millis(100)).await;

    pipeline.shutdown().await;
    release();
    mock.assert_async().await;
}
