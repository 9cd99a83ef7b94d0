// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use walqueue::format::{PrometheusMetric, SampleValue};
use walqueue::histogram::{Histogram, Span};
use walqueue::labels::Labels;
use walqueue::serializer::{MetadataSignal, SerializerHandle, Signal};

const COUNTER: &str = "walqueue_agent_requests_total";
const HISTOGRAM: &str = "walqueue_agent_request_duration_seconds";

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Generates a fixed set of series, as if scraped from `series` targets.
pub struct Producer {
    handle: SerializerHandle,
    series: usize,
    scrapes: u64,
}

impl Producer {
    pub fn new(handle: SerializerHandle, series: usize) -> Self {
        Self {
            handle,
            series,
            scrapes: 0,
        }
    }

    fn metadata() -> [MetadataSignal; 2] {
        [
            MetadataSignal {
                name: COUNTER.to_string(),
                help: "Synthetic requests handled by a target.".to_string(),
                metric_type: "counter".to_string(),
                ..Default::default()
            },
            MetadataSignal {
                name: HISTOGRAM.to_string(),
                unit: "seconds".to_string(),
                help: "Synthetic request latency.".to_string(),
                metric_type: "histogram".to_string(),
            },
        ]
    }

    /// One scrape: family metadata, a counter per target and a native
    /// histogram shared by all targets.
    fn scrape(&mut self, timestamp_ms: i64) -> Vec<Signal> {
        self.scrapes += 1;
        let mut signals: Vec<Signal> = Self::metadata().into_iter().map(Signal::Metadata).collect();
        signals.reserve(self.series + 1);

        for target in 0..self.series {
            let labels = Labels::from_pairs([
                ("__name__", COUNTER.to_string()),
                ("instance", format!("target-{target}")),
                ("job", "walqueue-agent".to_string()),
            ]);
            let value = (self.scrapes * (target as u64 + 1)) as f64;
            signals.push(Signal::Metric(PrometheusMetric::float(
                timestamp_ms,
                value,
                labels,
            )));
        }

        let count = self.scrapes * self.series as u64;
        signals.push(Signal::Metric(PrometheusMetric {
            timestamp_ms,
            value: SampleValue::Histogram(Histogram {
                schema: 0,
                count,
                sum: count as f64 * 0.25,
                positive_spans: vec![Span {
                    offset: -2,
                    length: 2,
                }],
                // Deltas: half the observations in each bucket.
                positive_buckets: vec![(count / 2) as i64, 0],
                zero_count: count - 2 * (count / 2),
                ..Default::default()
            }),
            labels: Labels::from_pairs([
                ("__name__", HISTOGRAM),
                ("job", "walqueue-agent"),
            ]),
            exemplar: None,
        }));
        signals
    }

    pub async fn run(mut self, every: Duration, cancel: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let signals = self.scrape(now_ms());
                    let n = signals.len();
                    for signal in signals {
                        let sent = match signal {
                            Signal::Metric(m) => self.handle.send_metric(&cancel, m),
                            Signal::Metadata(md) => self.handle.send_metadata(&cancel, md),
                        };
                        if let Err(e) = sent {
                            error!("Failed to queue synthetic signal: {}", e);
                            return;
                        }
                    }
                    debug!("Queued {} synthetic signals", n);
                }
            }
        }
        debug!("Producer stopped after {} scrapes", self.scrapes);
    }
}
