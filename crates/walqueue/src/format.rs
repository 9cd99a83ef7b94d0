// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batch codec.
//!
//! A batch is a flat stream of `[tag: u8][varint length][protobuf payload]`
//! records. The record count travels next to the buffer in the batch metadata
//! under [`RECORD_COUNT_KEY`], so the decoder knows how many records to expect
//! and can tell a short buffer from a complete one.

use std::collections::HashMap;

use prost::Message;

use crate::datum::{FileFormat, Metadata, Metric, MetricEnvelope, Record, RecordTag};
use crate::errors::{DecodeError, EncodeError};
use crate::histogram::{FloatHistogram, Histogram};
use crate::labels::Labels;
use crate::pool::MetricPool;
use crate::prompb;

pub const RECORD_COUNT_KEY: &str = "record_count";
pub const VERSION_KEY: &str = "version";

#[derive(Clone, Debug, PartialEq)]
pub enum SampleValue {
    Float(f64),
    Histogram(Histogram),
    FloatHistogram(FloatHistogram),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Exemplar {
    pub labels: Labels,
    pub value: f64,
    pub timestamp_ms: i64,
    pub has_timestamp: bool,
}

/// One sample as produced by a scrape or a remote-write receiver.
#[derive(Clone, Debug, PartialEq)]
pub struct PrometheusMetric {
    pub timestamp_ms: i64,
    pub value: SampleValue,
    pub labels: Labels,
    pub exemplar: Option<Exemplar>,
}

impl PrometheusMetric {
    #[must_use]
    pub fn float(timestamp_ms: i64, value: f64, labels: Labels) -> Self {
        Self {
            timestamp_ms,
            value: SampleValue::Float(value),
            labels,
            exemplar: None,
        }
    }

    #[must_use]
    pub fn is_histogram(&self) -> bool {
        !matches!(self.value, SampleValue::Float(_))
    }
}

pub trait Marshaller {
    /// Hands the encoded batch to `handle` and resets the encoder, whether or
    /// not `handle` succeeds.
    fn marshal<F, E>(&mut self, handle: F) -> Result<(), E>
    where
        F: FnOnce(HashMap<String, String>, &[u8]) -> Result<(), E>;
}

pub trait Unmarshaller {
    fn unmarshal(
        &self,
        meta: &HashMap<String, String>,
        buf: &[u8],
    ) -> Result<Vec<Record>, DecodeError>;
}

pub trait PrometheusMarshaller {
    fn add_prometheus_metric(
        &mut self,
        metric: &PrometheusMetric,
        external_labels: &Labels,
    ) -> Result<(), EncodeError>;

    fn add_prometheus_metadata(
        &mut self,
        name: &str,
        unit: &str,
        help: &str,
        metric_type: &str,
    ) -> Result<(), EncodeError>;
}

/// Reusable batch encoder and decoder. One writer at a time.
pub struct Format {
    buf: Vec<u8>,
    scratch: Vec<u8>,
    record_count: usize,
    pool: MetricPool,
}

impl Default for Format {
    fn default() -> Self {
        Self::new()
    }
}

impl Format {
    #[must_use]
    pub fn new() -> Self {
        Self::with_pool(MetricPool::default())
    }

    #[must_use]
    pub fn with_pool(pool: MetricPool) -> Self {
        Self {
            buf: Vec::new(),
            scratch: Vec::new(),
            record_count: 0,
            pool,
        }
    }

    /// Records added since the last marshal.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Size of the encoded stream so far.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.buf.len()
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.scratch.clear();
        self.record_count = 0;
    }

    fn push_record<M: Message>(&mut self, tag: RecordTag, message: &M) -> Result<(), EncodeError> {
        let start = self.buf.len();
        self.buf.push(tag as u8);
        if let Err(e) = message.encode_length_delimited(&mut self.buf) {
            self.buf.truncate(start);
            return Err(e.into());
        }
        self.record_count += 1;
        Ok(())
    }
}

fn to_proto_labels(labels: &Labels) -> Vec<prompb::Label> {
    labels
        .iter()
        .map(|l| prompb::Label {
            name: l.name.clone(),
            value: l.value.clone(),
        })
        .collect()
}

impl PrometheusMarshaller for Format {
    fn add_prometheus_metric(
        &mut self,
        metric: &PrometheusMetric,
        external_labels: &Labels,
    ) -> Result<(), EncodeError> {
        if metric.labels.is_empty() {
            return Err(EncodeError::EmptyLabels);
        }

        let mut series = prompb::TimeSeries {
            labels: to_proto_labels(&metric.labels.merge_external(external_labels)),
            ..Default::default()
        };
        match &metric.value {
            SampleValue::Float(value) => series.samples.push(prompb::Sample {
                value: *value,
                timestamp: metric.timestamp_ms,
            }),
            SampleValue::Histogram(h) => series.histograms.push(h.to_proto(metric.timestamp_ms)),
            SampleValue::FloatHistogram(h) => {
                series.histograms.push(h.to_proto(metric.timestamp_ms));
            }
        }
        if let Some(exemplar) = &metric.exemplar {
            series.exemplars.push(prompb::Exemplar {
                labels: to_proto_labels(&exemplar.labels),
                value: exemplar.value,
                timestamp: if exemplar.has_timestamp {
                    exemplar.timestamp_ms
                } else {
                    metric.timestamp_ms
                },
            });
        }

        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        series.encode(&mut scratch)?;
        let envelope = MetricEnvelope {
            hash: metric.labels.hash(),
            timestamp_ms: metric.timestamp_ms,
            is_histogram: metric.is_histogram(),
            series: scratch,
        };
        let result = self.push_record(RecordTag::PrometheusMetric, &envelope);
        self.scratch = envelope.series;
        result
    }

    fn add_prometheus_metadata(
        &mut self,
        name: &str,
        unit: &str,
        help: &str,
        metric_type: &str,
    ) -> Result<(), EncodeError> {
        let metric_type =
            prompb::metric_metadata::MetricType::from_str_name(&metric_type.to_uppercase())
                .unwrap_or(prompb::metric_metadata::MetricType::Unknown);
        let metadata = prompb::MetricMetadata {
            r#type: metric_type as i32,
            metric_family_name: name.to_string(),
            help: help.to_string(),
            unit: unit.to_string(),
        };
        self.push_record(RecordTag::PrometheusMetadata, &metadata)
    }
}

impl Marshaller for Format {
    fn marshal<F, E>(&mut self, handle: F) -> Result<(), E>
    where
        F: FnOnce(HashMap<String, String>, &[u8]) -> Result<(), E>,
    {
        let mut meta = HashMap::with_capacity(2);
        meta.insert(RECORD_COUNT_KEY.to_string(), self.record_count.to_string());
        meta.insert(VERSION_KEY.to_string(), FileFormat::V2.to_string());
        let result = handle(meta, &self.buf);
        self.reset();
        result
    }
}

/// Splits the next length-delimited payload off `cursor`.
fn next_payload<'a>(cursor: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = prost::encoding::decode_varint(cursor).ok()?;
    let len = usize::try_from(len).ok()?;
    let remaining: &'a [u8] = *cursor;
    if len > remaining.len() {
        return None;
    }
    let (payload, rest) = remaining.split_at(len);
    *cursor = rest;
    Some(payload)
}

impl Unmarshaller for Format {
    fn unmarshal(
        &self,
        meta: &HashMap<String, String>,
        buf: &[u8],
    ) -> Result<Vec<Record>, DecodeError> {
        let raw = meta
            .get(RECORD_COUNT_KEY)
            .ok_or(DecodeError::MissingRecordCount)?;
        let expected: usize = raw
            .trim()
            .parse()
            .map_err(|_| DecodeError::InvalidRecordCount(raw.clone()))?;

        // Every record takes at least two bytes, so a bogus count can not
        // force a huge allocation.
        let mut records = Vec::with_capacity(expected.min(buf.len() / 2));
        let mut cursor = buf;
        for decoded in 0..expected {
            let truncated = DecodeError::Truncated { decoded, expected };
            let Some((&tag, rest)) = cursor.split_first() else {
                return Err(truncated);
            };
            cursor = rest;
            let payload = next_payload(&mut cursor).ok_or(truncated)?;

            match RecordTag::from_u8(tag) {
                Some(RecordTag::PrometheusMetric) => {
                    let mut envelope = self.pool.get();
                    if let Err(e) = envelope.merge(payload) {
                        self.pool.put(envelope);
                        return Err(e.into());
                    }
                    records.push(Record::Metric(Metric::pooled(envelope, self.pool.clone())));
                }
                Some(RecordTag::PrometheusMetadata) => {
                    prompb::MetricMetadata::decode(payload)?;
                    records.push(Record::Metadata(Metadata::new(payload.to_vec())));
                }
                Some(RecordTag::PrometheusExemplar) | None => {
                    return Err(DecodeError::UnknownTag(tag));
                }
            }
        }
        Ok(records)
    }
}
