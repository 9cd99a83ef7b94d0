// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Decoded records handed from the batch codec to the network layer.
//!
//! Each datum carries the protobuf bytes the network layer puts on the wire.
//! Metric datums borrow their envelope from a [`MetricPool`]; consuming them
//! with [`Datum::free`] (or dropping them) returns it.

use derive_more::Display;

use crate::pool::MetricPool;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum DatumType {
    #[display("prometheus_metric_v1")]
    PrometheusMetricV1,
    #[display("prometheus_metadata_v1")]
    PrometheusMetadataV1,
}

/// Version tag written into every batch's metadata.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum FileFormat {
    #[display("alloy.metrics.queue.v1")]
    V1,
    #[display("alloy.metrics.queue.v2")]
    V2,
}

impl FileFormat {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        [FileFormat::V1, FileFormat::V2]
            .into_iter()
            .find(|format| format.to_string() == value)
    }
}

/// Record tags of the batch stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordTag {
    PrometheusMetric = 1,
    /// Reserved. Exemplars travel inside their metric record.
    PrometheusExemplar = 2,
    PrometheusMetadata = 3,
}

impl RecordTag {
    #[must_use]
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(RecordTag::PrometheusMetric),
            2 => Some(RecordTag::PrometheusExemplar),
            3 => Some(RecordTag::PrometheusMetadata),
            _ => None,
        }
    }
}

/// Payload of a metric record.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricEnvelope {
    #[prost(fixed64, tag = "1")]
    pub hash: u64,
    #[prost(int64, tag = "2")]
    pub timestamp_ms: i64,
    #[prost(bool, tag = "3")]
    pub is_histogram: bool,
    /// Serialized `prometheus.TimeSeries`.
    #[prost(bytes = "vec", tag = "4")]
    pub series: Vec<u8>,
}

impl MetricEnvelope {
    pub(crate) fn reset(&mut self) {
        self.hash = 0;
        self.timestamp_ms = 0;
        self.is_histogram = false;
        self.series.clear();
    }
}

pub trait Datum: Send {
    fn bytes(&self) -> &[u8];
    fn datum_type(&self) -> DatumType;
    fn file_format(&self) -> FileFormat;
    /// Releases the datum's buffers. The datum can not be used afterwards.
    fn free(self)
    where
        Self: Sized,
    {
        drop(self);
    }
}

pub trait MetricDatum: Datum {
    fn hash(&self) -> u64;
    fn timestamp_ms(&self) -> i64;
    fn is_histogram(&self) -> bool;
}

pub trait MetadataDatum: Datum {
    fn is_meta(&self) -> bool;
}

/// A decoded metric record backed by a pooled envelope.
pub struct Metric {
    envelope: MetricEnvelope,
    pool: Option<MetricPool>,
}

impl Metric {
    pub(crate) fn pooled(envelope: MetricEnvelope, pool: MetricPool) -> Self {
        Self {
            envelope,
            pool: Some(pool),
        }
    }

    /// A metric that is not tied to any pool.
    #[must_use]
    pub fn detached(hash: u64, timestamp_ms: i64, is_histogram: bool, series: Vec<u8>) -> Self {
        Self {
            envelope: MetricEnvelope {
                hash,
                timestamp_ms,
                is_histogram,
                series,
            },
            pool: None,
        }
    }
}

impl std::fmt::Debug for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metric")
            .field("hash", &self.envelope.hash)
            .field("timestamp_ms", &self.envelope.timestamp_ms)
            .field("is_histogram", &self.envelope.is_histogram)
            .field("len", &self.envelope.series.len())
            .finish()
    }
}

impl Drop for Metric {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(std::mem::take(&mut self.envelope));
        }
    }
}

impl Datum for Metric {
    fn bytes(&self) -> &[u8] {
        &self.envelope.series
    }

    fn datum_type(&self) -> DatumType {
        DatumType::PrometheusMetricV1
    }

    fn file_format(&self) -> FileFormat {
        FileFormat::V2
    }
}

impl MetricDatum for Metric {
    fn hash(&self) -> u64 {
        self.envelope.hash
    }

    fn timestamp_ms(&self) -> i64 {
        self.envelope.timestamp_ms
    }

    fn is_histogram(&self) -> bool {
        self.envelope.is_histogram
    }
}

/// A decoded `prometheus.MetricMetadata` record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    buf: Vec<u8>,
}

impl Metadata {
    #[must_use]
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf }
    }
}

impl Datum for Metadata {
    fn bytes(&self) -> &[u8] {
        &self.buf
    }

    fn datum_type(&self) -> DatumType {
        DatumType::PrometheusMetadataV1
    }

    fn file_format(&self) -> FileFormat {
        FileFormat::V2
    }
}

impl MetadataDatum for Metadata {
    fn is_meta(&self) -> bool {
        true
    }
}

#[derive(Debug)]
pub enum Record {
    Metric(Metric),
    Metadata(Metadata),
}

impl Record {
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        match self {
            Record::Metric(m) => m.bytes(),
            Record::Metadata(m) => m.bytes(),
        }
    }

    #[must_use]
    pub fn datum_type(&self) -> DatumType {
        match self {
            Record::Metric(m) => m.datum_type(),
            Record::Metadata(m) => m.datum_type(),
        }
    }
}
