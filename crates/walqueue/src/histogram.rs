// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Native histogram samples as handed to the encoder.

use crate::prompb;

/// A run of consecutive buckets starting `offset` buckets after the previous
/// span.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub offset: i32,
    pub length: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CounterResetHint {
    #[default]
    Unknown,
    Yes,
    No,
    Gauge,
}

impl From<CounterResetHint> for prompb::histogram::ResetHint {
    fn from(hint: CounterResetHint) -> Self {
        match hint {
            CounterResetHint::Unknown => Self::Unknown,
            CounterResetHint::Yes => Self::Yes,
            CounterResetHint::No => Self::No,
            CounterResetHint::Gauge => Self::Gauge,
        }
    }
}

/// Integer histogram. Bucket populations are delta encoded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Histogram {
    pub counter_reset_hint: CounterResetHint,
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: u64,
    pub count: u64,
    pub sum: f64,
    pub positive_spans: Vec<Span>,
    pub negative_spans: Vec<Span>,
    pub positive_buckets: Vec<i64>,
    pub negative_buckets: Vec<i64>,
}

/// Float histogram. Bucket populations are absolute.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FloatHistogram {
    pub counter_reset_hint: CounterResetHint,
    pub schema: i32,
    pub zero_threshold: f64,
    pub zero_count: f64,
    pub count: f64,
    pub sum: f64,
    pub positive_spans: Vec<Span>,
    pub negative_spans: Vec<Span>,
    pub positive_buckets: Vec<f64>,
    pub negative_buckets: Vec<f64>,
}

fn to_bucket_spans(spans: &[Span]) -> Vec<prompb::BucketSpan> {
    spans
        .iter()
        .map(|s| prompb::BucketSpan {
            offset: s.offset,
            length: s.length,
        })
        .collect()
}

impl Histogram {
    #[must_use]
    pub fn to_proto(&self, timestamp_ms: i64) -> prompb::Histogram {
        prompb::Histogram {
            count: Some(prompb::histogram::Count::CountInt(self.count)),
            sum: self.sum,
            schema: self.schema,
            zero_threshold: self.zero_threshold,
            zero_count: Some(prompb::histogram::ZeroCount::ZeroCountInt(self.zero_count)),
            negative_spans: to_bucket_spans(&self.negative_spans),
            negative_deltas: self.negative_buckets.clone(),
            negative_counts: Vec::new(),
            positive_spans: to_bucket_spans(&self.positive_spans),
            positive_deltas: self.positive_buckets.clone(),
            positive_counts: Vec::new(),
            reset_hint: prompb::histogram::ResetHint::from(self.counter_reset_hint) as i32,
            timestamp: timestamp_ms,
        }
    }
}

impl FloatHistogram {
    #[must_use]
    pub fn to_proto(&self, timestamp_ms: i64) -> prompb::Histogram {
        prompb::Histogram {
            count: Some(prompb::histogram::Count::CountFloat(self.count)),
            sum: self.sum,
            schema: self.schema,
            zero_threshold: self.zero_threshold,
            zero_count: Some(prompb::histogram::ZeroCount::ZeroCountFloat(
                self.zero_count,
            )),
            negative_spans: to_bucket_spans(&self.negative_spans),
            negative_deltas: Vec::new(),
            negative_counts: self.negative_buckets.clone(),
            positive_spans: to_bucket_spans(&self.positive_spans),
            positive_deltas: Vec::new(),
            positive_counts: self.positive_buckets.clone(),
            reset_hint: prompb::histogram::ResetHint::from(self.counter_reset_hint) as i32,
            timestamp: timestamp_ms,
        }
    }
}
