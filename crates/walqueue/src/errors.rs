// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Failures of the mailbox primitives.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MailboxError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("mailbox closed")]
    Closed,
    #[error("receiver dropped the request without responding")]
    NoResponse,
}

/// Failures while decoding a marshalled batch.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("record_count missing from batch metadata")]
    MissingRecordCount,
    #[error("invalid record_count {0:?}")]
    InvalidRecordCount(String),
    #[error("buffer ended after {decoded} of {expected} records")]
    Truncated { decoded: usize, expected: usize },
    #[error("unknown record tag {0}")]
    UnknownTag(u8),
    #[error("failed to decode record payload: {0}")]
    Payload(#[from] prost::DecodeError),
    #[error("unsupported batch version {0:?}")]
    UnsupportedVersion(String),
    #[error("unknown compression {0:?}")]
    UnknownCompression(String),
    #[error("failed to decompress batch: {0}")]
    Decompress(String),
}

/// Failures while encoding a record or compressing a batch.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("metric has no labels")]
    EmptyLabels,
    #[error("failed to encode record payload: {0}")]
    Payload(#[from] prost::EncodeError),
    #[error("failed to compress batch: {0}")]
    Compress(String),
}

/// Invalid connection or parallelism configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid endpoint URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid proxy URL {url:?}: {reason}")]
    InvalidProxyUrl { url: String, reason: String },
    #[error("invalid parallelism configuration: {0}")]
    InvalidParallelism(String),
    #[error("invalid TLS configuration: {0}")]
    Tls(String),
    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("failed to create HTTP client: {0}")]
    Client(String),
}

/// Failure of a synchronous configuration update.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
