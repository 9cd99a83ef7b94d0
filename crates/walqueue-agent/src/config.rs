// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use walqueue::batch::Compression;
use walqueue::labels::Labels;
use walqueue::network::{BasicAuth, ConnectionConfig, ParallelismConfig, ProtobufMessage};
use walqueue::serializer::SerializerConfig;

const DEFAULT_SERIES: usize = 100;
const DEFAULT_SCRAPE_INTERVAL_SECS: u64 = 15;
const DEFAULT_STATS_INTERVAL_SECS: u64 = 30;

#[derive(Debug)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub serializer: SerializerConfig,
    /// Number of synthetic series produced per scrape.
    pub series: usize,
    pub scrape_interval: Duration,
    /// How often the stats recorder is logged.
    pub stats_interval: Duration,
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{name} has an invalid value {raw:?}: {e}")),
        None => Ok(None),
    }
}

fn bool_var(name: &str, default: bool) -> bool {
    var(name)
        .map(|val| val.to_lowercase() == "true")
        .unwrap_or(default)
}

/// Parses a JSON object of strings, e.g. `{"X-Scope-OrgID": "tenant-1"}`.
fn map_var(name: &str) -> anyhow::Result<BTreeMap<String, String>> {
    match var(name) {
        Some(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("{name} must be a JSON object of strings")),
        None => Ok(BTreeMap::new()),
    }
}

impl Config {
    pub fn new() -> anyhow::Result<Config> {
        let url = var("WALQUEUE_URL")
            .ok_or_else(|| anyhow!("WALQUEUE_URL environment variable is not set"))?;

        let protobuf_message = match var("WALQUEUE_PROTOBUF_MESSAGE")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            None | Some("v1") => ProtobufMessage::V1,
            Some("v2") => ProtobufMessage::V2,
            Some(other) => {
                return Err(anyhow!(
                    "WALQUEUE_PROTOBUF_MESSAGE must be v1 or v2, got {other:?}"
                ))
            }
        };
        let compression = match var("WALQUEUE_COMPRESSION")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            None | Some("snappy") => Compression::Snappy,
            Some("zstd") => Compression::Zstd,
            Some(other) => {
                return Err(anyhow!(
                    "WALQUEUE_COMPRESSION must be snappy or zstd, got {other:?}"
                ))
            }
        };

        let basic_auth = match (
            var("WALQUEUE_BASIC_AUTH_USERNAME"),
            var("WALQUEUE_BASIC_AUTH_PASSWORD"),
        ) {
            (Some(username), password) => Some(BasicAuth {
                username,
                password: password.unwrap_or_default(),
            }),
            (None, _) => None,
        };

        let external_labels = Labels::from_pairs(map_var("WALQUEUE_EXTERNAL_LABELS")?);

        let defaults = ParallelismConfig::default();
        let parallelism = ParallelismConfig {
            min_connections: parse_var("WALQUEUE_MIN_CONNECTIONS")?
                .unwrap_or(defaults.min_connections),
            max_connections: parse_var("WALQUEUE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            allowed_network_error_fraction: parse_var("WALQUEUE_ALLOWED_NETWORK_ERROR_FRACTION")?
                .unwrap_or(defaults.allowed_network_error_fraction),
            ..defaults
        };

        let base = ConnectionConfig::default();
        let connection = ConnectionConfig {
            url,
            basic_auth,
            bearer_token: var("WALQUEUE_BEARER_TOKEN"),
            protobuf_message,
            enable_metadata_cache: bool_var("WALQUEUE_ENABLE_METADATA_CACHE", false),
            timeout: parse_var("WALQUEUE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(base.timeout),
            max_retry_attempts: parse_var("WALQUEUE_MAX_RETRY_ATTEMPTS")?
                .unwrap_or(base.max_retry_attempts),
            batch_count: parse_var("WALQUEUE_BATCH_COUNT")?.unwrap_or(base.batch_count),
            flush_interval: parse_var("WALQUEUE_FLUSH_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(base.flush_interval),
            external_labels: external_labels.clone(),
            headers: map_var("WALQUEUE_HEADERS")?,
            proxy_url: var("WALQUEUE_PROXY_URL").or_else(|| var("HTTPS_PROXY")),
            proxy_from_environment: bool_var("WALQUEUE_PROXY_FROM_ENVIRONMENT", false),
            insecure_skip_verify: bool_var("WALQUEUE_INSECURE_SKIP_VERIFY", false),
            use_round_robin: bool_var("WALQUEUE_USE_ROUND_ROBIN", false),
            parallelism,
            ..base
        };
        connection.validate()?;

        let base = SerializerConfig::default();
        let serializer = SerializerConfig {
            max_signals_in_batch: parse_var("WALQUEUE_MAX_SIGNALS_IN_BATCH")?
                .unwrap_or(base.max_signals_in_batch),
            flush_interval: parse_var("WALQUEUE_SERIALIZER_FLUSH_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(base.flush_interval),
            compression,
            external_labels,
        };

        Ok(Config {
            connection,
            serializer,
            series: parse_var("WALQUEUE_SERIES")?.unwrap_or(DEFAULT_SERIES),
            scrape_interval: Duration::from_secs(
                parse_var("WALQUEUE_SCRAPE_INTERVAL_SECS")?
                    .unwrap_or(DEFAULT_SCRAPE_INTERVAL_SECS)
                    .max(1),
            ),
            stats_interval: Duration::from_secs(
                parse_var("WALQUEUE_STATS_INTERVAL_SECS")?
                    .unwrap_or(DEFAULT_STATS_INTERVAL_SECS)
                    .max(1),
            ),
        })
    }
}
