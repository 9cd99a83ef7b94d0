// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Url;

use crate::errors::ConfigError;
use crate::labels::Labels;

/// Remote-write protocol version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProtobufMessage {
    #[default]
    V1,
    V2,
}

#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Control-loop parameters for the sender pool size.
#[derive(Clone, Debug, PartialEq)]
pub struct ParallelismConfig {
    /// Drift above which a connection is added.
    pub allowed_drift: Duration,
    /// Drift below which a connection may be removed.
    pub minimum_scale_down_drift: Duration,
    pub min_connections: usize,
    pub max_connections: usize,
    /// Window for the network success and error observations.
    pub reset_interval: Duration,
    /// Window of previous desired values considered before scaling down.
    pub lookback: Duration,
    pub check_interval: Duration,
    /// Error fraction that forces a scale down. 0 disables the check.
    pub allowed_network_error_fraction: f64,
}

impl Default for ParallelismConfig {
    fn default() -> Self {
        Self {
            allowed_drift: Duration::from_secs(60),
            minimum_scale_down_drift: Duration::from_secs(30),
            min_connections: 2,
            max_connections: 50,
            reset_interval: Duration::from_secs(5 * 60),
            lookback: Duration::from_secs(5 * 60),
            check_interval: Duration::from_secs(10),
            allowed_network_error_fraction: 0.05,
        }
    }
}

impl ParallelismConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_connections == 0 {
            return Err(ConfigError::InvalidParallelism(
                "min_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidParallelism(format!(
                "min_connections {} is greater than max_connections {}",
                self.min_connections, self.max_connections
            )));
        }
        if self.allowed_drift <= self.minimum_scale_down_drift {
            return Err(ConfigError::InvalidParallelism(format!(
                "allowed_drift {:?} must be greater than minimum_scale_down_drift {:?}",
                self.allowed_drift, self.minimum_scale_down_drift
            )));
        }
        if !(0.0..=1.0).contains(&self.allowed_network_error_fraction) {
            return Err(ConfigError::InvalidParallelism(format!(
                "allowed_network_error_fraction {} is outside [0, 1]",
                self.allowed_network_error_fraction
            )));
        }
        if self.check_interval.is_zero() {
            return Err(ConfigError::InvalidParallelism(
                "check_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Starting pool size, halfway between the bounds.
    #[must_use]
    pub fn initial_desired(&self) -> usize {
        (self.min_connections + self.max_connections) / 2
    }
}

/// Immutable network configuration. Replaced as a whole through
/// [`super::NetworkClient::update_config`].
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
    pub url: String,
    pub basic_auth: Option<BasicAuth>,
    pub bearer_token: Option<String>,
    pub user_agent: String,
    pub protobuf_message: ProtobufMessage,
    /// Sparse metadata sending for v2 requests.
    pub enable_metadata_cache: bool,
    pub metadata_cache_size: usize,
    pub timeout: Duration,
    /// Delay before attempt `n + 1` is `retry_backoff + retry_backoff * n`.
    pub retry_backoff: Duration,
    /// 0 disables retries.
    pub max_retry_attempts: u32,
    pub batch_count: usize,
    pub flush_interval: Duration,
    /// Applied by the serializer at encode time, see
    /// [`crate::serializer::SerializerConfig::external_labels`]. Changing
    /// only this field does not reconfigure the network client.
    pub external_labels: Labels,
    pub headers: BTreeMap<String, String>,
    pub proxy_url: Option<String>,
    /// Takes precedence over `proxy_url`.
    pub proxy_from_environment: bool,
    pub proxy_connect_headers: BTreeMap<String, String>,
    /// PEM encoded client certificate.
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub tls_ca_cert: Option<String>,
    pub insecure_skip_verify: bool,
    pub use_round_robin: bool,
    pub parallelism: ParallelismConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            basic_auth: None,
            bearer_token: None,
            user_agent: concat!("walqueue/", env!("CARGO_PKG_VERSION")).to_string(),
            protobuf_message: ProtobufMessage::V1,
            enable_metadata_cache: false,
            metadata_cache_size: 1000,
            timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
            max_retry_attempts: 3,
            batch_count: 1000,
            flush_interval: Duration::from_secs(1),
            external_labels: Labels::default(),
            headers: BTreeMap::new(),
            proxy_url: None,
            proxy_from_environment: false,
            proxy_connect_headers: BTreeMap::new(),
            tls_cert: None,
            tls_key: None,
            tls_ca_cert: None,
            insecure_skip_verify: false,
            use_round_robin: false,
            parallelism: ParallelismConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert: Option<String>,
    pub key: Option<String>,
    pub ca: Option<String>,
    pub insecure_skip_verify: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ProxySettings {
    #[default]
    Direct,
    /// `HTTP_PROXY`, `HTTPS_PROXY` and `NO_PROXY`.
    FromEnvironment,
    Url {
        url: Url,
        connect_headers: BTreeMap<String, String>,
    },
}

/// Transport-level settings derived from a [`ConnectionConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpClientSettings {
    pub timeout: Duration,
    pub tls: TlsSettings,
    pub proxy: ProxySettings,
    pub round_robin_dns: bool,
}

impl ConnectionConfig {
    /// Whether moving to `other` changes anything the network layer uses.
    /// External labels are applied before batches reach the network.
    #[must_use]
    pub fn network_differs(&self, other: &ConnectionConfig) -> bool {
        if self.external_labels == other.external_labels {
            return self != other;
        }
        let mut masked = other.clone();
        masked.external_labels = self.external_labels.clone();
        *self != masked
    }

    #[must_use]
    pub fn remote_write_v1(&self) -> bool {
        self.protobuf_message == ProtobufMessage::V1
    }

    #[must_use]
    pub fn remote_write_v2(&self) -> bool {
        self.protobuf_message == ProtobufMessage::V2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        if self.batch_count == 0 {
            return Err(ConfigError::InvalidParallelism(
                "batch_count must be at least 1".to_string(),
            ));
        }
        self.parallelism.validate()
    }

    pub fn to_http_client_config(&self) -> Result<HttpClientSettings, ConfigError> {
        let proxy = if self.proxy_from_environment {
            ProxySettings::FromEnvironment
        } else {
            match self.proxy_url.as_deref() {
                None | Some("") => ProxySettings::Direct,
                Some(raw) => {
                    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidProxyUrl {
                        url: raw.to_string(),
                        reason: e.to_string(),
                    })?;
                    ProxySettings::Url {
                        url,
                        connect_headers: self.proxy_connect_headers.clone(),
                    }
                }
            }
        };

        let tls = TlsSettings {
            cert: self.tls_cert.clone().filter(|s| !s.is_empty()),
            key: self.tls_key.clone().filter(|s| !s.is_empty()),
            ca: self.tls_ca_cert.clone().filter(|s| !s.is_empty()),
            insecure_skip_verify: self.insecure_skip_verify,
        };
        if tls.cert.is_some() != tls.key.is_some() {
            return Err(ConfigError::Tls(
                "client certificate and key must be set together".to_string(),
            ));
        }

        Ok(HttpClientSettings {
            timeout: self.timeout,
            tls,
            proxy,
            round_robin_dns: self.use_round_robin,
        })
    }
}
