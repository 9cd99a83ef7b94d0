// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::header::HeaderValue;
use reqwest::{Certificate, ClientBuilder, Identity, Proxy};
use tracing::{debug, warn};

use crate::errors::ConfigError;
use crate::network::config::{HttpClientSettings, ProxySettings};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const PROXY_AUTHORIZATION: &str = "proxy-authorization";

fn create_reqwest_client_builder() -> ClientBuilder {
    reqwest::Client::builder().use_rustls_tls()
}

/// Builds the client shared by every send of one configuration.
pub fn build_client(settings: &HttpClientSettings) -> Result<reqwest::Client, ConfigError> {
    let mut builder = create_reqwest_client_builder().timeout(settings.timeout);

    if let (Some(cert), Some(key)) = (&settings.tls.cert, &settings.tls.key) {
        let pem = format!("{cert}\n{key}");
        let identity =
            Identity::from_pem(pem.as_bytes()).map_err(|e| ConfigError::Tls(e.to_string()))?;
        builder = builder.identity(identity);
    }
    if let Some(ca) = &settings.tls.ca {
        let ca = Certificate::from_pem(ca.as_bytes()).map_err(|e| ConfigError::Tls(e.to_string()))?;
        builder = builder.add_root_certificate(ca);
    }
    if settings.tls.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder = match &settings.proxy {
        // reqwest reads the proxy environment variables unless told otherwise.
        ProxySettings::FromEnvironment => builder,
        ProxySettings::Direct => builder.no_proxy(),
        ProxySettings::Url {
            url,
            connect_headers,
        } => {
            let mut proxy = Proxy::all(url.clone()).map_err(|e| ConfigError::InvalidProxyUrl {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
            for (name, value) in connect_headers {
                if name.eq_ignore_ascii_case(PROXY_AUTHORIZATION) {
                    let value =
                        HeaderValue::from_str(value).map_err(|e| ConfigError::InvalidHeader {
                            name: name.clone(),
                            reason: e.to_string(),
                        })?;
                    proxy = proxy.custom_http_auth(value);
                } else {
                    warn!("Ignoring unsupported proxy connect header {}", name);
                }
            }
            builder.proxy(proxy)
        }
    };

    if settings.round_robin_dns {
        debug!("Using round-robin DNS resolution");
        builder = builder.dns_resolver(Arc::new(RoundRobinResolver::default()));
    }

    builder.build().map_err(|e| ConfigError::Client(e.to_string()))
}

/// Resolver that rotates the address list on every lookup so consecutive
/// connections spread over all the records of a name.
#[derive(Debug, Default)]
pub struct RoundRobinResolver {
    next: AtomicUsize,
}

fn rotated(mut addrs: Vec<SocketAddr>, offset: usize) -> Vec<SocketAddr> {
    if !addrs.is_empty() {
        let n = offset % addrs.len();
        addrs.rotate_left(n);
    }
    addrs
}

impl Resolve for RoundRobinResolver {
    fn resolve(&self, name: Name) -> Resolving {
        // Rotation is decided before the lookup so concurrent lookups differ.
        let offset = self.next.fetch_add(1, Ordering::Relaxed);
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((name.as_str(), 0))
                .await
                .map_err(|e| Box::new(e) as BoxError)?
                .collect();
            let addrs: Addrs = Box::new(rotated(addrs, offset).into_iter());
            Ok::<Addrs, BoxError>(addrs)
        })
    }
}
