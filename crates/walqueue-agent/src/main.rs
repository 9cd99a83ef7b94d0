// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use walqueue::{
    batch::EncodedBatch,
    mailbox::Mailbox,
    network::{NetworkClient, RemoteWriteClient},
    serializer::SerializerService,
    stats::{StatsHub, StatsRecorder},
};

mod config;
mod producer;

use producer::Producer;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("WALQUEUE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config::Config::new() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on walqueue agent startup: {e:#}");
            return;
        }
    };

    let hub = StatsHub::new();
    let recorder = StatsRecorder::register(&hub);
    let batches: Mailbox<EncodedBatch> = Mailbox::new();

    let client = match RemoteWriteClient::new(config.connection.clone(), hub.clone(), batches.clone())
    {
        Ok(client) => client,
        Err(e) => {
            error!("Error creating remote write client: {e}");
            return;
        }
    };
    let (serializer, serializer_handle) =
        SerializerService::new(config.serializer.clone(), hub.clone(), batches);

    let cancel = CancellationToken::new();
    client.start(cancel.clone());
    let serializer_task = tokio::spawn(serializer.run(cancel.clone()));

    let producer_cancel = cancel.child_token();
    let producer_task = tokio::spawn(
        Producer::new(serializer_handle.clone(), config.series)
            .run(config.scrape_interval, producer_cancel.clone()),
    );

    info!(
        "walqueue agent sending {} series every {:?} to {}",
        config.series, config.scrape_interval, config.connection.url
    );

    let mut stats_interval = interval(config.stats_interval);
    stats_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("Unable to listen for shutdown signal: {e}");
                }
                break;
            }
            _ = stats_interval.tick() => {
                info!("walqueue stats: {}", recorder.snapshot());
            }
        }
    }

    info!("Shutting down walqueue agent");
    producer_cancel.cancel();
    if let Err(e) = producer_task.await {
        error!("Producer task failed: {e}");
    }
    // The final batch reaches the network input, but stopping the client drops
    // whatever it has not sent yet.
    serializer_handle.stop();
    if let Err(e) = serializer_task.await {
        error!("Serializer task failed: {e}");
    }
    client.stop().await;
    cancel.cancel();
    info!("walqueue stats: {}", recorder.snapshot());
}
