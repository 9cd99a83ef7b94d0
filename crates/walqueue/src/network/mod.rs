// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote-write network layer.
//!
//! Batches arriving on the input mailbox are decoded, sharded by series hash
//! and sent over `desired` connections. The parallelism controller resizes the
//! pool from the drift between what was serialized and what was sent.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::UpdateError;

pub mod config;
pub mod http_client;
pub mod manager;
pub mod metadata_cache;
pub mod parallelism;
pub mod pending;
pub mod write;

pub use config::{BasicAuth, ConnectionConfig, ParallelismConfig, ProtobufMessage};
pub use manager::RemoteWriteClient;

#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Spawns the sender loop and the parallelism controller. Both stop when
    /// `cancel` fires or on [`NetworkClient::stop`].
    fn start(&self, cancel: CancellationToken);

    /// Stops the sender loop and waits for it to exit. Requests already in
    /// flight run until the start token is cancelled.
    async fn stop(&self);

    /// Applies `cfg` inside the sender loop. Returns once it was applied or
    /// rejected; `Ok(false)` means it matched the active configuration. A
    /// rejected configuration leaves the previous one active.
    async fn update_config(
        &self,
        cancel: &CancellationToken,
        cfg: ConnectionConfig,
    ) -> Result<bool, UpdateError>;
}
