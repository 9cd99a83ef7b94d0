// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Write-queue engine for Prometheus remote write.
//!
//! ```text
//! producer -> Mailbox<Signal> -> Serializer -> Mailbox<EncodedBatch> -> NetworkClient -> endpoint
//!                                    |                                        |
//!                                    +---------------> StatsHub <-------------+
//! ```
//!
//! The serializer packs samples and metadata with [`format::Format`], the network
//! client decodes those batches, shards them by series hash and sends them over a
//! pool of connections sized by the parallelism controller.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod batch;
pub mod datum;
pub mod errors;
pub mod format;
pub mod histogram;
pub mod labels;
pub mod mailbox;
pub mod network;
pub mod pool;
pub mod prompb;
pub mod serializer;
pub mod stats;
