// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sizing of the sender pool.
//!
//! [`Controller`] is a pure state machine fed with stats observations and
//! evaluated at explicit instants. [`ParallelismService`] drives it from the
//! [`StatsHub`] on a timer and publishes every committed change on a
//! [`Mailbox`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::mailbox::Mailbox;
use crate::network::config::ParallelismConfig;
use crate::stats::{
    NetworkStats, NotificationRelease, ParallelismStats, SerializerStats, StatsHub,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalingState {
    Stable,
    ScalingUp,
    ScalingDown,
}

#[derive(Debug)]
pub struct Controller {
    cfg: ParallelismConfig,
    desired: usize,
    state: ScalingState,
    /// Proposed values, used to hold scale downs for `lookback`.
    previous: VecDeque<(Instant, usize)>,
    errors: VecDeque<Instant>,
    successes: VecDeque<Instant>,
    network_newest_seconds: i64,
    serializer_newest_seconds: i64,
    drift_seconds: i64,
}

impl Controller {
    #[must_use]
    pub fn new(cfg: ParallelismConfig) -> Self {
        let desired = cfg.initial_desired();
        Self {
            cfg,
            desired,
            state: ScalingState::Stable,
            previous: VecDeque::new(),
            errors: VecDeque::new(),
            successes: VecDeque::new(),
            network_newest_seconds: 0,
            serializer_newest_seconds: 0,
            drift_seconds: 0,
        }
    }

    #[must_use]
    pub fn desired(&self) -> usize {
        self.desired
    }

    #[must_use]
    pub fn state(&self) -> ScalingState {
        self.state
    }

    #[must_use]
    pub fn drift_seconds(&self) -> i64 {
        self.drift_seconds
    }

    #[must_use]
    pub fn config(&self) -> &ParallelismConfig {
        &self.cfg
    }

    #[must_use]
    pub fn stats(&self) -> ParallelismStats {
        ParallelismStats {
            min: self.cfg.min_connections,
            max: self.cfg.max_connections,
            desired: self.desired,
        }
    }

    /// Every send or retry produces a snapshot, so each one counts as one
    /// success and/or one error observation.
    pub fn observe_network(&mut self, ns: &NetworkStats, now: Instant) {
        if ns.has_errors() {
            self.errors.push_back(now);
        }
        if ns.total_sent() > 0 {
            self.successes.push_back(now);
        }
        self.network_newest_seconds = self
            .network_newest_seconds
            .max(ns.newest_timestamp_seconds);
        self.update_drift();
    }

    pub fn observe_serializer(&mut self, ss: &SerializerStats) {
        self.serializer_newest_seconds = self
            .serializer_newest_seconds
            .max(ss.newest_timestamp_seconds);
        self.update_drift();
    }

    fn update_drift(&mut self) {
        // A serializer timestamp usually arrives before the first send.
        if self.network_newest_seconds > 0 && self.serializer_newest_seconds > 0 {
            self.drift_seconds = self.serializer_newest_seconds - self.network_newest_seconds;
        }
    }

    /// Replaces the configuration and clamps the current value into the new
    /// bounds. Returns the new value if it changed.
    pub fn update_config(&mut self, cfg: ParallelismConfig) -> Option<usize> {
        self.cfg = cfg;
        let clamped = self
            .desired
            .clamp(self.cfg.min_connections, self.cfg.max_connections);
        if clamped == self.desired {
            return None;
        }
        self.state = if clamped > self.desired {
            ScalingState::ScalingUp
        } else {
            ScalingState::ScalingDown
        };
        self.desired = clamped;
        Some(clamped)
    }

    #[must_use]
    pub fn error_rate(&self) -> f64 {
        if self.errors.is_empty() {
            return 0.0;
        }
        if self.successes.is_empty() {
            return 1.0;
        }
        let errors = self.errors.len() as f64;
        errors / (errors + self.successes.len() as f64)
    }

    fn prune(&mut self, now: Instant) {
        let lookback = self.cfg.lookback;
        let reset = self.cfg.reset_interval;
        self.previous
            .retain(|(recorded, _)| now.saturating_duration_since(*recorded) <= lookback);
        self.errors
            .retain(|t| now.saturating_duration_since(*t) <= reset);
        self.successes
            .retain(|t| now.saturating_duration_since(*t) <= reset);
    }

    /// Runs one check. Returns the new desired value when it changed.
    pub fn evaluate(&mut self, now: Instant) -> Option<usize> {
        self.state = ScalingState::Stable;
        let (min, max) = (self.cfg.min_connections, self.cfg.max_connections);

        self.prune(now);

        if min == max {
            self.previous.push_back((now, self.desired));
            return None;
        }

        let fraction = self.cfg.allowed_network_error_fraction;
        if fraction != 0.0 && self.error_rate() >= fraction {
            if self.desired > min {
                return self.scale_down(now, "network errors");
            }
            return None;
        }

        let drift = self.drift_seconds as f64;
        if drift > self.cfg.allowed_drift.as_secs_f64() {
            if self.desired < max {
                debug!(
                    "Increasing desired connections to {} due to drift of {}s",
                    self.desired + 1,
                    self.drift_seconds
                );
                self.previous.push_back((now, self.desired + 1));
                return self.commit(self.desired + 1);
            }
            return None;
        }

        if drift < self.cfg.minimum_scale_down_drift.as_secs_f64() && self.desired > min {
            return self.scale_down(now, "low drift");
        }

        None
    }

    /// Proposes one connection less, but never goes below the highest value
    /// proposed within `lookback`.
    fn scale_down(&mut self, now: Instant, reason: &str) -> Option<usize> {
        let proposed = self.desired - 1;
        let target = self
            .previous
            .iter()
            .map(|(_, d)| *d)
            .fold(proposed, usize::max)
            .min(self.cfg.max_connections);
        self.previous.push_back((now, proposed));
        if target < self.desired {
            debug!(
                "Decreasing desired connections to {} due to {}, drift is {}s",
                target, reason, self.drift_seconds
            );
            return self.commit(target);
        }
        debug!(
            "Holding desired connections at {}, a higher value was needed within the lookback",
            self.desired
        );
        None
    }

    fn commit(&mut self, desired: usize) -> Option<usize> {
        if desired == self.desired {
            return None;
        }
        self.state = if desired > self.desired {
            ScalingState::ScalingUp
        } else {
            ScalingState::ScalingDown
        };
        self.desired = desired;
        Some(desired)
    }
}

/// Shared access to a running controller.
#[derive(Clone, Debug)]
pub struct ParallelismHandle {
    controller: Arc<Mutex<Controller>>,
    hub: StatsHub,
}

impl ParallelismHandle {
    #[must_use]
    pub fn desired(&self) -> usize {
        #[allow(clippy::expect_used)]
        let controller = self.controller.lock().expect("lock poisoned");
        controller.desired()
    }

    /// Applies new bounds. Returns the clamped value if it changed.
    pub fn update_config(&self, cfg: ParallelismConfig) -> Option<usize> {
        let (changed, stats) = {
            #[allow(clippy::expect_used)]
            let mut controller = self.controller.lock().expect("lock poisoned");
            let changed = controller.update_config(cfg);
            (changed, controller.stats())
        };
        self.hub.send_parallelism_stats(stats);
        changed
    }
}

pub struct ParallelismService {
    controller: Arc<Mutex<Controller>>,
    hub: StatsHub,
    out: Mailbox<usize>,
    releases: Vec<NotificationRelease>,
}

impl ParallelismService {
    /// Registers the controller on `hub`. Committed changes are sent to `out`.
    pub fn new(
        cfg: ParallelismConfig,
        hub: StatsHub,
        out: Mailbox<usize>,
    ) -> (Self, ParallelismHandle) {
        let controller = Arc::new(Mutex::new(Controller::new(cfg)));

        let c = Arc::clone(&controller);
        let network_release = hub.register_series_network(move |ns| {
            #[allow(clippy::expect_used)]
            let mut controller = c.lock().expect("lock poisoned");
            controller.observe_network(ns, Instant::now());
        });
        let c = Arc::clone(&controller);
        let serializer_release = hub.register_serializer(move |ss| {
            #[allow(clippy::expect_used)]
            let mut controller = c.lock().expect("lock poisoned");
            controller.observe_serializer(ss);
        });

        let handle = ParallelismHandle {
            controller: Arc::clone(&controller),
            hub: hub.clone(),
        };
        let service = Self {
            controller,
            hub,
            out,
            releases: vec![network_release, serializer_release],
        };
        (service, handle)
    }

    fn check_interval(&self) -> std::time::Duration {
        #[allow(clippy::expect_used)]
        let controller = self.controller.lock().expect("lock poisoned");
        controller.config().check_interval
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("Parallelism controller started");
        {
            #[allow(clippy::expect_used)]
            let stats = self.controller.lock().expect("lock poisoned").stats();
            self.hub.send_parallelism_stats(stats);
        }

        loop {
            let check_interval = self.check_interval();
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(check_interval) => {
                    let (changed, stats) = {
                        #[allow(clippy::expect_used)]
                        let mut controller = self.controller.lock().expect("lock poisoned");
                        let changed = controller.evaluate(Instant::now());
                        (changed, controller.stats())
                    };
                    self.hub.send_parallelism_stats(stats);
                    if let Some(desired) = changed {
                        debug!("Sending desired connections {}", desired);
                        if let Err(e) = self.out.send(&cancel, desired) {
                            error!("Error sending desired connections: {}", e);
                        }
                    }
                }
            }
        }

        for release in self.releases.drain(..) {
            release();
        }
        debug!("Parallelism controller stopped");
    }
}
