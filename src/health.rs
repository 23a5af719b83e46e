/*
 * Copyright 2024 Google LLC All Rights Reserved.
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Active health checking of upstream hosts.
//!
//! Every host of a cluster gets its own check loop which is the only writer
//! of that host's health (besides administrative overrides). A loop sleeps
//! for a freshly computed delay, probes the host bounded by the configured
//! timeout, and folds the outcome into the host's [`HealthSnapshot`] through
//! the threshold state machine in [`state`].
//!
//! **Metrics**
//!
//! * `health_checks_total` Probes run, labelled by `cluster` and `result`.
//! * `health_transitions_total` Status changes, labelled by `cluster` and `to`.
//!
//! [`HealthSnapshot`]: crate::host::HealthSnapshot

pub mod config;
pub mod event;
pub mod probe;
pub mod schedule;
pub mod state;

use std::{sync::Arc, time::SystemTime};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use self::{
    config::{
        CustomProbeConfig, HealthCheckConfig, HttpProbeConfig, Payload, ProbeConfig, StatusRange,
        TcpProbeConfig,
    },
    event::{EventLog, HealthEvent},
    probe::{Probe, ProbeError, Verdict},
    state::{Outcome, Thresholds},
};

use crate::{
    config::ValidationError,
    host::{HealthStatus, Host, HostAddress},
};

const SUBSYSTEM: &str = "health";

pub(crate) fn checks_total() -> &'static prometheus::IntCounterVec {
    static CHECKS_TOTAL: Lazy<prometheus::IntCounterVec> = Lazy::new(|| {
        crate::metrics::register(
            prometheus::IntCounterVec::new(
                crate::metrics::opts("checks_total", SUBSYSTEM, "Total health check probes run."),
                &["cluster", "result"],
            )
            .unwrap(),
        )
    });

    &CHECKS_TOTAL
}

pub(crate) fn transitions_total() -> &'static prometheus::IntCounterVec {
    static TRANSITIONS_TOTAL: Lazy<prometheus::IntCounterVec> = Lazy::new(|| {
        crate::metrics::register(
            prometheus::IntCounterVec::new(
                crate::metrics::opts(
                    "transitions_total",
                    SUBSYSTEM,
                    "Total host health status transitions.",
                ),
                &["cluster", "to"],
            )
            .unwrap(),
        )
    });

    &TRANSITIONS_TOTAL
}

/// Called after a check loop changes the status of a host.
pub type TransitionHook = Arc<dyn Fn(&Host) + Send + Sync>;

/// State shared by every check loop of one cluster.
struct CheckContext {
    cluster: String,
    config: HealthCheckConfig,
    probe: Arc<dyn Probe>,
    events: Option<EventLog>,
    on_transition: TransitionHook,
}

/// Runs one check loop per host of a cluster.
pub struct HealthChecker {
    context: Arc<CheckContext>,
    token: CancellationToken,
    loops: DashMap<(u32, HostAddress), CancellationToken>,
}

impl HealthChecker {
    pub fn new(
        cluster: &str,
        config: HealthCheckConfig,
        on_transition: TransitionHook,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        let probe = config.probe.build()?;
        let events = config
            .event_log_path
            .as_deref()
            .map(EventLog::open)
            .transpose()
            .map_err(|error| {
                ValidationError::invalid("health_check.event_log_path", error.to_string())
            })?;

        Ok(Self {
            context: Arc::new(CheckContext {
                cluster: cluster.into(),
                config,
                probe,
                events,
                on_transition,
            }),
            token: CancellationToken::new(),
            loops: DashMap::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &HealthCheckConfig {
        &self.context.config
    }

    /// Starts a check loop for each host, replacing any loop already running
    /// for the same host.
    pub fn start(&self, hosts: impl IntoIterator<Item = Arc<Host>>) {
        for host in hosts {
            let token = self.token.child_token();
            let key = (host.priority(), host.address().clone());
            if let Some(previous) = self.loops.insert(key, token.clone()) {
                previous.cancel();
            }

            let span = tracing::debug_span!(
                "health_check",
                cluster = %self.context.cluster,
                host = %host.address(),
            );
            tokio::spawn(run(self.context.clone(), host, token).instrument(span));
        }
    }

    /// Cancels the loop of a single host. The host should already be retired
    /// so that a probe still in flight cannot write to it.
    pub fn stop_host(&self, host: &Host) {
        if let Some((_, token)) = self
            .loops
            .remove(&(host.priority(), host.address().clone()))
        {
            token.cancel();
        }
    }

    /// Cancels every loop of this checker.
    pub fn stop(&self) {
        self.token.cancel();
        self.loops.clear();
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl CheckContext {
    fn log_outcome(&self, target: &HostAddress, outcome: &Outcome) {
        let reason = match outcome {
            Outcome::Success | Outcome::Degraded => return,
            Outcome::Failure(reason) => reason.as_str(),
            Outcome::Timeout => "timed out",
        };

        if self.config.always_log_health_check_failures {
            tracing::warn!(%target, reason, "health check failed");
        } else {
            tracing::debug!(%target, reason, "health check failed");
        }
    }

    fn transitioned(&self, host: &Host, (from, to): (HealthStatus, HealthStatus), outcome: &Outcome) {
        transitions_total()
            .with_label_values(&[self.cluster.as_str(), to.as_ref()])
            .inc();

        match to {
            HealthStatus::Healthy => {
                tracing::info!(host = %host.address(), %from, %to, "host became healthy")
            }
            _ => tracing::warn!(host = %host.address(), %from, %to, "host health changed"),
        }

        if let Some(events) = &self.events {
            let reason = match outcome {
                Outcome::Failure(reason) => reason.as_str(),
                outcome => outcome.as_str(),
            };
            events.record(&HealthEvent::new(
                &self.cluster,
                host.address().to_string(),
                (from, to),
                reason,
            ));
        }

        (self.on_transition)(host);
    }
}

async fn run(context: Arc<CheckContext>, host: Arc<Host>, token: CancellationToken) {
    let config = &context.config;
    let target = match config.alt_port {
        Some(port) => host.address().with_port(port),
        None => host.address().clone(),
    };
    let thresholds = Thresholds {
        healthy: config.healthy_threshold,
        unhealthy: config.unhealthy_threshold,
    };
    let mut delay = schedule::initial_delay(config, &mut rand::thread_rng());

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let outcome = match tokio::time::timeout(config.timeout, context.probe.check(&target)).await
        {
            Ok(Ok(Verdict::Healthy)) => Outcome::Success,
            Ok(Ok(Verdict::Degraded)) => Outcome::Degraded,
            Ok(Err(error)) => Outcome::Failure(error.to_string()),
            Err(_) => Outcome::Timeout,
        };

        // The host was stopped while the probe was in flight.
        if token.is_cancelled() {
            break;
        }

        checks_total()
            .with_label_values(&[context.cluster.as_str(), outcome.as_str()])
            .inc();
        context.log_outcome(&target, &outcome);

        let Some(update) = host.update_health(|current| {
            state::apply(current, &outcome, thresholds, SystemTime::now())
        }) else {
            break;
        };

        let transition = update.transition();
        if let Some(transition) = transition {
            context.transitioned(&host, transition, &outcome);
        }

        delay = schedule::next_delay(
            config,
            update.current.status,
            transition.is_some(),
            &mut rand::thread_rng(),
        );
    }

    tracing::debug!("health check loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::net::TcpListener;

    fn fast_config() -> HealthCheckConfig {
        HealthCheckConfig {
            timeout: Duration::from_millis(200),
            interval: Duration::from_millis(20),
            healthy_threshold: 1,
            unhealthy_threshold: 2,
            ..<_>::default()
        }
    }

    async fn wait_for(host: &Host, status: HealthStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while host.status() != status {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("host never became {status}, is {}", host.status()));
    }

    #[tokio::test]
    async fn follows_host_availability() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = HostAddress::from(listener.local_addr().unwrap());
        let accept = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = transitions.clone();
        let checker = HealthChecker::new(
            "follows",
            fast_config(),
            Arc::new(move |_: &Host| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let host = Arc::new(Host::new(address, 0, 1, HealthStatus::Unknown));
        checker.start([host.clone()]);
        wait_for(&host, HealthStatus::Healthy).await;

        accept.abort();
        let _ = accept.await;
        wait_for(&host, HealthStatus::Unhealthy).await;

        assert_eq!(2, transitions.load(Ordering::SeqCst));
        checker.stop();
    }

    #[tokio::test]
    async fn stopped_hosts_are_left_alone() {
        let address = HostAddress::from(crate::test::available_addr().await);
        let checker = HealthChecker::new("stopped", fast_config(), Arc::new(|_: &Host| {})).unwrap();
        let host = Arc::new(Host::new(address, 0, 1, HealthStatus::Healthy));

        checker.start([host.clone()]);
        host.retire();
        checker.stop_host(&host);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(HealthStatus::Healthy, host.status());
        assert_eq!(0, host.health().consecutive_failures);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = HealthCheckConfig {
            unhealthy_threshold: 0,
            ..fast_config()
        };

        assert!(HealthChecker::new("invalid", config, Arc::new(|_: &Host| {})).is_err());
    }
}
