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

//! Upstream hosts and their health state.

pub mod address;

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::SystemTime,
};

use arc_swap::ArcSwap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use self::address::{AddressKind, HostAddress};

/// The health of a single [`Host`].
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    strum_macros::AsRefStr,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Never checked.
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    /// Administratively removed from rotation, still checked.
    Draining,
    /// The host is known to time out. Only ever set administratively or
    /// declared through `HostSpec::health_status`; active checks count
    /// timeouts as failures and leave it through the healthy threshold.
    Timeout,
    /// Passing checks, but marked for reduced preference.
    Degraded,
}

impl HealthStatus {
    /// Whether a host in this status may be handed out for new connections.
    #[inline]
    pub fn is_eligible(self, degraded_eligible: bool) -> bool {
        match self {
            Self::Healthy => true,
            Self::Degraded => degraded_eligible,
            Self::Unknown | Self::Unhealthy | Self::Draining | Self::Timeout => false,
        }
    }
}

/// The health state of a [`Host`], always published as a single unit so
/// readers never observe a status from one check and counters from another.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_checked: Option<SystemTime>,
    /// Set once the host has been removed from its cluster. No further
    /// health writes are accepted after this.
    pub removed: bool,
}

impl HealthSnapshot {
    pub fn new(status: HealthStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// The result of a successful [`Host::update_health`].
#[derive(Debug)]
pub struct HealthUpdate {
    pub previous: Arc<HealthSnapshot>,
    pub current: Arc<HealthSnapshot>,
}

impl HealthUpdate {
    /// Returns the new status if the update changed it.
    pub fn transition(&self) -> Option<(HealthStatus, HealthStatus)> {
        (self.previous.status != self.current.status)
            .then_some((self.previous.status, self.current.status))
    }
}

/// The control plane's description of a host.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HostSpec {
    pub address: HostAddress,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// The status a host starts in when its cluster has no active health
    /// check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,
}

fn default_weight() -> u32 {
    1
}

impl HostSpec {
    pub fn new(address: impl Into<HostAddress>) -> Self {
        Self {
            address: address.into(),
            weight: default_weight(),
            health_status: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_health_status(mut self, status: HealthStatus) -> Self {
        self.health_status = Some(status);
        self
    }
}

/// One upstream endpoint. The address and priority never change; the weight
/// and health are updated in place so long lived references stay valid
/// across control plane resyncs.
#[derive(Debug)]
pub struct Host {
    address: HostAddress,
    priority: u32,
    weight: AtomicU32,
    health: ArcSwap<HealthSnapshot>,
}

impl Host {
    pub fn new(address: HostAddress, priority: u32, weight: u32, status: HealthStatus) -> Self {
        Self {
            address,
            priority,
            weight: AtomicU32::new(weight.max(1)),
            health: ArcSwap::from_pointee(HealthSnapshot::new(status)),
        }
    }

    #[inline]
    pub fn address(&self) -> &HostAddress {
        &self.address
    }

    #[inline]
    pub fn priority(&self) -> u32 {
        self.priority
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Weights are always positive, a zero is clamped to one.
    pub(crate) fn set_weight(&self, weight: u32) -> bool {
        self.weight.swap(weight.max(1), Ordering::Relaxed) != weight.max(1)
    }

    /// Returns the current health snapshot.
    #[inline]
    pub fn health(&self) -> Arc<HealthSnapshot> {
        self.health.load_full()
    }

    #[inline]
    pub fn status(&self) -> HealthStatus {
        self.health.load().status
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.health.load().removed
    }

    #[inline]
    pub fn is_eligible(&self, degraded_eligible: bool) -> bool {
        let health = self.health.load();
        !health.removed && health.status.is_eligible(degraded_eligible)
    }

    /// Atomically replaces the health snapshot with the result of `update`.
    /// Returns `None` without writing anything once the host is removed.
    pub fn update_health(
        &self,
        mut update: impl FnMut(&HealthSnapshot) -> HealthSnapshot,
    ) -> Option<HealthUpdate> {
        let mut written = None;
        let previous = self.health.rcu(|current| {
            if current.removed {
                written = None;
                return Arc::clone(current);
            }

            let next = Arc::new(update(current));
            written = Some(next.clone());
            next
        });

        written.map(|current| HealthUpdate { previous, current })
    }

    /// Administrative override of the health status, resetting the check
    /// counters.
    pub fn set_status(&self, status: HealthStatus) -> Option<HealthUpdate> {
        self.update_health(|current| HealthSnapshot {
            status,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_checked: current.last_checked,
            removed: false,
        })
    }

    /// Marks the host as removed from its cluster.
    pub(crate) fn retire(&self) {
        self.health.rcu(|current| {
            Arc::new(HealthSnapshot {
                removed: true,
                ..HealthSnapshot::clone(current)
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn host(status: HealthStatus) -> Host {
        Host::new("127.0.0.1:9000".parse().unwrap(), 0, 1, status)
    }

    #[test]
    fn eligibility() {
        assert!(host(HealthStatus::Healthy).is_eligible(false));
        assert!(host(HealthStatus::Degraded).is_eligible(true));
        assert!(!host(HealthStatus::Degraded).is_eligible(false));

        for status in [
            HealthStatus::Unknown,
            HealthStatus::Unhealthy,
            HealthStatus::Draining,
            HealthStatus::Timeout,
        ] {
            assert!(!host(status).is_eligible(true), "{status}");
        }
    }

    #[test]
    fn removed_hosts_reject_writes() {
        let host = host(HealthStatus::Healthy);
        host.retire();

        assert!(!host.is_eligible(true));
        assert!(host.set_status(HealthStatus::Draining).is_none());
        assert_eq!(HealthStatus::Healthy, host.status());
    }

    #[test]
    fn override_resets_counters() {
        let host = host(HealthStatus::Healthy);
        host.update_health(|current| HealthSnapshot {
            consecutive_successes: 4,
            ..current.clone()
        });

        let update = host.set_status(HealthStatus::Draining).unwrap();
        assert_eq!(
            Some((HealthStatus::Healthy, HealthStatus::Draining)),
            update.transition()
        );
        assert_eq!(0, host.health().consecutive_successes);
    }

    #[test]
    fn zero_weight_is_clamped() {
        let host = Host::new("127.0.0.1:1".parse().unwrap(), 0, 0, HealthStatus::Healthy);
        assert_eq!(1, host.weight());
        assert!(host.set_weight(3));
        assert!(!host.set_weight(3));
        assert_eq!(3, host.weight());
    }

    #[test]
    fn status_names() {
        assert_eq!("DRAINING", HealthStatus::Draining.as_ref());
        assert_eq!(
            HealthStatus::Degraded,
            serde_yaml::from_str::<HealthStatus>("DEGRADED").unwrap()
        );
    }
}
