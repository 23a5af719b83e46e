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

//! Upstream clusters: named groups of hosts sharing a load balancing policy
//! and a health check.

mod cluster_manager;
pub mod load_balancer;
pub(crate) mod metrics;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use self::{
    cluster_manager::{
        ClusterConfigUpdater, ClusterHostUpdater, ClusterManager, ClusterMap, Unavailable,
    },
    load_balancer::{EligibleHosts, HostChooser, Policy, PriorityMap},
};

use crate::{
    config::{UpdateReport, ValidationError},
    health::{HealthCheckConfig, HealthChecker},
    host::{HealthStatus, Host, HostAddress, HostSpec},
};

/// The control plane's description of a cluster, without its hosts.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ClusterSpec {
    pub name: String,
    #[serde(default)]
    pub lb_policy: Policy,
    /// The most upstream connections open to this cluster at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    /// The relay buffer size for upstream connections.
    #[serde(default = "default_buffer_limit")]
    pub conn_buffer_limit_bytes: u32,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    #[schemars(with = "String")]
    pub connect_timeout: Duration,
    /// Whether DEGRADED hosts may still be selected.
    #[serde(default = "default_true")]
    pub degraded_eligible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
}

pub(crate) fn default_buffer_limit() -> u32 {
    32 * 1024
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_true() -> bool {
    true
}

impl ClusterSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lb_policy: Policy::default(),
            max_connections: None,
            conn_buffer_limit_bytes: default_buffer_limit(),
            connect_timeout: default_connect_timeout(),
            degraded_eligible: true,
            health_check: None,
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.lb_policy = policy;
        self
    }

    pub fn with_health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = Some(health_check);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName("name"));
        }

        if self.conn_buffer_limit_bytes == 0 {
            return Err(ValidationError::invalid(
                "conn_buffer_limit_bytes",
                "must be greater than zero",
            ));
        }

        if self.max_connections == Some(0) {
            return Err(ValidationError::invalid(
                "max_connections",
                "must be greater than zero when set",
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(ValidationError::invalid(
                "connect_timeout",
                "must be greater than zero",
            ));
        }

        self.health_check
            .as_ref()
            .map_or(Ok(()), HealthCheckConfig::validate)
    }
}

/// The hosts of a cluster and the cached set of those currently eligible.
struct HostPool {
    cluster: String,
    priorities: ArcSwap<PriorityMap>,
    eligible: ArcSwap<EligibleHosts>,
    degraded_eligible: AtomicBool,
    refresh_lock: Mutex<()>,
}

impl HostPool {
    fn new(cluster: &str, degraded_eligible: bool) -> Self {
        Self {
            cluster: cluster.into(),
            priorities: <_>::default(),
            eligible: <_>::default(),
            degraded_eligible: AtomicBool::new(degraded_eligible),
            refresh_lock: Mutex::new(()),
        }
    }

    #[inline]
    fn degraded_eligible(&self) -> bool {
        self.degraded_eligible.load(Ordering::Relaxed)
    }

    /// Rebuilds the eligible set from the live host state. Writers are
    /// serialized so an older rebuild can never overwrite a newer one.
    fn refresh(&self) {
        let _guard = self.refresh_lock.lock();
        let priorities = self.priorities.load();
        let eligible = EligibleHosts::from_priorities(&priorities, self.degraded_eligible());

        metrics::hosts()
            .with_label_values(&[self.cluster.as_str()])
            .set(priorities.values().map(BTreeMap::len).sum::<usize>() as i64);
        metrics::eligible_hosts()
            .with_label_values(&[self.cluster.as_str()])
            .set(eligible.len() as i64);

        self.eligible.store(Arc::new(eligible));
    }
}

/// A named group of hosts with its load balancer and health checker.
///
/// Reads ([`Cluster::select`]) never take a lock, they load the current
/// immutable snapshots. Updates are serialized per cluster.
pub struct Cluster {
    name: String,
    spec: ArcSwap<ClusterSpec>,
    pool: Arc<HostPool>,
    chooser: ArcSwap<Box<dyn HostChooser>>,
    checker: ArcSwapOption<HealthChecker>,
    update_lock: Mutex<()>,
    removed: AtomicBool,
    active_connections: Arc<AtomicUsize>,
}

impl Cluster {
    /// Creates a cluster with no hosts.
    pub fn new(spec: ClusterSpec) -> Result<Self, ValidationError> {
        spec.validate()?;

        let pool = Arc::new(HostPool::new(&spec.name, spec.degraded_eligible));
        let checker = spec
            .health_check
            .clone()
            .map(|config| Self::checker(&spec.name, &pool, config))
            .transpose()?;
        pool.refresh();

        Ok(Self {
            name: spec.name.clone(),
            chooser: ArcSwap::from_pointee(spec.lb_policy.as_host_chooser()),
            spec: ArcSwap::from_pointee(spec),
            pool,
            checker: ArcSwapOption::new(checker.map(Arc::new)),
            update_lock: Mutex::new(()),
            removed: AtomicBool::new(false),
            active_connections: <_>::default(),
        })
    }

    fn checker(
        name: &str,
        pool: &Arc<HostPool>,
        config: HealthCheckConfig,
    ) -> Result<HealthChecker, ValidationError> {
        let pool = Arc::downgrade(pool);
        HealthChecker::new(
            name,
            config,
            Arc::new(move |_: &Host| {
                if let Some(pool) = pool.upgrade() {
                    pool.refresh();
                }
            }),
        )
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn spec(&self) -> Arc<ClusterSpec> {
        self.spec.load_full()
    }

    #[inline]
    pub fn has_health_check(&self) -> bool {
        self.checker.load().is_some()
    }

    /// Every host of the cluster, ordered by priority then address.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.pool
            .priorities
            .load()
            .values()
            .flat_map(|hosts| hosts.values().cloned())
            .collect()
    }

    pub fn host(&self, address: &HostAddress) -> Option<Arc<Host>> {
        self.pool
            .priorities
            .load()
            .values()
            .find_map(|hosts| hosts.get(address).cloned())
    }

    /// The current snapshot of eligible hosts.
    #[inline]
    /// The priority levels currently holding hosts, lowest first.
    pub fn priorities(&self) -> Vec<u32> {
        self.pool.priorities.load().keys().copied().collect()
    }

    pub fn eligible_hosts(&self) -> Arc<EligibleHosts> {
        self.pool.eligible.load_full()
    }

    /// Chooses a host for a new connection, or `None` if no host is
    /// eligible. Never mutates host or cluster state.
    pub fn select(&self) -> Option<Arc<Host>> {
        let degraded_eligible = self.pool.degraded_eligible();
        let chooser = self.chooser.load();
        let host = chooser.choose(&self.pool.eligible.load())?;

        if host.is_eligible(degraded_eligible) {
            return Some(host);
        }

        // The host changed state after the cached set was built, choose
        // from the live state instead.
        let live = EligibleHosts::from_priorities(&self.pool.priorities.load(), degraded_eligible);
        chooser.choose(&live)
    }

    /// Administrative override of a host's status.
    pub fn set_host_status(&self, address: &HostAddress, status: HealthStatus) -> bool {
        let updated = self
            .host(address)
            .and_then(|host| host.set_status(status))
            .is_some();

        if updated {
            tracing::info!(cluster = %self.name, host = %address, %status, "host status overridden");
            self.pool.refresh();
        }

        updated
    }

    /// Reserves an upstream connection slot, `None` if the cluster is at its
    /// `max_connections` limit.
    pub fn try_acquire_connection(&self) -> Option<ConnectionGuard> {
        let limit = self
            .spec
            .load()
            .max_connections
            .map_or(usize::MAX, |max| max as usize);

        self.active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < limit).then_some(active + 1)
            })
            .ok()
            .map(|_| ConnectionGuard {
                active: self.active_connections.clone(),
            })
    }

    #[inline]
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Applies a config only update, keeping every host and its health.
    pub(crate) fn apply_spec(&self, spec: ClusterSpec) -> Result<(), ValidationError> {
        spec.validate()?;
        let _guard = self.update_lock.lock();
        let current = self.spec.load_full();

        // Built before anything is touched so a failure leaves the cluster as is.
        let checker = if current.health_check != spec.health_check {
            Some(
                spec.health_check
                    .clone()
                    .map(|config| Self::checker(&self.name, &self.pool, config))
                    .transpose()?
                    .map(Arc::new),
            )
        } else {
            None
        };

        if current.lb_policy != spec.lb_policy {
            self.chooser.store(Arc::new(spec.lb_policy.as_host_chooser()));
        }

        if let Some(next) = checker {
            if let Some(previous) = self.checker.swap(next.clone()) {
                previous.stop();
            }

            match next {
                Some(checker) => checker.start(self.hosts()),
                None => {
                    for host in self.hosts() {
                        if host.status() != HealthStatus::Draining {
                            host.set_status(HealthStatus::Healthy);
                        }
                    }
                }
            }
        }

        self.pool
            .degraded_eligible
            .store(spec.degraded_eligible, Ordering::Relaxed);
        self.spec.store(Arc::new(spec));
        self.pool.refresh();

        Ok(())
    }

    /// Replaces the host set of one priority level. Hosts whose address is
    /// already present keep their health state, new hosts start UNKNOWN (or
    /// their declared status when there is no health check) and removed
    /// hosts are retired before their check loop is cancelled.
    pub(crate) fn replace_hosts(
        &self,
        priority: u32,
        specs: Vec<HostSpec>,
    ) -> Result<UpdateReport, ValidationError> {
        let _guard = self.update_lock.lock();
        if self.is_removed() {
            return Err(ValidationError::UnknownCluster(self.name.clone()));
        }

        let checker = self.checker.load_full();
        let current = self.pool.priorities.load_full();
        let existing = current.get(&priority).cloned().unwrap_or_default();

        let mut report = UpdateReport::default();
        let mut next = BTreeMap::new();
        let mut added = Vec::new();

        for spec in specs {
            if spec.weight == 0 {
                report.reject(
                    spec.address.to_string(),
                    ValidationError::invalid("weight", "must be greater than zero"),
                );
                continue;
            }

            if next.contains_key(&spec.address) {
                report.reject(
                    spec.address.to_string(),
                    ValidationError::NotUnique(format!("hosts[{}]", spec.address)),
                );
                continue;
            }

            let host = match existing.get(&spec.address) {
                Some(host) => {
                    host.set_weight(spec.weight);
                    host.clone()
                }
                None => {
                    let status = if checker.is_some() {
                        HealthStatus::Unknown
                    } else {
                        spec.health_status.unwrap_or(HealthStatus::Healthy)
                    };
                    let host = Arc::new(Host::new(
                        spec.address.clone(),
                        priority,
                        spec.weight,
                        status,
                    ));
                    added.push(host.clone());
                    host
                }
            };

            next.insert(spec.address, host);
            report.applied += 1;
        }

        let removed: Vec<_> = existing
            .iter()
            .filter(|(address, _)| !next.contains_key(*address))
            .map(|(_, host)| host.clone())
            .collect();

        let mut priorities = PriorityMap::clone(&current);
        if next.is_empty() {
            priorities.remove(&priority);
        } else {
            priorities.insert(priority, next);
        }
        self.pool.priorities.store(Arc::new(priorities));
        self.pool.refresh();

        for host in &removed {
            host.retire();
            if let Some(checker) = &checker {
                checker.stop_host(host);
            }
        }

        if let Some(checker) = &checker {
            checker.start(added.iter().cloned());
        }

        tracing::debug!(
            cluster = %self.name,
            priority,
            added = added.len(),
            removed = removed.len(),
            rejected = report.rejected.len(),
            "updated cluster hosts"
        );

        Ok(report)
    }

    /// Stops health checking and retires every host. Connections already
    /// established to those hosts are unaffected.
    pub(crate) fn shut_down(&self) {
        let _guard = self.update_lock.lock();
        self.removed.store(true, Ordering::Release);

        if let Some(checker) = self.checker.swap(None) {
            checker.stop();
        }

        for host in self.hosts() {
            host.retire();
        }

        metrics::remove_cluster(&self.name);
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("spec", &self.spec.load_full())
            .field("hosts", &self.hosts().len())
            .field("eligible", &self.pool.eligible.load().len())
            .finish()
    }
}

/// An upstream connection slot, released on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec(name: &str) -> ClusterSpec {
        ClusterSpec::new(name)
    }

    fn host(port: u16) -> HostSpec {
        HostSpec::new((std::net::Ipv4Addr::LOCALHOST, port))
    }

    #[tokio::test]
    async fn hosts_without_health_check_are_healthy() {
        let cluster = Cluster::new(spec("static")).unwrap();
        cluster
            .replace_hosts(
                0,
                vec![host(1), host(2).with_health_status(HealthStatus::Draining)],
            )
            .unwrap();

        let selected = cluster.select().unwrap();
        assert_eq!(1, selected.address().port);
        assert_eq!(1, cluster.eligible_hosts().len());
    }

    #[tokio::test]
    async fn new_hosts_with_health_check_start_unknown() {
        let cluster = Cluster::new(spec("checked").with_health_check(HealthCheckConfig {
            interval: Duration::from_secs(60),
            initial_jitter: Duration::from_secs(60),
            ..<_>::default()
        }))
        .unwrap();
        cluster.replace_hosts(0, vec![host(1)]).unwrap();

        assert_eq!(HealthStatus::Unknown, cluster.hosts()[0].status());
        assert!(cluster.select().is_none());
    }

    #[tokio::test]
    async fn invalid_hosts_are_rejected_individually() {
        let cluster = Cluster::new(spec("partial")).unwrap();
        let report = cluster
            .replace_hosts(0, vec![host(1), host(2).with_weight(0), host(1)])
            .unwrap();

        assert_eq!(1, report.applied);
        assert_eq!(2, report.rejected.len());
        assert_eq!("127.0.0.1:2", report.rejected[0].entry);
        assert_eq!(1, cluster.hosts().len());
    }

    #[tokio::test]
    async fn override_and_degraded_mode() {
        let mut strict = spec("degraded");
        strict.degraded_eligible = false;
        let cluster = Cluster::new(strict).unwrap();
        cluster.replace_hosts(0, vec![host(1)]).unwrap();

        let address = cluster.hosts()[0].address().clone();
        assert!(cluster.set_host_status(&address, HealthStatus::Degraded));
        assert!(cluster.select().is_none());

        let mut lenient = spec("degraded");
        lenient.degraded_eligible = true;
        cluster.apply_spec(lenient).unwrap();
        assert!(cluster.select().is_some());
    }

    #[tokio::test]
    async fn stale_snapshot_never_returns_ineligible_host() {
        let cluster = Cluster::new(spec("stale")).unwrap();
        cluster.replace_hosts(0, vec![host(1), host(2)]).unwrap();

        // Bypass the cluster so the cached eligible set is not refreshed.
        cluster.host(&host(1).address).unwrap().set_status(HealthStatus::Unhealthy);

        for _ in 0..10 {
            assert_eq!(2, cluster.select().unwrap().address().port);
        }
    }

    #[tokio::test]
    async fn connection_limit() {
        let mut limited = spec("limited");
        limited.max_connections = Some(1);
        let cluster = Cluster::new(limited).unwrap();

        let guard = cluster.try_acquire_connection().unwrap();
        assert!(cluster.try_acquire_connection().is_none());
        assert_eq!(1, cluster.active_connections());
        drop(guard);
        assert!(cluster.try_acquire_connection().is_some());
    }

    #[tokio::test]
    async fn removed_cluster_rejects_host_updates() {
        let cluster = Cluster::new(spec("gone")).unwrap();
        cluster.replace_hosts(0, vec![host(1)]).unwrap();
        let first = cluster.hosts()[0].clone();
        cluster.shut_down();

        assert!(first.is_removed());
        assert_eq!(
            Err(ValidationError::UnknownCluster("gone".into())),
            cluster.replace_hosts(0, vec![host(2)])
        );
    }

    #[test]
    fn spec_validation() {
        assert_eq!(
            Err(ValidationError::EmptyName("name")),
            spec(" ").validate()
        );

        let mut zero_buffer = spec("zero");
        zero_buffer.conn_buffer_limit_bytes = 0;
        assert!(zero_buffer.validate().is_err());

        let spec: ClusterSpec = serde_yaml::from_str(
            "
name: tstCluster
lb_policy: LB_RANDOM
conn_buffer_limit_bytes: 32768
health_check:
  interval: 1s
  unhealthy_threshold: 1
  healthy_threshold: 1
  tcp: {}
",
        )
        .unwrap();
        spec.validate().unwrap();
        assert_eq!(Policy::Random, spec.lb_policy);
        assert!(spec.degraded_eligible);
    }
}
