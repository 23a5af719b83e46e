/*
 * Copyright 2020 Google LLC All Rights Reserved.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The YAML configuration document.

mod error;
mod filter;
pub mod watch;

use std::{collections::HashSet, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use self::{
    error::{Rejected, UpdateReport, ValidationError, ValueInvalidArgs},
    filter::Filter,
};

use crate::{
    cluster::{ClusterConfigUpdater, ClusterHostUpdater, ClusterSpec},
    host::HostSpec,
    listener::ListenerConfig,
};

/// The complete configuration of a proxy.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
    #[serde(default)]
    pub clusters: Vec<ClusterSpec>,
    #[serde(default)]
    pub hosts: Vec<ClusterHosts>,
    /// How long shutdown waits for in-flight connections.
    #[serde(with = "humantime_serde", default = "default_drain_timeout")]
    #[schemars(with = "String")]
    pub drain_timeout: Duration,
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

/// The hosts of one priority level of a cluster.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ClusterHosts {
    pub cluster: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub hosts: Vec<HostSpec>,
}

impl Config {
    /// Attempts to deserialize `input` as a YAML object representing `Self`.
    pub fn from_reader<R: std::io::Read>(input: R) -> Result<Self, eyre::Error> {
        let config: Self = serde_yaml::from_reader(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the listeners, which unlike clusters and hosts cannot be
    /// partially applied.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut names = HashSet::new();
        let mut addresses = HashSet::new();

        for listener in &self.listeners {
            listener.validate()?;

            if !names.insert(&listener.name) {
                return Err(ValidationError::NotUnique(format!(
                    "listeners[{}].name",
                    listener.name
                )));
            }

            if !addresses.insert(listener.address) {
                return Err(ValidationError::NotUnique(format!(
                    "listeners[{}].address",
                    listener.name
                )));
            }
        }

        Ok(())
    }

    /// Applies the clusters and then the hosts of this configuration. Invalid
    /// entries are skipped and listed in the returned report. Priority levels
    /// of a configured cluster which the hosts section no longer lists are
    /// emptied.
    pub fn apply<U>(&self, updater: &U) -> UpdateReport
    where
        U: ClusterConfigUpdater + ClusterHostUpdater + ?Sized,
    {
        let span = tracing::info_span!("cluster_update", clusters = self.clusters.len());
        let _enter = span.enter();

        let mut report = updater.update_cluster_config(self.clusters.clone());
        let mut seen = HashSet::new();

        for entry in &self.hosts {
            let key = format!("{}/{}", entry.cluster, entry.priority);
            if !seen.insert((entry.cluster.as_str(), entry.priority)) {
                report.reject(key.clone(), ValidationError::NotUnique(format!("hosts[{key}]")));
                continue;
            }

            match updater.update_cluster_host(&entry.cluster, entry.priority, entry.hosts.clone()) {
                Ok(hosts) => {
                    report.applied += hosts.applied;
                    report.rejected.extend(hosts.rejected);
                }
                Err(error) => report.reject(key, error),
            }
        }

        // The file is the whole host membership: priorities it no longer
        // lists are emptied.
        for cluster in &self.clusters {
            for priority in updater.priorities(&cluster.name) {
                if seen.contains(&(cluster.name.as_str(), priority)) {
                    continue;
                }

                tracing::info!(cluster = %cluster.name, priority, "removing hosts no longer configured");
                if let Err(error) = updater.update_cluster_host(&cluster.name, priority, Vec::new()) {
                    tracing::warn!(cluster = %cluster.name, priority, %error, "failed to remove hosts");
                }
            }
        }

        if report.is_clean() {
            tracing::info!(applied = report.applied, "configuration applied");
        } else {
            tracing::warn!(
                applied = report.applied,
                rejected = report.rejected.len(),
                "configuration partially applied"
            );
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cluster::{ClusterManager, Policy},
        host::HealthStatus,
    };
    use pretty_assertions::assert_eq;

    const REFERENCE: &str = "
drain_timeout: 5s
listeners:
  - name: ingress
    address: 127.0.0.1:2048
    per_conn_buffer_limit_bytes: 32768
    filters:
      - name: meshgate.filters.fault_injection.v1alpha1.FaultInjection
        config:
          delay_percent: 100
          delay_duration: 2000ms
      - name: meshgate.filters.tcp_proxy.v1alpha1.TcpProxy
        config:
          cluster: tstCluster
clusters:
  - name: tstCluster
    lb_policy: RANDOM
    conn_buffer_limit_bytes: 32768
    health_check:
      interval: 1s
      timeout: 1s
      unhealthy_threshold: 1
      healthy_threshold: 1
      tcp: {}
hosts:
  - cluster: tstCluster
    hosts:
      - address: 127.0.0.1:9000
        weight: 100
";

    #[test]
    fn parse_reference_config() {
        let config = Config::from_reader(REFERENCE.as_bytes()).unwrap();

        assert_eq!(Duration::from_secs(5), config.drain_timeout);
        assert_eq!(1, config.listeners.len());
        assert_eq!(2, config.listeners[0].filters.len());
        assert_eq!(Policy::Random, config.clusters[0].lb_policy);
        assert_eq!(100, config.hosts[0].hosts[0].weight);
        assert_eq!(0, config.hosts[0].priority);
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(Config::from_reader("clusterz: []".as_bytes()).is_err());
    }

    #[test]
    fn rejects_duplicate_listeners() {
        let yaml = "
listeners:
  - name: a
    address: 127.0.0.1:1000
  - name: a
    address: 127.0.0.1:1001
";
        let error = Config::from_reader(yaml.as_bytes()).unwrap_err();
        assert_eq!(
            Some(&ValidationError::NotUnique("listeners[a].name".into())),
            error.downcast_ref::<ValidationError>()
        );
    }

    #[tokio::test]
    async fn reapply_removes_unlisted_priorities() {
        let both = "
clusters:
  - name: web
hosts:
  - cluster: web
    hosts:
      - address: 127.0.0.1:1
  - cluster: web
    priority: 1
    hosts:
      - address: 127.0.0.1:2
";
        let primary_only = "
clusters:
  - name: web
hosts:
  - cluster: web
    hosts:
      - address: 127.0.0.1:1
";
        let manager = ClusterManager::new();
        Config::from_reader(both.as_bytes()).unwrap().apply(&manager);
        let web = manager.get_cluster_by_name("web").unwrap();
        assert_eq!(vec![0, 1], web.priorities());
        let backup = web
            .hosts()
            .into_iter()
            .find(|host| host.priority() == 1)
            .unwrap();

        let report = Config::from_reader(primary_only.as_bytes())
            .unwrap()
            .apply(&manager);

        assert!(report.is_clean());
        assert_eq!(vec![0], web.priorities());
        assert_eq!(1, web.hosts().len());
        assert!(backup.is_removed());
    }

    #[tokio::test]
    async fn apply_reports_bad_entries() {
        let yaml = "
clusters:
  - name: web
hosts:
  - cluster: web
    hosts:
      - address: 127.0.0.1:1
      - address: 127.0.0.1:2
        weight: 0
        health_status: DRAINING
  - cluster: missing
    hosts:
      - address: 127.0.0.1:3
  - cluster: web
    hosts: []
";
        let config = Config::from_reader(yaml.as_bytes()).unwrap();
        let manager = ClusterManager::new();
        let report = config.apply(&manager);

        assert_eq!(2, report.applied);
        assert_eq!(
            vec!["127.0.0.1:2", "missing/0", "web/0"],
            report
                .rejected
                .iter()
                .map(|rejected| rejected.entry.as_str())
                .collect::<Vec<_>>()
        );

        let web = manager.get_cluster_by_name("web").unwrap();
        assert_eq!(HealthStatus::Healthy, web.hosts()[0].status());
    }
}
