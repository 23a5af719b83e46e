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

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::{metrics, Cluster, ClusterSpec};
use crate::{
    config::{UpdateReport, ValidationError},
    host::{Host, HostSpec},
};

/// An immutable set of clusters keyed by name.
#[derive(Clone, Debug, Default)]
pub struct ClusterMap(HashMap<String, Arc<Cluster>>);

impl ClusterMap {
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.keys().map(String::as_str)
    }
}

impl std::ops::Deref for ClusterMap {
    type Target = HashMap<String, Arc<Cluster>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<(String, Arc<Cluster>)> for ClusterMap {
    fn from_iter<I: IntoIterator<Item = (String, Arc<Cluster>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Why no upstream host could be chosen for a connection.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Unavailable {
    #[error("cluster `{0}` does not exist")]
    UnknownCluster(String),
    #[error("cluster `{0}` has no healthy host")]
    NoHealthyHost(String),
}

impl Unavailable {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownCluster(_) => "unknown_cluster",
            Self::NoHealthyHost(_) => "no_healthy_host",
        }
    }
}

/// Receives full cluster configuration snapshots from the control plane.
pub trait ClusterConfigUpdater: Send + Sync {
    /// Makes `clusters` the complete set of clusters. Clusters missing from
    /// the batch are removed, existing ones keep their hosts.
    fn update_cluster_config(&self, clusters: Vec<ClusterSpec>) -> UpdateReport;
}

/// Receives host membership snapshots from the control plane.
pub trait ClusterHostUpdater: Send + Sync {
    /// Replaces the hosts of one priority level of a cluster.
    fn update_cluster_host(
        &self,
        cluster: &str,
        priority: u32,
        hosts: Vec<HostSpec>,
    ) -> Result<UpdateReport, ValidationError>;

    /// The priority levels of `cluster` currently holding hosts, empty for
    /// an unknown cluster.
    fn priorities(&self, cluster: &str) -> Vec<u32>;
}

/// ClusterManager owns every cluster and is the entry point for host
/// selection. Lookups are lock free, updates to the set of clusters are
/// serialized.
#[derive(Debug, Default)]
pub struct ClusterManager {
    clusters: ArcSwap<ClusterMap>,
    membership: Mutex<()>,
}

impl ClusterManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the current clusters.
    pub fn clusters(&self) -> Arc<ClusterMap> {
        self.clusters.load_full()
    }

    pub fn get_cluster_by_name(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.load().get(name).cloned()
    }

    /// Chooses a host of `cluster` for a new connection.
    pub fn select(&self, cluster: &str) -> Result<Arc<Host>, Unavailable> {
        self.select_upstream(cluster).map(|(_, host)| host)
    }

    /// Like [`ClusterManager::select`], also returning the cluster the host
    /// was chosen from.
    pub fn select_upstream(&self, cluster: &str) -> Result<(Arc<Cluster>, Arc<Host>), Unavailable> {
        let result = self
            .get_cluster_by_name(cluster)
            .ok_or_else(|| Unavailable::UnknownCluster(cluster.into()))
            .and_then(|cluster| match cluster.select() {
                Some(host) => Ok((cluster, host)),
                None => Err(Unavailable::NoHealthyHost(cluster.name().into())),
            });

        let label = match &result {
            Ok(_) => "selected",
            Err(error) => error.as_str(),
        };
        metrics::selections_total()
            .with_label_values(&[cluster, label])
            .inc();

        result
    }

    /// Removes every cluster, stopping all health checking.
    pub fn shutdown(&self) {
        let _guard = self.membership.lock();
        let clusters = self.clusters.swap(<_>::default());
        for cluster in clusters.values() {
            cluster.shut_down();
        }
        metrics::active_clusters().set(0);
    }
}

impl ClusterConfigUpdater for ClusterManager {
    fn update_cluster_config(&self, specs: Vec<ClusterSpec>) -> UpdateReport {
        let _guard = self.membership.lock();
        let current = self.clusters.load_full();
        let mut report = UpdateReport::default();
        let mut next = HashMap::with_capacity(specs.len());
        let mut applied = 0;
        let mut seen = HashSet::new();

        // A rejected update for a live cluster keeps the cluster as it was.
        let mut reject = |next: &mut HashMap<String, Arc<Cluster>>, entry: String, error| {
            if let Some(cluster) = current.get(&entry) {
                next.entry(entry.clone()).or_insert_with(|| cluster.clone());
            }
            report.reject(entry, error);
        };

        for spec in specs {
            let entry = spec.name.clone();
            if !seen.insert(entry.clone()) {
                let error = ValidationError::NotUnique(format!("clusters[{entry}]"));
                reject(&mut next, entry, error);
                continue;
            }

            if let Err(error) = spec.validate() {
                reject(&mut next, entry, error);
                continue;
            }

            let cluster = match current.get(&spec.name) {
                Some(cluster) => cluster.apply_spec(spec).map(|_| cluster.clone()),
                None => Cluster::new(spec).map(Arc::new),
            };

            match cluster {
                Ok(cluster) => {
                    next.insert(entry, cluster);
                    applied += 1;
                }
                Err(error) => reject(&mut next, entry, error),
            }
        }
        report.applied += applied;

        let removed: Vec<_> = current
            .iter()
            .filter(|(name, _)| !next.contains_key(*name))
            .map(|(_, cluster)| cluster.clone())
            .collect();

        metrics::active_clusters().set(next.len() as i64);
        self.clusters.store(Arc::new(ClusterMap(next)));

        for cluster in removed {
            tracing::info!(cluster = cluster.name(), "removing cluster");
            cluster.shut_down();
        }

        report
    }
}

impl ClusterHostUpdater for ClusterManager {
    fn update_cluster_host(
        &self,
        cluster: &str,
        priority: u32,
        hosts: Vec<HostSpec>,
    ) -> Result<UpdateReport, ValidationError> {
        self.get_cluster_by_name(cluster)
            .ok_or_else(|| ValidationError::UnknownCluster(cluster.into()))?
            .replace_hosts(priority, hosts)
    }

    fn priorities(&self, cluster: &str) -> Vec<u32> {
        self.get_cluster_by_name(cluster)
            .map(|cluster| cluster.priorities())
            .unwrap_or_default()
    }
}
