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
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use rand::{thread_rng, Rng};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::host::{Host, HostAddress};

/// Hosts of a cluster keyed by priority, then by address.
pub type PriorityMap = BTreeMap<u32, BTreeMap<HostAddress, Arc<Host>>>;

/// Policy represents how a cluster distributes connections across its
/// eligible hosts.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq, JsonSchema)]
pub enum Policy {
    /// Hand out hosts in turns, proportionally to their weight.
    #[default]
    #[serde(rename = "ROUND_ROBIN", alias = "LB_ROUNDROBIN")]
    RoundRobin,
    /// Pick hosts at random, proportionally to their weight.
    #[serde(rename = "RANDOM", alias = "LB_RANDOM")]
    Random,
}

impl Policy {
    pub fn as_host_chooser(&self) -> Box<dyn HostChooser> {
        match self {
            Policy::RoundRobin => Box::new(RoundRobinHostChooser::new()),
            Policy::Random => Box::new(RandomHostChooser),
        }
    }
}

/// An immutable snapshot of the hosts a cluster may currently hand out,
/// with the cumulative weights needed for weighted selection.
#[derive(Debug, Default)]
pub struct EligibleHosts {
    priority: Option<u32>,
    hosts: Vec<Arc<Host>>,
    /// `cumulative[i]` is the sum of the weights of `hosts[..=i]`.
    cumulative: Vec<u64>,
}

impl EligibleHosts {
    pub fn new(priority: Option<u32>, hosts: Vec<Arc<Host>>) -> Self {
        let cumulative = hosts
            .iter()
            .scan(0u64, |total, host| {
                *total += u64::from(host.weight());
                Some(*total)
            })
            .collect();

        Self {
            priority,
            hosts,
            cumulative,
        }
    }

    /// Builds the set from the lowest priority level that has at least one
    /// eligible host.
    pub fn from_priorities(priorities: &PriorityMap, degraded_eligible: bool) -> Self {
        for (priority, hosts) in priorities {
            let eligible: Vec<_> = hosts
                .values()
                .filter(|host| host.is_eligible(degraded_eligible))
                .cloned()
                .collect();

            if !eligible.is_empty() {
                return Self::new(Some(*priority), eligible);
            }
        }

        Self::default()
    }

    /// The priority level the hosts were taken from.
    #[inline]
    pub fn priority(&self) -> Option<u32> {
        self.priority
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    #[inline]
    pub fn total_weight(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Host>> + '_ {
        self.hosts.iter()
    }

    /// Returns the host owning `point` in `[0, total_weight)`.
    #[inline]
    pub fn at_weight(&self, point: u64) -> Option<&Arc<Host>> {
        let index = self.cumulative.partition_point(|&end| end <= point);
        self.hosts.get(index)
    }
}

/// HostChooser picks one host out of an eligible set.
pub trait HostChooser: Send + Sync {
    /// Returns `None` only if `hosts` is empty.
    fn choose(&self, hosts: &EligibleHosts) -> Option<Arc<Host>>;
}

/// RoundRobinHostChooser walks the weight space with a shared cursor, so
/// over `n` calls each host is chosen `n * weight / total` times.
pub struct RoundRobinHostChooser {
    next: AtomicU64,
}

impl RoundRobinHostChooser {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }
}

impl Default for RoundRobinHostChooser {
    fn default() -> Self {
        Self::new()
    }
}

impl HostChooser for RoundRobinHostChooser {
    fn choose(&self, hosts: &EligibleHosts) -> Option<Arc<Host>> {
        let total = hosts.total_weight();
        if total == 0 {
            return None;
        }

        let count = self.next.fetch_add(1, Ordering::Relaxed);
        hosts.at_weight(count % total).cloned()
    }
}

/// RandomHostChooser picks a uniformly random point in the weight space.
pub struct RandomHostChooser;

impl HostChooser for RandomHostChooser {
    fn choose(&self, hosts: &EligibleHosts) -> Option<Arc<Host>> {
        let total = hosts.total_weight();
        if total == 0 {
            return None;
        }

        hosts.at_weight(thread_rng().gen_range(0..total)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::host::HealthStatus;
    use pretty_assertions::assert_eq;

    fn hosts(weights: &[u32]) -> EligibleHosts {
        EligibleHosts::new(
            Some(0),
            weights
                .iter()
                .enumerate()
                .map(|(i, weight)| {
                    Arc::new(Host::new(
                        format!("127.0.0.1:{}", 8000 + i).parse().unwrap(),
                        0,
                        *weight,
                        HealthStatus::Healthy,
                    ))
                })
                .collect(),
        )
    }

    fn counts(chooser: &dyn HostChooser, hosts: &EligibleHosts, n: usize) -> HashMap<u16, usize> {
        let mut counts = HashMap::new();
        for _ in 0..n {
            let host = chooser.choose(hosts).unwrap();
            *counts.entry(host.address().port).or_default() += 1;
        }
        counts
    }

    #[test]
    fn weight_lookup() {
        let hosts = hosts(&[3, 1, 2]);
        assert_eq!(6, hosts.total_weight());

        let ports: Vec<u16> = (0..6)
            .map(|point| hosts.at_weight(point).unwrap().address().port)
            .collect();
        assert_eq!(vec![8000, 8000, 8000, 8001, 8002, 8002], ports);
        assert!(hosts.at_weight(6).is_none());
    }

    #[test]
    fn round_robin_is_exact_over_full_cycles() {
        let hosts = hosts(&[3, 1]);
        let counts = counts(&RoundRobinHostChooser::new(), &hosts, 4000);

        assert_eq!(3000, counts[&8000]);
        assert_eq!(1000, counts[&8001]);
    }

    #[test]
    fn round_robin_cycles_in_stable_order() {
        let hosts = hosts(&[1, 1, 1]);
        let chooser = RoundRobinHostChooser::new();
        let ports: Vec<u16> = (0..6)
            .map(|_| chooser.choose(&hosts).unwrap().address().port)
            .collect();

        assert_eq!(vec![8000, 8001, 8002, 8000, 8001, 8002], ports);
    }

    #[test]
    fn random_converges_to_weights() {
        let hosts = hosts(&[3, 1]);
        let n = 100_000;
        let counts = counts(&RandomHostChooser, &hosts, n);

        let ratio = counts[&8000] as f64 / counts[&8001] as f64;
        assert!((2.8..3.2).contains(&ratio), "ratio was {ratio}");
    }

    #[test]
    fn empty_set_has_no_choice() {
        let hosts = EligibleHosts::default();
        assert!(RandomHostChooser.choose(&hosts).is_none());
        assert!(RoundRobinHostChooser::new().choose(&hosts).is_none());
    }

    #[test]
    fn lowest_eligible_priority_wins() {
        let host = |port, priority, status| {
            Arc::new(Host::new(
                HostAddress::from((std::net::Ipv4Addr::LOCALHOST, port)),
                priority,
                1,
                status,
            ))
        };

        let mut priorities = PriorityMap::new();
        let primary = host(1, 0, HealthStatus::Unhealthy);
        let secondary = host(2, 1, HealthStatus::Healthy);
        let degraded = host(3, 1, HealthStatus::Degraded);
        priorities.entry(0).or_default().insert(primary.address().clone(), primary.clone());
        for host in [&secondary, &degraded] {
            priorities.entry(1).or_default().insert(host.address().clone(), host.clone());
        }

        let eligible = EligibleHosts::from_priorities(&priorities, true);
        assert_eq!(Some(1), eligible.priority());
        assert_eq!(2, eligible.len());

        let strict = EligibleHosts::from_priorities(&priorities, false);
        assert_eq!(1, strict.len());

        primary.set_status(HealthStatus::Healthy);
        let eligible = EligibleHosts::from_priorities(&priorities, true);
        assert_eq!(Some(0), eligible.priority());
    }

    #[test]
    fn policy_names() {
        assert_eq!(Policy::Random, serde_yaml::from_str("RANDOM").unwrap());
        assert_eq!(Policy::Random, serde_yaml::from_str("LB_RANDOM").unwrap());
        assert_eq!(Policy::RoundRobin, serde_yaml::from_str("ROUND_ROBIN").unwrap());
        assert_eq!(Policy::RoundRobin, Policy::default());
    }
}
