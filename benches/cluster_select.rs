use std::net::{Ipv4Addr, SocketAddr};

use divan::Bencher;
use meshgate::{
    cluster::{ClusterConfigUpdater, ClusterHostUpdater, ClusterManager, ClusterSpec, Policy},
    host::{HealthStatus, HostSpec},
};
use rand::Rng;

const HOSTS: &[usize] = &[1, 10, 100, 1000];

fn manager(policy: Policy, hosts: usize) -> ClusterManager {
    let mut rng = rand::thread_rng();
    let manager = ClusterManager::new();
    manager.update_cluster_config(vec![ClusterSpec::new("bench").with_policy(policy)]);
    manager
        .update_cluster_host(
            "bench",
            0,
            (0..hosts)
                .map(|i| {
                    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, 1024 + i as u16));
                    let status = if rng.gen_ratio(1, 10) {
                        HealthStatus::Unhealthy
                    } else {
                        HealthStatus::Healthy
                    };
                    HostSpec::new(address)
                        .with_weight(rng.gen_range(1..=100))
                        .with_health_status(status)
                })
                .collect(),
        )
        .unwrap();
    manager
}

#[divan::bench(args = HOSTS)]
fn round_robin(b: Bencher, hosts: usize) {
    let manager = manager(Policy::RoundRobin, hosts);
    b.bench(|| divan::black_box(manager.select("bench")));
}

#[divan::bench(args = HOSTS)]
fn random(b: Bencher, hosts: usize) {
    let manager = manager(Policy::Random, hosts);
    b.bench(|| divan::black_box(manager.select("bench")));
}

#[divan::bench(args = HOSTS, threads = [0, 4])]
fn contended_round_robin(b: Bencher, hosts: usize) {
    let manager = manager(Policy::RoundRobin, hosts);
    b.bench(|| divan::black_box(manager.select("bench")));
}

fn main() {
    divan::main();
}
