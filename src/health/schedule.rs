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

//! Delay calculation for the per host check timers. Each loop re-arms its
//! timer with [`next_delay`] after every probe.

use std::time::Duration;

use rand::Rng;

use super::HealthCheckConfig;
use crate::host::HealthStatus;

const MIN_DELAY: Duration = Duration::from_millis(1);

/// The delay before the first probe of a newly added host, uniform in
/// `[0, initial_jitter]`.
pub fn initial_delay(config: &HealthCheckConfig, rng: &mut impl Rng) -> Duration {
    uniform_up_to(config.initial_jitter, rng)
}

/// The delay before the next probe of a host currently in `status`.
/// `transitioned` is set when the probe that just finished changed the
/// status, in which case the matching edge interval applies unjittered.
pub fn next_delay(
    config: &HealthCheckConfig,
    status: HealthStatus,
    transitioned: bool,
    rng: &mut impl Rng,
) -> Duration {
    let base = base_interval(config, status);

    if transitioned {
        let edge = match status {
            HealthStatus::Unhealthy => config.unhealthy_edge_interval,
            HealthStatus::Healthy | HealthStatus::Degraded => config.healthy_edge_interval,
            _ => None,
        };

        if let Some(edge) = edge {
            return edge.max(MIN_DELAY);
        }
    }

    let spread = base.mul_f64(f64::from(config.interval_jitter_percent.min(100)) / 100.0);
    let jittered = base.saturating_sub(spread) + uniform_up_to(spread * 2, rng);

    (jittered + uniform_up_to(config.interval_jitter, rng)).max(MIN_DELAY)
}

fn base_interval(config: &HealthCheckConfig, status: HealthStatus) -> Duration {
    match status {
        HealthStatus::Unhealthy => config.unhealthy_interval.unwrap_or(config.interval),
        HealthStatus::Unknown => config.no_traffic_interval.unwrap_or(config.interval),
        _ => config.interval,
    }
}

fn uniform_up_to(max: Duration, rng: &mut impl Rng) -> Duration {
    if max.is_zero() {
        Duration::ZERO
    } else {
        Duration::from_nanos(rng.gen_range(0..=max.as_nanos().min(u64::MAX as u128) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            interval: Duration::from_secs(10),
            initial_jitter: Duration::from_secs(2),
            interval_jitter_percent: 20,
            unhealthy_interval: Some(Duration::from_secs(30)),
            unhealthy_edge_interval: Some(Duration::from_secs(1)),
            healthy_edge_interval: Some(Duration::from_millis(500)),
            ..<_>::default()
        }
    }

    #[test]
    fn initial_delay_within_jitter() {
        let config = config();
        let mut rng = rng();
        for _ in 0..1000 {
            assert!(initial_delay(&config, &mut rng) <= Duration::from_secs(2));
        }

        let no_jitter = HealthCheckConfig::default();
        assert_eq!(Duration::ZERO, initial_delay(&no_jitter, &mut rng));
    }

    #[test]
    fn percent_jitter_bounds() {
        let config = config();
        let mut rng = rng();
        let (mut min, mut max) = (Duration::MAX, Duration::ZERO);
        for _ in 0..5000 {
            let delay = next_delay(&config, HealthStatus::Healthy, false, &mut rng);
            assert!(delay >= Duration::from_secs(8), "{delay:?}");
            assert!(delay <= Duration::from_secs(12), "{delay:?}");
            min = min.min(delay);
            max = max.max(delay);
        }

        // Both sides of the interval are reachable.
        assert!(min < Duration::from_secs(9));
        assert!(max > Duration::from_secs(11));
    }

    #[test]
    fn unhealthy_interval_substitutes() {
        let config = config();
        let mut rng = rng();
        for _ in 0..1000 {
            let delay = next_delay(&config, HealthStatus::Unhealthy, false, &mut rng);
            assert!(delay >= Duration::from_secs(24), "{delay:?}");
            assert!(delay <= Duration::from_secs(36), "{delay:?}");
        }
    }

    #[test]
    fn edges_apply_only_after_transition() {
        let config = config();
        let mut rng = rng();

        assert_eq!(
            Duration::from_secs(1),
            next_delay(&config, HealthStatus::Unhealthy, true, &mut rng)
        );
        assert_eq!(
            Duration::from_millis(500),
            next_delay(&config, HealthStatus::Healthy, true, &mut rng)
        );
        assert!(next_delay(&config, HealthStatus::Healthy, false, &mut rng) >= Duration::from_secs(8));
    }

    #[test]
    fn edge_falls_back_to_base() {
        let config = HealthCheckConfig {
            interval: Duration::from_secs(3),
            ..<_>::default()
        };
        let mut rng = rng();

        assert_eq!(
            Duration::from_secs(3),
            next_delay(&config, HealthStatus::Unhealthy, true, &mut rng)
        );
    }

    #[test]
    fn absolute_jitter_is_added() {
        let config = HealthCheckConfig {
            interval: Duration::from_secs(1),
            interval_jitter: Duration::from_millis(100),
            ..<_>::default()
        };
        let mut rng = rng();
        for _ in 0..1000 {
            let delay = next_delay(&config, HealthStatus::Healthy, false, &mut rng);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1100));
        }
    }
}
