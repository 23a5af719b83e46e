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

//! The threshold state machine applied after every probe.

use std::time::SystemTime;

use crate::host::{HealthSnapshot, HealthStatus};

/// The result of a single probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The probe passed but the host asked to be deprioritised.
    Degraded,
    Failure(String),
    Timeout,
}

impl Outcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::Degraded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Degraded => "degraded",
            Self::Failure(_) => "failure",
            Self::Timeout => "timeout",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thresholds {
    pub healthy: u32,
    pub unhealthy: u32,
}

/// Computes the snapshot following `current` after `outcome`.
///
/// Successes and failures reset each other's counter. A host flips to
/// HEALTHY (or DEGRADED) on exactly the `healthy`th consecutive success and
/// to UNHEALTHY on exactly the `unhealthy`th consecutive failure, timeouts
/// counting as failures. DRAINING is only ever left through an
/// administrative override.
pub fn apply(
    current: &HealthSnapshot,
    outcome: &Outcome,
    thresholds: Thresholds,
    now: SystemTime,
) -> HealthSnapshot {
    let mut next = HealthSnapshot {
        last_checked: Some(now),
        ..current.clone()
    };

    if outcome.is_success() {
        next.consecutive_successes = next.consecutive_successes.saturating_add(1);
        next.consecutive_failures = 0;

        let target = match outcome {
            Outcome::Degraded => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        };

        if next.consecutive_successes >= thresholds.healthy && next.status != target {
            next.status = target;
        }
    } else {
        next.consecutive_failures = next.consecutive_failures.saturating_add(1);
        next.consecutive_successes = 0;

        if next.consecutive_failures >= thresholds.unhealthy
            && next.status != HealthStatus::Unhealthy
        {
            next.status = HealthStatus::Unhealthy;
        }
    }

    if current.status == HealthStatus::Draining {
        next.status = HealthStatus::Draining;
    }

    next
}
