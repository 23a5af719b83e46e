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

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec};

use crate::metrics::{opts, register};

const SUBSYSTEM: &str = "tcp_proxy";

/// The direction bytes travel in, relative to the upstream host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Direction {
    Upstream,
    Downstream,
}

impl Direction {
    const LABEL: &'static str = "direction";

    fn label(self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Downstream => "downstream",
        }
    }
}

pub(super) fn bytes_total(direction: Direction) -> IntCounter {
    static BYTES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts("bytes_total", SUBSYSTEM, "Total bytes relayed."),
                &[Direction::LABEL],
            )
            .unwrap(),
        )
    });

    BYTES_TOTAL.with_label_values(&[direction.label()])
}

pub(super) fn upstream_errors_total(cluster: &str, kind: &str) -> IntCounter {
    static UPSTREAM_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "upstream_errors_total",
                    SUBSYSTEM,
                    "Total connections that could not be relayed to an upstream host.",
                ),
                &["cluster", "kind"],
            )
            .unwrap(),
        )
    });

    UPSTREAM_ERRORS_TOTAL.with_label_values(&[cluster, kind])
}
