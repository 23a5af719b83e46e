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
use prometheus::{IntCounterVec, IntGauge, IntGaugeVec};

use crate::metrics::{opts, register};

const SUBSYSTEM: &str = "cluster";

pub(crate) fn active_clusters() -> &'static IntGauge {
    static ACTIVE_CLUSTERS: Lazy<IntGauge> = Lazy::new(|| {
        register(
            IntGauge::with_opts(opts(
                "active",
                SUBSYSTEM,
                "Number of currently active clusters.",
            ))
            .unwrap(),
        )
    });

    &ACTIVE_CLUSTERS
}

pub(crate) fn hosts() -> &'static IntGaugeVec {
    static HOSTS: Lazy<IntGaugeVec> = Lazy::new(|| {
        register(
            IntGaugeVec::new(
                opts("hosts", SUBSYSTEM, "Number of hosts in a cluster."),
                &["cluster"],
            )
            .unwrap(),
        )
    });

    &HOSTS
}

pub(crate) fn eligible_hosts() -> &'static IntGaugeVec {
    static ELIGIBLE_HOSTS: Lazy<IntGaugeVec> = Lazy::new(|| {
        register(
            IntGaugeVec::new(
                opts(
                    "eligible_hosts",
                    SUBSYSTEM,
                    "Number of hosts of a cluster currently eligible for selection.",
                ),
                &["cluster"],
            )
            .unwrap(),
        )
    });

    &ELIGIBLE_HOSTS
}

pub(crate) fn selections_total() -> &'static IntCounterVec {
    static SELECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "selections_total",
                    SUBSYSTEM,
                    "Total host selections, by cluster and result.",
                ),
                &["cluster", "result"],
            )
            .unwrap(),
        )
    });

    &SELECTIONS_TOTAL
}

/// Drops the per cluster series of a removed cluster.
pub(crate) fn remove_cluster(name: &str) {
    let _ = hosts().remove_label_values(&[name]);
    let _ = eligible_hosts().remove_label_values(&[name]);
}
