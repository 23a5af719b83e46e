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

const SUBSYSTEM: &str = "fault_injection";

pub(super) fn delays_total(listener: &str) -> IntCounter {
    static DELAYS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts("delays_total", SUBSYSTEM, "Total connections delayed."),
                &["listener"],
            )
            .unwrap(),
        )
    });

    DELAYS_TOTAL.with_label_values(&[listener])
}

pub(super) fn aborts_total(listener: &str) -> IntCounter {
    static ABORTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts("aborts_total", SUBSYSTEM, "Total connections aborted."),
                &["listener"],
            )
            .unwrap(),
        )
    });

    ABORTS_TOTAL.with_label_values(&[listener])
}
