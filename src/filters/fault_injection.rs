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

//! Delays or aborts a configurable share of new connections.

mod metrics;

use std::time::Duration;

use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::filters::prelude::*;

pub const NAME: &str = FaultInjection::NAME;

/// Holds back or terminates connections before they reach the rest of the
/// chain. Each connection draws a number in `[0, 100)` per fault, aborts are
/// drawn first and take precedence over delays.
pub struct FaultInjection {
    delay_percent: u8,
    delay: Duration,
    abort_percent: u8,
}

impl FaultInjection {
    fn new(config: Config) -> Result<Self, CreationError> {
        config.validate()?;

        Ok(Self {
            delay_percent: config.delay_percent,
            delay: config.delay_duration,
            abort_percent: config.abort_percent,
        })
    }

    fn roll(percent: u8) -> bool {
        percent > 0 && rand::thread_rng().gen_range(0..100) < percent
    }
}

#[async_trait::async_trait]
impl Filter for FaultInjection {
    #[cfg_attr(feature = "instrument", tracing::instrument(skip(self, ctx)))]
    async fn on_new_connection(&self, ctx: &mut ConnectionContext) -> Result<(), FilterError> {
        if Self::roll(self.abort_percent) {
            metrics::aborts_total(&ctx.listener).inc();
            tracing::debug!(peer = %ctx.peer_addr, "aborting connection");
            drop(ctx.take_downstream()?);
            return Err(FilterError::Aborted);
        }

        if !self.delay.is_zero() && Self::roll(self.delay_percent) {
            metrics::delays_total(&ctx.listener).inc();
            tracing::debug!(peer = %ctx.peer_addr, delay = ?self.delay, "delaying connection");
            tokio::time::sleep(self.delay).await;
        }

        Ok(())
    }
}

impl StaticFilter for FaultInjection {
    const NAME: &'static str = "meshgate.filters.fault_injection.v1alpha1.FaultInjection";
    type Configuration = Config;

    fn try_from_config(config: Option<Self::Configuration>) -> Result<Self, CreationError> {
        Self::new(config.unwrap_or_default())
    }
}

/// `fault_injection` filter's configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The percentage of connections (0-100) to delay.
    #[serde(default)]
    pub delay_percent: u8,
    /// How long a delayed connection is held back.
    #[serde(with = "humantime_serde", default)]
    #[schemars(with = "String")]
    pub delay_duration: Duration,
    /// The percentage of connections (0-100) to close without forwarding.
    #[serde(default)]
    pub abort_percent: u8,
}

impl Config {
    fn validate(&self) -> Result<(), CreationError> {
        for (field, percent) in [
            ("delay_percent", self.delay_percent),
            ("abort_percent", self.abort_percent),
        ] {
            if percent > 100 {
                return Err(CreationError::field_invalid(
                    field,
                    format!("{percent} is not a percentage between 0 and 100"),
                ));
            }
        }

        Ok(())
    }
}
