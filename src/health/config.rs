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

use std::{path::PathBuf, time::Duration};

use base64::Engine as _;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::ValidationError;

/// Active health checking for the hosts of one cluster.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub struct HealthCheckConfig {
    /// How long to wait for a single probe before counting it as a timeout.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    #[schemars(with = "String")]
    pub timeout: Duration,
    /// The time between probes of a host.
    #[serde(with = "humantime_serde", default = "default_interval")]
    #[schemars(with = "String")]
    pub interval: Duration,
    /// The first probe of a new host fires after a random delay up to this
    /// value.
    #[serde(with = "humantime_serde", default)]
    #[schemars(with = "String")]
    pub initial_jitter: Duration,
    /// A random delay up to this value is added to every interval.
    #[serde(with = "humantime_serde", default)]
    #[schemars(with = "String")]
    pub interval_jitter: Duration,
    /// Every interval is randomly moved by up to this percentage of itself in
    /// either direction.
    #[serde(default)]
    pub interval_jitter_percent: u32,
    /// Consecutive failures needed to mark a host unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Consecutive successes needed to mark a host healthy.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    /// Probe this port instead of the host's own port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_port: Option<u16>,
    /// The interval used while a host has not reached a verdict yet.
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub no_traffic_interval: Option<Duration>,
    /// The interval used while a host is unhealthy.
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub unhealthy_interval: Option<Duration>,
    /// The delay before the first probe after a host becomes unhealthy.
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub unhealthy_edge_interval: Option<Duration>,
    /// The delay before the first probe after a host becomes healthy.
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub healthy_edge_interval: Option<Duration>,
    /// Append every status transition to this file as a JSON line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_log_path: Option<PathBuf>,
    /// Log every failed probe at `warn` rather than `debug`.
    #[serde(default)]
    pub always_log_health_check_failures: bool,
    #[serde(flatten)]
    pub probe: ProbeConfig,
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    1
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            interval: default_interval(),
            initial_jitter: Duration::ZERO,
            interval_jitter: Duration::ZERO,
            interval_jitter_percent: 0,
            unhealthy_threshold: default_unhealthy_threshold(),
            healthy_threshold: default_healthy_threshold(),
            alt_port: None,
            no_traffic_interval: None,
            unhealthy_interval: None,
            unhealthy_edge_interval: None,
            healthy_edge_interval: None,
            event_log_path: None,
            always_log_health_check_failures: false,
            probe: ProbeConfig::Tcp(TcpProbeConfig::default()),
        }
    }
}

impl HealthCheckConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interval.is_zero() {
            return Err(ValidationError::invalid(
                "health_check.interval",
                "must be greater than zero",
            ));
        }

        if self.timeout.is_zero() {
            return Err(ValidationError::invalid(
                "health_check.timeout",
                "must be greater than zero",
            ));
        }

        if self.healthy_threshold == 0 {
            return Err(ValidationError::invalid(
                "health_check.healthy_threshold",
                "must be at least 1",
            ));
        }

        if self.unhealthy_threshold == 0 {
            return Err(ValidationError::invalid(
                "health_check.unhealthy_threshold",
                "must be at least 1",
            ));
        }

        if self.interval_jitter_percent > 100 {
            return Err(ValidationError::invalid(
                "health_check.interval_jitter_percent",
                "must be between 0 and 100",
            ));
        }

        for (field, value) in [
            ("no_traffic_interval", self.no_traffic_interval),
            ("unhealthy_interval", self.unhealthy_interval),
            ("unhealthy_edge_interval", self.unhealthy_edge_interval),
            ("healthy_edge_interval", self.healthy_edge_interval),
        ] {
            if value.map_or(false, |value| value.is_zero()) {
                return Err(ValidationError::invalid(
                    format!("health_check.{field}"),
                    "must be greater than zero when set",
                ));
            }
        }

        self.probe.validate()
    }
}

/// The protocol specific part of a health check.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProbeConfig {
    Tcp(TcpProbeConfig),
    Http(HttpProbeConfig),
    Custom(CustomProbeConfig),
}

impl ProbeConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Tcp(tcp) => {
                if let Some(send) = &tcp.send {
                    send.to_bytes("health_check.tcp.send")?;
                }
                for payload in &tcp.receive {
                    payload.to_bytes("health_check.tcp.receive")?;
                }
                Ok(())
            }
            Self::Http(http) => {
                if !http.path.starts_with('/') {
                    return Err(ValidationError::invalid(
                        "health_check.http.path",
                        "must start with `/`",
                    ));
                }
                if http.expected_statuses.is_empty() {
                    return Err(ValidationError::invalid(
                        "health_check.http.expected_statuses",
                        "must not be empty",
                    ));
                }
                for range in &http.expected_statuses {
                    if !(100 <= range.start && range.start < range.end && range.end <= 600) {
                        return Err(ValidationError::invalid(
                            "health_check.http.expected_statuses",
                            format!(
                                "[{}, {}) must satisfy 100 <= start < end <= 600",
                                range.start, range.end
                            ),
                        ));
                    }
                }
                for payload in &http.receive {
                    payload.to_bytes("health_check.http.receive")?;
                }
                Ok(())
            }
            Self::Custom(custom) => {
                if custom.name.is_empty() {
                    return Err(ValidationError::EmptyName("health_check.custom.name"));
                }
                Ok(())
            }
        }
    }
}

/// Connects to the host, optionally writes `send`, and then expects every
/// `receive` block to appear in the response in order. With no payloads a
/// successful connect is a pass.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TcpProbeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send: Option<Payload>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receive: Vec<Payload>,
}

/// Issues a `GET` request and checks the response status.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HttpProbeConfig {
    /// The value of the `Host` header, defaults to the host's address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub path: String,
    #[serde(default = "default_expected_statuses")]
    pub expected_statuses: Vec<StatusRange>,
    /// Blocks which must appear, in order, in the response body.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receive: Vec<Payload>,
}

fn default_expected_statuses() -> Vec<StatusRange> {
    vec![StatusRange {
        start: 200,
        end: 201,
    }]
}

/// A half open `[start, end)` range of HTTP status codes.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
pub struct StatusRange {
    pub start: u16,
    pub end: u16,
}

impl StatusRange {
    #[inline]
    pub fn contains(&self, status: u16) -> bool {
        (self.start..self.end).contains(&status)
    }
}

/// A probe implemented outside of this crate, identified by name.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CustomProbeConfig {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Raw bytes for a probe, hex encoded as `text` or base64 encoded as
/// `binary`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Binary(String),
}

impl Payload {
    pub fn to_bytes(&self, field: &str) -> Result<Vec<u8>, ValidationError> {
        match self {
            Self::Text(text) => hex::decode(text)
                .map_err(|error| ValidationError::invalid(field, format!("invalid hex: {error}"))),
            Self::Binary(binary) => base64::engine::general_purpose::STANDARD
                .decode(binary)
                .map_err(|error| {
                    ValidationError::invalid(field, format!("invalid base64: {error}"))
                }),
        }
    }
}
