/*
 * Copyright 2021 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fmt;

use prometheus::Error as MetricsError;

use crate::cluster::Unavailable;

#[cfg(doc)]
use crate::filters::{Filter, FilterFactory};

/// All possible errors that can be returned from [`Filter`] implementations.
/// Any error closes the connection the filter was running for.
#[derive(Debug)]
pub enum FilterError {
    /// The connection was deliberately terminated by fault injection.
    Aborted,
    /// No upstream host could be chosen.
    Unavailable(Unavailable),
    /// The cluster is at its `max_connections` limit.
    Overflow(String),
    ConnectTimeout,
    /// A terminal filter already took the downstream connection.
    StreamTaken,
    Io(std::io::Error),
    Custom(&'static str),
}

impl FilterError {
    pub fn discriminant(&self) -> &'static str {
        match self {
            Self::Aborted => "filter::fault_injection::aborted",
            Self::Unavailable(unavailable) => match unavailable {
                Unavailable::UnknownCluster(_) => "filter::tcp_proxy::unknown cluster",
                Unavailable::NoHealthyHost(_) => "filter::tcp_proxy::no healthy host",
            },
            Self::Overflow(_) => "filter::tcp_proxy::overflow",
            Self::ConnectTimeout => "filter::tcp_proxy::connect timeout",
            Self::StreamTaken => "filter::stream taken",
            Self::Io(..) => "filter::io",
            Self::Custom(custom) => custom,
        }
    }
}

impl std::error::Error for FilterError {}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => f.write_str("connection aborted by fault injection"),
            Self::Unavailable(unavailable) => write!(f, "{unavailable}"),
            Self::Overflow(cluster) => {
                write!(f, "cluster `{cluster}` is at its connection limit")
            }
            Self::ConnectTimeout => f.write_str("timed out connecting to upstream"),
            Self::StreamTaken => f.write_str("downstream connection already taken"),
            Self::Io(io) => write!(f, "{io}"),
            Self::Custom(custom) => f.write_str(custom),
        }
    }
}

impl From<std::io::Error> for FilterError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error)
    }
}

impl From<Unavailable> for FilterError {
    fn from(error: Unavailable) -> Self {
        Self::Unavailable(error)
    }
}

impl Eq for FilterError {}

impl PartialEq for FilterError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Aborted, Self::Aborted)
            | (Self::ConnectTimeout, Self::ConnectTimeout)
            | (Self::StreamTaken, Self::StreamTaken) => true,
            (Self::Unavailable(a), Self::Unavailable(b)) => a == b,
            (Self::Overflow(a), Self::Overflow(b)) => a == b,
            (Self::Io(ia), Self::Io(ib)) => ia.kind().eq(&ib.kind()),
            (Self::Custom(a), Self::Custom(b)) => a == b,
            _ => false,
        }
    }
}

/// An error that occurred when attempting to create a [`Filter`] from
/// a [`FilterFactory`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum CreationError {
    #[error("filter `{}` not found", .0)]
    NotFound(String),
    #[error("filter `{}` requires configuration, but none provided", .0)]
    MissingConfig(&'static str),
    #[error("field `{}` is invalid, reason: {}", field, reason)]
    FieldInvalid { field: String, reason: String },
    #[error("Deserialization failed: {}", .0)]
    DeserializeFailed(String),
    #[error("Failed to initialize metrics: {}", .0)]
    InitializeMetricsFailed(String),
    #[error("Infallible! This should never occur")]
    Infallible,
}

impl CreationError {
    pub(crate) fn field_invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::FieldInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::convert::Infallible> for CreationError {
    fn from(_: std::convert::Infallible) -> Self {
        Self::Infallible
    }
}

impl From<MetricsError> for CreationError {
    fn from(error: MetricsError) -> Self {
        Self::InitializeMetricsFailed(error.to_string())
    }
}

impl From<serde_yaml::Error> for CreationError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::DeserializeFailed(error.to_string())
    }
}

impl From<serde_json::Error> for CreationError {
    fn from(error: serde_json::Error) -> Self {
        Self::DeserializeFailed(error.to_string())
    }
}
