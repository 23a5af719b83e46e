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

//! Accepting connections and running them through a filter chain.
//!
//! A [`Listener`] moves through `CREATED → BOUND → ACCEPTING → DRAINING →
//! CLOSED`. Every accepted connection runs on its own task, draining stops
//! the accept loop and waits for those tasks to finish.
//!
//! **Metrics**
//!
//! * `listener_connections_active` Connections currently running their chain.
//! * `listener_connections_total` Connections accepted.
//! * `listener_connections_rejected_total` Connections closed because the
//!   listener was at `max_connections`.

use std::{
    io,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::{IntCounterVec, IntGaugeVec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{watch, OwnedSemaphorePermit, Semaphore},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    cluster::{self, ClusterManager},
    config::ValidationError,
    filters::{ConnectionContext, Filter, FilterChain},
    metrics::{opts, register},
};

const SUBSYSTEM: &str = "listener";

/// Pause after a failed `accept`, which is usually file descriptor
/// exhaustion.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

fn connections_active() -> &'static IntGaugeVec {
    static CONNECTIONS_ACTIVE: Lazy<IntGaugeVec> = Lazy::new(|| {
        register(
            IntGaugeVec::new(
                opts(
                    "connections_active",
                    SUBSYSTEM,
                    "Number of connections currently being handled.",
                ),
                &["listener"],
            )
            .unwrap(),
        )
    });

    &CONNECTIONS_ACTIVE
}

fn connections_total() -> &'static IntCounterVec {
    static CONNECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts("connections_total", SUBSYSTEM, "Total connections accepted."),
                &["listener"],
            )
            .unwrap(),
        )
    });

    &CONNECTIONS_TOTAL
}

fn connections_rejected_total() -> &'static IntCounterVec {
    static CONNECTIONS_REJECTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
        register(
            IntCounterVec::new(
                opts(
                    "connections_rejected_total",
                    SUBSYSTEM,
                    "Total connections closed because of the connection limit.",
                ),
                &["listener"],
            )
            .unwrap(),
        )
    });

    &CONNECTIONS_REJECTED_TOTAL
}

/// The configuration of one listener.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub name: String,
    pub address: SocketAddr,
    /// The relay buffer size for the downstream side of each connection.
    #[serde(default = "cluster::default_buffer_limit")]
    pub per_conn_buffer_limit_bytes: u32,
    /// Connections accepted beyond this many are closed immediately.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub filters: FilterChain,
}

fn default_max_connections() -> usize {
    10_000
}

impl ListenerConfig {
    pub fn new(name: impl Into<String>, address: SocketAddr, filters: FilterChain) -> Self {
        Self {
            name: name.into(),
            address,
            per_conn_buffer_limit_bytes: cluster::default_buffer_limit(),
            max_connections: default_max_connections(),
            filters,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName("listeners.name"));
        }

        if self.per_conn_buffer_limit_bytes == 0 {
            return Err(ValidationError::invalid(
                format!("listeners[{}].per_conn_buffer_limit_bytes", self.name),
                "must be greater than zero",
            ));
        }

        if self.max_connections == 0 {
            return Err(ValidationError::invalid(
                format!("listeners[{}].max_connections", self.name),
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display, strum_macros::AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerState {
    Created,
    Bound,
    Accepting,
    Draining,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind listener `{name}` to {address}: {source}")]
    Bind {
        name: String,
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("listener `{name}` is {actual}, expected {expected}")]
    InvalidState {
        name: String,
        expected: ListenerState,
        actual: ListenerState,
    },
}

/// Accepts connections on one address and runs each through the listener's
/// filter chain.
pub struct Listener {
    name: Arc<str>,
    config: ListenerConfig,
    clusters: Arc<ClusterManager>,
    state: watch::Sender<ListenerState>,
    socket: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: TaskTracker,
    /// Stops the accept loop.
    stop: CancellationToken,
    /// Cancels connections still running once the drain timeout expired.
    abort: CancellationToken,
}

impl Listener {
    pub fn new(config: ListenerConfig, clusters: Arc<ClusterManager>) -> Arc<Self> {
        Arc::new(Self {
            name: Arc::from(config.name.as_str()),
            config,
            clusters,
            state: watch::channel(ListenerState::Created).0,
            socket: Mutex::new(None),
            local_addr: Mutex::new(None),
            connections: TaskTracker::new(),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// The bound address, which differs from the configured one when binding
    /// to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Number of connections currently running their filter chain.
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    fn transition(&self, from: ListenerState, to: ListenerState) -> Result<(), ListenerError> {
        let mut actual = from;
        self.state.send_if_modified(|state| {
            actual = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });

        if actual == from {
            tracing::debug!(listener = %self.name, %from, %to, "listener state changed");
            Ok(())
        } else {
            Err(ListenerError::InvalidState {
                name: self.name.to_string(),
                expected: from,
                actual,
            })
        }
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<SocketAddr, ListenerError> {
        let state = self.state();
        if state != ListenerState::Created {
            return Err(ListenerError::InvalidState {
                name: self.name.to_string(),
                expected: ListenerState::Created,
                actual: state,
            });
        }

        let bind_error = |source| ListenerError::Bind {
            name: self.name.to_string(),
            address: self.config.address,
            source,
        };
        let socket = TcpListener::bind(self.config.address)
            .await
            .map_err(bind_error)?;
        let address = socket.local_addr().map_err(bind_error)?;

        *self.socket.lock() = Some(socket);
        *self.local_addr.lock() = Some(address);
        self.transition(ListenerState::Created, ListenerState::Bound)?;
        tracing::info!(listener = %self.name, %address, "listener bound");

        Ok(address)
    }

    /// Spawns the accept loop of a bound listener.
    pub fn start(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>, ListenerError> {
        self.transition(ListenerState::Bound, ListenerState::Accepting)?;
        let socket = self
            .socket
            .lock()
            .take()
            .ok_or_else(|| ListenerError::InvalidState {
                name: self.name.to_string(),
                expected: ListenerState::Bound,
                actual: ListenerState::Created,
            })?;

        let span = tracing::info_span!("listener", name = %self.name);
        Ok(tokio::spawn(self.clone().accept_loop(socket).instrument(span)))
    }

    async fn accept_loop(self: Arc<Self>, socket: TcpListener) {
        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        tracing::info!("accepting connections");

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.stop.cancelled() => break,
                accepted = socket.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(error) => {
                        tracing::warn!(%error, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                },
            };

            connections_total().with_label_values(&[&*self.name]).inc();
            let Ok(permit) = limit.clone().try_acquire_owned() else {
                connections_rejected_total()
                    .with_label_values(&[&*self.name])
                    .inc();
                tracing::debug!(%peer, "connection limit reached, closing connection");
                continue;
            };

            let span = tracing::info_span!("connection", %peer);
            self.connections
                .spawn(self.clone().handle(stream, permit).instrument(span));
        }

        drop(socket);
        self.state.send_replace(ListenerState::Draining);
        tracing::info!(active = self.connections.len(), "listener draining");

        self.connections.close();
        self.connections.wait().await;

        self.state.send_replace(ListenerState::Closed);
        tracing::info!("listener closed");
    }

    async fn handle(self: Arc<Self>, stream: TcpStream, _permit: OwnedSemaphorePermit) {
        let active = connections_active().with_label_values(&[&*self.name]);
        active.inc();

        let _ = stream.set_nodelay(true);
        match ConnectionContext::new(
            stream,
            self.name.clone(),
            self.clusters.clone(),
            self.config.per_conn_buffer_limit_bytes as usize,
        ) {
            Ok(mut ctx) => {
                let result = tokio::select! {
                    _ = self.abort.cancelled() => None,
                    result = self.config.filters.on_new_connection(&mut ctx) => Some(result),
                };

                match result {
                    None => tracing::debug!("connection aborted by shutdown"),
                    Some(Ok(())) if !ctx.is_terminated() => {
                        tracing::debug!("no filter took the connection, closing");
                    }
                    Some(Ok(())) => {}
                    Some(Err(error)) => tracing::debug!(
                        %error,
                        kind = error.discriminant(),
                        "connection closed by filter"
                    ),
                }
            }
            Err(error) => tracing::debug!(%error, "failed to read connection addresses"),
        }

        active.dec();
    }

    /// Stops accepting and waits up to `timeout` for in-flight connections
    /// to finish, then cancels whatever is left. Returns once the listener is
    /// closed.
    pub async fn drain(&self, timeout: Duration) {
        match self.state() {
            ListenerState::Created | ListenerState::Bound => {
                self.socket.lock().take();
                self.state.send_replace(ListenerState::Closed);
                return;
            }
            ListenerState::Closed => return,
            ListenerState::Accepting | ListenerState::Draining => {}
        }

        self.stop.cancel();
        let mut state = self.state.subscribe();

        let closed = state.wait_for(|state| *state == ListenerState::Closed);
        if tokio::time::timeout(timeout, closed).await.is_err() {
            tracing::warn!(
                listener = %self.name,
                remaining = self.connections.len(),
                "drain timed out, closing remaining connections"
            );
            self.abort.cancel();
            let _ = state
                .wait_for(|state| *state == ListenerState::Closed)
                .await;
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("address", &self.local_addr())
            .field("state", &self.state())
            .finish()
    }
}
