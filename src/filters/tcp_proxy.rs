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

//! Relays connections to a host of an upstream cluster.

mod metrics;

use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::Instant,
};

use self::metrics::Direction;
use crate::filters::prelude::*;

pub const NAME: &str = TcpProxy::NAME;

/// The terminal filter: selects a host from the configured cluster, connects
/// to it and relays bytes in both directions until both sides have closed,
/// an error occurs, or the connection has been idle for `idle_timeout`.
pub struct TcpProxy {
    cluster: String,
    idle_timeout: Option<Duration>,
    buffer_limit: Option<usize>,
}

impl TcpProxy {
    fn new(config: Config) -> Result<Self, CreationError> {
        if config.cluster.trim().is_empty() {
            return Err(CreationError::field_invalid(
                "cluster",
                "cluster name cannot be empty",
            ));
        }

        if config.buffer_limit_bytes == Some(0) {
            return Err(CreationError::field_invalid(
                "buffer_limit_bytes",
                "must be greater than zero",
            ));
        }

        Ok(Self {
            cluster: config.cluster,
            idle_timeout: config.idle_timeout.filter(|timeout| !timeout.is_zero()),
            buffer_limit: config.buffer_limit_bytes.map(|limit| limit as usize),
        })
    }

    async fn connect(&self, ctx: &ConnectionContext) -> Result<Upstream, FilterError> {
        let (cluster, host) = ctx.clusters.select_upstream(&self.cluster)?;
        let slot = cluster
            .try_acquire_connection()
            .ok_or_else(|| FilterError::Overflow(self.cluster.clone()))?;
        let spec = cluster.spec();

        let address = host.address().to_socket_addr().await?;
        let stream = tokio::time::timeout(spec.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| FilterError::ConnectTimeout)??;
        stream.set_nodelay(true)?;

        tracing::debug!(upstream = %host.address(), "connected to upstream");

        Ok(Upstream {
            stream,
            buffer_limit: self
                .buffer_limit
                .unwrap_or(spec.conn_buffer_limit_bytes as usize),
            _slot: slot,
        })
    }
}

struct Upstream {
    stream: TcpStream,
    buffer_limit: usize,
    _slot: crate::cluster::ConnectionGuard,
}

#[async_trait::async_trait]
impl Filter for TcpProxy {
    #[cfg_attr(feature = "instrument", tracing::instrument(skip(self, ctx)))]
    async fn on_new_connection(&self, ctx: &mut ConnectionContext) -> Result<(), FilterError> {
        let mut upstream = match self.connect(ctx).await {
            Ok(upstream) => upstream,
            Err(error) => {
                metrics::upstream_errors_total(&self.cluster, error.discriminant()).inc();
                drop(ctx.take_downstream()?);
                return Err(error);
            }
        };

        let mut downstream = ctx.take_downstream()?;
        let (sent, received) = relay(
            &mut downstream,
            &mut upstream.stream,
            (ctx.buffer_limit, upstream.buffer_limit),
            self.idle_timeout,
        )
        .await?;

        tracing::debug!(sent, received, "connection closed");
        Ok(())
    }
}

/// Copies bytes between the two streams, returning the byte counts sent to
/// and received from `upstream`. Each direction runs on its own, forwarding
/// end of stream as a write shutdown, so a peer that stops reading only stalls
/// its own direction. An error in either direction ends both.
async fn relay(
    downstream: &mut TcpStream,
    upstream: &mut TcpStream,
    (downstream_limit, upstream_limit): (usize, usize),
    idle_timeout: Option<Duration>,
) -> io::Result<(u64, u64)> {
    let (down_read, down_write) = downstream.split();
    let (up_read, up_write) = upstream.split();
    let activity = Activity::new();

    let transfer = async {
        tokio::try_join!(
            copy_half(down_read, up_write, downstream_limit, Direction::Upstream, &activity),
            copy_half(up_read, down_write, upstream_limit, Direction::Downstream, &activity),
        )
    };

    match idle_timeout {
        Some(timeout) => tokio::select! {
            result = transfer => result,
            _ = activity.idle(timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))
            }
        },
        None => transfer.await,
    }
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_limit: usize,
    direction: Direction,
    activity: &Activity,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_limit.max(1)];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        activity.touch();
        writer.write_all(&buf[..n]).await?;
        activity.touch();
        total += n as u64;
        metrics::bytes_total(direction).inc_by(n as u64);
    }

    // The peer may already have closed its side.
    let _ = writer.shutdown().await;
    Ok(total)
}

/// When either direction of a relay last moved bytes.
struct Activity {
    start: Instant,
    last_millis: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_millis
            .store(self.start.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Resolves once no bytes moved in either direction for `timeout`.
    async fn idle(&self, timeout: Duration) {
        loop {
            let last = self.start + Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
            let deadline = last + timeout;
            if Instant::now() >= deadline {
                return;
            }

            tokio::time::sleep_until(deadline).await;
        }
    }
}

impl StaticFilter for TcpProxy {
    const NAME: &'static str = "meshgate.filters.tcp_proxy.v1alpha1.TcpProxy";
    type Configuration = Config;

    fn try_from_config(config: Option<Self::Configuration>) -> Result<Self, CreationError> {
        Self::new(Self::ensure_config_exists(config)?)
    }
}

/// `tcp_proxy` filter's configuration.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The cluster connections are relayed to.
    pub cluster: String,
    /// Close the connection after this long without traffic in either
    /// direction.
    #[serde(with = "humantime_serde", default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub idle_timeout: Option<Duration>,
    /// The upstream relay buffer size, the cluster's `conn_buffer_limit_bytes`
    /// when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_limit_bytes: Option<u32>,
}

impl Config {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            idle_timeout: None,
            buffer_limit_bytes: None,
        }
    }
}
