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

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpStream;

use crate::{cluster::ClusterManager, filters::FilterError};

/// The state of one accepted connection as it passes through a filter chain.
pub struct ConnectionContext {
    downstream: Option<TcpStream>,
    /// The address of the downstream client.
    pub peer_addr: SocketAddr,
    /// The listener address the connection was accepted on.
    pub local_addr: SocketAddr,
    /// The name of the accepting listener.
    pub listener: Arc<str>,
    pub clusters: Arc<ClusterManager>,
    /// The relay buffer size for the downstream side.
    pub buffer_limit: usize,
}

impl ConnectionContext {
    pub fn new(
        downstream: TcpStream,
        listener: Arc<str>,
        clusters: Arc<ClusterManager>,
        buffer_limit: usize,
    ) -> std::io::Result<Self> {
        Ok(Self {
            peer_addr: downstream.peer_addr()?,
            local_addr: downstream.local_addr()?,
            downstream: Some(downstream),
            listener,
            clusters,
            buffer_limit,
        })
    }

    /// The downstream connection, `None` once a terminal filter has taken it.
    pub fn downstream(&mut self) -> Option<&mut TcpStream> {
        self.downstream.as_mut()
    }

    /// Takes ownership of the downstream connection, ending the chain.
    pub fn take_downstream(&mut self) -> Result<TcpStream, FilterError> {
        self.downstream.take().ok_or(FilterError::StreamTaken)
    }

    /// Whether a terminal filter has taken the connection.
    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.downstream.is_none()
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("listener", &self.listener)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
