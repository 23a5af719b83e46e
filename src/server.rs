/*
 * Copyright 2020 Google LLC All Rights Reserved.
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

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tokio::task::JoinHandle;

use crate::{
    cluster::ClusterManager,
    config::{Config, UpdateReport},
    listener::{Listener, ListenerError, ListenerState},
    signal::ShutdownRx,
};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listener `{listener}` to {address}: {source}")]
    Bind {
        listener: String,
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Listener(ListenerError),
}

impl From<ListenerError> for ServerError {
    fn from(error: ListenerError) -> Self {
        match error {
            ListenerError::Bind {
                name,
                address,
                source,
            } => Self::Bind {
                listener: name,
                address,
                source,
            },
            error => Self::Listener(error),
        }
    }
}

/// Owns the listeners of a proxy and the [`ClusterManager`] they relay to.
#[derive(Debug)]
pub struct Server {
    clusters: Arc<ClusterManager>,
    listeners: Vec<Arc<Listener>>,
    tasks: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl Server {
    /// Builds the cluster manager and listeners of `config`. Clusters and
    /// hosts are applied immediately, entries that fail validation are
    /// skipped and listed in the returned report.
    pub fn new(config: &Config) -> (Self, UpdateReport) {
        let clusters = Arc::new(ClusterManager::new());
        let report = config.apply(&*clusters);
        let listeners = config
            .listeners
            .iter()
            .map(|listener| Listener::new(listener.clone(), clusters.clone()))
            .collect();

        (
            Self {
                clusters,
                listeners,
                tasks: Vec::new(),
                drain_timeout: config.drain_timeout,
            },
            report,
        )
    }

    #[inline]
    pub fn clusters(&self) -> &Arc<ClusterManager> {
        &self.clusters
    }

    #[inline]
    pub fn listeners(&self) -> &[Arc<Listener>] {
        &self.listeners
    }

    pub fn listener(&self, name: &str) -> Option<&Arc<Listener>> {
        self.listeners
            .iter()
            .find(|listener| listener.name() == name)
    }

    /// Binds and starts every listener in configuration order. The first
    /// failure is returned, listeners started before it keep accepting.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        for listener in &self.listeners {
            if listener.state() != ListenerState::Created {
                continue;
            }

            listener.bind().await?;
            self.tasks.push(listener.start()?);
        }

        tracing::info!(
            listeners = self.listeners.len(),
            clusters = self.clusters.clusters().len(),
            "server started"
        );
        Ok(())
    }

    /// Drains every listener, bounded by the configured drain timeout, and
    /// then stops all health checking.
    pub async fn shutdown(&mut self) {
        tracing::info!(timeout = ?self.drain_timeout, "draining listeners");
        futures::future::join_all(
            self.listeners
                .iter()
                .map(|listener| listener.drain(self.drain_timeout)),
        )
        .await;

        for task in self.tasks.drain(..) {
            if let Err(error) = task.await {
                tracing::warn!(%error, "listener task failed");
            }
        }

        self.clusters.shutdown();
        tracing::info!("server stopped");
    }

    /// Starts the server and shuts it down once `shutdown_rx` fires.
    pub async fn run(mut self, mut shutdown_rx: ShutdownRx) -> Result<(), ServerError> {
        if let Err(error) = self.start().await {
            self.shutdown().await;
            return Err(error);
        }

        let _ = shutdown_rx.changed().await;
        self.shutdown().await;
        Ok(())
    }
}
