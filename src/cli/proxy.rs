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

use std::path::PathBuf;

use crate::{server::Server, signal::ShutdownRx, Config};

/// Run Meshgate as a TCP proxy.
#[derive(clap::Args, Clone, Debug)]
pub struct Proxy {
    /// Re-apply clusters and hosts whenever the configuration file changes.
    /// Listeners are not rebound.
    #[clap(short, long, env = "MESHGATE_WATCH")]
    pub watch: bool,
}

impl Proxy {
    /// Start and run a proxy until `shutdown_rx` fires.
    pub async fn run(
        &self,
        config: Config,
        path: Option<PathBuf>,
        shutdown_rx: ShutdownRx,
    ) -> crate::Result<()> {
        let (server, report) = Server::new(&config);
        for rejected in &report.rejected {
            tracing::warn!(entry = %rejected.entry, error = %rejected.error, "configuration entry rejected");
        }

        let watch = match path.filter(|_| self.watch) {
            Some(path) => Some(tokio::spawn(crate::config::watch::fs(
                server.clusters().clone(),
                path,
                shutdown_rx.clone(),
            ))),
            None => {
                if self.watch {
                    tracing::warn!("no configuration file found, nothing to watch");
                }
                None
            }
        };

        server.run(shutdown_rx).await?;

        if let Some(watch) = watch {
            watch.await??;
        }

        Ok(())
    }
}
