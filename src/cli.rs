/*
 * Copyright 2022 Google LLC
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

mod generate_config_schema;
mod proxy;

use std::path::{Path, PathBuf};

use crate::Config;

pub use self::{generate_config_schema::GenerateConfigSchema, proxy::Proxy};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const ETC_CONFIG_PATH: &str = "/etc/meshgate/meshgate.yaml";

/// The Command-Line Interface for Meshgate.
#[derive(clap::Parser)]
#[command(version, about)]
#[non_exhaustive]
pub struct Cli {
    /// The path to the configuration file for the Meshgate instance.
    #[clap(short, long, env = "MESHGATE_CONFIG", default_value = "meshgate.yaml")]
    pub config: PathBuf,
    /// Whether Meshgate will report any results to stdout/stderr.
    #[clap(short, long, env)]
    pub quiet: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

/// The various Meshgate commands.
#[derive(Clone, clap::Subcommand)]
pub enum Commands {
    Proxy(Proxy),
    GenerateConfigSchema(GenerateConfigSchema),
}

impl Cli {
    /// Drives the main meshgate application lifecycle using the command line
    /// arguments.
    #[tracing::instrument(skip_all)]
    pub async fn drive(self) -> crate::Result<()> {
        let version: std::borrow::Cow<'static, str> = if cfg!(debug_assertions) {
            format!("{VERSION}+debug").into()
        } else {
            VERSION.into()
        };

        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_file(true)
                .with_env_filter(env_filter)
                .init();
        }

        tracing::info!(version = &*version, "Starting Meshgate");

        match self.command {
            Commands::Proxy(proxy) => {
                let (config, path) = Self::read_config(&self.config)?;
                let shutdown_rx = crate::signal::spawn_handler()?;
                proxy.run(config, path, shutdown_rx).await
            }
            Commands::GenerateConfigSchema(generator) => generator.generate_config_schema(),
        }
    }

    /// Searches for the configuration file, returning the configuration and
    /// the path it was read from. Falls back to an empty configuration when
    /// neither the given path nor the `/etc` path exists.
    fn read_config(path: &Path) -> crate::Result<(Config, Option<PathBuf>)> {
        let open = |path: &Path| -> crate::Result<(Config, Option<PathBuf>)> {
            let file = std::fs::File::open(path)?;
            Ok((Config::from_reader(file)?, Some(path.to_owned())))
        };

        if path.exists() {
            return open(path);
        }

        tracing::debug!(path = %path.display(), "provided path not found");
        let etc = Path::new(ETC_CONFIG_PATH);
        if cfg!(unix) && etc.exists() {
            return open(etc);
        }

        tracing::debug!(path = %etc.display(), "/etc path not found");
        Ok((Config::default(), None))
    }
}
