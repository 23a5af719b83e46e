/*
 * Copyright 2020 Google LLC
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

//! Common utilities for testing

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Once,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tracing_subscriber::EnvFilter;

use crate::filters::{prelude::*, FilterRegistry};

static LOG_ONCE: Once = Once::new();

/// Call to safely enable logging calls with a given tracing env filter, e.g. "meshgate=debug"
/// This can be very useful when attempting to debug unit and integration tests.
pub fn enable_log(filter: impl Into<EnvFilter>) {
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .init()
    });
}

/// Returns a local address nothing is listening on.
pub async fn available_addr() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tracing::debug!(%addr, "test::available_addr");
    addr
}

/// Returns both ends of a fresh loopback connection as `(accepted, client)`.
pub async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap());
    let (accepted, client) = tokio::join!(listener.accept(), client);
    (accepted.unwrap().0, client.unwrap())
}

/// Spawns a server echoing back everything it reads on every connection,
/// returning its address.
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

#[derive(Clone, Copy, Debug, Default)]
enum Behaviour {
    #[default]
    Pass,
    /// Takes the downstream stream and closes it.
    Take,
    /// Never returns.
    Hold,
    Sleep(Duration),
}

/// TestFilter is useful for testing that listeners and chains are running
/// filters appropriately.
#[derive(Default)]
pub struct TestFilter {
    visited: Option<Arc<AtomicUsize>>,
    behaviour: Behaviour,
}

impl TestFilter {
    fn instance(self) -> FilterInstance {
        FilterInstance::new(serde_json::Value::Null, Arc::new(self))
    }

    /// Counts every connection it sees and passes it on.
    pub fn counting(visited: Arc<AtomicUsize>) -> FilterInstance {
        Self {
            visited: Some(visited),
            behaviour: Behaviour::Pass,
        }
        .instance()
    }

    /// Counts every connection it sees and terminates it.
    pub fn terminal(visited: Arc<AtomicUsize>) -> FilterInstance {
        Self {
            visited: Some(visited),
            behaviour: Behaviour::Take,
        }
        .instance()
    }

    /// Keeps every connection open until the listener aborts it.
    pub fn holding() -> FilterInstance {
        Self {
            visited: None,
            behaviour: Behaviour::Hold,
        }
        .instance()
    }

    /// Holds every connection for `duration`, then passes it on.
    pub fn sleeping(duration: Duration) -> FilterInstance {
        Self {
            visited: None,
            behaviour: Behaviour::Sleep(duration),
        }
        .instance()
    }
}

#[async_trait::async_trait]
impl Filter for TestFilter {
    async fn on_new_connection(&self, ctx: &mut ConnectionContext) -> Result<(), FilterError> {
        if let Some(visited) = &self.visited {
            visited.fetch_add(1, Ordering::SeqCst);
        }

        match self.behaviour {
            Behaviour::Pass => {}
            Behaviour::Take => drop(ctx.take_downstream()?),
            Behaviour::Hold => std::future::pending::<()>().await,
            Behaviour::Sleep(duration) => tokio::time::sleep(duration).await,
        }

        Ok(())
    }
}

impl StaticFilter for TestFilter {
    const NAME: &'static str = "TestFilter";
    type Configuration = ();

    fn try_from_config(_: Option<Self::Configuration>) -> Result<Self, CreationError> {
        Ok(Self::default())
    }
}

/// Registers [`TestFilter`] alongside the built-in filters.
pub fn load_test_filters() {
    FilterRegistry::register([TestFilter::factory()]);
}
