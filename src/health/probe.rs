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

//! Protocol specific probes. A probe only reports pass or fail, thresholds
//! and timeouts are applied by the checker loop.

use std::sync::Arc;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use super::config::{CustomProbeConfig, HttpProbeConfig, ProbeConfig, StatusRange, TcpProbeConfig};
use crate::{config::ValidationError, host::HostAddress};

/// The response header a host sets to be marked DEGRADED.
pub const DEGRADED_HEADER: &str = "x-envoy-degraded";

/// A passing probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Degraded,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("response did not contain the expected payload")]
    Mismatch,
    #[error("unexpected status {0}")]
    Status(u16),
    #[error(transparent)]
    Http(#[from] hyper::Error),
    #[error("invalid request: {0}")]
    Request(String),
    #[error("unsupported custom probe `{0}`")]
    Unsupported(String),
}

/// A single active check against one host.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, address: &HostAddress) -> Result<Verdict, ProbeError>;
}

impl ProbeConfig {
    /// Decodes the payloads and builds the probe.
    pub fn build(&self) -> Result<Arc<dyn Probe>, ValidationError> {
        Ok(match self {
            Self::Tcp(config) => Arc::new(TcpProbe::new(config)?),
            Self::Http(config) => Arc::new(HttpProbe::new(config)?),
            Self::Custom(config) => Arc::new(CustomProbe::new(config)),
        })
    }
}

pub struct TcpProbe {
    send: Option<Vec<u8>>,
    receive: Vec<Vec<u8>>,
}

impl TcpProbe {
    pub fn new(config: &TcpProbeConfig) -> Result<Self, ValidationError> {
        Ok(Self {
            send: config
                .send
                .as_ref()
                .map(|payload| payload.to_bytes("health_check.tcp.send"))
                .transpose()?,
            receive: config
                .receive
                .iter()
                .map(|payload| payload.to_bytes("health_check.tcp.receive"))
                .collect::<Result<_, _>>()?,
        })
    }
}

#[async_trait::async_trait]
impl Probe for TcpProbe {
    async fn check(&self, address: &HostAddress) -> Result<Verdict, ProbeError> {
        let mut stream = TcpStream::connect(address.to_socket_addr().await?).await?;

        if let Some(send) = &self.send {
            stream.write_all(send).await?;
        }

        if self.receive.is_empty() {
            return Ok(Verdict::Healthy);
        }

        let mut response = Vec::new();
        let mut buf = [0; 1024];
        loop {
            let read = stream.read(&mut buf).await?;
            if read == 0 {
                return Err(ProbeError::Mismatch);
            }
            response.extend_from_slice(&buf[..read]);

            if contains_in_order(&response, &self.receive) {
                return Ok(Verdict::Healthy);
            }
        }
    }
}

pub struct HttpProbe {
    client: hyper::Client<hyper::client::HttpConnector>,
    host: Option<String>,
    path: String,
    expected_statuses: Vec<StatusRange>,
    receive: Vec<Vec<u8>>,
}

impl HttpProbe {
    pub fn new(config: &HttpProbeConfig) -> Result<Self, ValidationError> {
        Ok(Self {
            client: hyper::Client::new(),
            host: config.host.clone(),
            path: config.path.clone(),
            expected_statuses: config.expected_statuses.clone(),
            receive: config
                .receive
                .iter()
                .map(|payload| payload.to_bytes("health_check.http.receive"))
                .collect::<Result<_, _>>()?,
        })
    }
}

#[async_trait::async_trait]
impl Probe for HttpProbe {
    async fn check(&self, address: &HostAddress) -> Result<Verdict, ProbeError> {
        let socket = address.to_socket_addr().await?;
        let request = hyper::Request::get(format!("http://{socket}{}", self.path))
            .header(
                hyper::header::HOST,
                self.host.clone().unwrap_or_else(|| address.to_string()),
            )
            .header(hyper::header::USER_AGENT, "meshgate-health-check")
            .body(hyper::Body::empty())
            .map_err(|error| ProbeError::Request(error.to_string()))?;

        let response = self.client.request(request).await?;
        let status = response.status().as_u16();
        if !self
            .expected_statuses
            .iter()
            .any(|range| range.contains(status))
        {
            return Err(ProbeError::Status(status));
        }

        let verdict = if response.headers().contains_key(DEGRADED_HEADER) {
            Verdict::Degraded
        } else {
            Verdict::Healthy
        };

        if !self.receive.is_empty() {
            let body = hyper::body::to_bytes(response.into_body()).await?;
            if !contains_in_order(&body, &self.receive) {
                return Err(ProbeError::Mismatch);
            }
        }

        Ok(verdict)
    }
}

/// Placeholder for probes implemented outside of this crate. Always fails.
pub struct CustomProbe {
    name: String,
}

impl CustomProbe {
    pub fn new(config: &CustomProbeConfig) -> Self {
        tracing::warn!(
            name = %config.name,
            "custom health checks are not supported, hosts will never pass"
        );
        Self {
            name: config.name.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Probe for CustomProbe {
    async fn check(&self, _: &HostAddress) -> Result<Verdict, ProbeError> {
        Err(ProbeError::Unsupported(self.name.clone()))
    }
}

/// Whether every block in `blocks` occurs in `haystack`, each one after the
/// end of the previous match.
pub(crate) fn contains_in_order(haystack: &[u8], blocks: &[Vec<u8>]) -> bool {
    let mut rest = haystack;
    for block in blocks {
        if block.is_empty() {
            continue;
        }

        match rest
            .windows(block.len())
            .position(|window| window == block.as_slice())
        {
            Some(index) => rest = &rest[index + block.len()..],
            None => return false,
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::config::Payload;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    #[test]
    fn ordered_matching() {
        let blocks = [b"PO".to_vec(), b"NG".to_vec()];
        assert!(contains_in_order(b"xxPOyyNG", &blocks));
        assert!(!contains_in_order(b"NGxxPO", &blocks));
        assert!(!contains_in_order(b"PO", &blocks));
        assert!(contains_in_order(b"", &[]));
    }

    #[tokio::test]
    async fn tcp_send_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = HostAddress::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0; 4];
                stream.read_exact(&mut buf).await.unwrap();
                if &buf == b"PING" {
                    stream.write_all(b"PONG").await.unwrap();
                }
            }
        });

        let probe = TcpProbe::new(&TcpProbeConfig {
            send: Some(Payload::Text(hex::encode("PING"))),
            receive: vec![Payload::Text(hex::encode("PONG"))],
        })
        .unwrap();
        assert_eq!(Verdict::Healthy, probe.check(&address).await.unwrap());

        let probe = TcpProbe::new(&TcpProbeConfig {
            send: Some(Payload::Text(hex::encode("PING"))),
            receive: vec![Payload::Text(hex::encode("OTHER"))],
        })
        .unwrap();
        assert!(matches!(
            probe.check(&address).await,
            Err(ProbeError::Mismatch)
        ));
    }

    #[tokio::test]
    async fn tcp_connect_refused() {
        let address = HostAddress::from(crate::test::available_addr().await);
        let probe = TcpProbe::new(&TcpProbeConfig::default()).unwrap();

        assert!(matches!(probe.check(&address).await, Err(ProbeError::Io(_))));
    }

    #[tokio::test]
    async fn http_status_ranges() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = HostAddress::from(listener.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0; 1024];
                    let read = stream.read(&mut buf).await.unwrap();
                    let request = String::from_utf8_lossy(&buf[..read]).to_string();
                    let response = if request.starts_with("GET /healthz ") {
                        "HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                    } else if request.starts_with("GET /degraded ") {
                        "HTTP/1.1 200 OK\r\nx-envoy-degraded: 1\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    } else {
                        "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                    };
                    stream.write_all(response.as_bytes()).await.unwrap();
                });
            }
        });

        let probe = |path: &str| {
            HttpProbe::new(&HttpProbeConfig {
                host: None,
                path: path.into(),
                expected_statuses: vec![StatusRange {
                    start: 200,
                    end: 300,
                }],
                receive: Vec::new(),
            })
            .unwrap()
        };

        assert_eq!(
            Verdict::Healthy,
            probe("/healthz").check(&address).await.unwrap()
        );
        assert_eq!(
            Verdict::Degraded,
            probe("/degraded").check(&address).await.unwrap()
        );
        assert!(matches!(
            probe("/missing").check(&address).await,
            Err(ProbeError::Status(503))
        ));
    }

    #[tokio::test]
    async fn custom_probe_always_fails() {
        let probe = ProbeConfig::Custom(CustomProbeConfig {
            name: "redis".into(),
            config: serde_json::Value::Null,
        })
        .build()
        .unwrap();

        assert!(matches!(
            probe.check(&"127.0.0.1:6379".parse().unwrap()).await,
            Err(ProbeError::Unsupported(name)) if name == "redis"
        ));
    }
}
