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

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

/// An upstream `host:port` address. Unlike [`SocketAddr`] the host may be a
/// domain name, which is resolved each time a connection is opened.
#[derive(Debug, PartialEq, Clone, PartialOrd, Ord, Eq, Hash)]
pub struct HostAddress {
    pub host: AddressKind,
    pub port: u16,
}

impl HostAddress {
    /// Returns a copy of this address using `port` instead.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            port,
        }
    }

    /// Resolves the address, preferring the first result returned by the
    /// system resolver for domain names.
    pub async fn to_socket_addr(&self) -> std::io::Result<SocketAddr> {
        match &self.host {
            AddressKind::Ip(ip) => Ok(SocketAddr::from((*ip, self.port))),
            AddressKind::Name(name) => tokio::net::lookup_host((name.as_str(), self.port))
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no address found for `{name}`"),
                    )
                }),
        }
    }
}

impl FromStr for HostAddress {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.contains("://") {
            return Err(ParseError::SchemeNotAllowed);
        }

        if let Ok(socket) = input.parse::<SocketAddr>() {
            return Ok(socket.into());
        }

        let (host, port) = input.rsplit_once(':').ok_or(ParseError::EmptyPort)?;
        if host.is_empty() {
            return Err(ParseError::EmptyHost);
        }
        if host.contains(['/', ':', '[', ']']) {
            return Err(ParseError::InvalidHost(host.to_owned()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ParseError::InvalidPort(port.to_owned()))?;

        Ok(Self {
            // Infallible
            host: host.parse().unwrap_or_else(|_| AddressKind::Name(host.into())),
            port,
        })
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("addresses must not include a scheme")]
    SchemeNotAllowed,
    #[error("hostname is required")]
    EmptyHost,
    #[error("port is required")]
    EmptyPort,
    #[error("`{0}` is not a valid port")]
    InvalidPort(String),
    #[error("`{0}` is not a valid hostname")]
    InvalidHost(String),
}

impl From<SocketAddr> for HostAddress {
    fn from(socket: SocketAddr) -> Self {
        Self {
            host: AddressKind::Ip(socket.ip()),
            port: socket.port(),
        }
    }
}

impl From<(IpAddr, u16)> for HostAddress {
    fn from((ip, port): (IpAddr, u16)) -> Self {
        Self {
            host: AddressKind::Ip(ip),
            port,
        }
    }
}

impl From<(Ipv4Addr, u16)> for HostAddress {
    fn from((ip, port): (Ipv4Addr, u16)) -> Self {
        Self {
            host: AddressKind::Ip(IpAddr::V4(ip)),
            port,
        }
    }
}

impl From<(Ipv6Addr, u16)> for HostAddress {
    fn from((ip, port): (Ipv6Addr, u16)) -> Self {
        Self {
            host: AddressKind::Ip(IpAddr::V6(ip)),
            port,
        }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            AddressKind::Ip(IpAddr::V6(ip)) => write!(f, "[{ip}]:{}", self.port),
            host => write!(f, "{host}:{}", self.port),
        }
    }
}

impl Serialize for HostAddress {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HostAddress {
    fn deserialize<D>(de: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        // Accept borrowed or owned strings.
        let string = <std::borrow::Cow<'de, str>>::deserialize(de)?;
        string.parse::<Self>().map_err(serde::de::Error::custom)
    }
}

impl schemars::JsonSchema for HostAddress {
    fn schema_name() -> String {
        "HostAddress".into()
    }

    fn json_schema(r#gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(r#gen)
    }
}

/// The kind of address, such as Domain Name or IP address. The name is not
/// validated as resolvable.
#[derive(Debug, PartialEq, Clone, PartialOrd, Eq, Hash, Ord)]
pub enum AddressKind {
    Name(String),
    Ip(IpAddr),
}

impl FromStr for AddressKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.parse()
            .map(Self::Ip)
            .unwrap_or_else(|_| Self::Name(s.to_owned())))
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => name.fmt(f),
            Self::Ip(ip) => ip.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ip_and_names() {
        let address: HostAddress = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(HostAddress::from((Ipv4Addr::LOCALHOST, 9000)), address);

        let address: HostAddress = "[::1]:80".parse().unwrap();
        assert_eq!(HostAddress::from((Ipv6Addr::LOCALHOST, 80)), address);
        assert_eq!("[::1]:80", address.to_string());

        let address: HostAddress = "backend.svc:8080".parse().unwrap();
        assert_eq!(AddressKind::Name("backend.svc".into()), address.host);
        assert_eq!(8080, address.port);
        assert_eq!("backend.svc:8080", address.to_string());
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            Err(ParseError::SchemeNotAllowed),
            "tcp://127.0.0.1:80".parse::<HostAddress>()
        );
        assert_eq!(Err(ParseError::EmptyPort), "localhost".parse::<HostAddress>());
        assert_eq!(Err(ParseError::EmptyHost), ":80".parse::<HostAddress>());
        assert_eq!(
            Err(ParseError::InvalidPort("99999".into())),
            "localhost:99999".parse::<HostAddress>()
        );
    }

    #[test]
    fn serde_uses_string_form() {
        let address: HostAddress = serde_yaml::from_str("\"localhost:25\"").unwrap();
        assert_eq!("localhost:25", address.to_string());
        assert_eq!(
            "\"localhost:25\"",
            serde_json::to_string(&address).unwrap()
        );
    }
}
