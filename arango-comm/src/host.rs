use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// The address of a single ArangoDB server.
///
/// Used as the key of every per-host structure so it must never be mutated after construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostDescription {
    host: String,
    port: u16,
}

impl HostDescription {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        HostDescription {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The (host, port) pair in a form accepted by `tokio::net::lookup_host` and `TcpStream::connect`.
    pub fn socket_address(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }

    /// Parses an endpoint as reported by the server, e.g. `tcp://127.0.0.1:8529` or `tcp://[::1]:8530`.
    /// A bare `host:port` is also accepted.
    /// Connections are plaintext only, so TLS endpoints are rejected rather than dialled without encryption.
    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        let address = match endpoint.split_once("://") {
            Some((scheme, address)) => match scheme {
                "tcp" | "http" | "vst" | "h2" => address,
                "ssl" | "https" => {
                    return Err(anyhow!(
                        "TLS endpoint {endpoint:?} is not supported, connections are plaintext only"
                    ))
                }
                scheme => return Err(anyhow!("Unsupported endpoint scheme {scheme:?} in {endpoint:?}")),
            },
            None => endpoint,
        };
        let address = address.trim_end_matches('/');

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| anyhow!("Unterminated IPv6 address in endpoint {endpoint:?}"))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| anyhow!("Endpoint {endpoint:?} must include a port after the address"))?;
            (host, port)
        } else {
            address
                .rsplit_once(':')
                .ok_or_else(|| anyhow!("Endpoint {endpoint:?} must include ':' separator"))?
        };

        if host.is_empty() {
            return Err(anyhow!("Endpoint {endpoint:?} has an empty host"));
        }
        let port = port
            .parse()
            .map_err(|_| anyhow!("Failed to parse port of endpoint {endpoint:?} as integer"))?;
        Ok(HostDescription::new(host, port))
    }
}

impl fmt::Display for HostDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostDescription {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        HostDescription::from_endpoint(s)
    }
}

impl Serialize for HostDescription {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HostDescription {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let address = String::deserialize(deserializer)?;
        HostDescription::from_endpoint(&address).map_err(serde::de::Error::custom)
    }
}
