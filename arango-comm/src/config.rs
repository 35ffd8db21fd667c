//! Config types, used for serializing/deserializing arango-comm configuration files

use crate::auth::AuthenticationMethod;
use crate::host::HostDescription;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    SingleServer,
    Cluster,
    ActiveFailover,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArangoProtocol {
    Vst,
    Http,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Vpack,
}

impl ContentType {
    pub fn mime_type(self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Vpack => "application/x-velocypack",
        }
    }
}

/// Settings shared by every connection created by a single communication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub content_type: ContentType,
    pub chunk_size: usize,
    pub protocol: ArangoProtocol,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            content_type: ContentType::Vpack,
            chunk_size: DEFAULT_CHUNK_SIZE,
            protocol: ArangoProtocol::Vst,
        }
    }
}

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CHUNK_SIZE: usize = 30_000;
const DEFAULT_ACQUIRE_HOST_LIST_INTERVAL_MS: u64 = 60_000;

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CommunicationConfig {
    pub hosts: Vec<HostDescription>,
    #[serde(default = "default_topology")]
    pub topology: Topology,
    #[serde(default = "default_protocol")]
    pub protocol: ArangoProtocol,
    #[serde(default = "default_content_type")]
    pub content_type: ContentType,
    #[serde(default)]
    pub authentication: Option<AuthenticationMethod>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Defaults to `timeout_ms` when unset.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default = "default_connections_per_host")]
    pub connections_per_host: usize,
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default)]
    pub dirty_reads: bool,
    #[serde(default)]
    pub acquire_host_list: bool,
    #[serde(default = "default_acquire_host_list_interval_ms")]
    pub acquire_host_list_interval_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_topology() -> Topology {
    Topology::SingleServer
}

fn default_protocol() -> ArangoProtocol {
    ArangoProtocol::Vst
}

fn default_content_type() -> ContentType {
    ContentType::Vpack
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_connections_per_host() -> usize {
    1
}

fn default_retries() -> usize {
    10
}

fn default_acquire_host_list_interval_ms() -> u64 {
    DEFAULT_ACQUIRE_HOST_LIST_INTERVAL_MS
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl CommunicationConfig {
    pub fn new(hosts: Vec<HostDescription>, topology: Topology) -> Self {
        CommunicationConfig {
            hosts,
            topology,
            protocol: default_protocol(),
            content_type: default_content_type(),
            authentication: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            connect_timeout_ms: None,
            connections_per_host: default_connections_per_host(),
            retries: default_retries(),
            dirty_reads: false,
            acquire_host_list: false,
            acquire_host_list_interval_ms: DEFAULT_ACQUIRE_HOST_LIST_INTERVAL_MS,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn from_file(filepath: String) -> Result<CommunicationConfig> {
        let file = std::fs::File::open(&filepath)
            .with_context(|| format!("Couldn't open the config file {}", &filepath))?;
        let config: CommunicationConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config file {}", &filepath))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", &filepath))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(anyhow!("hosts must contain at least one host"));
        }
        if self.connections_per_host == 0 {
            return Err(anyhow!("connections_per_host must be greater than 0"));
        }
        if self.chunk_size == 0 {
            return Err(anyhow!("chunk_size must be greater than 0"));
        }
        if self.timeout_ms == 0 {
            return Err(anyhow!("timeout_ms must be greater than 0"));
        }
        if self.acquire_host_list && self.acquire_host_list_interval_ms == 0 {
            return Err(anyhow!(
                "acquire_host_list_interval_ms must be greater than 0 when acquire_host_list is enabled"
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(self.timeout_ms))
    }

    pub fn acquire_host_list_interval(&self) -> Duration {
        Duration::from_millis(self.acquire_host_list_interval_ms)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            timeout: self.timeout(),
            connect_timeout: self.connect_timeout(),
            content_type: self.content_type,
            chunk_size: self.chunk_size,
            protocol: self.protocol,
        }
    }
}
