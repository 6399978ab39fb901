//! Client configuration

use serde::{Deserialize, Serialize};
use soht2_proto::{duration_millis, CompressionType, PollConfig};
use std::time::Duration;

/// One forwarded port: local listener to remote target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_local_host")]
    pub local_host: String,
    /// Local port to listen on; 0 picks an ephemeral port
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

impl HostConfig {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_host: default_local_host(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }
}

/// Request body compression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    #[serde(rename = "type")]
    pub compression_type: CompressionType,
    /// Bodies smaller than this are sent as is
    pub min_request_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            compression_type: CompressionType::None,
            min_request_size: 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection resource of the server, e.g. `http://host:8080/api/connection`
    pub url: String,
    pub username: String,
    pub password: String,
    /// How long a session waits for local data before exchanging anyway
    #[serde(with = "duration_millis")]
    pub socket_read_timeout: Duration,
    pub read_buffer_size: usize,
    #[serde(with = "duration_millis")]
    pub request_timeout: Duration,
    pub connections: Vec<HostConfig>,
    pub compression: CompressionConfig,
    pub poll: PollConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: format!("http://localhost:8080{}", soht2_proto::CONNECTION_PATH),
            username: String::new(),
            password: String::new(),
            socket_read_timeout: Duration::from_millis(100),
            read_buffer_size: 64 * 1024,
            request_timeout: Duration::from_secs(30),
            connections: Vec::new(),
            compression: CompressionConfig::default(),
            poll: PollConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("url is required".to_string());
        }
        if self.username.is_empty() {
            return Err("username is required".to_string());
        }
        if self.read_buffer_size == 0 {
            return Err("read_buffer_size must be greater than zero".to_string());
        }
        if self.socket_read_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err("timeouts must be greater than zero".to_string());
        }
        self.poll.validate()
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = username.into();
        self.config.password = password.into();
        self
    }

    pub fn connection(mut self, host: HostConfig) -> Self {
        self.config.connections.push(host);
        self
    }

    pub fn socket_read_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_read_timeout = timeout;
        self
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    pub fn compression(mut self, compression_type: CompressionType, min_request_size: usize) -> Self {
        self.config.compression = CompressionConfig {
            compression_type,
            min_request_size,
        };
        self
    }

    pub fn poll(mut self, poll: PollConfig) -> Self {
        self.config.poll = poll;
        self
    }

    pub fn build(self) -> Result<ClientConfig, String> {
        if self.config.connections.is_empty() {
            return Err("at least one connection must be configured".to_string());
        }
        self.config.validate()?;
        Ok(self.config)
    }
}
