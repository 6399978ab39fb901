//! Server configuration

use serde::{Deserialize, Serialize};
use soht2_proto::{duration_millis, UserRole};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid password hash for user '{0}'")]
    InvalidPasswordHash(String),
}

/// Abandoned connection sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbandonedConnectionsConfig {
    /// Idle time after which a connection is forcibly closed
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// How often the sweep runs
    #[serde(with = "duration_millis")]
    pub check_interval: Duration,
}

impl Default for AbandonedConnectionsConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            check_interval: Duration::from_secs(5),
        }
    }
}

/// A user allowed to open tunnels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Argon2 PHC string, see `soht2 hash-password`
    pub password_hash: String,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub allowed_targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Maximum number of bytes returned by one exchange
    pub read_buffer_size: usize,
    /// Bounded read on the target socket during an exchange
    #[serde(with = "duration_millis")]
    pub socket_read_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// How long verified credentials are trusted without re-hashing
    #[serde(with = "duration_millis")]
    pub user_cache_ttl: Duration,
    pub abandoned_connections: AbandonedConnectionsConfig,
    pub enable_history: bool,
    pub history_capacity: usize,
    pub users: Vec<UserConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            read_buffer_size: 64 * 1024,
            socket_read_timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            user_cache_ttl: Duration::from_secs(600),
            abandoned_connections: AbandonedConnectionsConfig::default(),
            enable_history: true,
            history_capacity: 1000,
            users: Vec::new(),
        }
    }
}

/// Exchange bodies may carry this many read buffers' worth of client data
const REQUEST_BUFFERS: usize = 16;
/// Floor for the request body limit, matching axum's default
const MIN_REQUEST_SIZE: usize = 2 * 1024 * 1024;

impl ServerConfig {
    /// Largest exchange body, before and after decompression
    pub fn max_request_size(&self) -> usize {
        self.read_buffer_size
            .saturating_mul(REQUEST_BUFFERS)
            .max(MIN_REQUEST_SIZE)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "read_buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.socket_read_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "socket_read_timeout must be greater than zero".to_string(),
            ));
        }
        if self.abandoned_connections.check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "abandoned_connections.check_interval must be greater than zero".to_string(),
            ));
        }
        if let Some(user) = self.users.iter().find(|u| u.username.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "user with empty username (role {:?})",
                user.role
            )));
        }
        Ok(())
    }
}
