//! Connection metadata shared by client and server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque tunnel identifier, also used as the URL segment of exchange/close calls
pub type ConnectionId = Uuid;

/// Generate a new time-sortable connection identifier (UUID v7)
pub fn new_connection_id() -> ConnectionId {
    Uuid::now_v7()
}

/// Role of a tunnel user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    #[default]
    User,
}

/// Tunnel user profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Soht2User {
    pub username: String,
    #[serde(default)]
    pub role: UserRole,
    /// `host:port` glob patterns this user may open tunnels to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_targets: Vec<String>,
}

impl Soht2User {
    /// Minimal profile carrying only a username
    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            role: UserRole::User,
            allowed_targets: Vec::new(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Check whether `host:port` matches one of the allowed target patterns.
    ///
    /// `*` matches any run of characters in either half of the pattern, so
    /// `*:*` allows everything. An empty pattern list allows nothing.
    pub fn is_allowed_target(&self, host: &str, port: u16) -> bool {
        let port = port.to_string();
        self.allowed_targets.iter().any(|pattern| {
            match pattern.rsplit_once(':') {
                Some((host_pattern, port_pattern)) => {
                    glob_match(host_pattern, host) && glob_match(port_pattern, &port)
                }
                None => false,
            }
        })
    }
}

/// Case-insensitive glob match where `*` stands for any (possibly empty) run of characters
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let text: Vec<char> = text.to_lowercase().chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut star: Option<usize> = None;
    let mut star_text = 0;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_text = t;
            p += 1;
        } else if p < pattern.len() && pattern[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some(s) = star {
            p = s + 1;
            star_text += 1;
            t = star_text;
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Metadata of one tunnel.
///
/// Values are immutable; updates go through the `with_*` methods which return
/// a new value. `closed_at` is only set by the server close path, after which
/// the byte counters are frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Soht2Connection {
    pub id: ConnectionId,
    pub user: Soht2User,
    pub client_host: String,
    pub target_host: String,
    pub target_port: u16,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub bytes_read: u64,
    #[serde(default)]
    pub bytes_written: u64,
}

impl Soht2Connection {
    /// Create metadata for a freshly opened tunnel with a new id
    pub fn new(
        user: Soht2User,
        client_host: impl Into<String>,
        target_host: impl Into<String>,
        target_port: u16,
    ) -> Self {
        Self {
            id: new_connection_id(),
            user,
            client_host: client_host.into(),
            target_host: target_host.into(),
            target_port,
            opened_at: Utc::now(),
            closed_at: None,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn with_user(&self, user: Soht2User) -> Self {
        Self {
            user,
            ..self.clone()
        }
    }

    pub fn with_closed_at(&self, closed_at: DateTime<Utc>) -> Self {
        Self {
            closed_at: Some(closed_at),
            ..self.clone()
        }
    }

    /// Counters of a closed connection stay frozen
    pub fn with_bytes_exchanged(&self, bytes_read: u64, bytes_written: u64) -> Self {
        if self.closed_at.is_some() {
            return self.clone();
        }
        Self {
            bytes_read,
            bytes_written,
            ..self.clone()
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed_at.is_some()
    }
}
