//! SOHT2 Protocol Definitions
//!
//! Shared types for the HTTP tunnel: connection metadata, payload compression,
//! client polling strategies and the wire constants both sides agree on.

pub mod compress;
pub mod connection;
pub mod duration_millis;
pub mod poll;

pub use compress::{CompressError, CompressionType, Compressor};
pub use connection::{new_connection_id, ConnectionId, Soht2Connection, Soht2User, UserRole};
pub use poll::{PollConfig, PollStrategy, PollStrategyType};

/// Path of the connection resource collection on the server
pub const CONNECTION_PATH: &str = "/api/connection";

/// Query parameter carrying the target host on open
pub const HOST_PARAM: &str = "host";

/// Query parameter carrying the target port on open
pub const PORT_PARAM: &str = "port";

/// Content type of exchange request and response bodies
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Authentication realm advertised by the server
pub const AUTH_REALM: &str = "soht2";
