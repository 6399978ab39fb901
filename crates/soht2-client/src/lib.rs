//! SOHT2 tunnel client
//!
//! Listens on local ports and forwards every accepted connection through an
//! HTTP tunnel: open once, then exchange bytes in a polling loop until either
//! side goes away.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod session;

pub use api::{HttpTunnelClient, TunnelApi};
pub use client::{ClientHandle, Soht2Client};
pub use config::{ClientConfig, CompressionConfig, HostConfig};
pub use error::ClientError;
pub use session::{SessionEnd, SessionOptions, TunnelSession};
