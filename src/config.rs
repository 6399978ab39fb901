//! Configuration file loading and command line overrides

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use soht2_client::HostConfig;
use std::path::Path;

/// Load a YAML configuration file, or defaults when no file is given
pub fn load_yaml<T>(path: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = path else {
        return Ok(T::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

/// Parse a `LOCAL_PORT:REMOTE_HOST:REMOTE_PORT` forward specification
pub fn parse_forward(spec: &str) -> Result<HostConfig> {
    let (local_port, rest) = spec
        .split_once(':')
        .with_context(|| format!("Invalid forward '{}'", spec))?;
    let (remote_host, remote_port) = rest
        .rsplit_once(':')
        .with_context(|| format!("Invalid forward '{}'", spec))?;
    if remote_host.is_empty() {
        bail!("Invalid forward '{}': missing remote host", spec);
    }

    let local_port = local_port
        .parse()
        .with_context(|| format!("Invalid local port in '{}'", spec))?;
    let remote_port = remote_port
        .parse()
        .with_context(|| format!("Invalid remote port in '{}'", spec))?;
    Ok(HostConfig::new(local_port, remote_host, remote_port))
}
