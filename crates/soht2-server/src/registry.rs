//! Registry of open tunnels
//!
//! Every live tunnel is keyed by its connection id. An entry is removed by the
//! connection's own post-close action, so whatever closes it (client, reaper,
//! shutdown) the registry and the history stay consistent.

use crate::connection::{PostCloseAction, ServerConnection, SocketOptions};
use crate::error::TunnelError;
use crate::history::HistorySink;
use dashmap::DashMap;
use soht2_proto::{ConnectionId, Compressor, Soht2Connection};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub struct ConnectionRegistry {
    connections: Arc<DashMap<ConnectionId, Arc<ServerConnection>>>,
    options: SocketOptions,
    history: Option<Arc<dyn HistorySink>>,
}

impl ConnectionRegistry {
    pub fn new(options: SocketOptions) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            options,
            history: None,
        }
    }

    /// Record every closed connection in `history`
    pub fn with_history(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    fn post_close_action(&self) -> PostCloseAction {
        let connections = self.connections.clone();
        let history = self.history.clone();
        Box::new(move |closed: Soht2Connection| {
            connections.remove(&closed.id);
            trace!("Connection {} removed from registry", closed.id);
            if let Some(history) = history {
                let id = closed.id;
                if let Err(e) = history.add_history(closed) {
                    warn!("Failed to record history of connection {}: {}", id, e);
                }
            }
        })
    }

    /// Connect to the target and register the new tunnel
    pub async fn open(&self, soht2: Soht2Connection) -> Result<Arc<ServerConnection>, TunnelError> {
        let connection = Arc::new(
            ServerConnection::open(soht2, self.options, Some(self.post_close_action())).await?,
        );
        let meta = connection.soht2();
        self.connections.insert(meta.id, connection.clone());

        info!(
            "Opened connection {} for {} to {}:{}",
            meta.id, meta.user.username, meta.target_host, meta.target_port
        );
        Ok(connection)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ServerConnection>> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Write the client's bytes to the target and return what the target sent
    /// back within the socket read timeout.
    ///
    /// `data` is decoded with the compressor named by `encoding` before it is
    /// written. The returned bytes are raw.
    pub async fn exchange(
        &self,
        id: &ConnectionId,
        data: &[u8],
        encoding: Option<&str>,
    ) -> Result<Vec<u8>, TunnelError> {
        let connection = self.get(id).ok_or_else(|| TunnelError::not_found(*id))?;
        if !connection.is_open() {
            return Err(TunnelError::closed(*id));
        }
        connection.touch();

        let payload = Compressor::for_encoding(encoding)
            .decompress_limited(data, self.options.max_payload_size)?;
        connection.write_all(&payload).await?;
        let response = connection.read_available().await?;

        trace!(
            "Exchange on {}: sent {} bytes, received {} bytes",
            id,
            payload.len(),
            response.len()
        );
        Ok(response)
    }

    /// Close a tunnel. Returns `false` when the id is unknown.
    pub async fn close(&self, id: &ConnectionId) -> bool {
        match self.get(id) {
            Some(connection) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    /// Open connections, with live byte counters
    pub fn list(&self) -> Vec<Soht2Connection> {
        self.connections
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Handles to all open connections
    pub fn connections(&self) -> Vec<Arc<ServerConnection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn is_connection_owner(&self, username: &str, id: &ConnectionId) -> bool {
        self.connections
            .get(id)
            .map(|entry| entry.value().soht2().user.username.eq_ignore_ascii_case(username))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every connection idle for at least `timeout`
    pub async fn close_abandoned_connections(&self, timeout: Duration) -> usize {
        let abandoned: Vec<Arc<ServerConnection>> = self
            .connections
            .iter()
            .filter(|entry| is_abandoned(entry.value().activity_age(), timeout))
            .map(|entry| entry.value().clone())
            .collect();

        for connection in &abandoned {
            debug!(
                "Closing abandoned connection {} (idle {:?})",
                connection.id(),
                connection.activity_age()
            );
            connection.close().await;
        }
        abandoned.len()
    }

    pub async fn close_all(&self) {
        for connection in self.connections() {
            connection.close().await;
        }
    }
}

/// A connection idle for exactly `timeout` already counts as abandoned
fn is_abandoned(idle: Duration, timeout: Duration) -> bool {
    idle >= timeout
}
