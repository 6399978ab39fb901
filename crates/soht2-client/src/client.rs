//! Local listeners that turn every accepted socket into a tunnel session

use crate::api::{HttpTunnelClient, TunnelApi};
use crate::config::{ClientConfig, HostConfig};
use crate::error::ClientError;
use crate::session::{SessionOptions, TunnelSession};
use dashmap::DashMap;
use soht2_proto::{ConnectionId, PollStrategy};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Soht2Client {
    config: ClientConfig,
    api: Arc<dyn TunnelApi>,
}

impl Soht2Client {
    /// Client talking to the server named in `config.url`
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let api = Arc::new(HttpTunnelClient::new(&config)?);
        Ok(Self::with_api(config, api))
    }

    pub fn with_api(config: ClientConfig, api: Arc<dyn TunnelApi>) -> Self {
        Self { config, api }
    }

    /// Bind every configured local port and start accepting
    pub async fn start(self) -> std::io::Result<ClientHandle> {
        let shutdown = CancellationToken::new();
        let sessions: Arc<DashMap<ConnectionId, CancellationToken>> = Arc::new(DashMap::new());
        let poll = Arc::new(PollStrategy::from_config(&self.config.poll));
        let options = SessionOptions {
            socket_read_timeout: self.config.socket_read_timeout,
            read_buffer_size: self.config.read_buffer_size,
        };

        let mut local_addrs = Vec::with_capacity(self.config.connections.len());
        let mut listeners = Vec::with_capacity(self.config.connections.len());
        for host in &self.config.connections {
            let listener =
                TcpListener::bind((host.local_host.as_str(), host.local_port)).await?;
            let local_addr = listener.local_addr()?;
            info!(
                "Forwarding {} to {}:{} via {}",
                local_addr, host.remote_host, host.remote_port, self.config.url
            );
            local_addrs.push(local_addr);
            listeners.push((listener, host.clone()));
        }

        let tasks = listeners
            .into_iter()
            .map(|(listener, host)| {
                let acceptor = Acceptor {
                    api: self.api.clone(),
                    host,
                    options,
                    poll: poll.clone(),
                    sessions: sessions.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(acceptor.run(listener))
            })
            .collect();

        Ok(ClientHandle {
            local_addrs,
            sessions,
            shutdown,
            tasks,
        })
    }
}

struct Acceptor {
    api: Arc<dyn TunnelApi>,
    host: HostConfig,
    options: SessionOptions,
    poll: Arc<PollStrategy>,
    sessions: Arc<DashMap<ConnectionId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        let mut session_tasks = Vec::new();
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    debug!("Accepted local connection from {}", peer);
                    session_tasks.retain(|task: &JoinHandle<()>| !task.is_finished());
                    session_tasks.push(tokio::spawn(self.start_session(socket)));
                }
                Err(e) => error!("Failed to accept local connection: {}", e),
            }
        }

        drop(listener);
        for task in session_tasks {
            let _ = task.await;
        }
    }

    fn start_session(&self, socket: TcpStream) -> impl std::future::Future<Output = ()> + Send + 'static {
        let api = self.api.clone();
        let host = self.host.clone();
        let options = self.options;
        let poll = self.poll.clone();
        let sessions = self.sessions.clone();
        let cancel = self.shutdown.child_token();

        async move {
            let connection = match api.open(&host.remote_host, host.remote_port).await {
                Ok(connection) => connection,
                Err(e) => {
                    error!(
                        "Failed to open tunnel to {}:{}: {}",
                        host.remote_host, host.remote_port, e
                    );
                    return;
                }
            };

            let id = connection.id;
            sessions.insert(id, cancel.clone());
            TunnelSession::new(api, id, options, poll, cancel)
                .run(socket)
                .await;
            sessions.remove(&id);
        }
    }
}

/// Running client
pub struct ClientHandle {
    local_addrs: Vec<SocketAddr>,
    sessions: Arc<DashMap<ConnectionId, CancellationToken>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientHandle {
    /// Bound local addresses, in configuration order
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Ids of the tunnels with a live session
    pub fn sessions(&self) -> Vec<ConnectionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    pub fn is_session_open(&self, id: &ConnectionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Stop one session; its remote tunnel is closed
    pub fn close_session(&self, id: &ConnectionId) -> bool {
        match self.sessions.get(id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    /// Stop accepting, end every session and wait for them to finish
    pub async fn stop(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Client stopped");
    }
}
