//! Exchange loop between one accepted local socket and its remote tunnel

use crate::api::TunnelApi;
use crate::error::ClientError;
use soht2_proto::{ConnectionId, PollStrategy};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The local peer closed its socket
    LocalClosed,
    /// Reading from or writing to the local socket failed
    LocalError,
    /// The server discarded the tunnel
    RemoteGone,
    /// The target closed its side of the stream
    RemoteClosed,
    /// An exchange call failed for a reason other than "gone"
    ExchangeFailed,
    /// The client is shutting down
    Stopped,
}

impl SessionEnd {
    /// Whether the remote tunnel may still exist and should be closed
    fn needs_remote_close(self) -> bool {
        !matches!(self, SessionEnd::RemoteGone)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub socket_read_timeout: Duration,
    pub read_buffer_size: usize,
}

pub struct TunnelSession {
    api: Arc<dyn TunnelApi>,
    id: ConnectionId,
    options: SessionOptions,
    poll: Arc<PollStrategy>,
    cancel: CancellationToken,
}

impl TunnelSession {
    pub fn new(
        api: Arc<dyn TunnelApi>,
        id: ConnectionId,
        options: SessionOptions,
        poll: Arc<PollStrategy>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            id,
            options,
            poll,
            cancel,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Drive the exchange loop until either side goes away, then close the
    /// remote tunnel if it may still exist.
    pub async fn run(self, socket: TcpStream) -> SessionEnd {
        let end = self.exchange_loop(socket).await;

        if end.needs_remote_close() {
            if let Err(e) = self.api.close(&self.id).await {
                warn!("Failed to close tunnel {}: {}", self.id, e);
            }
        }
        info!("Session {} ended: {:?}", self.id, end);
        end
    }

    async fn exchange_loop(&self, socket: TcpStream) -> SessionEnd {
        let (mut reader, mut writer) = socket.into_split();
        let mut buffer = vec![0u8; self.options.read_buffer_size];
        let mut empty_rounds: u32 = 0;

        loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Stopped,
                read = tokio::time::timeout(self.options.socket_read_timeout, reader.read(&mut buffer)) => read,
            };
            let sent = match read {
                Err(_elapsed) => 0,
                Ok(Ok(0)) => {
                    debug!("Session {}: local peer closed", self.id);
                    return SessionEnd::LocalClosed;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    warn!("Session {}: local read failed: {}", self.id, e);
                    return SessionEnd::LocalError;
                }
            };

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Stopped,
                result = self.api.exchange(&self.id, &buffer[..sent]) => result,
            };
            let received = match result {
                Ok(received) => received,
                Err(e) if e.is_peer_closed() => {
                    debug!("Session {}: target closed the stream", self.id);
                    return SessionEnd::RemoteClosed;
                }
                Err(e @ ClientError::Gone { .. }) => {
                    info!("Session {}: {}", self.id, e);
                    return SessionEnd::RemoteGone;
                }
                Err(e) => {
                    error!("Session {}: exchange failed: {}", self.id, e);
                    return SessionEnd::ExchangeFailed;
                }
            };

            if !received.is_empty() {
                let written = async {
                    writer.write_all(&received).await?;
                    writer.flush().await
                };
                if let Err(e) = written.await {
                    warn!("Session {}: local write failed: {}", self.id, e);
                    return SessionEnd::LocalError;
                }
            }
            trace!(
                "Session {}: sent {} bytes, received {} bytes",
                self.id,
                sent,
                received.len()
            );

            if sent == 0 && received.is_empty() {
                let delay = self.poll.delay(empty_rounds);
                empty_rounds = empty_rounds.saturating_add(1);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return SessionEnd::Stopped,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            } else {
                empty_rounds = 0;
            }
        }
    }
}
