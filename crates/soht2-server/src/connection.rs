//! Server side of one tunnel: the target socket plus its live metadata

use crate::error::TunnelError;
use socket2::{SockRef, TcpKeepalive};
use soht2_proto::{ConnectionId, Soht2Connection, Soht2User};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Invoked exactly once with the final metadata after a connection closes
pub type PostCloseAction = Box<dyn FnOnce(Soht2Connection) + Send>;

const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Socket settings applied when a tunnel is opened
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub read_buffer_size: usize,
    /// Largest decoded client payload accepted by one exchange
    pub max_payload_size: usize,
}

pub struct ServerConnection {
    soht2: RwLock<Arc<Soht2Connection>>,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    options: SocketOptions,
    opened: AtomicBool,
    cancel: CancellationToken,
    last_activity: StdMutex<Instant>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    post_close: StdMutex<Option<PostCloseAction>>,
}

impl ServerConnection {
    /// Connect to the target described by `soht2`
    pub async fn open(
        soht2: Soht2Connection,
        options: SocketOptions,
        post_close: Option<PostCloseAction>,
    ) -> Result<Self, TunnelError> {
        let target = format!("{}:{}", soht2.target_host, soht2.target_port);
        let open_failed = |source| TunnelError::OpenFailed {
            target: target.clone(),
            source,
        };

        let stream = tokio::time::timeout(
            options.connect_timeout,
            TcpStream::connect((soht2.target_host.as_str(), soht2.target_port)),
        )
        .await
        .map_err(|_| open_failed(std::io::Error::new(ErrorKind::TimedOut, "connect timed out")))?
        .map_err(open_failed)?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", target, e);
        }
        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!("Failed to enable keepalive for {}: {}", target, e);
        }

        debug!("Connection {} opened to {}", soht2.id, target);

        let (reader, writer) = stream.into_split();
        Ok(Self {
            soht2: RwLock::new(Arc::new(soht2)),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            options,
            opened: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            last_activity: StdMutex::new(Instant::now()),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            post_close: StdMutex::new(post_close),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.soht2().id
    }

    /// Current metadata, without live counters
    pub fn soht2(&self) -> Arc<Soht2Connection> {
        match self.soht2.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Install a new metadata value derived from the current one.
    ///
    /// The read and the swap happen under one write guard, so concurrent
    /// updates (user enrichment, close) never drop each other's fields.
    pub fn update_soht2<F>(&self, update: F) -> Arc<Soht2Connection>
    where
        F: FnOnce(&Soht2Connection) -> Soht2Connection,
    {
        let mut guard = match self.soht2.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let updated = Arc::new(update(&guard));
        *guard = updated.clone();
        updated
    }

    /// Replace the user profile, keeping every other field as it is now
    pub fn update_user(&self, user: Soht2User) -> Arc<Soht2Connection> {
        self.update_soht2(|current| current.with_user(user))
    }

    /// Metadata merged with the live byte counters
    pub fn snapshot(&self) -> Soht2Connection {
        self.soht2().with_bytes_exchanged(self.bytes_read(), self.bytes_written())
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn read_buffer_size(&self) -> usize {
        self.options.read_buffer_size
    }

    /// Record client activity
    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    /// Time since the last exchange (or since open)
    pub fn activity_age(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|last| last.elapsed())
            .unwrap_or_default()
    }

    /// Write the whole payload to the target and flush it
    pub async fn write_all(&self, data: &[u8]) -> Result<(), TunnelError> {
        if data.is_empty() {
            return Ok(());
        }

        let id = self.id();
        let mut writer = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TunnelError::closed(id)),
            guard = self.writer.lock() => guard,
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(TunnelError::closed(id)),
            result = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => {
                result?;
                self.bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
                trace!("Connection {} wrote {} bytes to target", id, data.len());
                Ok(())
            }
        }
    }

    /// Read whatever the target has available, waiting at most the socket read
    /// timeout. Nothing available yields an empty buffer; end of stream yields
    /// [`TunnelError::PeerClosed`].
    pub async fn read_available(&self) -> Result<Vec<u8>, TunnelError> {
        let id = self.id();
        let mut reader = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TunnelError::closed(id)),
            guard = self.reader.lock() => guard,
        };

        let mut buffer = vec![0u8; self.options.read_buffer_size];
        let read = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TunnelError::closed(id)),
            read = tokio::time::timeout(self.options.read_timeout, reader.read(&mut buffer)) => read,
        };

        match read {
            Err(_elapsed) => Ok(Vec::new()),
            Ok(Ok(0)) => {
                debug!("Connection {} reached end of stream", id);
                Err(TunnelError::PeerClosed(id))
            }
            Ok(Ok(n)) => {
                buffer.truncate(n);
                self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                trace!("Connection {} read {} bytes from target", id, n);
                Ok(buffer)
            }
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                ) =>
            {
                debug!("Connection {} reset by target: {}", id, e);
                Ok(Vec::new())
            }
            Ok(Err(e)) => Err(TunnelError::Io(e)),
        }
    }

    /// Close the connection. Only the first call has any effect; it cancels
    /// in-flight reads and writes, shuts the target socket down and runs the
    /// post-close action with the final metadata.
    pub async fn close(&self) {
        if !self.opened.swap(false, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                trace!("Shutdown of connection {} failed: {}", self.id(), e);
            }
        }

        let (bytes_read, bytes_written) = (self.bytes_read(), self.bytes_written());
        let closed = self.update_soht2(|current| {
            current
                .with_bytes_exchanged(bytes_read, bytes_written)
                .with_closed_at(chrono::Utc::now())
        });
        debug!(
            "Connection {} closed (read {} bytes, written {} bytes)",
            closed.id, closed.bytes_read, closed.bytes_written
        );

        let action = match self.post_close.lock() {
            Ok(mut action) => action.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(action) = action {
            action(Soht2Connection::clone(&closed));
        }
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("soht2", &self.soht2())
            .field("opened", &self.is_open())
            .finish()
    }
}
