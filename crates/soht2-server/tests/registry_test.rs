//! Registry behaviour against real loopback targets

use soht2_proto::{CompressError, Compressor, Soht2Connection, Soht2User};
use soht2_server::{
    AbandonedConnectionReaper, AbandonedConnectionsConfig, ConnectionRegistry, HistorySink,
    InMemoryHistory, SocketOptions, TunnelError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const BUFFER_SIZE: usize = 1024;
const MAX_PAYLOAD: usize = 16 * 1024;

fn options() -> SocketOptions {
    SocketOptions {
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_millis(50),
        read_buffer_size: BUFFER_SIZE,
        max_payload_size: MAX_PAYLOAD,
    }
}

/// Echo server that returns everything it receives
async fn start_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

fn meta(user: &str, port: u16) -> Soht2Connection {
    Soht2Connection::new(Soht2User::named(user), "127.0.0.1", "127.0.0.1", port)
}

/// Send `data` once, then poll with empty exchanges until `expected` bytes arrived
async fn exchange_until(
    registry: &ConnectionRegistry,
    id: &soht2_proto::ConnectionId,
    data: &[u8],
    expected: usize,
) -> Vec<u8> {
    let mut received = registry.exchange(id, data, None).await.unwrap();
    assert!(received.len() <= BUFFER_SIZE);
    for _ in 0..100 {
        if received.len() >= expected {
            break;
        }
        let chunk = registry.exchange(id, &[], None).await.unwrap();
        assert!(chunk.len() <= BUFFER_SIZE);
        received.extend_from_slice(&chunk);
    }
    received
}

#[tokio::test]
async fn test_echo_preserves_bytes_and_order() {
    let port = start_echo_server().await;
    let registry = ConnectionRegistry::new(options());
    let connection = registry.open(meta("user1", port)).await.unwrap();
    let id = connection.id();

    let small: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
    assert_eq!(exchange_until(&registry, &id, &small, small.len()).await, small);

    let large: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(exchange_until(&registry, &id, &large, large.len()).await, large);

    // nothing pending
    assert!(registry.exchange(&id, &[], None).await.unwrap().is_empty());

    let listed = registry.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].bytes_written, 5100);
    assert_eq!(listed[0].bytes_read, 5100);

    assert!(registry.close(&id).await);
}

#[tokio::test]
async fn test_compressed_request_is_decoded() {
    let port = start_echo_server().await;
    let registry = ConnectionRegistry::new(options());
    let id = registry.open(meta("user1", port)).await.unwrap().id();

    let data = b"compressed payload ".repeat(20);
    let gzip = Compressor::for_encoding(Some("gzip"));
    let body = gzip.compress(&data).unwrap();

    let mut received = registry.exchange(&id, &body, Some("gzip")).await.unwrap();
    for _ in 0..50 {
        if received.len() >= data.len() {
            break;
        }
        received.extend(registry.exchange(&id, &[], None).await.unwrap());
    }
    assert_eq!(received, data);

    assert!(matches!(
        registry.exchange(&id, b"not gzip", Some("gzip")).await,
        Err(TunnelError::Compression(_))
    ));
}

#[tokio::test]
async fn test_oversized_payload_is_rejected() {
    let port = start_echo_server().await;
    let registry = ConnectionRegistry::new(options());
    let id = registry.open(meta("user1", port)).await.unwrap().id();

    let bomb = vec![0u8; MAX_PAYLOAD + 1];
    let gzip = Compressor::for_encoding(Some("gzip"));
    let body = gzip.compress(&bomb).unwrap();
    assert!(body.len() < MAX_PAYLOAD);

    assert!(matches!(
        registry.exchange(&id, &body, Some("gzip")).await,
        Err(TunnelError::Compression(CompressError::TooLarge { .. }))
    ));
    assert!(matches!(
        registry.exchange(&id, &bomb, None).await,
        Err(TunnelError::Compression(CompressError::TooLarge { .. }))
    ));
    assert_eq!(registry.get(&id).unwrap().bytes_written(), 0);
}

#[tokio::test]
async fn test_gone_after_close() {
    let port = start_echo_server().await;
    let history = Arc::new(InMemoryHistory::new(10));
    let registry = ConnectionRegistry::new(options()).with_history(history.clone());

    let never_opened = soht2_proto::new_connection_id();
    assert!(matches!(
        registry.exchange(&never_opened, b"x", None).await,
        Err(TunnelError::Gone { .. })
    ));

    let connection = registry.open(meta("user1", port)).await.unwrap();
    let id = connection.id();
    exchange_until(&registry, &id, b"abc", 3).await;

    assert!(registry.close(&id).await);
    assert!(!registry.close(&id).await);
    connection.close().await;

    assert!(registry.get(&id).is_none());
    assert!(matches!(
        registry.exchange(&id, b"x", None).await,
        Err(TunnelError::Gone { .. })
    ));

    // recorded exactly once, with frozen counters
    assert_eq!(history.len(), 1);
    let page = history.search(&Default::default(), &[], |_| true, 0, 10);
    let closed = &page.entries[0];
    assert_eq!(closed.id, id);
    assert!(closed.is_closed());
    assert_eq!((closed.bytes_read, closed.bytes_written), (3, 3));
}

#[tokio::test]
async fn test_target_eof_is_peer_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            drop(socket);
        }
    });

    let registry = ConnectionRegistry::new(options());
    let id = registry.open(meta("user1", port)).await.unwrap().id();

    let mut result = Ok(Vec::new());
    for _ in 0..20 {
        result = registry.exchange(&id, &[], None).await;
        if result.is_err() {
            break;
        }
    }
    assert!(matches!(result, Err(TunnelError::PeerClosed(_))));

    // the client decides when to close
    assert!(registry.get(&id).is_some());
    registry.close(&id).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_open_to_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let registry = ConnectionRegistry::new(options());
    assert!(matches!(
        registry.open(meta("user1", port)).await,
        Err(TunnelError::OpenFailed { .. })
    ));
    assert!(registry.is_empty());
}

struct FailingHistory;

impl HistorySink for FailingHistory {
    fn add_history(&self, _: Soht2Connection) -> Result<(), soht2_server::HistoryError> {
        Err(soht2_server::HistoryError::Storage("disk full".to_string()))
    }
}

#[tokio::test]
async fn test_history_failure_does_not_break_close() {
    let port = start_echo_server().await;
    let registry = ConnectionRegistry::new(options()).with_history(Arc::new(FailingHistory));
    let id = registry.open(meta("user1", port)).await.unwrap().id();

    assert!(registry.close(&id).await);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_reaper_closes_only_idle_connections() {
    let port = start_echo_server().await;
    let registry = Arc::new(ConnectionRegistry::new(options()));
    let idle = registry.open(meta("user1", port)).await.unwrap().id();
    let active = registry.open(meta("user1", port)).await.unwrap().id();

    let reaper = AbandonedConnectionReaper::new(
        registry.clone(),
        &AbandonedConnectionsConfig {
            timeout: Duration::from_millis(300),
            check_interval: Duration::from_millis(50),
        },
    )
    .spawn();

    for _ in 0..12 {
        registry.exchange(&active, &[], None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(registry.get(&idle).is_none());
    assert!(registry.get(&active).is_some());

    reaper.stop().await;
    registry.close_all().await;
}
