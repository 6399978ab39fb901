//! End-to-end: local app -> client -> HTTP server -> echo target

use soht2_client::{
    ClientConfig, ClientError, HostConfig, HttpTunnelClient, Soht2Client, TunnelApi,
};
use soht2_proto::{CompressionType, PollConfig, PollStrategyType, UserRole};
use soht2_server::{hash_password, ConnectionRegistry, ServerConfig, Soht2Server, UserConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

const PASSWORD: &str = "secret";

struct TestServer {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn start_server() -> TestServer {
    let config = ServerConfig {
        users: vec![UserConfig {
            username: "user1".to_string(),
            password_hash: hash_password(PASSWORD).unwrap(),
            role: UserRole::User,
            allowed_targets: vec!["127.0.0.1:*".to_string()],
        }],
        ..ServerConfig::default()
    };
    let server = Soht2Server::from_config(config).unwrap();
    let registry = server.registry();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server.serve(listener, async move {
        let _ = rx.await;
    }));

    TestServer {
        addr,
        registry,
        shutdown: Some(tx),
    }
}

async fn start_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

fn client_config(server: &TestServer, target_host: &str, target_port: u16) -> ClientConfig {
    ClientConfig::builder()
        .url(format!("http://{}/api/connection", server.addr))
        .credentials("user1", PASSWORD)
        .connection(HostConfig::new(0, target_host, target_port))
        .socket_read_timeout(Duration::from_millis(20))
        .poll(PollConfig {
            strategy: PollStrategyType::Exponent,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            factor: 5,
        })
        .build()
        .unwrap()
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn round_trip(app: &mut TcpStream, data: &[u8]) -> Vec<u8> {
    app.write_all(data).await.unwrap();
    let mut received = vec![0u8; data.len()];
    tokio::time::timeout(Duration::from_secs(10), app.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .unwrap();
    received
}

#[tokio::test]
async fn test_end_to_end_echo() {
    let server = start_server().await;
    let echo_port = start_echo_server().await;
    let client = Soht2Client::new(client_config(&server, "127.0.0.1", echo_port)).unwrap();
    let handle = client.start().await.unwrap();

    let mut app = TcpStream::connect(handle.local_addrs()[0]).await.unwrap();
    assert_eq!(round_trip(&mut app, b"hello").await, b"hello");

    let large: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
    assert_eq!(round_trip(&mut app, &large).await, large);

    assert_eq!(handle.sessions().len(), 1);
    let id = handle.sessions()[0];
    assert!(handle.is_session_open(&id));
    assert!(server.registry.get(&id).is_some());

    drop(app);
    assert!(wait_for(|| !handle.is_session_open(&id)).await);
    assert!(wait_for(|| server.registry.get(&id).is_none()).await);

    handle.stop().await;
}

#[tokio::test]
async fn test_gzip_requests() {
    let server = start_server().await;
    let echo_port = start_echo_server().await;
    let mut config = client_config(&server, "127.0.0.1", echo_port);
    config.compression.compression_type = CompressionType::Gzip;
    config.compression.min_request_size = 16;
    let handle = Soht2Client::new(config).unwrap().start().await.unwrap();

    let mut app = TcpStream::connect(handle.local_addrs()[0]).await.unwrap();
    let data = b"compressible ".repeat(1000);
    assert_eq!(round_trip(&mut app, &data).await, data);
    assert_eq!(round_trip(&mut app, b"tiny").await, b"tiny");

    handle.stop().await;
}

#[tokio::test]
async fn test_stop_closes_remote_tunnels() {
    let server = start_server().await;
    let echo_port = start_echo_server().await;
    let handle = Soht2Client::new(client_config(&server, "127.0.0.1", echo_port))
        .unwrap()
        .start()
        .await
        .unwrap();

    let mut app = TcpStream::connect(handle.local_addrs()[0]).await.unwrap();
    round_trip(&mut app, b"x").await;
    assert_eq!(server.registry.len(), 1);

    handle.stop().await;
    assert!(server.registry.is_empty());

    let mut buf = [0u8; 1];
    assert_eq!(app.read(&mut buf).await.unwrap(), 0);
}

#[tokio::test]
async fn test_close_single_session() {
    let server = start_server().await;
    let echo_port = start_echo_server().await;
    let handle = Soht2Client::new(client_config(&server, "127.0.0.1", echo_port))
        .unwrap()
        .start()
        .await
        .unwrap();

    let mut first = TcpStream::connect(handle.local_addrs()[0]).await.unwrap();
    let mut second = TcpStream::connect(handle.local_addrs()[0]).await.unwrap();
    round_trip(&mut first, b"one").await;
    round_trip(&mut second, b"two").await;
    assert_eq!(handle.sessions().len(), 2);

    let id = handle.sessions()[0];
    assert!(handle.close_session(&id));
    assert!(wait_for(|| !handle.is_session_open(&id)).await);
    assert!(wait_for(|| server.registry.get(&id).is_none()).await);
    assert_eq!(handle.sessions().len(), 1);
    assert!(!handle.close_session(&id));

    handle.stop().await;
}

#[tokio::test]
async fn test_open_failure_drops_local_socket() {
    let server = start_server().await;
    let handle = Soht2Client::new(client_config(&server, "example.com", 22))
        .unwrap()
        .start()
        .await
        .unwrap();

    let mut app = TcpStream::connect(handle.local_addrs()[0]).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(10), app.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0)) || read.is_err());
    assert!(handle.sessions().is_empty());

    handle.stop().await;
}

#[tokio::test]
async fn test_http_api_lifecycle() {
    let server = start_server().await;
    let echo_port = start_echo_server().await;
    let api = HttpTunnelClient::new(&client_config(&server, "127.0.0.1", echo_port)).unwrap();

    let connection = api.open("127.0.0.1", echo_port).await.unwrap();
    assert_eq!(connection.user.username, "user1");
    assert_eq!(api.list().await.unwrap().len(), 1);

    let mut received = api.exchange(&connection.id, b"abc").await.unwrap();
    for _ in 0..50 {
        if received.len() >= 3 {
            break;
        }
        received.extend(api.exchange(&connection.id, &[]).await.unwrap());
    }
    assert_eq!(received, b"abc");

    api.close(&connection.id).await.unwrap();
    let after = api.exchange(&connection.id, b"late").await;
    assert!(matches!(after, Err(ClientError::Gone { .. })));
    assert!(api.list().await.unwrap().is_empty());

    // unknown ids close quietly
    api.close(&connection.id).await.unwrap();

    let forbidden = api.open("example.com", 22).await;
    assert!(matches!(
        forbidden,
        Err(ClientError::Status { status: 403, .. })
    ));
}

#[tokio::test]
async fn test_wrong_password_is_rejected() {
    let server = start_server().await;
    let mut config = client_config(&server, "127.0.0.1", 1);
    config.password = "wrong".to_string();
    let api = HttpTunnelClient::new(&config).unwrap();

    assert!(matches!(
        api.list().await,
        Err(ClientError::Status { status: 401, .. })
    ));
}
