//! SOHT2 tunnel server
//!
//! Exposes the connection resource over HTTP: clients open a tunnel to a TCP
//! target, exchange raw bytes with it through repeated POSTs and close it when
//! done. Idle tunnels are swept by a background reaper.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod history;
pub mod middleware;
pub mod models;
pub mod reaper;
pub mod registry;

use axum::{
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use auth::{hash_password, verify_password, Authorizer, Identity, UserDirectory};
pub use config::{AbandonedConnectionsConfig, ConfigError, ServerConfig, UserConfig};
pub use connection::{ServerConnection, SocketOptions};
pub use error::TunnelError;
pub use history::{HistoryError, HistorySink, InMemoryHistory};
pub use reaper::{AbandonedConnectionReaper, ReaperHandle};
pub use registry::ConnectionRegistry;

use soht2_proto::CONNECTION_PATH;

pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub authorizer: Arc<dyn Authorizer>,
    pub history: Option<Arc<InMemoryHistory>>,
}

pub struct Soht2Server {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl Soht2Server {
    pub fn new(config: ServerConfig, authorizer: Arc<dyn Authorizer>) -> Self {
        let options = SocketOptions {
            connect_timeout: config.connect_timeout,
            read_timeout: config.socket_read_timeout,
            read_buffer_size: config.read_buffer_size,
            max_payload_size: config.max_request_size(),
        };

        let history = config
            .enable_history
            .then(|| Arc::new(InMemoryHistory::new(config.history_capacity)));
        let mut registry = ConnectionRegistry::new(options);
        if let Some(history) = &history {
            registry = registry.with_history(history.clone());
        }

        Self {
            state: Arc::new(AppState {
                registry: Arc::new(registry),
                authorizer,
                history,
            }),
            config,
        }
    }

    /// Server backed by the users listed in the configuration
    pub fn from_config(config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let directory = UserDirectory::new(&config.users, config.user_cache_ttl)?;
        if directory.is_empty() {
            tracing::warn!("No users configured; every API call will be rejected");
        }
        Ok(Self::new(config, Arc::new(directory)))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.state.registry.clone()
    }

    pub fn build_router(&self) -> Router {
        let public_router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .with_state(self.state.clone());

        let protected_router = Router::new()
            .route(
                CONNECTION_PATH,
                get(handlers::list_connections).post(handlers::open_connection),
            )
            .route(
                &format!("{}/history", CONNECTION_PATH),
                get(handlers::search_history),
            )
            .route(
                &format!("{}/{{id}}", CONNECTION_PATH),
                post(handlers::exchange)
                    .layer(DefaultBodyLimit::max(self.config.max_request_size()))
                    .delete(handlers::close_connection),
            )
            .with_state(self.state.clone())
            .layer(axum_middleware::from_fn_with_state(
                self.state.clone(),
                middleware::require_basic_auth,
            ));

        public_router
            .merge(protected_router)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on `listener` until `shutdown` resolves, then close every open tunnel
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let registry = self.registry();
        let reaper =
            AbandonedConnectionReaper::new(registry.clone(), &self.config.abandoned_connections)
                .spawn();

        info!("SOHT2 server listening on {}", listener.local_addr()?);

        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        reaper.stop().await;
        registry.close_all().await;
        info!("SOHT2 server stopped");
        result
    }
}
