//! API request handlers

use crate::error::TunnelError;
use crate::history::HistoryPage;
use crate::middleware::AuthContext;
use crate::models::{ErrorResponse, HealthResponse, HistoryQuery, OpenQuery};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use soht2_proto::{CompressError, Compressor, ConnectionId, Soht2Connection, Soht2User, OCTET_STREAM};
use std::sync::Arc;
use tracing::{error, info, warn};

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>, code: &str) -> ApiError {
    (status, Json(ErrorResponse::new(message, code)))
}

impl From<TunnelError> for ApiError {
    fn from(e: TunnelError) -> Self {
        let (status, code) = match &e {
            TunnelError::Gone { .. } => (StatusCode::GONE, "GONE"),
            TunnelError::PeerClosed(_) => (StatusCode::GONE, "PEER_CLOSED"),
            TunnelError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            TunnelError::OpenFailed { .. } => (StatusCode::BAD_GATEWAY, "OPEN_FAILED"),
            TunnelError::Compression(CompressError::TooLarge { .. }) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "PAYLOAD_TOO_LARGE")
            }
            TunnelError::Compression(_) => (StatusCode::BAD_REQUEST, "COMPRESSION"),
            TunnelError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
        };
        api_error(status, e.to_string(), code)
    }
}

/// Replace the connection's user with the directory profile
fn enrich_user(state: &AppState, soht2: &Soht2Connection) -> Option<Soht2User> {
    state
        .authorizer
        .user_profile(&soht2.user.username)
        .filter(|profile| *profile != soht2.user)
}

/// Open a tunnel to `host:port`
pub async fn open_connection(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<OpenQuery>,
) -> Result<Json<Soht2Connection>, ApiError> {
    if !state
        .authorizer
        .is_target_allowed(&auth.identity, &query.host, query.port)
    {
        warn!(
            "User {} is not allowed to connect to {}:{}",
            auth.identity.username, query.host, query.port
        );
        return Err(TunnelError::Forbidden(format!(
            "{}:{} is not an allowed target",
            query.host, query.port
        ))
        .into());
    }

    let soht2 = Soht2Connection::new(
        Soht2User::named(auth.identity.username.clone()),
        auth.client_host,
        query.host,
        query.port,
    );
    let connection = state.registry.open(soht2).await.map_err(|e| {
        error!("Failed to open connection: {}", e);
        ApiError::from(e)
    })?;

    if let Some(profile) = enrich_user(&state, &connection.soht2()) {
        connection.update_user(profile);
    }
    Ok(Json(connection.snapshot()))
}

/// List the caller's open connections (all of them for admins)
pub async fn list_connections(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Json<Vec<Soht2Connection>> {
    let connections = state
        .registry
        .connections()
        .into_iter()
        .filter(|connection| {
            state
                .authorizer
                .can_view(&auth.identity, &connection.soht2())
        })
        .map(|connection| {
            if let Some(profile) = enrich_user(&state, &connection.soht2()) {
                connection.update_user(profile);
            }
            connection.snapshot()
        })
        .collect();
    Json(connections)
}

/// Push client bytes to the target and return the target's pending bytes
pub async fn exchange(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<ConnectionId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if state.registry.get(&id).is_none() {
        return Err(TunnelError::not_found(id).into());
    }
    if !state
        .registry
        .is_connection_owner(&auth.identity.username, &id)
    {
        return Err(TunnelError::Forbidden(format!(
            "connection {} belongs to another user",
            id
        ))
        .into());
    }

    let content_encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|h| h.to_str().ok());
    let accept_encoding = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|h| h.to_str().ok());

    let data = state
        .registry
        .exchange(&id, &body, content_encoding)
        .await
        .map_err(|e| {
            if e.is_gone() {
                info!("Exchange on {} ended: {}", id, e);
            } else {
                error!("Exchange on {} failed: {}", id, e);
            }
            ApiError::from(e)
        })?;

    let compressor = Compressor::for_encoding(accept_encoding).response_compressor();
    let payload = compressor.compress(&data).map_err(|e| {
        error!("Failed to compress response of {}: {}", id, e);
        ApiError::from(TunnelError::from(e))
    })?;

    let mut response = (
        [(header::CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM))],
        payload.into_owned(),
    )
        .into_response();
    if let Some(encoding) = compressor.content_encoding().filter(|_| !data.is_empty()) {
        response
            .headers_mut()
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static(encoding));
    }
    Ok(response)
}

/// Close a tunnel; unknown ids are a no-op
pub async fn close_connection(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<ConnectionId>,
) -> Result<StatusCode, ApiError> {
    if state.registry.get(&id).is_none() {
        return Ok(StatusCode::NO_CONTENT);
    }
    if !auth.identity.is_admin()
        && !state
            .registry
            .is_connection_owner(&auth.identity.username, &id)
    {
        return Err(TunnelError::Forbidden(format!(
            "connection {} belongs to another user",
            id
        ))
        .into());
    }

    if state.registry.close(&id).await {
        info!("Connection {} closed by {}", id, auth.identity.username);
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Search closed connections; non-admins only ever see their own
pub async fn search_history(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<HistoryPage>, ApiError> {
    let history = state.history.as_ref().ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "Connection history is disabled",
            "HISTORY_DISABLED",
        )
    })?;
    let query = HistoryQuery::from_pairs(pairs)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e, "INVALID_QUERY"))?;

    let page = history.search(
        &query.filter,
        &query.sort,
        |connection| state.authorizer.can_view(&auth.identity, connection),
        query.page,
        query.size,
    );
    Ok(Json(page))
}

/// Liveness probe, no authentication
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: state.registry.len(),
    })
}
