//! HTTP Basic authentication middleware
//!
//! Decodes `Authorization: Basic <base64(username:password)>`, checks the
//! credentials against the configured [`Authorizer`] and makes the caller
//! available to handlers as an [`AuthContext`] extension.

use crate::auth::Identity;
use crate::models::ErrorResponse;
use crate::AppState;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use soht2_proto::AUTH_REALM;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingCredentials,

    #[error("Invalid Authorization header format. Expected 'Basic <credentials>'")]
    InvalidFormat,

    #[error("Invalid username or password")]
    InvalidCredentials,
}

impl AuthError {
    fn code(&self) -> &'static str {
        match self {
            AuthError::MissingCredentials => "MISSING_AUTH",
            AuthError::InvalidFormat => "INVALID_AUTH_FORMAT",
            AuthError::InvalidCredentials => "INVALID_CREDENTIALS",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let challenge = format!("Basic realm=\"{}\"", AUTH_REALM);
        let mut response = (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new(self.to_string(), self.code())),
        )
            .into_response();
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
        response
    }
}

/// Authenticated caller and the address it connected from
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub identity: Identity,
    pub client_host: String,
}

/// Split a Basic authorization header into username and password
pub fn parse_basic_credentials(value: &str) -> Result<(String, String), AuthError> {
    let (scheme, encoded) = value
        .trim()
        .split_once(' ')
        .ok_or(AuthError::InvalidFormat)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::InvalidFormat);
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::InvalidFormat)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::InvalidFormat)?;
    let (username, password) = decoded.split_once(':').ok_or(AuthError::InvalidFormat)?;
    Ok((username.to_string(), password.to_string()))
}

/// Client address: first `X-Forwarded-For` hop, else the socket peer
fn client_host(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn require_basic_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(AuthError::MissingCredentials)?;
    let (username, password) = parse_basic_credentials(header_value)?;

    let authorizer = state.authorizer.clone();
    let identity = tokio::task::spawn_blocking(move || authorizer.authenticate(&username, &password))
        .await
        .ok()
        .flatten()
        .ok_or(AuthError::InvalidCredentials)?;

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client_host = client_host(request.headers(), peer);
    debug!(
        "Authenticated {} from {} for {}",
        identity.username,
        client_host,
        request.uri().path()
    );

    request.extensions_mut().insert(AuthContext {
        identity,
        client_host,
    });
    Ok(next.run(request).await)
}
