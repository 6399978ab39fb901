//! HTTP binding of the connection resource

use crate::config::ClientConfig;
use crate::error::ClientError;
use async_trait::async_trait;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use soht2_proto::{
    Compressor, ConnectionId, Soht2Connection, HOST_PARAM, OCTET_STREAM, PORT_PARAM,
};
use tracing::trace;
use url::Url;

/// Remote tunnel operations used by client sessions
#[async_trait]
pub trait TunnelApi: Send + Sync {
    async fn open(&self, host: &str, port: u16) -> Result<Soht2Connection, ClientError>;

    /// Send `data` and return what the target produced meanwhile
    async fn exchange(&self, id: &ConnectionId, data: &[u8]) -> Result<Vec<u8>, ClientError>;

    async fn close(&self, id: &ConnectionId) -> Result<(), ClientError>;

    async fn list(&self) -> Result<Vec<Soht2Connection>, ClientError>;
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
    code: Option<String>,
}

pub struct HttpTunnelClient {
    http: reqwest::Client,
    url: Url,
    username: String,
    password: String,
    compressor: &'static Compressor,
    min_request_size: usize,
}

impl HttpTunnelClient {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let url = Url::parse(&config.url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if url.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(config.url.clone()));
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            http,
            url,
            username: config.username.clone(),
            password: config.password.clone(),
            compressor: Compressor::for_type(config.compression.compression_type),
            min_request_size: config.compression.min_request_size,
        })
    }

    fn connection_url(&self, id: &ConnectionId) -> Result<Url, ClientError> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.url.to_string()))?
            .pop_if_empty()
            .push(&id.to_string());
        Ok(url)
    }

    async fn check(response: Response) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let (message, code) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.error, body.code),
            Err(_) => (text, None),
        };
        if status == StatusCode::GONE {
            return Err(ClientError::Gone { code, message });
        }
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl TunnelApi for HttpTunnelClient {
    async fn open(&self, host: &str, port: u16) -> Result<Soht2Connection, ClientError> {
        let port = port.to_string();
        let response = self
            .http
            .post(self.url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .query(&[(HOST_PARAM, host), (PORT_PARAM, port.as_str())])
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn exchange(&self, id: &ConnectionId, data: &[u8]) -> Result<Vec<u8>, ClientError> {
        let compressor = if data.len() >= self.min_request_size {
            self.compressor
        } else {
            Compressor::for_encoding(None)
        };
        let body = compressor.compress(data)?.into_owned();
        trace!(
            "exchange {}: data.len={}, body.len={}",
            id,
            data.len(),
            body.len()
        );

        let mut request = self
            .http
            .post(self.connection_url(id)?)
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, OCTET_STREAM)
            .header(ACCEPT_ENCODING, self.compressor.accept_encoding());
        if let Some(encoding) = compressor.content_encoding() {
            request = request.header(CONTENT_ENCODING, encoding);
        }

        let response = Self::check(request.body(body).send().await?).await?;
        let encoding = response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        let data = Compressor::for_encoding(encoding.as_deref()).decompress(&bytes)?;
        Ok(data.into_owned())
    }

    async fn close(&self, id: &ConnectionId) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.connection_url(id)?)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Soht2Connection>, ClientError> {
        let response = self
            .http
            .get(self.url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
