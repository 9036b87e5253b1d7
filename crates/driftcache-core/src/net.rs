//! Network access behind a trait.
//!
//! The strategy engine and sync queue never talk to `reqwest` directly; they
//! fetch through [`Network`] so tests can inject a scripted network and the
//! agent can inject the real one.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::http::{Method, Request, Response};

/// HTTP request timeout in seconds.
/// Long enough for slow origins, short enough that strategy fallback kicks in
/// before the user gives up.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Device connectivity, updated only by the two connectivity transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("device is offline")]
    Offline,

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkError::Timeout
        } else if err.is_connect() {
            NetworkError::Offline
        } else {
            NetworkError::Transport(err.to_string())
        }
    }
}

/// A source of responses for outbound requests.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Real network access over a shared `reqwest` client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Patch => reqwest::Method::PATCH,
            Method::Head => reqwest::Method::HEAD,
        };

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let wire = builder.send().await?;
        let status = wire.status();

        let mut headers = BTreeMap::new();
        for (name, value) in wire.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let body = wire.bytes().await?.to_vec();
        debug!(url = %request.url, status = status.as_u16(), bytes = body.len(), "Fetched");

        let mut response = Response::new(status.as_u16());
        response.headers = headers;
        response.body = body;
        Ok(response)
    }
}
