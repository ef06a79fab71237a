use async_trait::async_trait;
use axum::http::{
    header::{self, HeaderName},
    HeaderMap, HeaderValue, Method,
};
use bytes::Bytes;
use reqwest::Url;
use std::time::Duration;
use telemetry::metrics::EDGE_CACHE_ORIGIN_FETCHES;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::message::{without_hop_by_hop, StoredResponse};

static VALIDATOR_HEADERS: [HeaderName; 5] = [
    header::IF_NONE_MATCH,
    header::IF_MODIFIED_SINCE,
    header::IF_MATCH,
    header::IF_UNMODIFIED_SINCE,
    header::IF_RANGE,
];

/// Cache directive attached to a network fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    /// Let intermediaries answer; validators supplied by the caller are sent.
    #[default]
    Default,
    /// Force end-to-end revalidation: no validators, `no-cache` on the wire.
    Reload,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Default => "default",
            CacheMode::Reload => "reload",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub mode: CacheMode,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            mode: CacheMode::Default,
        }
    }

    pub fn with_mode(mut self, mode: CacheMode) -> Self {
        self.mode = mode;
        self
    }

    /// Headers as they go on the wire for this request's cache mode.
    pub fn wire_headers(&self) -> HeaderMap {
        let mut headers = without_hop_by_hop(&self.headers);
        if self.mode == CacheMode::Reload {
            for name in VALIDATOR_HEADERS.iter() {
                headers.remove(name);
            }
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        }
        headers
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
    #[error("network fetch failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Any HTTP status is a successful fetch; only transport failures are
    /// errors.
    async fn fetch(&self, request: FetchRequest) -> Result<StoredResponse, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// No overall timeout: a slow origin stalls only its own request.
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip_all, fields(method = %request.method, url = %request.url, mode = request.mode.as_str()))]
    async fn fetch(&self, request: FetchRequest) -> Result<StoredResponse, FetchError> {
        let url = Url::parse(&request.url).map_err(|_| FetchError::InvalidUrl(request.url.clone()))?;

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(request.wire_headers());
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let resp = match builder.send().await {
            Ok(resp) => resp,
            Err(err) => {
                EDGE_CACHE_ORIGIN_FETCHES
                    .with_label_values(&[request.mode.as_str(), "error"])
                    .inc();
                return Err(err.into());
            }
        };

        let status = resp.status();
        let headers = without_hop_by_hop(resp.headers());
        let body = resp.bytes().await?;

        EDGE_CACHE_ORIGIN_FETCHES
            .with_label_values(&[request.mode.as_str(), status.as_str()])
            .inc();
        debug!(status = status.as_u16(), bytes = body.len(), "fetched from network");

        Ok(StoredResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}
