use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::fetch::FetchError;
use crate::store::StoreError;

/// Failure of a single cache decision.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Offline and nothing stored for the request. Terminal: surfaced to the
    /// caller instead of degrading to a network fetch.
    #[error("offline and no cached response for {url}")]
    OfflineNoCache { url: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("store lookup failed: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineError::OfflineNoCache { .. })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RewriteError {
    #[error("malformed percent-encoding in {0}")]
    MalformedEncoding(String),
    #[error("unsupported url: {0}")]
    UnsupportedUrl(String),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("bad gateway: {0}")]
    BadGateway(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self::BadGateway(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(err.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::OfflineNoCache { .. } => ApiError::unavailable(err.to_string()),
            EngineError::Fetch(_) => ApiError::bad_gateway(err.to_string()),
            EngineError::Store(_) => ApiError::internal(err.to_string()),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        ApiError::bad_gateway(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_miss_maps_to_503() {
        let err = EngineError::OfflineNoCache {
            url: "https://example.com/a.png".into(),
        };
        assert!(err.is_terminal());
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn fetch_failure_maps_to_502() {
        let err = EngineError::from(FetchError::InvalidUrl("nope".into()));
        assert!(!err.is_terminal());
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
