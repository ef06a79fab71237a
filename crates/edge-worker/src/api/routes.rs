use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use common::handshake::{ConfigAcceptedResponse, ConfigHandshake, ConnectivityUpdate};

use crate::error::ApiError;
use crate::interceptor::{Disposition, InterceptOutcome};
use crate::message::{without_hop_by_hop, InterceptedRequest};
use crate::state::WorkerState;

/// Largest request body accepted for pass-through.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

pub const CACHE_STATUS_HEADER: &str = "x-cache";

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics() -> Result<Response, ApiError> {
    let body = telemetry::metrics::encode_metrics()
        .map_err(|e| ApiError::internal(format!("failed to encode metrics: {e}")))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

pub async fn configure(
    State(state): State<WorkerState>,
    Json(handshake): Json<ConfigHandshake>,
) -> Result<Json<ConfigAcceptedResponse>, ApiError> {
    let config = state
        .interceptor()
        .configure(handshake)
        .await
        .map_err(|e| ApiError::bad_request(format!("configuration rejected: {e}")))?;

    Ok(Json(ConfigAcceptedResponse {
        accepted: true,
        tenant_prefix: config.rewriter.context().tenant_prefix().to_string(),
        message: Some(format!("configured for app '{}'", config.handshake.app_name)),
    }))
}

pub async fn connectivity(State(state): State<WorkerState>) -> Json<ConnectivityUpdate> {
    Json(ConnectivityUpdate {
        online: state.connectivity().is_online(),
    })
}

pub async fn set_connectivity(
    State(state): State<WorkerState>,
    Json(update): Json<ConnectivityUpdate>,
) -> Json<ConnectivityUpdate> {
    state.connectivity().set_online(update.online);
    Json(update)
}

/// Interception boundary for every request not addressed to the worker
/// itself.
pub async fn intercept(State(state): State<WorkerState>, request: Request) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let url = absolute_url(&parts.uri, &parts.headers)?;
    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read request body: {e}")))?;

    let intercepted = InterceptedRequest::new(parts.method, url)
        .with_headers(parts.headers)
        .with_body(body);
    let outcome = state.interceptor().handle(intercepted).await?;
    into_response(outcome)
}

/// Request URL from an absolute-form target, or from `Host` plus
/// `X-Forwarded-Proto` for origin-form targets.
pub fn absolute_url(uri: &Uri, headers: &HeaderMap) -> Result<String, ApiError> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }

    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing Host header"))?;
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|proto| !proto.is_empty())
        .unwrap_or("http");
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    Ok(format!("{scheme}://{host}{path}"))
}

fn into_response(outcome: InterceptOutcome) -> Result<Response, ApiError> {
    let InterceptOutcome {
        response,
        disposition,
    } = outcome;

    let status = StatusCode::from_u16(response.status)
        .map_err(|e| ApiError::bad_gateway(format!("invalid upstream status: {e}")))?;
    let mut reply = Response::builder()
        .status(status)
        .body(Body::from(response.body))
        .map_err(|e| ApiError::internal(format!("failed to build response: {e}")))?;

    let headers = reply.headers_mut();
    *headers = without_hop_by_hop(&response.headers);
    if let Disposition::Cache(outcome) = disposition {
        headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static(outcome.as_str()));
    }
    Ok(reply)
}
