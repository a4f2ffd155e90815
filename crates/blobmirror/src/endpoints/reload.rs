use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use super::ServiceState;

/// Forcibly expires a list of keys.
///
/// The body is a JSON array of keys. Requires the `X-API-KEY` header to
/// match the configured secret; without a configured secret the endpoint is
/// disabled.
pub(super) async fn handle_reload(
    State(service): State<ServiceState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(api_key) = service.config.api_key.as_deref() else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let presented = headers.get("X-API-KEY").and_then(|value| value.to_str().ok());
    if presented != Some(api_key) {
        tracing::warn!("Rejected reload request with a bad API key");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let keys: Vec<String> = match serde_json::from_slice(&body) {
        Ok(keys) => keys,
        Err(error) => {
            return (StatusCode::BAD_REQUEST, format!("invalid body: {error}")).into_response()
        }
    };

    tracing::info!(count = keys.len(), "Reload requested");
    service.cache.force_expire(&keys);
    StatusCode::OK.into_response()
}
