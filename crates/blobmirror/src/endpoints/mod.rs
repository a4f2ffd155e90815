use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;

use blobmirror_service::{Cache, Config};

mod error;
mod reload;
mod serve;

pub use error::ResponseError;

/// Shared state handed to all request handlers.
#[derive(Clone, Debug)]
pub struct ServiceState {
    config: Arc<Config>,
    cache: Cache,
}

impl ServiceState {
    /// Bundles the loaded config and the running cache.
    pub fn new(config: Config, cache: Cache) -> Self {
        Self {
            config: Arc::new(config),
            cache,
        }
    }
}

async fn healthcheck(State(service): State<ServiceState>) -> impl IntoResponse {
    if service.cache.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    }
}

async fn robots() -> &'static str {
    "User-agent: *\nDisallow: /\n"
}

async fn index(State(service): State<ServiceState>) -> axum::response::Response {
    match &service.config.redirect {
        Some(target) => {
            (StatusCode::FOUND, [(header::LOCATION, target.clone())]).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Builds the application router.
pub fn create_app(service: ServiceState) -> Router {
    // the reload body is a JSON list of keys; nothing close to this limit is
    // ever legitimate
    let layer = ServiceBuilder::new().layer(DefaultBodyLimit::max(1024 * 1024));

    Router::new()
        .route("/", get(index))
        .route("/healthcheck", get(healthcheck))
        .route("/robots.txt", get(robots))
        .route("/reload", post(reload::handle_reload))
        .route("/{*key}", get(serve::handle_object))
        .with_state(service)
        .layer(layer)
}
