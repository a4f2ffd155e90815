use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};

use blobmirror_service::caching::CacheEntry;
use blobmirror_service::{CacheError, Item, ItemReader};

use super::{ResponseError, ServiceState};

/// Serves a mirrored object.
///
/// The body streams while the backing download is still in flight; later
/// requests stream straight from disk. `HEAD` yields the headers only.
pub(super) async fn handle_object(
    State(service): State<ServiceState>,
    method: Method,
    Path(key): Path<String>,
) -> Result<Response, ResponseError> {
    let key = rewrite_key(&service, key);

    match fetch(&service, &key).await {
        Ok((item, reader)) => object_response(&service, &key, &item, reader, &method),
        Err(CacheError::NotFound) => Ok(not_found_response(&service).await),
        Err(err) => Err(err.into()),
    }
}

/// Directory-like paths are served the configured index object.
fn rewrite_key(service: &ServiceState, key: String) -> String {
    match (&service.config.index_html, &service.config.index_html_regex) {
        (Some(index), Some(pattern)) if pattern.is_match(&key) => index.clone(),
        _ => key,
    }
}

async fn fetch(service: &ServiceState, key: &str) -> CacheEntry<(Arc<Item>, ItemReader)> {
    let item = service.cache.get(key)?;
    if !item.exists().await? {
        return Err(CacheError::NotFound);
    }

    // hold the resolution handle only; the body streams from the reader
    let _download = item.download().await?;
    let reader = item.local_reader().await?;
    Ok((item, reader))
}

fn object_response(
    service: &ServiceState,
    key: &str,
    item: &Arc<Item>,
    reader: ItemReader,
    method: &Method,
) -> Result<Response, ResponseError> {
    let cache_control = match &service.config.no_cache {
        Some(pattern) if pattern.is_match(key) => "private, no-cache, no-store".to_owned(),
        _ => format!(
            "public, max-age={}",
            service.cache.validity_period().as_secs().saturating_sub(1)
        ),
    };

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(reader.into_stream())
    };

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, item.full_length())
        .header(header::CONTENT_TYPE, content_type_for(key))
        .header(header::CACHE_CONTROL, cache_control)
        .header(
            header::LAST_MODIFIED,
            httpdate::fmt_http_date(item.last_modified()),
        )
        .body(body)?;
    Ok(response)
}

/// Responds 404, substituting the configured not-found page if possible.
async fn not_found_response(service: &ServiceState) -> Response {
    if let Some(key) = &service.config.not_found_html {
        if let Ok((_, mut reader)) = fetch(service, key).await {
            if let Ok(body) = reader.read_to_end().await {
                return (
                    StatusCode::NOT_FOUND,
                    [(header::CONTENT_TYPE, "text/html")],
                    body,
                )
                    .into_response();
            }
        }
    }
    StatusCode::NOT_FOUND.into_response()
}

fn content_type_for(key: &str) -> &'static str {
    let extension = std::path::Path::new(key)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();

    match extension.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}
