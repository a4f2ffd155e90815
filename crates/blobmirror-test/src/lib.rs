//! Helpers for testing the mirror service and its HTTP surface.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all
//!    console output is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp
//!    directory is held for the entire lifetime of the test, e.g.
//!    `let _cache_dir = test::tempdir()`. When dropped too early, the
//!    directory silently disappears under the cache.
//!
//!  - When using [`Server`], make sure the server is held until all requests
//!    to it have been made; it stops serving when dropped.

use std::collections::{BTreeMap, HashMap};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{middleware, Router};
use bytes::Bytes;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Sets up the test environment.
///
/// The logger only captures logs from the mirror crates and mutes all other
/// output.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new(
            "blobmirror=trace,blobmirror_service=trace",
        ))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it
/// as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

async fn serve_blob(
    State(blobs): State<Arc<HashMap<String, Bytes>>>,
    Path(path): Path<String>,
) -> impl IntoResponse {
    match blobs.get(&path) {
        Some(data) => (
            StatusCode::OK,
            [(header::LAST_MODIFIED, "Wed, 21 Oct 2015 07:28:00 GMT")],
            data.clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn respond_statuscode(Path(code): Path<u16>) -> impl IntoResponse {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// A test server that binds to a random port and serves a set of blobs.
///
/// The server counts all requests per URI, to be asserted on via
/// [`hits`](Self::hits) or [`accesses`](Self::accesses); `HEAD` and `GET`
/// requests for the same path share a counter. Besides the blobs,
/// `/respond_statuscode/{num}` responds with the given status code. It
/// requires a `tokio` runtime and automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl Server {
    /// Spawns a server for the given `(path, content)` pairs.
    pub fn with_blobs<K, B>(blobs: impl IntoIterator<Item = (K, B)>) -> Self
    where
        K: Into<String>,
        B: Into<Bytes>,
    {
        let blobs: Arc<HashMap<String, Bytes>> = Arc::new(
            blobs
                .into_iter()
                .map(|(key, data)| (key.into(), data.into()))
                .collect(),
        );

        let hits = Arc::new(Mutex::new(BTreeMap::new()));
        let hitcounter = {
            let hits = Arc::clone(&hits);
            move |request: axum::extract::Request, next: middleware::Next| {
                let hits = Arc::clone(&hits);
                async move {
                    let uri = request.uri().path().to_owned();
                    *hits.lock().unwrap().entry(uri).or_default() += 1;
                    next.run(request).await
                }
            }
        };

        let router = Router::new()
            .route("/respond_statuscode/{code}", get(respond_statuscode))
            .route("/{*path}", get(serve_blob))
            .with_state(blobs)
            .layer(middleware::from_fn(hitcounter));

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            handle,
            socket,
            hits,
        }
    }

    /// Absolute URL for the given path on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.socket, path)
    }

    /// Number of requests seen for `path`.
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    /// Total number of requests seen.
    pub fn accesses(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
