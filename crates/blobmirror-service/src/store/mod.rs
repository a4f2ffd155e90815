//! Access to the remote object store backing the mirror.
//!
//! The cache engine only needs two capabilities from the remote side: probing
//! an object's metadata and opening its bytes for sequential reading. Both
//! are expressed by the [`ObjectStore`] trait; the backends in this module
//! implement it for HTTP servers and for local directories (the latter is
//! mostly useful for testing).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use reqwest::Url;

use crate::caching::{CacheEntry, CacheError};

mod filesystem;
mod http;

pub use filesystem::FilesystemStore;
pub use http::HttpStore;

/// Remote metadata reported by a [`stat`](ObjectStore::stat) probe.
#[derive(Debug, Clone, Copy)]
pub struct RemoteMetadata {
    /// Object size in bytes, if the store reports one.
    pub length: Option<u64>,
    /// Remote modification time, if the store reports one.
    pub last_modified: Option<SystemTime>,
}

/// A stream of object bytes, yielded in remote order.
pub type ByteStream = BoxStream<'static, CacheEntry<Bytes>>;

/// Minimal capability set the cache engine needs from a remote store.
///
/// Implementations must report a missing object as [`CacheError::NotFound`]
/// and never fold it into other errors; the cache treats it as a distinct,
/// cacheable outcome.
pub trait ObjectStore: Send + Sync + 'static {
    /// Queries length and modification time of the object at `key`.
    fn stat<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheEntry<RemoteMetadata>>;

    /// Opens the object at `key` for sequential reading.
    fn open<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheEntry<ByteStream>>;
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        Self::download_error(&error)
    }
}

/// A parsed `PRIMARY` connection string.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// Objects served by an HTTP(S) server; keys are appended to the URL.
    Http(Url),
    /// Objects read from a local directory.
    Filesystem(PathBuf),
}

impl StoreConfig {
    /// Parses a connection string.
    ///
    /// `http://` and `https://` URLs select the HTTP backend; `file://` URLs
    /// and bare paths select the filesystem backend.
    pub fn parse(primary: &str) -> Result<Self> {
        if primary.starts_with("http://") || primary.starts_with("https://") {
            let url = Url::parse(primary)
                .with_context(|| format!("invalid store URL `{primary}`"))?;
            Ok(Self::Http(url))
        } else if let Some(path) = primary.strip_prefix("file://") {
            Ok(Self::Filesystem(PathBuf::from(path)))
        } else {
            Ok(Self::Filesystem(PathBuf::from(primary)))
        }
    }

    /// Instantiates the configured backend.
    pub fn create(&self) -> Result<Arc<dyn ObjectStore>> {
        Ok(match self {
            Self::Http(url) => Arc::new(HttpStore::new(url.clone())?),
            Self::Filesystem(path) => Arc::new(FilesystemStore::new(path.clone())),
        })
    }
}
