use std::io;

use thiserror::Error;

/// An error that happens while resolving or serving a mirrored object.
///
/// This is the error type that crosses the seam between the cache engine and
/// its callers; the HTTP adapter translates the variants into response codes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The object does not exist at the remote store.
    ///
    /// This is a regular, cacheable outcome and is never folded into the
    /// other variants.
    #[error("not found")]
    NotFound,
    /// The remote store failed with something other than a missing object.
    ///
    /// The attached string contains the innermost error message.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// Reading or writing the local cache file failed.
    #[error("local io: {0}")]
    LocalIo(String),
    /// The cache has been shut down.
    #[error("cache is closed")]
    Disposed,
    /// An operation was attempted in an item state that does not support it.
    #[error("invalid item state for {0}")]
    InvalidState(&'static str),
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        Self::LocalIo(err.to_string())
    }
}

impl CacheError {
    /// Builds a [`DownloadError`](Self::DownloadError) from the innermost
    /// cause of `error`.
    pub fn download_error(mut error: &dyn std::error::Error) -> Self {
        while let Some(source) = error.source() {
            error = source;
        }

        Self::DownloadError(error.to_string())
    }
}

/// An outcome of a cache operation, either `Ok(T)` or the reason why the
/// object could not be resolved or served.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
