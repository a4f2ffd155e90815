//! Support to mirror objects from the local filesystem.
//!
//! It allows the store to be a plain directory, usually only used for
//! testing.

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::caching::{CacheEntry, CacheError};

use super::{ByteStream, ObjectStore, RemoteMetadata};

/// Granularity of the chunks yielded by [`FilesystemStore::open`].
const CHUNK_SIZE: usize = 64 * 1024;

/// Store backend that reads objects from a local directory.
#[derive(Debug)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn map_io(error: io::Error) -> CacheError {
        match error.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound,
            _ => CacheError::DownloadError(error.to_string()),
        }
    }
}

impl ObjectStore for FilesystemStore {
    fn stat<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheEntry<RemoteMetadata>> {
        async move {
            let path = self.root.join(key);
            tracing::debug!("Probing {:?}", path);

            let metadata = tokio::fs::metadata(&path).await.map_err(Self::map_io)?;
            if !metadata.is_file() {
                return Err(CacheError::NotFound);
            }

            Ok(RemoteMetadata {
                length: Some(metadata.len()),
                last_modified: metadata.modified().ok(),
            })
        }
        .boxed()
    }

    fn open<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheEntry<ByteStream>> {
        async move {
            let path = self.root.join(key);
            tracing::debug!("Fetching {:?}", path);

            let file = File::open(&path).await.map_err(Self::map_io)?;
            let stream = futures::stream::try_unfold(file, |mut file| async move {
                let mut buf = vec![0; CHUNK_SIZE];
                let read = file
                    .read(&mut buf)
                    .await
                    .map_err(|e| CacheError::DownloadError(e.to_string()))?;
                if read == 0 {
                    Ok(None)
                } else {
                    buf.truncate(read);
                    Ok(Some((Bytes::from(buf), file)))
                }
            });

            let stream: ByteStream = Box::pin(stream);
            Ok(stream)
        }
        .boxed()
    }
}
