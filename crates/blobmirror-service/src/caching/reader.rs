use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use super::item::{Flight, Item};
use super::{CacheEntry, CacheError};

/// Upper bound on the chunks handed out per read.
const READ_CHUNK: usize = 64 * 1024;

/// A read-only, forward-only view of an item's local file.
///
/// For a fully downloaded item this is a plain sequential reader. While the
/// download is still in flight, reads past the flushed length wait on the
/// writer's progress signal; bytes are observed in exactly the order they
/// arrive from the remote, and nothing is buffered outside the local file.
///
/// Dropping the reader aborts any pending wait but never cancels the
/// underlying download.
pub struct ItemReader {
    item: Arc<Item>,
    file: File,
    pos: u64,
    full_length: u64,
    tail: Option<Tail>,
}

struct Tail {
    progress: watch::Receiver<u64>,
    download: Flight,
}

impl fmt::Debug for ItemReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemReader")
            .field("key", &self.item.key())
            .field("pos", &self.pos)
            .field("full_length", &self.full_length)
            .field("tailing", &self.tail.is_some())
            .finish()
    }
}

impl ItemReader {
    pub(super) fn new(
        item: Arc<Item>,
        file: File,
        full_length: u64,
        tail: Option<(watch::Receiver<u64>, Flight)>,
    ) -> Self {
        Self {
            item,
            file,
            pos: 0,
            full_length,
            tail: tail.map(|(progress, download)| Tail { progress, download }),
        }
    }

    /// Total object length as reported by the remote store.
    pub fn len(&self) -> u64 {
        self.full_length
    }

    /// Whether the object is empty.
    pub fn is_empty(&self) -> bool {
        self.full_length == 0
    }

    /// Pulls the next chunk, waiting for the writer when tailing.
    ///
    /// `Ok(None)` is end-of-stream. A failed download surfaces as an error
    /// once all flushed bytes have been served.
    pub async fn next_chunk(&mut self) -> CacheEntry<Option<Bytes>> {
        loop {
            let available = match self.tail.as_mut() {
                Some(tail) => *tail.progress.borrow_and_update(),
                None => self.full_length,
            };

            if self.pos < available {
                let chunk = self.read_from_file(available).await?;
                return Ok(Some(chunk));
            }

            let Some(tail) = self.tail.as_mut() else {
                return Ok(None);
            };

            match *tail.download.borrow() {
                Some(true) => {
                    if self.pos >= self.full_length {
                        return Ok(None);
                    }
                    // The final progress value was published before the
                    // resolution; pick it up on the next pass.
                    continue;
                }
                Some(false) => {
                    return Err(CacheError::DownloadError(
                        "download failed mid-stream".into(),
                    ))
                }
                None => {}
            }

            let writer_gone = tokio::select! {
                changed = tail.progress.changed() => changed.is_err(),
                changed = tail.download.changed() => changed.is_err(),
            };

            // The writer resolves the download before it drops either
            // channel, so a closed channel with no resolution means the
            // transfer task died.
            if writer_gone && tail.download.borrow().is_none() {
                return Err(CacheError::DownloadError("download interrupted".into()));
            }
        }
    }

    /// Reads the remainder of the stream into memory.
    ///
    /// Intended for small objects and tests; response bodies should stream
    /// via [`into_stream`](Self::into_stream) instead.
    pub async fn read_to_end(&mut self) -> CacheEntry<Vec<u8>> {
        let mut content = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            content.extend_from_slice(&chunk);
        }
        Ok(content)
    }

    /// Adapts the reader into a byte stream suitable for a response body.
    pub fn into_stream(self) -> impl Stream<Item = CacheEntry<Bytes>> + Send {
        futures::stream::try_unfold(self, |mut reader| async move {
            Ok(reader.next_chunk().await?.map(|chunk| (chunk, reader)))
        })
    }

    async fn read_from_file(&mut self, available: u64) -> CacheEntry<Bytes> {
        // the writer flushed up to `available`, so these bytes must be there
        let want = (available - self.pos).min(READ_CHUNK as u64) as usize;
        let mut buf = vec![0; want];
        self.file.read_exact(&mut buf).await?;
        self.pos += want as u64;
        Ok(Bytes::from(buf))
    }
}
