use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::store::{ObjectStore, RemoteMetadata};

use super::cache::CacheInner;
use super::reader::ItemReader;
use super::{CacheEntry, CacheError};

/// Lifecycle state of a cached item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Fresh item, nothing known about the remote object.
    Created,
    /// The existence probe is in flight.
    Querying,
    /// The remote object does not exist; negatively cached.
    NotFound,
    /// Remote metadata is known, no local copy yet.
    Found,
    /// The download is in flight and the local file is growing.
    Active,
    /// The local copy is complete.
    Downloaded,
    /// The item has been evicted. Terminal.
    Expired,
}

/// A single-flight resolution shared by all concurrent callers.
///
/// `None` until the underlying operation resolves; the resolved value stays
/// readable after the operation's task is gone.
pub(super) type Flight = watch::Receiver<Option<bool>>;

/// Awaits a [`Flight`]'s resolution.
pub(super) async fn resolved(mut rx: Flight) -> CacheEntry<bool> {
    let value = rx
        .wait_for(|resolution| resolution.is_some())
        .await
        .map_err(|_| CacheError::DownloadError("operation interrupted".into()))?;
    // the predicate guarantees `Some`
    Ok(value.unwrap_or(false))
}

/// Waiter for an in-flight download, handed out by [`Item::download`].
#[derive(Debug)]
pub struct Download {
    rx: Flight,
}

impl Download {
    /// Resolves `true` once the object is fully on disk, `false` if the
    /// attempt failed.
    pub async fn wait(self) -> CacheEntry<bool> {
        resolved(self.rx).await
    }
}

/// Point-in-time view of an item, taken by the expirer while it holds the
/// directory lock.
#[derive(Debug, Clone, Copy)]
pub(super) struct ItemSnapshot {
    pub state: ItemState,
    pub last_accessed: Instant,
    pub expires_at: Instant,
    pub available: u64,
    pub never_expires: bool,
}

/// One remote object known to the cache.
///
/// All state transitions happen under the item's own mutex; no I/O is ever
/// performed while it is held. Counter updates on the owning [`Cache`] are
/// reported outside of the lock as well.
///
/// [`Cache`]: super::Cache
pub struct Item {
    key: String,
    never_expires: bool,
    cache: Weak<CacheInner>,
    store: Arc<dyn ObjectStore>,
    inner: Mutex<ItemInner>,
}

struct ItemInner {
    state: ItemState,
    expires_at: Instant,
    last_accessed: Instant,
    full_length: u64,
    last_modified: SystemTime,
    available: u64,
    local_path: Option<PathBuf>,
    exists: Option<Flight>,
    download: Option<Flight>,
    progress: Option<watch::Receiver<u64>>,
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

impl Item {
    pub(super) fn new(
        key: String,
        never_expires: bool,
        cache: Weak<CacheInner>,
        store: Arc<dyn ObjectStore>,
        validity_period: Duration,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            key,
            never_expires,
            cache,
            store,
            inner: Mutex::new(ItemInner {
                state: ItemState::Created,
                expires_at: now + validity_period,
                last_accessed: now,
                full_length: 0,
                last_modified: UNIX_EPOCH,
                available: 0,
                local_path: None,
                exists: None,
                download: None,
                progress: None,
            }),
        })
    }

    /// The normalized object key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ItemState {
        self.inner.lock().unwrap().state
    }

    /// Remote object size. Meaningful once the item has been found.
    pub fn full_length(&self) -> u64 {
        self.inner.lock().unwrap().full_length
    }

    /// Remote modification time; the epoch when the store reported none.
    pub fn last_modified(&self) -> SystemTime {
        self.inner.lock().unwrap().last_modified
    }

    /// Bytes currently persisted in the local cache file.
    pub fn available_len(&self) -> u64 {
        self.inner.lock().unwrap().available
    }

    pub(super) fn local_path(&self) -> Option<PathBuf> {
        self.inner.lock().unwrap().local_path.clone()
    }

    pub(super) fn touch(&self, now: Instant) {
        self.inner.lock().unwrap().last_accessed = now;
    }

    pub(super) fn is_expired_at(&self, now: Instant) -> bool {
        self.inner.lock().unwrap().expires_at < now
    }

    pub(super) fn snapshot(&self) -> ItemSnapshot {
        let inner = self.inner.lock().unwrap();
        ItemSnapshot {
            state: inner.state,
            last_accessed: inner.last_accessed,
            expires_at: inner.expires_at,
            available: inner.available,
            never_expires: self.never_expires,
        }
    }

    #[cfg(test)]
    pub(super) fn backdate_expiry(&self, by: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner.expires_at = now.checked_sub(by).unwrap_or(now);
    }

    /// Resolves whether the object exists at the remote store.
    ///
    /// The first caller launches the probe; every other caller awaits the
    /// same resolution, which stays in place until the item expires or a
    /// failed download resets it.
    pub async fn exists(self: &Arc<Self>) -> CacheEntry<bool> {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.exists {
                Some(rx) => rx.clone(),
                None => match inner.state {
                    ItemState::Created => {
                        let (tx, rx) = watch::channel(None);
                        inner.state = ItemState::Querying;
                        inner.exists = Some(rx.clone());

                        let item = Arc::clone(self);
                        tokio::spawn(async move { item.probe(tx).await });
                        rx
                    }
                    ItemState::Expired => return Err(CacheError::NotFound),
                    _ => return Err(CacheError::InvalidState("existence probe")),
                },
            }
        };

        resolved(rx).await
    }

    async fn probe(self: Arc<Self>, tx: watch::Sender<Option<bool>>) {
        let outcome = match self.store.stat(&self.key).await {
            Ok(RemoteMetadata {
                length: Some(length),
                last_modified,
            }) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.state == ItemState::Querying {
                    inner.state = ItemState::Found;
                    inner.full_length = length;
                    inner.last_modified = last_modified.unwrap_or(UNIX_EPOCH);
                }
                true
            }
            Ok(RemoteMetadata { length: None, .. }) => {
                // an object of unknown size cannot be mirrored
                tracing::warn!(key = %self.key, "Remote did not report an object length");
                self.mark_not_found()
            }
            Err(CacheError::NotFound) => self.mark_not_found(),
            Err(error) => {
                tracing::warn!(key = %self.key, %error, "Existence probe failed");
                self.mark_not_found()
            }
        };

        tx.send_replace(Some(outcome));
    }

    /// Returns `false`, the resolution value for a missing object.
    fn mark_not_found(&self) -> bool {
        let transitioned = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ItemState::Querying {
                inner.state = ItemState::NotFound;
                true
            } else {
                false
            }
        };

        if transitioned {
            if let Some(cache) = self.cache.upgrade() {
                cache.report_not_found();
            }
        }
        false
    }

    /// Starts or joins the single-flight download.
    ///
    /// Probes existence first if that has not happened yet, and fails with
    /// [`CacheError::NotFound`] for missing objects. On success the item is
    /// in `Active` or `Downloaded` state and [`local_reader`] can be taken
    /// immediately; the returned [`Download`] resolves once the transfer
    /// finishes.
    ///
    /// [`local_reader`]: Self::local_reader
    pub async fn download(self: &Arc<Self>) -> CacheEntry<Download> {
        loop {
            if !self.exists().await? {
                return Err(CacheError::NotFound);
            }

            match self.start_download() {
                Some(result) => return result,
                // A concurrent failed attempt reset the item between our
                // probe and the lock; start over with a fresh probe.
                None => continue,
            }
        }
    }

    /// Joins or launches the transfer, or asks the caller to re-probe.
    fn start_download(self: &Arc<Self>) -> Option<CacheEntry<Download>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(rx) = &inner.download {
            return Some(Ok(Download { rx: rx.clone() }));
        }

        match inner.state {
            ItemState::Found => {
                let Some(cache) = self.cache.upgrade() else {
                    return Some(Err(CacheError::Disposed));
                };
                let (file, path) = match allocate_cache_file(cache.cache_path()) {
                    Ok(allocated) => allocated,
                    Err(error) => return Some(Err(error.into())),
                };

                let (download_tx, download_rx) = watch::channel(None);
                let (progress_tx, progress_rx) = watch::channel(0);
                inner.state = ItemState::Active;
                inner.available = 0;
                inner.local_path = Some(path);
                inner.download = Some(download_rx.clone());
                inner.progress = Some(progress_rx);
                drop(inner);

                let item = Arc::clone(self);
                tokio::spawn(async move { item.transfer(file, download_tx, progress_tx).await });

                Some(Ok(Download { rx: download_rx }))
            }
            ItemState::NotFound | ItemState::Expired => Some(Err(CacheError::NotFound)),
            ItemState::Created | ItemState::Querying => None,
            ItemState::Active | ItemState::Downloaded => {
                Some(Err(CacheError::InvalidState("download")))
            }
        }
    }

    async fn transfer(
        self: Arc<Self>,
        file: std::fs::File,
        download_tx: watch::Sender<Option<bool>>,
        progress_tx: watch::Sender<u64>,
    ) {
        match self.run_transfer(file, &progress_tx).await {
            Ok(()) => {
                let (finished, full_length) = {
                    let mut inner = self.inner.lock().unwrap();
                    let finished = inner.state == ItemState::Active;
                    if finished {
                        inner.state = ItemState::Downloaded;
                    }
                    inner.available = inner.full_length;
                    (finished, inner.full_length)
                };

                // Size accounting must be settled before the download
                // resolves, so that a resolved download implies an updated
                // `current_size`.
                if finished {
                    if let Some(cache) = self.cache.upgrade() {
                        cache.report_completed(full_length);
                    }
                    tracing::debug!(key = %self.key, bytes = full_length, "Download complete");
                }

                progress_tx.send_replace(full_length);
                download_tx.send_replace(Some(true));
            }
            Err(error) => {
                tracing::warn!(key = %self.key, %error, "Download failed");

                let path = {
                    let mut inner = self.inner.lock().unwrap();
                    let path = inner.local_path.take();
                    if inner.state == ItemState::Active {
                        // back to square one; a later `get` retries from a
                        // fresh probe
                        inner.state = ItemState::Created;
                        inner.exists = None;
                        inner.download = None;
                        inner.progress = None;
                        inner.available = 0;
                    }
                    path
                };

                if let Some(path) = path {
                    if let Err(error) = std::fs::remove_file(&path) {
                        tracing::debug!(key = %self.key, %error, "Failed to remove partial file");
                    }
                }

                download_tx.send_replace(Some(false));
                // dropping `progress_tx` wakes and cancels tailing readers
            }
        }
    }

    async fn run_transfer(
        &self,
        file: std::fs::File,
        progress: &watch::Sender<u64>,
    ) -> CacheEntry<()> {
        let full_length = self.inner.lock().unwrap().full_length;

        let mut stream = self.store.open(&self.key).await?;
        let mut file = File::from_std(file);
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > full_length {
                return Err(CacheError::DownloadError(format!(
                    "remote sent more than the probed {full_length} bytes"
                )));
            }

            file.write_all(&chunk).await?;
            file.flush().await?;

            self.inner.lock().unwrap().available = written;
            progress.send_replace(written);
        }

        if written != full_length {
            return Err(CacheError::DownloadError(format!(
                "remote stream ended at {written} of {full_length} bytes"
            )));
        }
        Ok(())
    }

    /// Opens a reader over the local cache file.
    ///
    /// Legal in `Active` (tailing the in-flight download) and `Downloaded`
    /// (plain sequential reads) only.
    pub async fn local_reader(self: &Arc<Self>) -> CacheEntry<ItemReader> {
        let (path, full_length, tail) = {
            let inner = self.inner.lock().unwrap();
            let path = match (&inner.state, &inner.local_path) {
                (ItemState::Active | ItemState::Downloaded, Some(path)) => path.clone(),
                _ => return Err(CacheError::InvalidState("local reader")),
            };

            let tail = if inner.state == ItemState::Active {
                match (&inner.progress, &inner.download) {
                    (Some(progress), Some(download)) => {
                        Some((progress.clone(), download.clone()))
                    }
                    _ => return Err(CacheError::InvalidState("local reader")),
                }
            } else {
                None
            };

            (path, inner.full_length, tail)
        };

        let file = File::open(&path).await?;
        Ok(ItemReader::new(Arc::clone(self), file, full_length, tail))
    }

    /// Moves the item to its terminal state and removes the local file.
    ///
    /// Idempotent. Open readers keep working: the unlink only detaches the
    /// path while their handles stay valid.
    pub(super) fn expire(&self) {
        let (prev_state, path, available) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ItemState::Expired {
                return;
            }
            let prev_state = inner.state;
            inner.state = ItemState::Expired;
            (prev_state, inner.local_path.take(), inner.available)
        };

        if let Some(cache) = self.cache.upgrade() {
            cache.report_expired(prev_state, available);
        }

        if let Some(path) = path {
            if let Err(error) = std::fs::remove_file(&path) {
                tracing::debug!(key = %self.key, %error, "Failed to remove cache file");
            }
        }
        tracing::debug!(key = %self.key, state = ?prev_state, "Expired item");
    }
}

/// Allocates a uniquely named file in the cache directory.
///
/// The name carries a random component, so concurrent downloads can never
/// collide. The file outlives the handle; deletion is explicit.
fn allocate_cache_file(dir: &Path) -> io::Result<(std::fs::File, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let temp_file = tempfile::Builder::new()
        .prefix("dl-")
        .rand_bytes(10)
        .tempfile_in(dir)?;
    temp_file.keep().map_err(|e| e.error)
}
