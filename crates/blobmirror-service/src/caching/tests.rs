use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::config::Config;
use crate::store::{ByteStream, ObjectStore, RemoteMetadata};
use crate::test;

use super::*;

/// Fixed remote modification time reported by [`MockStore`].
fn mock_modified() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_600_000_000)
}

#[derive(Clone)]
struct MockObject {
    data: Bytes,
    chunk_size: usize,
    chunk_delay: Duration,
    fail_once_at: Option<u64>,
    stat_error: bool,
    report_length: bool,
}

/// A scripted in-memory object store.
///
/// Counts `stat` and `open` calls so tests can assert on single-flight
/// behavior, and supports throttled streaming and one-shot mid-stream
/// failures.
#[derive(Default)]
struct MockStore {
    objects: Mutex<HashMap<String, MockObject>>,
    stat_calls: AtomicUsize,
    open_calls: AtomicUsize,
}

impl MockStore {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds an object served as a single chunk.
    fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.insert_throttled(key, data, usize::MAX, Duration::ZERO);
    }

    /// Adds an object streamed in `chunk_size` pieces with a delay before
    /// each piece.
    fn insert_throttled(
        &self,
        key: &str,
        data: impl Into<Bytes>,
        chunk_size: usize,
        chunk_delay: Duration,
    ) {
        let object = MockObject {
            data: data.into(),
            chunk_size: chunk_size.max(1),
            chunk_delay,
            fail_once_at: None,
            stat_error: false,
            report_length: true,
        };
        self.objects.lock().unwrap().insert(key.to_owned(), object);
    }

    /// Makes the next `open` of `key` fail after `offset` bytes.
    fn fail_once_at(&self, key: &str, offset: u64) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(object) = objects.get_mut(key) {
            object.fail_once_at = Some(offset);
        }
    }

    /// Makes every `stat` of `key` fail with a transient error.
    fn poison_stat(&self, key: &str, data: impl Into<Bytes>) {
        let object = MockObject {
            data: data.into(),
            chunk_size: usize::MAX,
            chunk_delay: Duration::ZERO,
            fail_once_at: None,
            stat_error: true,
            report_length: true,
        };
        self.objects.lock().unwrap().insert(key.to_owned(), object);
    }

    /// Makes `stat` of `key` omit the object length.
    fn hide_length(&self, key: &str) {
        let mut objects = self.objects.lock().unwrap();
        if let Some(object) = objects.get_mut(key) {
            object.report_length = false;
        }
    }

    fn stat_calls(&self) -> usize {
        self.stat_calls.load(Ordering::Relaxed)
    }

    fn open_calls(&self) -> usize {
        self.open_calls.load(Ordering::Relaxed)
    }
}

struct MockTransfer {
    data: Bytes,
    pos: usize,
    chunk_size: usize,
    chunk_delay: Duration,
    fail_at: Option<u64>,
}

impl ObjectStore for MockStore {
    fn stat<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheEntry<RemoteMetadata>> {
        self.stat_calls.fetch_add(1, Ordering::Relaxed);
        let result = match self.objects.lock().unwrap().get(key) {
            Some(object) if object.stat_error => {
                Err(CacheError::DownloadError("scripted stat failure".into()))
            }
            Some(object) => Ok(RemoteMetadata {
                length: object.report_length.then(|| object.data.len() as u64),
                last_modified: Some(mock_modified()),
            }),
            None => Err(CacheError::NotFound),
        };
        async move { result }.boxed()
    }

    fn open<'a>(&'a self, key: &'a str) -> BoxFuture<'a, CacheEntry<ByteStream>> {
        self.open_calls.fetch_add(1, Ordering::Relaxed);
        let object = {
            let mut objects = self.objects.lock().unwrap();
            match objects.get_mut(key) {
                Some(object) => {
                    let fail_at = object.fail_once_at.take();
                    let mut object = object.clone();
                    object.fail_once_at = fail_at;
                    Ok(object)
                }
                None => Err(CacheError::NotFound),
            }
        };

        async move {
            let object = object?;
            let transfer = MockTransfer {
                data: object.data,
                pos: 0,
                chunk_size: object.chunk_size,
                chunk_delay: object.chunk_delay,
                fail_at: object.fail_once_at,
            };

            let stream = futures::stream::try_unfold(transfer, |mut t| async move {
                if t.pos >= t.data.len() {
                    return Ok(None);
                }
                if t.chunk_delay > Duration::ZERO {
                    tokio::time::sleep(t.chunk_delay).await;
                }

                let mut end = t.pos.saturating_add(t.chunk_size).min(t.data.len());
                if let Some(fail_at) = t.fail_at {
                    if t.pos as u64 >= fail_at {
                        return Err(CacheError::DownloadError(
                            "scripted stream failure".into(),
                        ));
                    }
                    end = end.min(fail_at as usize);
                }

                let chunk = t.data.slice(t.pos..end);
                t.pos = end;
                Ok(Some((chunk, t)))
            });

            let stream: ByteStream = Box::pin(stream);
            Ok(stream)
        }
        .boxed()
    }
}

fn test_config(dir: &std::path::Path) -> Config {
    Config {
        cache_path: dir.to_path_buf(),
        ..Default::default()
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_cache_dir_created() {
    test::setup();

    let basedir = test::tempdir();
    let cachedir = basedir.path().join("cache");
    let _cache = Cache::new(&test_config(&cachedir), MockStore::new()).unwrap();

    assert!(std::fs::metadata(cachedir).unwrap().is_dir());
}

#[tokio::test]
async fn test_cold_hit_then_local_serves() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    let data = payload(1000);
    store.insert("a/b.bin", data.clone());

    let cache = Cache::new(&test_config(cachedir.path()), Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();

    let item = cache.get("/a/b.bin").unwrap();
    assert!(item.exists().await.unwrap());
    assert!(item.download().await.unwrap().wait().await.unwrap());
    assert_eq!(item.state(), ItemState::Downloaded);
    assert_eq!(item.full_length(), 1000);
    assert_eq!(item.last_modified(), mock_modified());

    let mut reader = item.local_reader().await.unwrap();
    assert_eq!(reader.len(), 1000);
    assert_eq!(reader.read_to_end().await.unwrap(), data);
    assert_eq!(cache.current_size(), 1000);

    // the second access is served entirely from disk
    let again = cache.get("a/b.bin").unwrap();
    assert!(Arc::ptr_eq(&item, &again));
    assert!(again.download().await.unwrap().wait().await.unwrap());
    let mut reader = again.local_reader().await.unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), data);

    assert_eq!(store.stat_calls(), 1);
    assert_eq!(store.open_calls(), 1);
}

#[tokio::test]
async fn test_concurrent_readers_single_download() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    let data = payload(64 * 1024);
    store.insert_throttled("big", data.clone(), 4096, Duration::from_millis(1));

    let cache = Cache::new(&test_config(cachedir.path()), Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..50 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            let item = cache.get("big").unwrap();
            let _download = item.download().await.unwrap();
            let mut reader = item.local_reader().await.unwrap();
            reader.read_to_end().await.unwrap()
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap(), data);
    }
    assert_eq!(store.open_calls(), 1);
}

#[tokio::test]
async fn test_single_flight_probe() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    store.insert("a", b"hi".as_slice());

    let cache = Cache::new(&test_config(cachedir.path()), Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();
    let item = cache.get("a").unwrap();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let item = Arc::clone(&item);
        tasks.push(tokio::spawn(async move { item.exists().await.unwrap() }));
    }
    for task in tasks {
        assert!(task.await.unwrap());
    }
    assert_eq!(store.stat_calls(), 1);
}

#[tokio::test]
async fn test_not_found_probed_once() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    let cache = Cache::new(&test_config(cachedir.path()), Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();

    for _ in 0..15 {
        let item = cache.get("missing").unwrap();
        assert!(!item.exists().await.unwrap());
    }

    let item = cache.get("missing").unwrap();
    assert_eq!(item.state(), ItemState::NotFound);
    assert_eq!(item.download().await.unwrap_err(), CacheError::NotFound);
    assert_eq!(store.stat_calls(), 1);
    assert_eq!(cache.not_found_count(), 1);
}

#[tokio::test]
async fn test_transient_stat_error_cached_as_not_found() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    store.poison_stat("flaky", b"data".as_slice());

    let cache = Cache::new(&test_config(cachedir.path()), Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();
    let item = cache.get("flaky").unwrap();

    assert!(!item.exists().await.unwrap());
    assert_eq!(item.state(), ItemState::NotFound);
    assert_eq!(cache.not_found_count(), 1);
}

#[tokio::test]
async fn test_unknown_length_treated_as_not_found() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    store.insert("nosize", b"data".as_slice());
    store.hide_length("nosize");

    let cache = Cache::new(&test_config(cachedir.path()), Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();
    let item = cache.get("nosize").unwrap();

    assert!(!item.exists().await.unwrap());
    assert_eq!(item.state(), ItemState::NotFound);
}

#[tokio::test]
async fn test_not_found_cap_evicts_to_band() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    let config = Config {
        max_not_found: 20,
        ..test_config(cachedir.path())
    };
    let cache = Cache::new(&config, Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();

    for i in 0..40 {
        let item = cache.get(&format!("miss-{i}")).unwrap();
        assert!(!item.exists().await.unwrap());
    }
    assert_eq!(cache.not_found_count(), 40);

    cache.enforce_limits();
    // the cap is 20, the hysteresis band keeps 20 - max(10, 20/10) = 10
    assert_eq!(cache.not_found_count(), 10);
}

#[tokio::test]
async fn test_size_eviction_keeps_most_recent() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    let config = Config {
        max_size: 10 * 1024 * 1024,
        ..test_config(cachedir.path())
    };
    let cache = Cache::new(&config, Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();

    let mut items = Vec::new();
    for i in 0..10 {
        let key = format!("f{i}");
        store.insert(&key, payload(2 * 1024 * 1024));
        let item = cache.get(&key).unwrap();
        assert!(item.download().await.unwrap().wait().await.unwrap());
        items.push(item);
        // keep the access order unambiguous
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(cache.current_size(), 20 * 1024 * 1024);

    let paths: Vec<_> = items.iter().map(|item| item.local_path().unwrap()).collect();

    cache.enforce_limits();
    assert!(cache.current_size() <= config.max_size);

    // the band is 9 MiB; the running sum over f9..f5 crosses it at f5, so
    // f5..f0 are gone and the four most recent survive
    for (i, item) in items.iter().enumerate() {
        if i >= 6 {
            assert_eq!(item.state(), ItemState::Downloaded, "f{i}");
            assert!(paths[i].exists(), "f{i}");
        } else {
            assert_eq!(item.state(), ItemState::Expired, "f{i}");
            assert!(!paths[i].exists(), "f{i}");
        }
    }
    assert_eq!(cache.current_size(), 8 * 1024 * 1024);
}

#[tokio::test]
async fn test_active_downloads_are_not_evicted() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    let data = payload(32 * 1024);
    store.insert_throttled("slow", data.clone(), 1024, Duration::from_millis(2));

    let cache = Cache::new(&test_config(cachedir.path()), Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();
    let item = cache.get("slow").unwrap();
    let download = item.download().await.unwrap();
    assert_eq!(item.state(), ItemState::Active);

    // an in-flight download has no bytes accounted and must survive a sweep
    cache.enforce_limits();
    assert_eq!(item.state(), ItemState::Active);
    assert_eq!(cache.current_size(), 0);

    let mut reader = item.local_reader().await.unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), data);
    assert!(download.wait().await.unwrap());
    assert_eq!(cache.current_size(), data.len() as u64);
}

#[tokio::test]
async fn test_failed_download_resets_and_retries() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    let data = payload(1000);
    store.insert_throttled("wobbly", data.clone(), 100, Duration::from_millis(1));
    store.fail_once_at("wobbly", 500);

    let cache = Cache::new(&test_config(cachedir.path()), Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();

    let item = cache.get("wobbly").unwrap();
    let download = item.download().await.unwrap();
    let mut reader = item.local_reader().await.unwrap();
    let path = item.local_path().unwrap();

    assert!(matches!(
        reader.read_to_end().await.unwrap_err(),
        CacheError::DownloadError(_)
    ));
    assert!(!download.wait().await.unwrap());
    assert_eq!(item.state(), ItemState::Created);
    assert_eq!(item.local_path(), None);
    assert!(!path.exists());
    assert_eq!(cache.current_size(), 0);

    // the second attempt starts from scratch and succeeds
    let item = cache.get("wobbly").unwrap();
    assert!(item.download().await.unwrap().wait().await.unwrap());
    let mut reader = item.local_reader().await.unwrap();
    assert_eq!(reader.read_to_end().await.unwrap(), data);
    assert_eq!(store.stat_calls(), 2);
    assert_eq!(store.open_calls(), 2);
}

#[tokio::test]
async fn test_force_expire_is_idempotent() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    store.insert("a/b.bin", payload(100));

    let cache = Cache::new(&test_config(cachedir.path()), Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();
    let item = cache.get("a/b.bin").unwrap();
    assert!(item.download().await.unwrap().wait().await.unwrap());
    let path = item.local_path().unwrap();

    cache.force_expire(["/a/b.bin"]);
    assert_eq!(item.state(), ItemState::Expired);
    assert_eq!(cache.current_size(), 0);
    assert!(!path.exists());

    cache.force_expire(["/a/b.bin"]);
    assert_eq!(cache.current_size(), 0);

    // a fresh request rebuilds the item from the remote
    let fresh = cache.get("a/b.bin").unwrap();
    assert!(!Arc::ptr_eq(&item, &fresh));
    assert!(fresh.download().await.unwrap().wait().await.unwrap());
    assert_eq!(store.open_calls(), 2);
    assert_eq!(cache.current_size(), 100);
}

#[tokio::test]
async fn test_expiry_by_time_and_keep_forever() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    store.insert("keep/me", payload(10));
    store.insert("drop/me", payload(10));

    let config = Config {
        keep_forever: Some(regex::Regex::new("^keep/").unwrap()),
        ..test_config(cachedir.path())
    };
    let cache = Cache::new(&config, Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();

    let kept = cache.get("keep/me").unwrap();
    let dropped = cache.get("drop/me").unwrap();
    assert!(kept.download().await.unwrap().wait().await.unwrap());
    assert!(dropped.download().await.unwrap().wait().await.unwrap());

    kept.backdate_expiry(Duration::from_millis(50));
    dropped.backdate_expiry(Duration::from_millis(50));

    // a stale item is still served to the request that finds it
    let stale = cache.get("drop/me").unwrap();
    assert!(Arc::ptr_eq(&dropped, &stale));
    assert_eq!(stale.state(), ItemState::Downloaded);

    cache.enforce_limits();
    assert_eq!(dropped.state(), ItemState::Expired);
    assert_eq!(kept.state(), ItemState::Downloaded);
    assert_eq!(cache.current_size(), 10);
}

#[tokio::test]
async fn test_local_reader_requires_local_file() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    let cache = Cache::new(&test_config(cachedir.path()), Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();

    let item = cache.get("nothing").unwrap();
    assert!(matches!(
        item.local_reader().await.unwrap_err(),
        CacheError::InvalidState(_)
    ));

    assert!(!item.exists().await.unwrap());
    assert!(matches!(
        item.local_reader().await.unwrap_err(),
        CacheError::InvalidState(_)
    ));
}

#[tokio::test]
async fn test_empty_key_is_rejected() {
    test::setup();

    let cachedir = test::tempdir();
    let cache = Cache::new(&test_config(cachedir.path()), MockStore::new()).unwrap();

    assert_eq!(cache.get("/").unwrap_err(), CacheError::NotFound);
    assert_eq!(cache.get("").unwrap_err(), CacheError::NotFound);
}

#[tokio::test]
async fn test_close_disposes_and_drains() {
    test::setup();

    let cachedir = test::tempdir();
    let store = MockStore::new();
    store.insert("a", payload(10));

    let cache = Cache::new(&test_config(cachedir.path()), Arc::clone(&store) as Arc<dyn ObjectStore>).unwrap();
    let item = cache.get("a").unwrap();
    assert!(item.download().await.unwrap().wait().await.unwrap());

    assert!(cache.is_ready());
    cache.close();
    cache.close();
    assert!(!cache.is_ready());
    assert_eq!(cache.get("a").unwrap_err(), CacheError::Disposed);

    // the expirer wakes on the close signal and drains everything
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(item.state(), ItemState::Expired);
    assert_eq!(cache.current_size(), 0);
}
