use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::Notify;

use crate::config::Config;
use crate::store::ObjectStore;

use super::item::{Item, ItemState};
use super::{CacheEntry, CacheError};

/// Lower bound for the negative-cache cap.
const MIN_NOT_FOUND: usize = 10;

/// Lower bound for the size cap.
const MIN_SIZE: u64 = 5 * 1024 * 1024;

/// Lower bound for the validity period.
const MIN_VALIDITY: Duration = Duration::from_secs(3600);

/// Debounce applied to expire triggers, so a flurry of over-limit reports
/// collapses into a single sweep.
const TRIGGER_JITTER: Duration = Duration::from_secs(1);

/// The in-memory directory of mirrored objects.
///
/// Owns the key→[`Item`] mapping, the size and negative-cache accounting,
/// and the background expirer. Cheap to clone; all clones share one
/// directory. Items reference the directory through a non-owning handle;
/// they disappear only via the directory's own eviction paths.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

pub(super) struct CacheInner {
    store: Arc<dyn ObjectStore>,
    cache_path: PathBuf,
    max_size: u64,
    max_not_found: usize,
    validity_period: Duration,
    keep_forever: Option<Regex>,
    state: Mutex<CacheState>,
    trigger: Trigger,
}

struct CacheState {
    items: HashMap<String, Arc<Item>>,
    current_size: u64,
    not_found_count: usize,
    disposed: bool,
}

/// Coalescing signal for the expirer.
struct Trigger {
    generation: AtomicU64,
    notify: Notify,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Cache")
            .field("items", &state.items.len())
            .field("current_size", &state.current_size)
            .field("not_found_count", &state.not_found_count)
            .field("disposed", &state.disposed)
            .finish()
    }
}

impl Cache {
    /// Creates the cache directory if missing and starts the expirer.
    ///
    /// The caps from `config` are clamped to workable minimums: at least 10
    /// negative entries, at least 5 MiB of payload, at least one hour of
    /// validity.
    pub fn new(config: &Config, store: Arc<dyn ObjectStore>) -> io::Result<Self> {
        std::fs::create_dir_all(&config.cache_path)?;

        let inner = Arc::new(CacheInner {
            store,
            cache_path: config.cache_path.clone(),
            max_size: config.max_size.max(MIN_SIZE),
            max_not_found: config.max_not_found.max(MIN_NOT_FOUND),
            validity_period: config.cache_time.max(MIN_VALIDITY),
            keep_forever: config.keep_forever.clone(),
            state: Mutex::new(CacheState {
                items: HashMap::new(),
                current_size: 0,
                not_found_count: 0,
                disposed: false,
            }),
            trigger: Trigger {
                generation: AtomicU64::new(0),
                notify: Notify::new(),
            },
        });

        tokio::spawn(Arc::clone(&inner).run_expirer());

        Ok(Self { inner })
    }

    /// Looks up or creates the item for `key`.
    ///
    /// A leading `/` is stripped. The existing item is returned even when it
    /// is already past its expiry; the sweep is signalled and a later request
    /// gets a fresh item, but this request may serve stale content.
    pub fn get(&self, key: &str) -> CacheEntry<Arc<Item>> {
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            return Err(CacheError::NotFound);
        }

        let now = Instant::now();
        let item = {
            let mut state = self.inner.state.lock().unwrap();
            if state.disposed {
                return Err(CacheError::Disposed);
            }

            match state.items.get(key) {
                Some(item) => Arc::clone(item),
                None => {
                    let never_expires = self
                        .inner
                        .keep_forever
                        .as_ref()
                        .is_some_and(|re| re.is_match(key));
                    let item = Item::new(
                        key.to_owned(),
                        never_expires,
                        Arc::downgrade(&self.inner),
                        Arc::clone(&self.inner.store),
                        self.inner.validity_period,
                    );
                    state.items.insert(key.to_owned(), Arc::clone(&item));
                    item
                }
            }
        };

        item.touch(now);
        if item.is_expired_at(now) {
            self.inner.trigger_sweep();
        }
        Ok(item)
    }

    /// Removes and expires the named items.
    ///
    /// Unknown keys are ignored; expiring the same key twice is a no-op.
    pub fn force_expire<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let removed: Vec<_> = {
            let mut state = self.inner.state.lock().unwrap();
            keys.into_iter()
                .filter_map(|key| state.items.remove(key.as_ref().trim_start_matches('/')))
                .collect()
        };

        for item in &removed {
            item.expire();
        }
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Force-expired items");
        }
    }

    /// The effective validity period, after clamping.
    pub fn validity_period(&self) -> Duration {
        self.inner.validity_period
    }

    /// Whether the cache can still serve requests.
    pub fn is_ready(&self) -> bool {
        !self.inner.state.lock().unwrap().disposed
    }

    /// Bytes currently held by fully downloaded items.
    pub fn current_size(&self) -> u64 {
        self.inner.state.lock().unwrap().current_size
    }

    /// Number of negatively cached keys.
    pub fn not_found_count(&self) -> usize {
        self.inner.state.lock().unwrap().not_found_count
    }

    /// Shuts the cache down.
    ///
    /// Subsequent [`get`](Self::get) calls fail with
    /// [`CacheError::Disposed`]; the expirer drains all items and stops.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.disposed {
                return;
            }
            state.disposed = true;
        }
        // bypass the debounce, the expirer should drain right away
        self.inner.trigger.notify.notify_one();
    }

    #[cfg(test)]
    pub(super) fn enforce_limits(&self) {
        self.inner.enforce_limits();
    }
}

impl CacheInner {
    pub(super) fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Called by an item once its download finished; may signal the expirer.
    pub(super) fn report_completed(self: &Arc<Self>, len: u64) {
        let over_limit = {
            let mut state = self.state.lock().unwrap();
            state.current_size += len;
            state.current_size > self.max_size
        };
        if over_limit {
            self.trigger_sweep();
        }
    }

    /// Called by an item once its probe came back negative.
    pub(super) fn report_not_found(self: &Arc<Self>) {
        let over_limit = {
            let mut state = self.state.lock().unwrap();
            state.not_found_count += 1;
            state.not_found_count > self.max_not_found
        };
        if over_limit {
            self.trigger_sweep();
        }
    }

    /// Called by an expiring item to release whatever its previous state
    /// contributed to the accounting.
    pub(super) fn report_expired(&self, prev_state: ItemState, available: u64) {
        let mut state = self.state.lock().unwrap();
        match prev_state {
            ItemState::NotFound => {
                state.not_found_count = state.not_found_count.saturating_sub(1);
            }
            ItemState::Downloaded => {
                state.current_size = state.current_size.saturating_sub(available);
            }
            _ => {}
        }
    }

    /// Debounced request for an eviction sweep.
    ///
    /// Captures the current trigger generation and fires it after the jitter
    /// delay; a fire for a rotated generation is dropped, since that sweep
    /// already ran or a newer trigger is in flight.
    fn trigger_sweep(self: &Arc<Self>) {
        let generation = self.trigger.generation.load(Ordering::Acquire);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(TRIGGER_JITTER).await;
            if inner.trigger.generation.load(Ordering::Acquire) == generation {
                inner.trigger.notify.notify_one();
            }
        });
    }

    async fn run_expirer(self: Arc<Self>) {
        loop {
            let interval = self.validity_period / 2 + Duration::from_secs(1);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.trigger.notify.notified() => {
                    self.trigger.generation.fetch_add(1, Ordering::AcqRel);
                }
            }

            let disposed = self.state.lock().unwrap().disposed;
            self.enforce_limits();
            if disposed {
                break;
            }
        }
        tracing::debug!("Expirer stopped");
    }

    /// Computes the eviction set under the directory lock, then tears the
    /// evicted items down outside of it.
    pub(super) fn enforce_limits(self: &Arc<Self>) {
        let evicted = self.collect_evictable();
        if evicted.is_empty() {
            return;
        }

        tracing::info!(count = evicted.len(), "Evicting items");
        for item in &evicted {
            item.expire();
        }
    }

    fn collect_evictable(&self) -> Vec<Arc<Item>> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        if state.disposed {
            return state.items.drain().map(|(_, item)| item).collect();
        }

        let mut entries: Vec<_> = state
            .items
            .values()
            .map(|item| (Arc::clone(item), item.snapshot()))
            .collect();
        // most recently accessed first; the stable sort breaks ties by map
        // order, which is as good as any
        entries.sort_by(|a, b| b.1.last_accessed.cmp(&a.1.last_accessed));

        // hysteresis bands: evict down to roughly 90% of each cap
        let not_found_keep = self
            .max_not_found
            .saturating_sub(MIN_NOT_FOUND.max(self.max_not_found / 10));
        let size_band = self.max_size - self.max_size / 10;

        let mut evict = vec![false; entries.len()];
        let mut not_found_rank = 0;
        let mut size_sum = 0u64;
        let mut size_exceeded = false;

        for (idx, (_, snapshot)) in entries.iter().enumerate() {
            match snapshot.state {
                ItemState::NotFound => {
                    not_found_rank += 1;
                    if not_found_rank > not_found_keep {
                        evict[idx] = true;
                    }
                }
                ItemState::Downloaded => {
                    size_sum += snapshot.available;
                    if size_sum > size_band {
                        size_exceeded = true;
                    }
                    if size_exceeded {
                        evict[idx] = true;
                    }
                }
                // in-flight downloads are not size-counted yet; their
                // completion report triggers the next sweep if needed
                _ => {}
            }

            // keep-forever only shields against the clock, not the caps
            let timed_out = snapshot.state == ItemState::Expired
                || (snapshot.expires_at < now && !snapshot.never_expires);
            if timed_out {
                evict[idx] = true;
            }
        }

        let mut evicted = Vec::new();
        for (idx, (item, _)) in entries.into_iter().enumerate() {
            if evict[idx] {
                state.items.remove(item.key());
                evicted.push(item);
            }
        }
        evicted
    }
}
