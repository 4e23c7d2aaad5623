use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::store::{Registry, Subscription};

type Erased = Arc<dyn Any + Send + Sync>;

pub(crate) type SharedFetch<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

const MAX_SWEEP_PERIOD: Duration = Duration::from_secs(60 * 60);

struct CacheEntry {
    value: Erased,
    stored_at: Instant,
    max_age: Duration,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.stored_at.elapsed() >= self.max_age
    }
}

struct Sweeper {
    period: Duration,
    handle: AbortHandle,
}

struct InFlight {
    id: u64,
    started: Instant,
    // A `SharedFetch<T, E>` for whatever types the first caller used.
    fetch: Box<dyn Any + Send + Sync>,
}

struct KeyListener {
    active: Arc<AtomicBool>,
    callback: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct CacheInner {
    entries: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    listeners: Mutex<HashMap<String, Vec<Arc<KeyListener>>>>,
    next_fetch: AtomicU64,
    sweeper: Mutex<Option<Sweeper>>,
}

impl Registry for CacheInner {
    fn prune(&self) {
        let mut listeners = self.listeners.lock();
        for list in listeners.values_mut() {
            list.retain(|listener| listener.active.load(Ordering::Acquire));
        }
        listeners.retain(|_, list| !list.is_empty());
    }
}

/// Keyed store of previously fetched results, shared by every
/// [`SwrEffect`](super::SwrEffect) that uses it.
///
/// Values are type-erased; reading a key with a different type than it was
/// written with behaves like a miss. Use [`SwrCache::global`] for the
/// process-wide default, or [`SwrCache::new`] for an isolated cache (handy in
/// tests).
#[derive(Clone, Default)]
pub struct SwrCache {
    inner: Arc<CacheInner>,
}

impl SwrCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache.
    pub fn global() -> Self {
        static CACHE: OnceLock<SwrCache> = OnceLock::new();
        CACHE.get_or_init(SwrCache::new).clone()
    }

    /// The cached value and its age, unless it is absent or at least `max_age` old.
    ///
    /// An entry past the window it was written with is purged on the way out;
    /// one that is only older than the caller's `max_age` stays for others.
    pub fn get<T>(&self, key: &str, max_age: Duration) -> Option<(T, Duration)>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut entries = self.inner.entries.lock();
        let entry = entries.get(key)?;
        let age = entry.stored_at.elapsed();
        if entry.expired() {
            tracing::trace!(key, ?age, "purging expired cache entry");
            entries.remove(key);
            return None;
        }
        if age >= max_age {
            return None;
        }
        let value = entry.value.downcast_ref::<T>()?.clone();
        Some((value, age))
    }

    /// Write `value` with the current timestamp and tell every listener on `key`.
    ///
    /// The entry is never swept; use [`set_with_max_age`](Self::set_with_max_age)
    /// to give it an expiry.
    pub fn set<T>(&self, key: &str, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.set_with_max_age(key, value, Duration::MAX);
    }

    /// Like [`set`](Self::set), but the entry expires once it is `max_age` old.
    pub fn set_with_max_age<T>(&self, key: &str, value: T, max_age: Duration)
    where
        T: Send + Sync + 'static,
    {
        self.inner.entries.lock().insert(
            key.to_string(),
            CacheEntry {
                value: Arc::new(value),
                stored_at: Instant::now(),
                max_age,
            },
        );
        self.notify(key);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner.entries.lock().remove(key).is_some()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.entries.lock().clear();
    }

    /// Drop every entry past the window it was written with. Returns how many
    /// were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired());
        let purged = before - entries.len();
        if purged > 0 {
            tracing::debug!(purged, "swept expired cache entries");
        }
        purged
    }

    /// Make sure this cache is swept at least every `period` on `runtime`.
    ///
    /// A cache runs one sweeper however many effects share it. A shorter
    /// period than the running one restarts it; the task ends on its own once
    /// every handle to the cache is gone.
    pub(crate) fn ensure_sweeper(&self, runtime: &tokio::runtime::Handle, period: Duration) {
        let period = period.clamp(Duration::from_millis(1), MAX_SWEEP_PERIOD);
        let mut sweeper = self.inner.sweeper.lock();
        if let Some(running) = sweeper.as_ref() {
            if !running.handle.is_finished() && running.period <= period {
                return;
            }
            running.handle.abort();
        }
        tracing::debug!(?period, "starting cache sweeper");
        let inner = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                SwrCache { inner }.sweep();
            }
        });
        *sweeper = Some(Sweeper {
            period,
            handle: handle.abort_handle(),
        });
    }

    /// Be told whenever `key` is written.
    pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        self.inner
            .listeners
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(Arc::new(KeyListener {
                active: Arc::clone(&active),
                callback: Box::new(callback),
            }));
        let registry: Weak<dyn Registry> = Arc::downgrade(&self.inner) as Weak<dyn Registry>;
        Subscription::new(active, registry)
    }

    fn notify(&self, key: &str) {
        let listeners = self
            .inner
            .listeners
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            if listener.active.load(Ordering::Acquire) {
                (listener.callback)();
            }
        }
    }

    /// Whether a fetch for `key` is currently in flight.
    pub fn is_fetching(&self, key: &str) -> bool {
        self.inner.in_flight.lock().contains_key(key)
    }

    /// Join the fetch already in flight for `key` if it started less than
    /// `interval` ago, otherwise start `fetch` and register it.
    ///
    /// A successful result is written through to the cache by the fetch
    /// itself, once, however many callers are waiting on it. It expires after
    /// the `max_age` of whichever caller started the fetch.
    pub(crate) fn fetch_deduped<T, E, Fut>(
        &self,
        key: &str,
        interval: Duration,
        max_age: Duration,
        fetch: impl FnOnce() -> Fut,
    ) -> SharedFetch<T, E>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if let Some(shared) = self.join_in_flight::<T, E>(key, interval) {
            tracing::debug!(key, "joining in-flight fetch");
            return shared;
        }

        let id = self.inner.next_fetch.fetch_add(1, Ordering::Relaxed);
        let cache = self.clone();
        let owned_key = key.to_string();
        let work = fetch();
        let shared = async move {
            let result = work.await;
            cache.finish_fetch(&owned_key, id);
            if let Ok(value) = &result {
                cache.set_with_max_age(&owned_key, value.clone(), max_age);
            }
            result
        }
        .boxed()
        .shared();

        tracing::debug!(key, id, "starting fetch");
        self.inner.in_flight.lock().insert(
            key.to_string(),
            InFlight {
                id,
                started: Instant::now(),
                fetch: Box::new(shared.clone()),
            },
        );
        shared
    }

    fn join_in_flight<T, E>(&self, key: &str, interval: Duration) -> Option<SharedFetch<T, E>>
    where
        T: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let in_flight = self.inner.in_flight.lock();
        let existing = in_flight.get(key)?;
        if existing.started.elapsed() >= interval {
            return None;
        }
        existing.fetch.downcast_ref::<SharedFetch<T, E>>().cloned()
    }

    fn finish_fetch(&self, key: &str, id: u64) {
        let mut in_flight = self.inner.in_flight.lock();
        if in_flight.get(key).is_some_and(|entry| entry.id == id) {
            in_flight.remove(key);
        }
    }
}

impl std::fmt::Debug for SwrCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwrCache")
            .field("entries", &self.len())
            .finish()
    }
}
