use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::AbortHandle;

use super::cache::SwrCache;
use super::signals::{RevalidateSignal, RevalidateSignals};
use crate::effect::{boxed_unit, EffectState, EffectStatus, ExecutorPhase, TaskSlot, Unit};
use crate::store::{State, Store, Subscription};

/// Freshness and revalidation settings for an [`SwrEffect`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwrOptions {
    /// Cached data younger than this is served without revalidating.
    pub stale_time: Duration,
    /// Cached data at least this old is treated as absent. Values this effect
    /// writes are swept once they reach it.
    pub cache_time: Duration,
    /// A fetch for the same key started less than this long ago is joined
    /// instead of repeated.
    pub deduping_interval: Duration,
    pub revalidate_on_focus: bool,
    pub revalidate_on_reconnect: bool,
    /// Whether a stale cache hit starts a background fetch.
    pub revalidate_if_stale: bool,
}

impl Default for SwrOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            cache_time: Duration::from_secs(5 * 60),
            deduping_interval: Duration::from_secs(2),
            revalidate_on_focus: true,
            revalidate_on_reconnect: true,
            revalidate_if_stale: true,
        }
    }
}

impl SwrOptions {
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_deduping_interval(mut self, interval: Duration) -> Self {
        self.deduping_interval = interval;
        self
    }

    pub fn with_revalidate_on_focus(mut self, enabled: bool) -> Self {
        self.revalidate_on_focus = enabled;
        self
    }

    pub fn with_revalidate_on_reconnect(mut self, enabled: bool) -> Self {
        self.revalidate_on_reconnect = enabled;
        self
    }

    pub fn with_revalidate_if_stale(mut self, enabled: bool) -> Self {
        self.revalidate_if_stale = enabled;
        self
    }

    fn reacts_to(&self, signal: RevalidateSignal) -> bool {
        match signal {
            RevalidateSignal::Focus => self.revalidate_on_focus,
            RevalidateSignal::Reconnect => self.revalidate_on_reconnect,
        }
    }
}

/// Status of an [`SwrEffect`].
///
/// `effect.is_loading` is only true while validating with nothing to show;
/// `is_validating` is true for any fetch in flight.
#[derive(Clone, Debug, PartialEq)]
pub struct SwrState<T, E> {
    pub effect: EffectState<T, E>,
    pub is_validating: bool,
}

impl<T, E> Default for SwrState<T, E> {
    fn default() -> Self {
        Self {
            effect: EffectState::default(),
            is_validating: false,
        }
    }
}

impl<T: Clone, E: Clone> SwrState<T, E> {
    fn showing(&self, data: T) -> Self {
        let mut next = self.clone();
        next.effect.data = Some(data);
        next.effect.error = None;
        next.effect.is_loading = false;
        if !next.is_validating {
            next.effect.phase = ExecutorPhase::Succeeded;
        }
        next
    }

    fn validating(&self) -> Self {
        let mut next = self.clone();
        next.is_validating = true;
        next.effect.is_loading = next.effect.data.is_none();
        next.effect.phase = ExecutorPhase::Running;
        next
    }

    fn settled(&self, outcome: Result<T, E>) -> Self {
        let mut next = self.clone();
        next.is_validating = false;
        next.effect.is_loading = false;
        match outcome {
            Ok(data) => {
                next.effect.data = Some(data);
                next.effect.error = None;
                next.effect.phase = ExecutorPhase::Succeeded;
            }
            Err(error) => {
                next.effect.error = Some(error);
                next.effect.phase = ExecutorPhase::Failed;
            }
        }
        next
    }
}

impl<T, E> State for SwrState<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Patch = Self;

    fn merge(&mut self, patch: Self) {
        *self = patch;
    }
}

struct Inner<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    key: String,
    unit: Unit<T, E>,
    options: SwrOptions,
    cache: SwrCache,
    status: Store<SwrState<T, E>>,
    task: TaskSlot,
}

impl<T, E> Inner<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn show(&self, data: T) {
        self.status.replace_state(|state| Some(state.showing(data)));
    }

    fn revalidate(self: &Arc<Self>) {
        let generation = self.task.begin();
        self.status.replace_state(|state| Some(state.validating()));

        let unit = Arc::clone(&self.unit);
        let fetch = self.cache.fetch_deduped(
            &self.key,
            self.options.deduping_interval,
            self.options.cache_time,
            move || unit(),
        );

        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let outcome = fetch.await;
            if let Some(inner) = weak.upgrade() {
                inner.settle(generation, outcome);
            }
        });
        self.task.attach(generation, handle.abort_handle());
        tracing::debug!(key = %self.key, generation, "revalidating");
    }

    fn settle(&self, generation: u64, outcome: Result<T, E>) {
        if !self.task.finish(generation) {
            return;
        }
        if outcome.is_err() {
            tracing::debug!(key = %self.key, "revalidation failed, keeping stale data");
        }
        self.status.replace_state(|state| Some(state.settled(outcome)));
    }
}

/// Builder for an [`SwrEffect`] that needs more than the defaults.
pub struct SwrBuilder<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    key: String,
    unit: Unit<T, E>,
    options: SwrOptions,
    cache: Option<SwrCache>,
    signals: Option<RevalidateSignals>,
}

impl<T, E> SwrBuilder<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn options(mut self, options: SwrOptions) -> Self {
        self.options = options;
        self
    }

    /// Use `cache` instead of [`SwrCache::global`].
    pub fn cache(mut self, cache: SwrCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Revalidate on focus/reconnect signals from `signals`.
    pub fn signals(mut self, signals: RevalidateSignals) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Background work (sweeping the cache, listening for signals) is only
    /// started when a tokio runtime is available.
    pub fn build(self) -> SwrEffect<T, E> {
        let cache = self.cache.unwrap_or_else(SwrCache::global);
        let inner = Arc::new(Inner {
            key: self.key,
            unit: self.unit,
            options: self.options,
            cache: cache.clone(),
            status: Store::new(SwrState::default()),
            task: TaskSlot::new(),
        });

        let weak: Weak<Inner<T, E>> = Arc::downgrade(&inner);
        let cache_subscription = cache.subscribe(&inner.key, move || {
            let Some(inner) = weak.upgrade() else { return };
            let cached = inner.cache.get::<T>(&inner.key, inner.options.cache_time);
            if let Some((data, _age)) = cached {
                inner.show(data);
            }
        });

        let mut signal_listener = None;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                cache.ensure_sweeper(&runtime, inner.options.cache_time);
                if let Some(signals) = &self.signals {
                    let weak = Arc::downgrade(&inner);
                    signal_listener = Some(spawn_signal_listener(&runtime, signals, weak));
                }
            }
            Err(_) => {
                tracing::warn!(
                    key = %inner.key,
                    "no tokio runtime, cache sweeping and revalidate signals disabled"
                );
            }
        }

        SwrEffect {
            inner,
            cache_subscription,
            signal_listener,
        }
    }
}

fn spawn_signal_listener<T, E>(
    runtime: &tokio::runtime::Handle,
    signals: &RevalidateSignals,
    inner: Weak<Inner<T, E>>,
) -> AbortHandle
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let mut rx = signals.subscribe();
    runtime
        .spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => {
                        let Some(inner) = inner.upgrade() else { break };
                        if inner.options.reacts_to(signal) {
                            tracing::debug!(key = %inner.key, ?signal, "revalidating on signal");
                            inner.revalidate();
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "revalidate listener lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
        .abort_handle()
}

/// Serves cached data immediately and refreshes it in the background.
///
/// Every instance reading the same key from the same [`SwrCache`] sees the
/// others' successful fetches.
///
/// # Examples
///
/// ```
/// use cannery::effect::EffectStatus;
/// use cannery::swr::{SwrCache, SwrEffect};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() {
/// let cache = SwrCache::new();
/// let profile = SwrEffect::builder("profile", || async { Ok::<_, String>("ferris") })
///     .cache(cache.clone())
///     .build();
///
/// assert_eq!(profile.fetch(), None);
/// tokio::time::sleep(Duration::from_millis(10)).await;
/// assert_eq!(profile.data(), Some("ferris"));
///
/// // Stale, but served right away while a refresh runs.
/// assert_eq!(profile.fetch(), Some("ferris"));
/// assert!(profile.is_validating());
/// # }
/// ```
pub struct SwrEffect<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T, E>>,
    cache_subscription: Subscription,
    signal_listener: Option<AbortHandle>,
}

impl<T, E> SwrEffect<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// An effect on the global cache.
    pub fn new<K, F, Fut>(key: K, fetcher: F, options: SwrOptions) -> Self
    where
        K: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::builder(key, fetcher).options(options).build()
    }

    pub fn builder<K, F, Fut>(key: K, fetcher: F) -> SwrBuilder<T, E>
    where
        K: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        SwrBuilder {
            key: key.into(),
            unit: boxed_unit(fetcher),
            options: SwrOptions::default(),
            cache: None,
            signals: None,
        }
    }

    /// Return what the cache holds for this key, refreshing it in the
    /// background when it is missing or stale.
    ///
    /// # Panics
    ///
    /// Panics if a fetch has to start outside a tokio runtime.
    pub fn fetch(&self) -> Option<T> {
        let inner = &self.inner;
        match inner.cache.get::<T>(&inner.key, inner.options.cache_time) {
            Some((data, age)) => {
                inner.show(data.clone());
                if age < inner.options.stale_time || !inner.options.revalidate_if_stale {
                    tracing::trace!(key = %inner.key, ?age, "serving cached data");
                } else {
                    inner.revalidate();
                }
                Some(data)
            }
            None => {
                inner.revalidate();
                None
            }
        }
    }

    /// Fetch now, whatever the cache holds.
    pub fn revalidate(&self) {
        self.inner.revalidate();
    }

    /// Replace the cached value without fetching. Every instance on this key
    /// sees the new value.
    pub fn mutate(&self, data: T) {
        let inner = &self.inner;
        inner
            .cache
            .set_with_max_age(&inner.key, data.clone(), inner.options.cache_time);
        inner.show(data);
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn options(&self) -> &SwrOptions {
        &self.inner.options
    }

    pub fn cache(&self) -> &SwrCache {
        &self.inner.cache
    }

    pub fn is_validating(&self) -> bool {
        self.inner.status.read(|state| state.is_validating)
    }

    pub fn status(&self) -> SwrState<T, E> {
        (*self.inner.status.get_state()).clone()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SwrState<T, E>) + Send + Sync + 'static,
    {
        self.inner.status.subscribe(callback)
    }
}

impl<T, E> EffectStatus for SwrEffect<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Data = T;
    type Error = E;

    fn effect_state(&self) -> EffectState<T, E> {
        self.inner.status.read(|state| state.effect.clone())
    }
}

impl<T, E> Drop for SwrEffect<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.cache_subscription.unsubscribe();
        if let Some(handle) = &self.signal_listener {
            handle.abort();
        }
        self.inner.task.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::{BoxFuture, FutureExt};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    type Fetcher = Box<dyn Fn() -> BoxFuture<'static, Result<u32, String>> + Send + Sync>;

    fn counting(calls: &Arc<AtomicUsize>, result: Result<u32, String>) -> Fetcher {
        let calls = Arc::clone(calls);
        Box::new(move || {
            let calls = Arc::clone(&calls);
            let result = result.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(100)).await;
                result
            }
            .boxed()
        })
    }

    fn effect(
        cache: &SwrCache,
        calls: &Arc<AtomicUsize>,
        result: Result<u32, String>,
        options: SwrOptions,
    ) -> SwrEffect<u32, String> {
        let fetcher = counting(calls, result);
        SwrEffect::builder("user", move || fetcher())
            .options(options)
            .cache(cache.clone())
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn miss_fetches_and_writes_through() {
        let cache = SwrCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let user = effect(&cache, &calls, Ok(7), SwrOptions::default());

        assert_eq!(user.fetch(), None);
        assert!(user.is_validating());
        assert!(user.is_loading());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(user.data(), Some(7));
        assert!(!user.is_validating());
        assert!(!user.is_loading());
        assert!(cache.contains_key("user"));
    }

    #[tokio::test(start_paused = true)]
    async fn instances_share_one_in_flight_fetch() {
        let cache = SwrCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let a = effect(&cache, &calls, Ok(7), SwrOptions::default());
        let b = effect(&cache, &calls, Ok(7), SwrOptions::default());

        a.fetch();
        b.fetch();
        a.revalidate();
        sleep(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.data(), Some(7));
        assert_eq!(b.data(), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_hit_does_not_fetch() {
        let cache = SwrCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let user = effect(
            &cache,
            &calls,
            Ok(7),
            SwrOptions::default().with_stale_time(Duration::from_secs(10)),
        );
        cache.set("user", 1u32);

        assert_eq!(user.fetch(), Some(1));
        assert!(!user.is_validating());
        sleep(Duration::from_secs(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(user.data(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_hit_is_served_then_refreshed() {
        let cache = SwrCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let user = effect(&cache, &calls, Ok(7), SwrOptions::default());
        cache.set("user", 1u32);

        assert_eq!(user.fetch(), Some(1));
        assert!(user.is_validating());
        assert!(!user.is_loading());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(user.data(), Some(7));
        let cached = cache.get::<u32>("user", Duration::from_secs(60));
        assert_eq!(cached.map(|(v, _)| v), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_hit_without_revalidate_if_stale_stays_put() {
        let cache = SwrCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let user = effect(
            &cache,
            &calls,
            Ok(7),
            SwrOptions::default().with_revalidate_if_stale(false),
        );
        cache.set("user", 1u32);

        assert_eq!(user.fetch(), Some(1));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_a_miss() {
        let cache = SwrCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let user = effect(
            &cache,
            &calls,
            Ok(7),
            SwrOptions::default().with_cache_time(Duration::from_secs(5)),
        );
        cache.set("user", 1u32);
        sleep(Duration::from_secs(6)).await;

        assert_eq!(user.fetch(), None);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(user.data(), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_revalidation_keeps_stale_data() {
        let cache = SwrCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let user = effect(&cache, &calls, Err("offline".into()), SwrOptions::default());
        cache.set("user", 1u32);

        user.fetch();
        sleep(Duration::from_secs(1)).await;

        let status = user.status();
        assert_eq!(status.effect.data, Some(1));
        assert_eq!(status.effect.error, Some("offline".to_string()));
        assert!(!status.is_validating);
        assert_eq!(status.effect.phase, ExecutorPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn mutate_reaches_every_instance_without_fetching() {
        let cache = SwrCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let a = effect(&cache, &calls, Ok(7), SwrOptions::default());
        let b = effect(&cache, &calls, Ok(7), SwrOptions::default());

        a.mutate(5);

        assert_eq!(a.data(), Some(5));
        assert_eq!(b.data(), Some(5));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn signals_trigger_revalidation_when_enabled() {
        let cache = SwrCache::new();
        let signals = RevalidateSignals::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting(&calls, Ok(7));
        let user = SwrEffect::builder("user", move || fetcher())
            .options(SwrOptions::default().with_revalidate_on_reconnect(false))
            .cache(cache.clone())
            .signals(signals.clone())
            .build();

        user.fetch();
        sleep(Duration::from_secs(3)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        signals.reconnect();
        sleep(Duration::from_secs(3)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        signals.focus();
        sleep(Duration::from_secs(3)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    fn keyed(
        cache: &SwrCache,
        key: &str,
        value: u32,
        cache_time: Duration,
    ) -> SwrEffect<u32, String> {
        SwrEffect::builder(key, move || async move { Ok::<_, String>(value) })
            .options(SwrOptions::default().with_cache_time(cache_time))
            .cache(cache.clone())
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn entries_are_swept_against_their_writers_cache_time() {
        let cache = SwrCache::new();
        let ticker = keyed(&cache, "ticker", 1, Duration::from_secs(1));
        let profile = keyed(&cache, "profile", 2, Duration::from_secs(600));

        ticker.fetch();
        profile.fetch();
        sleep(Duration::from_millis(10)).await;
        assert!(cache.contains_key("ticker"));
        assert!(cache.contains_key("profile"));

        sleep(Duration::from_secs(3)).await;
        assert!(!cache.contains_key("ticker"));
        assert_eq!(profile.fetch(), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn mutated_values_expire_after_cache_time() {
        let cache = SwrCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let user = effect(
            &cache,
            &calls,
            Ok(7),
            SwrOptions::default().with_cache_time(Duration::from_secs(1)),
        );

        user.mutate(5);
        sleep(Duration::from_secs(3)).await;
        assert!(!cache.contains_key("user"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeping_outlives_the_instance_that_started_it() {
        let cache = SwrCache::new();
        drop(keyed(&cache, "ticker", 1, Duration::from_secs(1)));
        cache.set_with_max_age("other", 1u32, Duration::from_secs(1));

        sleep(Duration::from_secs(3)).await;
        assert!(!cache.contains_key("other"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_instance_stops_listening() {
        let cache = SwrCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let user = effect(&cache, &calls, Ok(7), SwrOptions::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        user.subscribe(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        drop(user);
        cache.set("user", 3u32);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
