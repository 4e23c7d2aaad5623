use futures::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::task::AbortHandle;

use super::priority::Priority;
use super::resource::{Resource, ResourceStatus};
use crate::effect::{boxed_unit, Unit};
use crate::error::SchedulerError;

/// A unit of work waiting for the [`EffectScheduler`].
pub struct ScheduledEffect<T, E> {
    pub id: String,
    pub priority: Priority,
    /// Ids of units that must succeed before this one may start.
    pub dependencies: Vec<String>,
    unit: Unit<T, E>,
}

impl<T, E> ScheduledEffect<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new<K, F, Fut>(id: K, unit: F) -> Self
    where
        K: Into<String>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            id: id.into(),
            priority: Priority::default(),
            dependencies: Vec::new(),
            unit: boxed_unit(unit),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_dependencies<I, K>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }
}

impl<T, E> std::fmt::Debug for ScheduledEffect<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledEffect")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

type CompletionHook = Arc<dyn Fn() + Send + Sync>;

/// Settings for an [`EffectScheduler`].
#[derive(Clone)]
pub struct SchedulerOptions {
    /// How many units may run at once. Zero is treated as one.
    pub concurrency: usize,
    /// Admit work as soon as it is added, without calling `start`.
    pub auto_start: bool,
    /// Called each time the scheduler drains completely while processing.
    pub on_complete: Option<CompletionHook>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            auto_start: false,
            on_complete: None,
        }
    }
}

impl SchedulerOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }
}

impl std::fmt::Debug for SchedulerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerOptions")
            .field("concurrency", &self.concurrency)
            .field("auto_start", &self.auto_start)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

struct Queued<T, E> {
    seq: u64,
    effect: ScheduledEffect<T, E>,
}

struct Running {
    token: u64,
    handle: Option<AbortHandle>,
}

struct Core<T, E> {
    queue: Vec<Queued<T, E>>,
    running: IndexMap<String, Running>,
    resources: IndexMap<String, Resource<T, E>>,
    processing: bool,
    // Set once work is admitted, cleared when the drain is reported.
    busy: bool,
    next_seq: u64,
}

impl<T, E> Core<T, E> {
    fn is_ready(&self, effect: &ScheduledEffect<T, E>) -> bool {
        effect
            .dependencies
            .iter()
            .all(|dep| self.resources.get(dep).is_some_and(Resource::is_success))
    }

    fn depends_on_failure(&self, effect: &ScheduledEffect<T, E>) -> bool {
        effect
            .dependencies
            .iter()
            .any(|dep| self.resources.get(dep).is_some_and(Resource::is_error))
    }

    /// Index of the next unit to admit: best level, then heaviest, then oldest.
    fn select(&self) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .filter(|(_, queued)| self.is_ready(&queued.effect))
            .min_by_key(|(_, queued)| (queued.effect.priority, queued.seq))
            .map(|(index, _)| index)
    }

    fn take_drained(&mut self) -> bool {
        if self.processing && self.busy && self.queue.is_empty() && self.running.is_empty() {
            self.busy = false;
            return true;
        }
        false
    }

    fn abort_running(&mut self) {
        for (id, running) in self.running.drain(..) {
            if let Some(handle) = running.handle {
                tracing::debug!(id = %id, "aborting scheduled unit");
                handle.abort();
            }
        }
    }
}

struct Inner<T, E> {
    options: SchedulerOptions,
    core: Mutex<Core<T, E>>,
}

impl<T, E> Inner<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Admit as much ready work as capacity allows.
    fn pump(self: &Arc<Self>) {
        let concurrency = self.options.concurrency.max(1);
        let mut admitted = Vec::new();
        let drained = {
            let mut core = self.core.lock();
            if !core.processing {
                return;
            }
            while core.running.len() < concurrency {
                let Some(index) = core.select() else { break };
                let queued = core.queue.remove(index);
                let id = queued.effect.id;
                let token = core.next_seq;
                core.next_seq += 1;
                core.running.insert(id.clone(), Running { token, handle: None });
                if let Some(resource) = core.resources.get_mut(&id) {
                    resource.start();
                }
                core.busy = true;
                tracing::debug!(id = %id, priority = ?queued.effect.priority, "admitting unit");
                admitted.push((id, token, queued.effect.unit));
            }
            core.take_drained()
        };

        for (id, token, unit) in admitted {
            let Ok(work) = std::panic::catch_unwind(AssertUnwindSafe(|| unit())) else {
                self.complete(&id, token, None);
                continue;
            };
            let weak: Weak<Self> = Arc::downgrade(self);
            let task_id = id.clone();
            let handle = tokio::spawn(async move {
                let outcome = AssertUnwindSafe(work).catch_unwind().await.ok();
                if let Some(inner) = weak.upgrade() {
                    inner.complete(&task_id, token, outcome);
                }
            });
            let mut core = self.core.lock();
            match core.running.get_mut(&id) {
                Some(running) if running.token == token => {
                    running.handle = Some(handle.abort_handle());
                }
                _ => handle.abort(),
            }
        }

        if drained {
            self.report_drained();
        }
    }

    /// Free the slot of a finished unit. `None` means the unit panicked.
    fn complete(self: &Arc<Self>, id: &str, token: u64, outcome: Option<Result<T, E>>) {
        {
            let mut core = self.core.lock();
            if !core.running.get(id).is_some_and(|running| running.token == token) {
                return;
            }
            core.running.shift_remove(id);
            let resource = core.resources.get_mut(id);
            match outcome {
                Some(outcome) => {
                    tracing::debug!(id, ok = outcome.is_ok(), "unit settled");
                    if let Some(resource) = resource {
                        resource.settle(outcome);
                    }
                }
                None => {
                    tracing::warn!(id, "scheduled unit panicked");
                    if let Some(resource) = resource {
                        resource.abandon();
                    }
                }
            }
        }
        self.pump();
    }

    fn report_drained(&self) {
        tracing::debug!("scheduler drained");
        if let Some(hook) = &self.options.on_complete {
            hook();
        }
    }
}

/// Runs queued units with bounded concurrency, in priority order, each only
/// after its dependencies have succeeded.
///
/// A unit whose dependency failed stays queued; [`blocked_effects`] lists them.
///
/// [`blocked_effects`]: EffectScheduler::blocked_effects
///
/// # Examples
///
/// ```
/// use cannery::scheduler::{
///     EffectScheduler, Priority, ResourceStatus, ScheduledEffect, SchedulerOptions,
/// };
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() {
/// let scheduler = EffectScheduler::new(SchedulerOptions::default());
/// scheduler
///     .add_effect(ScheduledEffect::new("config", || async { Ok::<_, String>(1) }))
///     .unwrap();
/// scheduler
///     .add_effect(
///         ScheduledEffect::new("session", || async { Ok::<_, String>(2) })
///             .with_priority(Priority::critical())
///             .depends_on("config"),
///     )
///     .unwrap();
///
/// scheduler.start();
/// tokio::time::sleep(Duration::from_millis(10)).await;
/// assert_eq!(scheduler.resource("session").unwrap().status, ResourceStatus::Success);
/// # }
/// ```
pub struct EffectScheduler<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> EffectScheduler<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new(options: SchedulerOptions) -> Self {
        let processing = options.auto_start;
        Self {
            inner: Arc::new(Inner {
                options,
                core: Mutex::new(Core {
                    queue: Vec::new(),
                    running: IndexMap::new(),
                    resources: IndexMap::new(),
                    processing,
                    busy: false,
                    next_seq: 0,
                }),
            }),
        }
    }

    /// Queue `effect`, admitting it right away if processing and it is ready.
    ///
    /// An id may be reused once its previous unit has settled or been removed.
    pub fn add_effect(&self, effect: ScheduledEffect<T, E>) -> Result<(), SchedulerError> {
        {
            let mut core = self.inner.core.lock();
            let taken = core.running.contains_key(&effect.id)
                || core.queue.iter().any(|queued| queued.effect.id == effect.id);
            if taken {
                return Err(SchedulerError::DuplicateId(effect.id));
            }
            let resource = Resource::queued(
                effect.id.clone(),
                effect.dependencies.clone(),
                effect.priority,
            );
            core.resources.insert(effect.id.clone(), resource);
            let seq = core.next_seq;
            core.next_seq += 1;
            tracing::debug!(id = %effect.id, "unit queued");
            core.queue.push(Queued { seq, effect });
        }
        self.inner.pump();
        Ok(())
    }

    /// Drop a queued unit along with its resource, or abort a running one and
    /// reset its resource. Returns whether `id` was known.
    pub fn remove_effect(&self, id: &str) -> bool {
        let removed = {
            let mut core = self.inner.core.lock();
            if let Some(index) = core.queue.iter().position(|queued| queued.effect.id == id) {
                core.queue.remove(index);
                core.resources.shift_remove(id);
                tracing::debug!(id, "queued unit removed");
                true
            } else if let Some(running) = core.running.shift_remove(id) {
                if let Some(handle) = running.handle {
                    handle.abort();
                }
                if let Some(resource) = core.resources.get_mut(id) {
                    resource.reset();
                }
                tracing::debug!(id, "running unit aborted");
                true
            } else {
                core.resources.shift_remove(id).is_some()
            }
        };
        if removed {
            self.inner.pump();
        }
        removed
    }

    /// Begin (or resume) admitting work.
    pub fn start(&self) {
        self.inner.core.lock().processing = true;
        self.inner.pump();
    }

    /// Stop admitting work. Running units carry on.
    pub fn pause(&self) {
        self.inner.core.lock().processing = false;
    }

    /// Abort everything, forget every unit and stop processing.
    pub fn clear(&self) {
        let mut core = self.inner.core.lock();
        core.abort_running();
        core.queue.clear();
        core.resources.clear();
        core.processing = false;
        core.busy = false;
    }

    pub fn is_processing(&self) -> bool {
        self.inner.core.lock().processing
    }

    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        let core = self.inner.core.lock();
        core.queue.is_empty() && core.running.is_empty()
    }

    pub fn resource(&self, id: &str) -> Option<Resource<T, E>> {
        self.inner.core.lock().resources.get(id).cloned()
    }

    /// Every known resource, in the order the units were first added.
    pub fn resources(&self) -> Vec<Resource<T, E>> {
        self.inner.core.lock().resources.values().cloned().collect()
    }

    pub fn status(&self, id: &str) -> Option<ResourceStatus> {
        self.inner.core.lock().resources.get(id).map(|r| r.status)
    }

    /// Ids waiting to start, in insertion order.
    pub fn queued_effects(&self) -> Vec<String> {
        let core = self.inner.core.lock();
        let mut queued: Vec<_> = core.queue.iter().collect();
        queued.sort_by_key(|queued| queued.seq);
        queued.into_iter().map(|queued| queued.effect.id.clone()).collect()
    }

    /// Ids currently running, in admission order.
    pub fn running_effects(&self) -> Vec<String> {
        self.inner.core.lock().running.keys().cloned().collect()
    }

    /// Queued ids that can never start because a dependency failed.
    pub fn blocked_effects(&self) -> Vec<String> {
        let core = self.inner.core.lock();
        core.queue
            .iter()
            .filter(|queued| core.depends_on_failure(&queued.effect))
            .map(|queued| queued.effect.id.clone())
            .collect()
    }
}

impl<T, E> Drop for EffectScheduler<T, E> {
    fn drop(&mut self) {
        self.inner.core.lock().abort_running();
    }
}
