use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::runner::Handlers;
use super::status::{EffectState, EffectStatus};
use super::task::{boxed_unit, TaskSlot, Unit};
use crate::error::EffectError;
use crate::store::{Store, Subscription};

/// Settings for a [`CancellableEffect`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CancellableOptions {
    /// Fail the run with [`EffectError::Timeout`] if it takes longer than this.
    pub timeout: Option<Duration>,
}

impl CancellableOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

type Status<T, E> = EffectState<T, EffectError<E>>;

struct Inner<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    unit: Unit<T, E>,
    options: CancellableOptions,
    handlers: Handlers<T, EffectError<E>>,
    status: Store<Status<T, E>>,
    task: TaskSlot,
}

impl<T, E> Inner<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn settle(&self, generation: u64, outcome: Result<T, EffectError<E>>) {
        if !self.task.finish(generation) {
            tracing::debug!(generation, "dropping result of cancelled run");
            return;
        }
        match outcome {
            Ok(data) => {
                self.status
                    .replace_state(|_| Some(EffectState::succeeded(data.clone())));
                self.handlers.success(&data);
            }
            Err(error) => {
                tracing::debug!(generation, timeout = error.is_timeout(), "run failed");
                self.status
                    .replace_state(|_| Some(EffectState::failed(error.clone())));
                self.handlers.error(&error);
            }
        }
    }
}

/// Runs one unit of work at a time, with an optional timeout and explicit
/// cancellation.
///
/// Starting a new run aborts the previous one. Cancelling is not a failure:
/// it stops loading and reports nothing. Dropping the executor aborts whatever
/// is in flight.
///
/// # Examples
///
/// ```
/// use cannery::effect::{CancellableEffect, CancellableOptions, EffectStatus, Handlers};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() {
/// let effect = CancellableEffect::new(
///     || async {
///         tokio::time::sleep(Duration::from_secs(5)).await;
///         Ok::<_, String>("slow")
///     },
///     CancellableOptions::default().with_timeout(Duration::from_secs(1)),
///     Handlers::new(),
/// );
///
/// effect.run();
/// tokio::time::sleep(Duration::from_secs(2)).await;
/// assert!(effect.error().unwrap().is_timeout());
/// # }
/// ```
pub struct CancellableEffect<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T, E>>,
}

impl<T, E> CancellableEffect<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(
        unit: F,
        options: CancellableOptions,
        handlers: Handlers<T, EffectError<E>>,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                unit: boxed_unit(unit),
                options,
                handlers,
                status: Store::new(EffectState::default()),
                task: TaskSlot::new(),
            }),
        }
    }

    /// Start a run, aborting any run still in flight.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn run(&self) {
        let inner = Arc::clone(&self.inner);
        let generation = inner.task.begin();
        inner.status.replace_state(|_| Some(EffectState::loading()));

        let work = (inner.unit)();
        let timeout = inner.options.timeout;
        let task_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let outcome = match timeout {
                // The losing side of the race is dropped, which cancels the unit.
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(result) => result.map_err(EffectError::Failed),
                    Err(_elapsed) => Err(EffectError::Timeout(limit)),
                },
                None => work.await.map_err(EffectError::Failed),
            };
            task_inner.settle(generation, outcome);
        });
        inner.task.attach(generation, handle.abort_handle());
        tracing::debug!(generation, ?timeout, "run started");
    }

    /// Abort the run in flight. A no-op when nothing is running.
    pub fn cancel(&self) {
        if self.inner.task.cancel() {
            tracing::debug!("run cancelled");
            self.inner.status.replace_state(|state| Some(state.cancelled()));
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.task.is_running()
    }

    pub fn status(&self) -> EffectState<T, EffectError<E>> {
        (*self.inner.status.get_state()).clone()
    }

    /// Be told about every status change.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&EffectState<T, EffectError<E>>) + Send + Sync + 'static,
    {
        self.inner.status.subscribe(callback)
    }
}

impl<T, E> EffectStatus for CancellableEffect<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Data = T;
    type Error = EffectError<E>;

    fn effect_state(&self) -> EffectState<T, EffectError<E>> {
        self.status()
    }
}

impl<T, E> Drop for CancellableEffect<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.task.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::ExecutorPhase;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn delayed(ms: u64, value: i32) -> impl Future<Output = Result<i32, String>> {
        async move {
            sleep(Duration::from_millis(ms)).await;
            Ok(value)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_loading_then_data() {
        let effect = CancellableEffect::new(
            || delayed(100, 7),
            CancellableOptions::default(),
            Handlers::new(),
        );

        effect.run();
        assert!(effect.is_loading());
        assert_eq!(effect.status().phase, ExecutorPhase::Running);

        sleep(Duration::from_millis(200)).await;
        assert!(!effect.is_loading());
        assert_eq!(effect.data(), Some(7));
        assert_eq!(effect.error(), None);
        assert_eq!(effect.status().phase, ExecutorPhase::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_wrapped_and_reported_once() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_clone = errors.clone();
        let effect = CancellableEffect::new(
            || async { Err::<i32, _>("nope".to_string()) },
            CancellableOptions::default(),
            Handlers::new().on_error(move |e: &EffectError<String>| {
                errors_clone.lock().push(e.clone());
            }),
        );

        effect.run();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(*errors.lock(), vec![EffectError::Failed("nope".to_string())]);
        assert_eq!(effect.error(), Some(EffectError::Failed("nope".to_string())));
        assert_eq!(effect.status().phase, ExecutorPhase::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_with_distinct_error() {
        let successes = Arc::new(AtomicUsize::new(0));
        let successes_clone = successes.clone();
        let effect = CancellableEffect::new(
            || delayed(5_000, 1),
            CancellableOptions::default().with_timeout(Duration::from_millis(500)),
            Handlers::new().on_success(move |_| {
                successes_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        effect.run();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(
            effect.error(),
            Some(EffectError::Timeout(Duration::from_millis(500)))
        );
        assert_eq!(effect.data(), None);
        assert_eq!(successes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_loading_without_error_and_drops_late_result() {
        let successes = Arc::new(AtomicUsize::new(0));
        let successes_clone = successes.clone();
        let effect = CancellableEffect::new(
            || delayed(1_000, 1),
            CancellableOptions::default(),
            Handlers::new().on_success(move |_| {
                successes_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        effect.run();
        sleep(Duration::from_millis(100)).await;
        effect.cancel();

        assert!(!effect.is_loading());
        assert_eq!(effect.error(), None);
        assert_eq!(effect.status().phase, ExecutorPhase::Cancelled);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(effect.data(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_when_idle_is_a_no_op_and_repeatable() {
        let effect = CancellableEffect::new(
            || delayed(10, 1),
            CancellableOptions::default(),
            Handlers::new(),
        );
        let notifications = Arc::new(AtomicUsize::new(0));
        let notifications_clone = notifications.clone();
        effect.subscribe(move |_| {
            notifications_clone.fetch_add(1, Ordering::SeqCst);
        });

        effect.cancel();
        effect.cancel();

        assert_eq!(notifications.load(Ordering::SeqCst), 0);
        assert_eq!(effect.status().phase, ExecutorPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn new_run_supersedes_previous() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let effect = CancellableEffect::new(
            move || {
                let n = calls_clone.fetch_add(1, Ordering::SeqCst) as i32;
                delayed(100, n)
            },
            CancellableOptions::default(),
            Handlers::new().on_success(move |v: &i32| seen_clone.lock().push(*v)),
        );

        effect.run();
        sleep(Duration::from_millis(50)).await;
        effect.run();
        sleep(Duration::from_millis(500)).await;

        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(effect.data(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_after_terminal_state_clears_previous_data() {
        let effect = CancellableEffect::new(
            || delayed(100, 3),
            CancellableOptions::default(),
            Handlers::new(),
        );

        effect.run();
        sleep(Duration::from_millis(200)).await;
        assert_eq!(effect.data(), Some(3));

        effect.run();
        assert_eq!(effect.data(), None);
        assert!(effect.is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_executor_interrupts_the_task() {
        let finished = Arc::new(AtomicUsize::new(0));
        let finished_clone = finished.clone();
        let effect = CancellableEffect::new(
            move || {
                let finished = finished_clone.clone();
                async move {
                    sleep(Duration::from_millis(100)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            },
            CancellableOptions::default(),
            Handlers::new(),
        );

        effect.run();
        drop(effect);
        sleep(Duration::from_secs(1)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
