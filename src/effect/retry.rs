use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::runner::Handlers;
use super::status::{EffectState, EffectStatus};
use super::task::{boxed_unit, TaskSlot, Unit};
use crate::store::{State, Store, Subscription};

/// How the delay grows between retries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Always `base`.
    Constant,
    /// `base * n`.
    Linear,
    /// `base * 2^(n-1)`.
    #[default]
    Exponential,
}

impl RetryStrategy {
    /// Delay before retry number `retry` (1-indexed; the first attempt is not a retry).
    ///
    /// ```
    /// use cannery::effect::RetryStrategy;
    /// use std::time::Duration;
    ///
    /// let base = Duration::from_millis(1000);
    /// assert_eq!(RetryStrategy::Exponential.delay_for(base, 3), Duration::from_millis(4000));
    /// assert_eq!(RetryStrategy::Linear.delay_for(base, 3), Duration::from_millis(3000));
    /// assert_eq!(RetryStrategy::Constant.delay_for(base, 3), base);
    /// ```
    pub fn delay_for(self, base: Duration, retry: u32) -> Duration {
        let n = retry.max(1);
        match self {
            RetryStrategy::Constant => base,
            RetryStrategy::Linear => base.saturating_mul(n),
            RetryStrategy::Exponential => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        }
    }
}

/// Retry policy for a [`RetryEffect`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub strategy: RetryStrategy,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            strategy: RetryStrategy::Exponential,
        }
    }
}

impl RetryOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Status of a [`RetryEffect`]: the usual triple plus the retry counter.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryState<T, E> {
    pub effect: EffectState<T, E>,
    pub retry_count: u32,
}

impl<T, E> Default for RetryState<T, E> {
    fn default() -> Self {
        Self {
            effect: EffectState::default(),
            retry_count: 0,
        }
    }
}

impl<T, E> State for RetryState<T, E>
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
    unit: Unit<T, E>,
    options: RetryOptions,
    handlers: Handlers<T, E>,
    status: Store<RetryState<T, E>>,
    task: TaskSlot,
}

impl<T, E> Inner<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    async fn attempt_loop(self: Arc<Self>, generation: u64) {
        let mut retries = 0;
        loop {
            let error = match (self.unit)().await {
                Ok(data) => {
                    self.settle(generation, retries, Ok(data));
                    return;
                }
                Err(error) => error,
            };

            if retries >= self.options.max_retries {
                tracing::debug!(generation, retries, "retries exhausted");
                self.settle(generation, retries, Err(error));
                return;
            }

            retries += 1;
            let delay = self
                .options
                .strategy
                .delay_for(self.options.base_delay, retries);
            tracing::debug!(
                generation,
                retry = retries,
                ?delay,
                "attempt failed, scheduling retry"
            );
            tokio::time::sleep(delay).await;

            if !self.task.is_current(generation) {
                return;
            }
            self.status.replace_state(|state| {
                Some(RetryState {
                    effect: state.effect.clone(),
                    retry_count: retries,
                })
            });
        }
    }

    fn settle(&self, generation: u64, retries: u32, outcome: Result<T, E>) {
        if !self.task.finish(generation) {
            return;
        }
        match outcome {
            Ok(data) => {
                self.status.replace_state(|_| {
                    Some(RetryState {
                        effect: EffectState::succeeded(data.clone()),
                        retry_count: retries,
                    })
                });
                self.handlers.success(&data);
            }
            Err(error) => {
                self.status.replace_state(|_| {
                    Some(RetryState {
                        effect: EffectState::failed(error.clone()),
                        retry_count: retries,
                    })
                });
                self.handlers.error(&error);
            }
        }
    }
}

/// Runs a unit of work and retries it with backoff until it succeeds or the
/// retry budget is spent.
///
/// Only the final error is reported; intermediate failures just advance
/// [`retry_count`](RetryEffect::retry_count).
pub struct RetryEffect<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T, E>>,
}

impl<T, E> RetryEffect<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(unit: F, options: RetryOptions, handlers: Handlers<T, E>) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                unit: boxed_unit(unit),
                options,
                handlers,
                status: Store::new(RetryState::default()),
                task: TaskSlot::new(),
            }),
        }
    }

    /// Start a fresh attempt sequence with the retry counter at zero.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn run(&self) {
        let inner = Arc::clone(&self.inner);
        let generation = inner.task.begin();
        inner.status.replace_state(|_| {
            Some(RetryState {
                effect: EffectState::loading(),
                retry_count: 0,
            })
        });
        let handle = tokio::spawn(Arc::clone(&inner).attempt_loop(generation));
        inner.task.attach(generation, handle.abort_handle());
    }

    /// Restart the whole attempt sequence, typically after it gave up.
    pub fn retry(&self) {
        self.run();
    }

    pub fn cancel(&self) {
        if self.inner.task.cancel() {
            self.inner.status.replace_state(|state| {
                Some(RetryState {
                    effect: state.effect.cancelled(),
                    retry_count: state.retry_count,
                })
            });
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.status.get_state().retry_count
    }

    pub fn options(&self) -> &RetryOptions {
        &self.inner.options
    }

    pub fn status(&self) -> RetryState<T, E> {
        (*self.inner.status.get_state()).clone()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&RetryState<T, E>) + Send + Sync + 'static,
    {
        self.inner.status.subscribe(callback)
    }
}

impl<T, E> EffectStatus for RetryEffect<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Data = T;
    type Error = E;

    fn effect_state(&self) -> EffectState<T, E> {
        self.inner.status.get_state().effect.clone()
    }
}

impl<T, E> Drop for RetryEffect<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.inner.task.cancel();
    }
}
