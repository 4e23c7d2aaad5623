use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

use crate::effect::TaskSlot;
use crate::store::{State, Store, Subscription};

/// Actions that say for themselves whether they should trigger the effect.
pub trait EffectAction {
    fn runs_effect(&self) -> bool;
}

type Reducer<S, A> = Box<dyn Fn(&S, &A) -> S + Send + Sync>;
type Predicate<S, A> = Box<dyn Fn(&S, &A) -> bool + Send + Sync>;
type Factory<S, A, T, E> = Box<dyn Fn(&S, &A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;
type SuccessHook<S, A, T> = Box<dyn Fn(&T, &S, &A) + Send + Sync>;
type ErrorHook<S, A, E> = Box<dyn Fn(&E, &S, &A) + Send + Sync>;

struct Inner<S: State, A, T, E> {
    store: Store<S>,
    reducer: Reducer<S, A>,
    should_run: Predicate<S, A>,
    factory: Option<Factory<S, A, T, E>>,
    on_success: Option<SuccessHook<S, A, T>>,
    on_error: Option<ErrorHook<S, A, E>>,
    task: TaskSlot,
}

impl<S, A, T, E> Inner<S, A, T, E>
where
    S: State,
    A: Send + Sync + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    fn settle(&self, generation: u64, outcome: Result<T, E>, action: &A) {
        if !self.task.finish(generation) {
            tracing::debug!(generation, "dropping result of superseded effect");
            return;
        }
        let state = self.store.get_state();
        match outcome {
            Ok(value) => {
                if let Some(hook) = &self.on_success {
                    hook(&value, &state, action);
                }
            }
            Err(error) => {
                tracing::debug!(generation, "reducer effect failed");
                if let Some(hook) = &self.on_error {
                    hook(&error, &state, action);
                }
            }
        }
    }
}

/// Configures a [`ReducerEffect`].
pub struct ReducerBuilder<S: State, A, T, E> {
    initial: S,
    reducer: Reducer<S, A>,
    should_run: Option<Predicate<S, A>>,
    factory: Option<Factory<S, A, T, E>>,
    on_success: Option<SuccessHook<S, A, T>>,
    on_error: Option<ErrorHook<S, A, E>>,
}

impl<S, A, T, E> ReducerBuilder<S, A, T, E>
where
    S: State,
    A: Send + Sync + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    /// The unit to run after qualifying actions, built from the reduced state.
    pub fn effect<F, Fut>(mut self, factory: F) -> Self
    where
        F: Fn(&S, &A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.factory = Some(Box::new(
            move |state: &S, action: &A| -> BoxFuture<'static, Result<T, E>> {
                Box::pin(factory(state, action))
            },
        ));
        self
    }

    /// Decide per dispatch whether the effect runs, instead of asking the action.
    pub fn should_run(
        mut self,
        predicate: impl Fn(&S, &A) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_run = Some(Box::new(predicate));
        self
    }

    /// Receives the result together with the state current when it settled.
    pub fn on_success(mut self, f: impl Fn(&T, &S, &A) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&E, &S, &A) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Finish with the predicate set by [`should_run`](Self::should_run), or
    /// [`EffectAction::runs_effect`] when none was set.
    pub fn build(self) -> ReducerEffect<S, A, T, E>
    where
        A: EffectAction,
    {
        self.finish(|_, action: &A| action.runs_effect())
    }

    /// Finish for action types without [`EffectAction`]. Without a
    /// [`should_run`](Self::should_run) predicate the effect runs on every dispatch.
    pub fn build_any(self) -> ReducerEffect<S, A, T, E> {
        self.finish(|_, _| true)
    }

    fn finish(
        self,
        fallback: impl Fn(&S, &A) -> bool + Send + Sync + 'static,
    ) -> ReducerEffect<S, A, T, E> {
        ReducerEffect {
            inner: Arc::new(Inner {
                store: Store::new(self.initial),
                reducer: self.reducer,
                should_run: self
                    .should_run
                    .unwrap_or_else(|| Box::new(fallback) as Predicate<S, A>),
                factory: self.factory,
                on_success: self.on_success,
                on_error: self.on_error,
                task: TaskSlot::new(),
            }),
        }
    }
}

/// A reducer-driven store with at most one effect in flight.
///
/// `dispatch` reduces synchronously, so the new state is visible before any
/// effect starts. A qualifying dispatch aborts the effect already running.
///
/// # Examples
///
/// ```
/// use cannery::reducer::{EffectAction, ReducerEffect};
/// use cannery::Record;
/// use serde_json::json;
/// use std::time::Duration;
///
/// enum Query {
///     Search(String),
///     Clear,
/// }
///
/// impl EffectAction for Query {
///     fn runs_effect(&self) -> bool {
///         matches!(self, Query::Search(_))
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread", start_paused = true)]
/// # async fn main() {
/// let reduce = |state: &Record, action: &Query| {
///     let mut next = state.clone();
///     match action {
///         Query::Search(q) => next.insert("query", q.as_str()),
///         Query::Clear => next.insert("query", ""),
///     }
///     next
/// };
/// let search = ReducerEffect::builder(Record::new().with("query", ""), reduce)
///     .effect(|_, action: &Query| {
///         let hits = match action {
///             Query::Search(q) => vec![format!("{q}-1"), format!("{q}-2")],
///             Query::Clear => Vec::new(),
///         };
///         async move { Ok::<_, String>(hits) }
///     })
///     .build();
///
/// search.dispatch(Query::Search("rust".into()));
/// assert_eq!(search.store().get_state_selective("query"), Some(json!("rust")));
/// assert!(search.is_running());
///
/// tokio::time::sleep(Duration::from_millis(10)).await;
/// assert!(!search.is_running());
/// # }
/// ```
pub struct ReducerEffect<S: State, A, T, E> {
    inner: Arc<Inner<S, A, T, E>>,
}

impl<S, A, T, E> ReducerEffect<S, A, T, E>
where
    S: State,
    A: Send + Sync + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn builder<R>(initial: S, reducer: R) -> ReducerBuilder<S, A, T, E>
    where
        R: Fn(&S, &A) -> S + Send + Sync + 'static,
    {
        ReducerBuilder {
            initial,
            reducer: Box::new(reducer),
            should_run: None,
            factory: None,
            on_success: None,
            on_error: None,
        }
    }

    /// Reduce `action` into the store, then start the effect if it qualifies.
    ///
    /// # Panics
    ///
    /// Panics if the effect has to start outside a tokio runtime, or if the
    /// reducer panics.
    pub fn dispatch(&self, action: A) {
        let inner = &self.inner;
        inner
            .store
            .replace_state(|state| Some((inner.reducer)(state, &action)));

        let Some(factory) = &inner.factory else {
            return;
        };
        let state = inner.store.get_state();
        if !(inner.should_run)(&state, &action) {
            return;
        }

        let generation = inner.task.begin();
        let work = factory(&state, &action);
        let weak = Arc::downgrade(inner);
        let handle = tokio::spawn(async move {
            let outcome = work.await;
            if let Some(inner) = weak.upgrade() {
                inner.settle(generation, outcome, &action);
            }
        });
        inner.task.attach(generation, handle.abort_handle());
        tracing::debug!(generation, "reducer effect started");
    }

    /// Abort the effect in flight, if any. Its callbacks never fire.
    pub fn cancel_effect(&self) {
        if self.inner.task.cancel() {
            tracing::debug!("reducer effect cancelled");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.task.is_running()
    }

    pub fn store(&self) -> &Store<S> {
        &self.inner.store
    }

    pub fn get_state(&self) -> Arc<S> {
        self.inner.store.get_state()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        self.inner.store.subscribe(callback)
    }
}

impl<S: State, A, T, E> Drop for ReducerEffect<S, A, T, E> {
    fn drop(&mut self) {
        self.inner.task.cancel();
    }
}
