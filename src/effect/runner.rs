use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use crate::store::{State, Store, StoreApi};

/// One-shot success/error callbacks for [`run`].
pub struct Callbacks<T, E> {
    on_success: Option<Box<dyn FnOnce(T) + Send>>,
    on_error: Option<Box<dyn FnOnce(E) + Send>>,
}

impl<T, E> Callbacks<T, E> {
    pub fn new() -> Self {
        Self {
            on_success: None,
            on_error: None,
        }
    }

    pub fn on_success(mut self, f: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(E) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn settle(self, result: Result<T, E>) {
        match result {
            Ok(value) => {
                if let Some(f) = self.on_success {
                    f(value);
                }
            }
            Err(error) => {
                if let Some(f) = self.on_error {
                    f(error);
                }
            }
        }
    }
}

impl<T, E> Default for Callbacks<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

type SuccessHandler<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorHandler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Reusable callbacks for executors that run many times.
pub struct Handlers<T, E> {
    on_success: Option<SuccessHandler<T>>,
    on_error: Option<ErrorHandler<E>>,
}

impl<T, E> Handlers<T, E> {
    pub fn new() -> Self {
        Self {
            on_success: None,
            on_error: None,
        }
    }

    pub fn on_success(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub(crate) fn success(&self, value: &T) {
        if let Some(f) = &self.on_success {
            f(value);
        }
    }

    pub(crate) fn error(&self, error: &E) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }
}

impl<T, E> Default for Handlers<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for Handlers<T, E> {
    fn clone(&self) -> Self {
        Self {
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

/// Start `work` in the background and report its outcome through `callbacks`.
///
/// There is no completion handle and no way to cancel; concurrent calls are
/// independent of each other.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
pub fn run<T, E, Fut>(work: Fut, callbacks: Callbacks<T, E>)
where
    T: Send + 'static,
    E: Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = work.await;
        tracing::debug!(ok = result.is_ok(), "effect settled");
        callbacks.settle(result);
    });
}

/// A [`Store`] that can also run effects.
///
/// Effects do not touch the store on their own; the callbacks decide how the
/// outcome lands in state.
///
/// # Examples
///
/// ```
/// use cannery::effect::{Callbacks, EffectStore};
/// use cannery::Record;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = EffectStore::new(Record::new().with("user", "unknown"));
/// let api = store.api();
/// let (done_tx, done_rx) = tokio::sync::oneshot::channel();
///
/// store.run(
///     async { Ok::<_, String>("ferris") },
///     Callbacks::new().on_success(move |name: &'static str| {
///         api.set_state_selective("user", serde_json::json!(name));
///         let _ = done_tx.send(());
///     }),
/// );
///
/// done_rx.await.unwrap();
/// assert_eq!(store.get_state_selective("user"), Some(serde_json::json!("ferris")));
/// # }
/// ```
pub struct EffectStore<S: State> {
    store: Store<S>,
}

impl<S: State> EffectStore<S> {
    pub fn new(initial: S) -> Self {
        Self::from_store(Store::new(initial))
    }

    pub fn create<F>(init: F) -> Self
    where
        F: FnOnce(&StoreApi<S>) -> S,
    {
        Self::from_store(Store::create(init))
    }

    pub fn from_store(store: Store<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store<S> {
        &self.store
    }

    /// See [`run`].
    pub fn run<T, E, Fut>(&self, work: Fut, callbacks: Callbacks<T, E>)
    where
        T: Send + 'static,
        E: Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        run(work, callbacks);
    }
}

impl<S: State> Deref for EffectStore<S> {
    type Target = Store<S>;

    fn deref(&self) -> &Store<S> {
        &self.store
    }
}

impl<S: State> Clone for EffectStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Record;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn success_reaches_on_success() {
        let (tx, rx) = oneshot::channel();
        run(
            async { Ok::<_, String>(21 * 2) },
            Callbacks::new()
                .on_success(move |v| {
                    let _ = tx.send(v);
                })
                .on_error(|_| panic!("no error expected")),
        );
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn failure_reaches_on_error() {
        let (tx, rx) = oneshot::channel();
        run(
            async { Err::<i32, _>("network down".to_string()) },
            Callbacks::new().on_error(move |e| {
                let _ = tx.send(e);
            }),
        );
        assert_eq!(rx.await.unwrap(), "network down");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_are_independent() {
        let store = EffectStore::new(Record::new().with("done", 0));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for (tag, delay) in [("slow", 300u64), ("fast", 100)] {
            let order = order.clone();
            let api = store.api();
            store.run(
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    Ok::<_, ()>(tag)
                },
                Callbacks::new().on_success(move |tag| {
                    order.lock().push(tag);
                    api.set_state_selective(
                        "done",
                        crate::FieldUpdate::with(|d: Option<serde_json::Value>| {
                            json!(d.and_then(|d| d.as_i64()).unwrap_or(0) + 1)
                        }),
                    );
                }),
            );
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*order.lock(), vec!["fast", "slow"]);
        assert_eq!(store.get_state_selective("done"), Some(json!(2)));
    }

    #[tokio::test]
    async fn missing_callbacks_are_fine() {
        let calls = Arc::new(AtomicUsize::new(0));
        run(async { Err::<(), _>(()) }, Callbacks::new());
        let (tx, rx) = oneshot::channel();
        let calls_clone = calls.clone();
        run(
            async { Ok::<_, ()>(()) },
            Callbacks::new().on_success(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            }),
        );
        rx.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
