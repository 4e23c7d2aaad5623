use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::state::{FieldUpdate, Keyed, Next, State};
use super::subscription::{Registry, Subscription};

type Callback<S> = Box<dyn Fn(&Change<'_, S>) + Send + Sync>;

struct Listener<S> {
    active: Arc<AtomicBool>,
    callback: Callback<S>,
}

/// One published update, as seen by [`Store::subscribe_changes`] listeners.
pub struct Change<'a, S> {
    /// Label passed to [`Store::set_state_as`], `None` for unlabeled updates.
    pub label: Option<&'a str>,
    pub previous: &'a S,
    pub state: &'a S,
}

struct StoreInner<S> {
    state: RwLock<Arc<S>>,
    listeners: Mutex<Vec<Arc<Listener<S>>>>,
    // Held from snapshot to swap so concurrent updaters never see the same base.
    updating: ReentrantMutex<()>,
}

impl<S: State> Registry for StoreInner<S> {
    fn prune(&self) {
        self.listeners
            .lock()
            .retain(|listener| listener.active.load(Ordering::Acquire));
    }
}

/// A thread-safe container for application state.
///
/// The current state is an immutable snapshot behind an `Arc`. Every update
/// publishes a fresh snapshot and notifies subscribers synchronously, in
/// registration order, before the update call returns.
///
/// # Examples
///
/// ```
/// use cannery::{Record, Store};
/// use serde_json::json;
///
/// let store = Store::new(Record::new().with("count", 0));
/// store.set_state(|_| Some(Record::new().with("count", 1)));
/// assert_eq!(store.get_state_selective("count"), Some(json!(1)));
/// ```
pub struct Store<S: State> {
    inner: Arc<StoreInner<S>>,
}

impl<S: State> Store<S> {
    /// Create a new store with the given initial state.
    pub fn new(initial: S) -> Self {
        Self::from_inner(Arc::new(StoreInner {
            state: RwLock::new(Arc::new(initial)),
            listeners: Mutex::new(Vec::new()),
            updating: ReentrantMutex::new(()),
        }))
    }

    /// Create a store whose initial state is built by `init`.
    ///
    /// `init` runs exactly once, synchronously, before the store is returned.
    /// It receives a [`StoreApi`] that actions in the initial state can capture.
    /// The api only becomes live once construction finishes, so calls made on
    /// it from inside `init` itself are ignored.
    pub fn create<F>(init: F) -> Self
    where
        F: FnOnce(&StoreApi<S>) -> S,
    {
        let inner = Arc::new_cyclic(|weak| {
            let api = StoreApi {
                inner: weak.clone(),
            };
            StoreInner {
                state: RwLock::new(Arc::new(init(&api))),
                listeners: Mutex::new(Vec::new()),
                updating: ReentrantMutex::new(()),
            }
        });
        Self::from_inner(inner)
    }

    fn from_inner(inner: Arc<StoreInner<S>>) -> Self {
        Self { inner }
    }

    /// A weak accessor handle, suitable for capturing inside state actions.
    pub fn api(&self) -> StoreApi<S> {
        StoreApi {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The current snapshot.
    pub fn get_state(&self) -> Arc<S> {
        Arc::clone(&self.inner.state.read())
    }

    /// Read state without cloning the snapshot handle.
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&S) -> R,
    {
        let state = self.get_state();
        f(&state)
    }

    /// Merge the patch returned by `updater` into the current state.
    ///
    /// Returning `None` leaves the state untouched and notifies nobody.
    /// A panic inside `updater` propagates to the caller.
    pub fn set_state<F>(&self, updater: F)
    where
        F: FnOnce(&S) -> Option<S::Patch>,
    {
        self.apply(None, |state| updater(state).map(Next::Merge));
    }

    /// Replace the whole state with the value returned by `updater`.
    pub fn replace_state<F>(&self, updater: F)
    where
        F: FnOnce(&S) -> Option<S>,
    {
        self.apply(None, |state| updater(state).map(Next::Replace));
    }

    /// Update with an explicit [`Next`], merging or replacing as it says.
    pub fn update<F>(&self, updater: F)
    where
        F: FnOnce(&S) -> Option<Next<S>>,
    {
        self.apply(None, updater);
    }

    /// Apply an already computed [`Next`].
    pub fn set_state_with(&self, next: Next<S>) {
        self.apply(None, |_| Some(next));
    }

    /// Like [`update`](Store::update) but tags the change with `label`, which
    /// [`subscribe_changes`](Store::subscribe_changes) listeners (such as the
    /// devtools bridge) receive.
    pub fn set_state_as<F>(&self, label: &str, updater: F)
    where
        F: FnOnce(&S) -> Option<Next<S>>,
    {
        self.apply(Some(label), updater);
    }

    fn apply<F>(&self, label: Option<&str>, updater: F)
    where
        F: FnOnce(&S) -> Option<Next<S>>,
    {
        let (previous, next) = {
            // Reentrant, so an updater may itself update or read the store.
            let _updating = self.inner.updating.lock();
            let current = self.get_state();
            let Some(next) = updater(&current) else {
                tracing::trace!(?label, "updater returned nothing, skipping notification");
                return;
            };
            let next = Arc::new(next.resolve(&current));
            let previous = std::mem::replace(&mut *self.inner.state.write(), Arc::clone(&next));
            (previous, next)
        };
        self.notify(label, &previous, &next);
    }

    fn notify(&self, label: Option<&str>, previous: &S, state: &S) {
        let listeners = self.inner.listeners.lock().clone();
        tracing::trace!(?label, listeners = listeners.len(), "notifying subscribers");
        let change = Change {
            label,
            previous,
            state,
        };
        for listener in listeners {
            if listener.active.load(Ordering::Acquire) {
                (listener.callback)(&change);
            }
        }
    }

    /// Subscribe to state changes.
    ///
    /// The callback receives the new state after every published update.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        self.subscribe_changes(move |change| callback(change.state))
    }

    /// Subscribe with access to the previous state and the update's label.
    pub fn subscribe_changes<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Change<'_, S>) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        self.inner.listeners.lock().push(Arc::new(Listener {
            active: Arc::clone(&active),
            callback: Box::new(callback),
        }));
        let registry: Weak<dyn Registry> = Arc::downgrade(&self.inner) as Weak<dyn Registry>;
        Subscription::new(active, registry)
    }

    /// Number of currently registered listeners.
    pub fn subscriber_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

impl<S: Keyed> Store<S> {
    /// Read a single top-level field from the latest snapshot.
    pub fn get_state_selective(&self, key: &S::Key) -> Option<S::Value> {
        self.inner.state.read().field(key)
    }

    /// Set a single top-level field, using the same merge semantics as
    /// [`set_state`](Store::set_state).
    ///
    /// # Examples
    ///
    /// ```
    /// use cannery::{FieldUpdate, Record, Store};
    /// use serde_json::{json, Value};
    ///
    /// let store = Store::new(Record::new().with("count", 0));
    /// store.set_state_selective(
    ///     "count",
    ///     FieldUpdate::with(|count: Option<Value>| {
    ///         json!(count.and_then(|c| c.as_i64()).unwrap_or(0) + 1)
    ///     }),
    /// );
    /// assert_eq!(store.get_state_selective("count"), Some(json!(1)));
    /// ```
    pub fn set_state_selective(&self, key: &S::Key, update: impl Into<FieldUpdate<S::Value>>) {
        let update = update.into();
        self.set_state(|state| Some(S::field_patch(key, update.resolve(state.field(key)))));
    }
}

impl<S: State> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: State + std::fmt::Debug> std::fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state", &self.get_state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// A weak `(set, get)` handle to a store.
///
/// Slices and actions hold this instead of a [`Store`] so that a state which
/// contains actions does not keep its own store alive. Every method is a no-op
/// (or returns `None`) once the store is gone or while it is still being built.
pub struct StoreApi<S: State> {
    inner: Weak<StoreInner<S>>,
}

impl<S: State> StoreApi<S> {
    /// The store, if it is alive.
    pub fn store(&self) -> Option<Store<S>> {
        self.inner.upgrade().map(Store::from_inner)
    }

    pub fn get_state(&self) -> Option<Arc<S>> {
        self.store().map(|store| store.get_state())
    }

    pub fn set_state<F>(&self, updater: F)
    where
        F: FnOnce(&S) -> Option<S::Patch>,
    {
        if let Some(store) = self.store() {
            store.set_state(updater);
        }
    }

    pub fn replace_state<F>(&self, updater: F)
    where
        F: FnOnce(&S) -> Option<S>,
    {
        if let Some(store) = self.store() {
            store.replace_state(updater);
        }
    }

    pub fn set_state_as<F>(&self, label: &str, updater: F)
    where
        F: FnOnce(&S) -> Option<Next<S>>,
    {
        if let Some(store) = self.store() {
            store.set_state_as(label, updater);
        }
    }
}

impl<S: Keyed> StoreApi<S> {
    pub fn get_state_selective(&self, key: &S::Key) -> Option<S::Value> {
        self.store().and_then(|store| store.get_state_selective(key))
    }

    pub fn set_state_selective(&self, key: &S::Key, update: impl Into<FieldUpdate<S::Value>>) {
        if let Some(store) = self.store() {
            store.set_state_selective(key, update);
        }
    }
}

impl<S: State> Clone for StoreApi<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}
