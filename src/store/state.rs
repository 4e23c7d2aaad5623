/// A value that can live in a [`Store`](super::Store).
///
/// The store never mutates a published snapshot. Each update clones the current
/// snapshot, merges a [`Patch`](State::Patch) into the clone (or swaps in a whole
/// new value) and publishes the result.
///
/// # Examples
///
/// ```
/// use cannery::State;
///
/// #[derive(Clone, Debug, PartialEq)]
/// struct Counter {
///     count: i32,
///     label: String,
/// }
///
/// #[derive(Default)]
/// struct CounterPatch {
///     count: Option<i32>,
///     label: Option<String>,
/// }
///
/// impl State for Counter {
///     type Patch = CounterPatch;
///
///     fn merge(&mut self, patch: CounterPatch) {
///         if let Some(count) = patch.count {
///             self.count = count;
///         }
///         if let Some(label) = patch.label {
///             self.label = label;
///         }
///     }
/// }
/// ```
pub trait State: Clone + Send + Sync + 'static {
    /// A partial update. Merging only touches the top-level fields it carries.
    type Patch: Send + 'static;

    /// Shallow-merge `patch` into `self`.
    fn merge(&mut self, patch: Self::Patch);
}

/// The outcome of an updater: merge a patch or replace the whole state.
pub enum Next<S: State> {
    Merge(S::Patch),
    Replace(S),
}

impl<S: State> Next<S> {
    /// Resolve against the current snapshot into the next full state.
    pub(crate) fn resolve(self, current: &S) -> S {
        match self {
            Next::Merge(patch) => {
                let mut next = current.clone();
                next.merge(patch);
                next
            }
            Next::Replace(next) => next,
        }
    }
}

/// States whose top-level fields can be addressed by key.
///
/// This powers [`Store::get_state_selective`](super::Store::get_state_selective)
/// and [`Store::set_state_selective`](super::Store::set_state_selective).
pub trait Keyed: State {
    type Key: ?Sized;
    type Value: Clone + Send + 'static;

    /// Read one field, `None` if it is not present.
    fn field(&self, key: &Self::Key) -> Option<Self::Value>;

    /// Build a patch that sets exactly one field.
    fn field_patch(key: &Self::Key, value: Self::Value) -> Self::Patch;
}

/// A new value for a single field, or a function of its previous value.
pub enum FieldUpdate<V> {
    Set(V),
    Update(Box<dyn FnOnce(Option<V>) -> V + Send>),
}

impl<V> FieldUpdate<V> {
    /// Derive the new value from the previous one.
    pub fn with(f: impl FnOnce(Option<V>) -> V + Send + 'static) -> Self {
        FieldUpdate::Update(Box::new(f))
    }

    pub(crate) fn resolve(self, previous: Option<V>) -> V {
        match self {
            FieldUpdate::Set(value) => value,
            FieldUpdate::Update(f) => f(previous),
        }
    }
}

impl<V> From<V> for FieldUpdate<V> {
    fn from(value: V) -> Self {
        FieldUpdate::Set(value)
    }
}
