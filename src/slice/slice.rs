use crate::store::{State, StoreApi};

/// A fragment of state (and actions) built against the shared store accessor.
pub type Slice<S> = Box<dyn FnOnce(&StoreApi<S>) -> <S as State>::Patch + Send>;

/// Wrap a closure as a [`Slice`]. Nothing happens beyond fixing the signature.
pub fn create_slice<S, F>(f: F) -> Slice<S>
where
    S: State,
    F: FnOnce(&StoreApi<S>) -> S::Patch + Send + 'static,
{
    Box::new(f)
}

/// Combine slices into a single initializer for [`Store::create`](crate::Store::create).
///
/// Every slice receives the same [`StoreApi`], so an action defined by one
/// slice can read and write fields defined by another. Fragments are merged
/// onto `S::default()` in iteration order; when two slices define the same
/// key, the later slice wins.
///
/// # Examples
///
/// ```
/// use cannery::{combine_slices, create_slice, FieldUpdate, Record, Store, StoreApi};
/// use serde_json::{json, Value};
///
/// let counter = create_slice(|api: &StoreApi<Record>| {
///     let api = api.clone();
///     Record::new().with("count", 0).with_action("increment", move |_| {
///         api.set_state_selective(
///             "count",
///             FieldUpdate::with(|c: Option<Value>| {
///                 json!(c.and_then(|c| c.as_i64()).unwrap_or(0) + 1)
///             }),
///         );
///     })
/// });
/// let greeting = create_slice::<Record, _>(|_| Record::new().with("greeting", "hi"));
///
/// let store = Store::create(combine_slices([("counter", counter), ("greeting", greeting)]));
/// store.get_state().call("increment", Value::Null);
///
/// assert_eq!(store.get_state_selective("count"), Some(json!(1)));
/// assert_eq!(store.get_state_selective("greeting"), Some(json!("hi")));
/// ```
pub fn combine_slices<S, K, I>(slices: I) -> impl FnOnce(&StoreApi<S>) -> S
where
    S: State + Default,
    K: Into<String>,
    I: IntoIterator<Item = (K, Slice<S>)>,
{
    let slices: Vec<(String, Slice<S>)> = slices
        .into_iter()
        .map(|(name, slice)| (name.into(), slice))
        .collect();

    move |api| {
        let mut state = S::default();
        for (name, slice) in slices {
            tracing::trace!(slice = %name, "merging slice");
            state.merge(slice(api));
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FieldUpdate, Record, Store};
    use indexmap::IndexMap;
    use serde_json::{json, Value};

    fn bump(value: Option<Value>) -> Value {
        json!(value.and_then(|v| v.as_i64()).unwrap_or(0) + 1)
    }

    fn counter_slice() -> Slice<Record> {
        create_slice(|api: &StoreApi<Record>| {
            let api = api.clone();
            Record::new()
                .with("count", 0)
                .with_action("increment", move |_| {
                    api.set_state_selective("count", FieldUpdate::with(bump));
                })
        })
    }

    fn double_slice() -> Slice<Record> {
        create_slice(|api: &StoreApi<Record>| {
            let api = api.clone();
            Record::new()
                .with("doubled", 0)
                .with_action("doubleCount", move |_| {
                    let count = api
                        .get_state_selective("count")
                        .and_then(|c| c.as_i64())
                        .unwrap_or(0);
                    api.set_state_selective("doubled", json!(count * 2));
                })
        })
    }

    #[test]
    fn slices_see_their_own_initial_fields() {
        let store = Store::create(combine_slices([
            ("counter", counter_slice()),
            ("double", double_slice()),
        ]));

        let state = store.get_state();
        assert_eq!(state.get("count"), Some(&json!(0)));
        assert_eq!(state.get("doubled"), Some(&json!(0)));
        assert!(state.action("increment").is_some());
        assert!(state.action("doubleCount").is_some());
    }

    #[test]
    fn actions_read_fields_from_other_slices() {
        let store = Store::create(combine_slices([
            ("counter", counter_slice()),
            ("double", double_slice()),
        ]));

        store.get_state().call("increment", Value::Null);
        store.get_state().call("increment", Value::Null);
        store.get_state().call("doubleCount", Value::Null);

        assert_eq!(store.get_state_selective("count"), Some(json!(2)));
        assert_eq!(store.get_state_selective("doubled"), Some(json!(4)));
    }

    #[test]
    fn later_slice_wins_on_key_collision() {
        let mut slices: IndexMap<&str, Slice<Record>> = IndexMap::new();
        slices.insert(
            "first",
            create_slice(|_| Record::new().with("shared", "first").with("a", 1)),
        );
        slices.insert(
            "second",
            create_slice(|_| Record::new().with("shared", "second").with("b", 2)),
        );

        let store = Store::create(combine_slices(slices));
        let state = store.get_state();

        assert_eq!(state.get("shared"), Some(&json!("second")));
        assert_eq!(state.keys().collect::<Vec<_>>(), vec!["shared", "a", "b"]);
    }

    #[test]
    fn every_slice_runs_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let runs = Arc::new(AtomicUsize::new(0));
        let slices: Vec<(String, Slice<Record>)> = (0..3)
            .map(|i| {
                let runs = runs.clone();
                (
                    format!("slice-{i}"),
                    create_slice(move |_| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Record::new().with(format!("field-{i}"), i)
                    }),
                )
            })
            .collect();

        let store = Store::create(combine_slices(slices));

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(store.get_state().len(), 3);
    }
}
