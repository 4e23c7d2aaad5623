use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::sync::Arc;

use super::state::{Keyed, State};

/// A callable stored in a [`Record`].
///
/// Actions take a JSON payload (use `Value::Null` when there is nothing to pass)
/// and usually capture a [`StoreApi`](super::StoreApi) to read and write state.
#[derive(Clone)]
pub struct Action(Arc<dyn Fn(Value) + Send + Sync>);

impl Action {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, payload: Value) {
        (self.0)(payload)
    }

    fn same(&self, other: &Action) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Action(..)")
    }
}

/// One top-level entry of a [`Record`].
#[derive(Clone, Debug)]
pub enum Slot {
    Data(Value),
    Action(Action),
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Slot::Data(a), Slot::Data(b)) => a == b,
            (Slot::Action(a), Slot::Action(b)) => a.same(b),
            _ => false,
        }
    }
}

/// A dynamic, insertion-ordered state made of named data fields and actions.
///
/// `Record` is its own patch type: merging copies every slot of the patch over
/// the current record, keeping untouched keys. Only data slots are serialized.
///
/// # Examples
///
/// ```
/// use cannery::Record;
/// use serde_json::json;
///
/// let mut state = Record::new().with("count", 1).with("name", "bears");
/// state.insert("count", 2);
///
/// assert_eq!(state.get("count"), Some(&json!(2)));
/// assert_eq!(state.get_as::<String>("name").as_deref(), Some("bears"));
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Record {
    slots: IndexMap<String, Slot>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`insert`](Record::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Builder form of [`insert_action`](Record::insert_action).
    pub fn with_action<F>(mut self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.insert_action(key, Action::new(f));
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.slots.insert(key.into(), Slot::Data(value.into()));
    }

    pub fn insert_action(&mut self, key: impl Into<String>, action: Action) {
        self.slots.insert(key.into(), Slot::Action(action));
    }

    pub fn remove(&mut self, key: &str) -> Option<Slot> {
        self.slots.shift_remove(key)
    }

    /// The data stored under `key`. Actions are not data and yield `None`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.slots.get(key) {
            Some(Slot::Data(value)) => Some(value),
            _ => None,
        }
    }

    /// Deserialize the data stored under `key`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn action(&self, key: &str) -> Option<&Action> {
        match self.slots.get(key) {
            Some(Slot::Action(action)) => Some(action),
            _ => None,
        }
    }

    /// Invoke the action under `key`. Returns `false` if there is no such action.
    pub fn call(&self, key: &str, payload: Value) -> bool {
        match self.action(key) {
            Some(action) => {
                action.call(payload);
                true
            }
            None => false,
        }
    }

    pub fn slot(&self, key: &str) -> Option<&Slot> {
        self.slots.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Only the data slots, as a JSON object.
    pub fn to_json(&self) -> Value {
        Value::Object(
            self.slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Data(value) => Some((key.clone(), value.clone())),
                    Slot::Action(_) => None,
                })
                .collect(),
        )
    }
}

impl State for Record {
    type Patch = Record;

    fn merge(&mut self, patch: Record) {
        for (key, slot) in patch.slots {
            // IndexMap keeps an existing key at its original position.
            self.slots.insert(key, slot);
        }
    }
}

impl Keyed for Record {
    type Key = str;
    type Value = Value;

    fn field(&self, key: &str) -> Option<Value> {
        self.get(key).cloned()
    }

    fn field_patch(key: &str, value: Value) -> Record {
        Record::new().with(key, value)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.slots.iter().filter_map(|(key, slot)| match slot {
            Slot::Data(value) => Some((key, value)),
            Slot::Action(_) => None,
        }))
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let data = IndexMap::<String, Value>::deserialize(deserializer)?;
        Ok(Self {
            slots: data
                .into_iter()
                .map(|(key, value)| (key, Slot::Data(value)))
                .collect(),
        })
    }
}
