use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use super::storage::StateStorage;
use crate::error::{PersistError, StorageError};
use crate::store::{Next, State, Store, StoreApi, Subscription};

type Partialize<S> = Arc<dyn Fn(&S) -> Result<Value, serde_json::Error> + Send + Sync>;
type Merge<S> = Arc<dyn Fn(Value, &S) -> Result<Next<S>, serde_json::Error> + Send + Sync>;
type Migrate = Arc<dyn Fn(Value, u32) -> Result<Value, String> + Send + Sync>;
type HydrationHook<S> = Box<dyn FnOnce(&S) + Send>;

/// On-disk shape of a persisted payload.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    state: Value,
    version: u32,
}

/// Where and how a store is persisted.
pub struct PersistOptions<S: State> {
    /// Storage key of the payload.
    pub name: String,
    /// Schema version written with every payload.
    pub version: u32,
    storage: Arc<dyn StateStorage>,
    partialize: Option<Partialize<S>>,
    merge: Option<Merge<S>>,
    migrate: Option<Migrate>,
}

impl<S: State> PersistOptions<S> {
    pub fn new(name: impl Into<String>, storage: impl StateStorage + 'static) -> Self {
        Self {
            name: name.into(),
            version: 0,
            storage: Arc::new(storage),
            partialize: None,
            merge: None,
            migrate: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Persist only what `f` picks out of the state.
    pub fn with_partialize<F>(mut self, f: F) -> Self
    where
        F: Fn(&S) -> Value + Send + Sync + 'static,
    {
        self.partialize = Some(Arc::new(
            move |state: &S| -> Result<Value, serde_json::Error> { Ok(f(state)) },
        ));
        self
    }

    /// Combine the hydrated payload with the live state yourself.
    pub fn with_merge<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &S) -> Result<Next<S>, serde_json::Error> + Send + Sync + 'static,
    {
        self.merge = Some(Arc::new(f));
        self
    }

    /// Upgrade a payload written by an older (or newer) `version`.
    pub fn with_migrate<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, u32) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.migrate = Some(Arc::new(f));
        self
    }
}

enum WriteOp {
    Set(String),
    Remove(oneshot::Sender<Result<(), StorageError>>),
}

struct Hydration<S> {
    done: bool,
    hooks: Vec<HydrationHook<S>>,
}

struct PersistInner<S: State> {
    api: StoreApi<S>,
    name: String,
    version: u32,
    storage: Arc<dyn StateStorage>,
    partialize: Partialize<S>,
    merge: Merge<S>,
    migrate: Option<Migrate>,
    hydration: Mutex<Hydration<S>>,
    hydrated_tx: watch::Sender<bool>,
    writes: mpsc::UnboundedSender<WriteOp>,
}

impl<S> PersistInner<S>
where
    S: State + Serialize,
    S::Patch: DeserializeOwned,
{
    fn has_hydrated(&self) -> bool {
        self.hydration.lock().done
    }

    fn enqueue_write(&self, state: &S) {
        let payload = (self.partialize)(state).and_then(|state| {
            serde_json::to_string(&Envelope {
                state,
                version: self.version,
            })
        });
        match payload {
            Ok(payload) => {
                if self.writes.send(WriteOp::Set(payload)).is_err() {
                    tracing::warn!(name = %self.name, "persist writer has stopped, dropping write");
                }
            }
            Err(error) => {
                tracing::warn!(name = %self.name, %error, "failed to serialize state for storage");
            }
        }
    }

    async fn load(&self) -> Result<Option<Value>, PersistError> {
        let Some(raw) = self.storage.get(&self.name).await? else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_str(&raw).map_err(PersistError::Decode)?;
        if envelope.version == self.version {
            return Ok(Some(envelope.state));
        }
        let Some(migrate) = &self.migrate else {
            return Err(PersistError::VersionMismatch {
                stored: envelope.version,
                current: self.version,
            });
        };
        tracing::debug!(
            name = %self.name,
            from = envelope.version,
            to = self.version,
            "migrating persisted state"
        );
        migrate(envelope.state, envelope.version)
            .map(Some)
            .map_err(|reason| PersistError::Migration {
                from: envelope.version,
                reason,
            })
    }

    async fn hydrate(&self) -> Result<(), PersistError> {
        self.set_hydrated(false);
        let outcome = match self.load().await {
            Ok(Some(value)) => self.apply(value),
            Ok(None) => Ok(()),
            Err(error) => Err(error),
        };
        if let Err(error) = &outcome {
            tracing::warn!(name = %self.name, %error, "discarding persisted state");
        }
        self.finish_hydration(outcome.is_ok());
        outcome
    }

    fn apply(&self, value: Value) -> Result<(), PersistError> {
        let Some(current) = self.api.get_state() else {
            return Ok(());
        };
        let next = (self.merge)(value, &current).map_err(PersistError::Decode)?;
        self.api.set_state_as("@persist/hydrate", |_| Some(next));
        Ok(())
    }

    fn set_hydrated(&self, done: bool) {
        self.hydration.lock().done = done;
        self.hydrated_tx.send_replace(done);
    }

    /// Marks hydration done and runs the hooks. The merged state is written
    /// back only when `write_back` is set, so a failed read never clobbers
    /// what storage still holds.
    fn finish_hydration(&self, write_back: bool) {
        let hooks = {
            let mut hydration = self.hydration.lock();
            hydration.done = true;
            std::mem::take(&mut hydration.hooks)
        };
        if let Some(state) = self.api.get_state() {
            tracing::debug!(name = %self.name, write_back, "hydration finished");
            if write_back {
                self.enqueue_write(&state);
            }
            for hook in hooks {
                hook(&state);
            }
        }
        self.hydrated_tx.send_replace(true);
    }
}

async fn write_loop(
    storage: Arc<dyn StateStorage>,
    name: String,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Set(payload) => {
                if let Err(error) = storage.set(&name, payload).await {
                    tracing::warn!(name = %name, %error, "failed to write persisted state");
                }
            }
            WriteOp::Remove(done) => {
                let _ = done.send(storage.remove(&name).await);
            }
        }
    }
}

/// Keep `store` in sync with a [`StateStorage`] backend.
///
/// Hydration starts immediately in the background. Until it finishes, updates
/// are not written; afterwards the merged state is written once and every
/// update after that is queued to a single writer.
///
/// # Panics
///
/// Panics if called outside a tokio runtime.
///
/// # Examples
///
/// ```
/// use cannery::middleware::{persist, MemoryStorage, PersistOptions};
/// use cannery::{Record, Store};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let storage = MemoryStorage::new().with("prefs", r#"{"state":{"theme":"dark"},"version":0}"#);
/// let store = Store::new(Record::new().with("theme", "light").with("font", 12));
///
/// let persisted = persist(&store, PersistOptions::new("prefs", storage.clone()));
/// persisted.wait_for_hydration().await;
///
/// assert_eq!(store.get_state_selective("theme"), Some(json!("dark")));
/// assert_eq!(store.get_state_selective("font"), Some(json!(12)));
/// # }
/// ```
pub fn persist<S>(store: &Store<S>, options: PersistOptions<S>) -> Persist<S>
where
    S: State + Serialize,
    S::Patch: DeserializeOwned,
{
    let PersistOptions {
        name,
        version,
        storage,
        partialize,
        merge,
        migrate,
    } = options;

    let (writes, ops) = mpsc::unbounded_channel();
    let (hydrated_tx, _) = watch::channel(false);
    let inner = Arc::new(PersistInner {
        api: store.api(),
        name: name.clone(),
        version,
        storage: Arc::clone(&storage),
        partialize: partialize
            .unwrap_or_else(|| Arc::new(|state: &S| serde_json::to_value(state)) as Partialize<S>),
        merge: merge.unwrap_or_else(|| {
            Arc::new(|value: Value, _current: &S| -> Result<Next<S>, serde_json::Error> {
                serde_json::from_value::<S::Patch>(value).map(Next::Merge)
            }) as Merge<S>
        }),
        migrate,
        hydration: Mutex::new(Hydration {
            done: false,
            hooks: Vec::new(),
        }),
        hydrated_tx,
        writes,
    });

    let writer = tokio::spawn(write_loop(storage, name, ops)).abort_handle();

    let listener = Arc::clone(&inner);
    let subscription = store.subscribe(move |state| {
        if listener.has_hydrated() {
            listener.enqueue_write(state);
        }
    });

    let hydrating = Arc::clone(&inner);
    tokio::spawn(async move {
        let _ = hydrating.hydrate().await;
    });

    Persist {
        inner,
        subscription,
        writer,
    }
}

/// Handle returned by [`persist`]. Dropping it stops persisting.
pub struct Persist<S: State> {
    inner: Arc<PersistInner<S>>,
    subscription: Subscription,
    writer: tokio::task::AbortHandle,
}

impl<S> Persist<S>
where
    S: State + Serialize,
    S::Patch: DeserializeOwned,
{
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn has_hydrated(&self) -> bool {
        self.inner.has_hydrated()
    }

    /// Run `hook` once hydration has finished, or right now if it already has.
    pub fn on_finish_hydration<F>(&self, hook: F)
    where
        F: FnOnce(&S) + Send + 'static,
    {
        {
            let mut hydration = self.inner.hydration.lock();
            if !hydration.done {
                hydration.hooks.push(Box::new(hook));
                return;
            }
        }
        if let Some(state) = self.inner.api.get_state() {
            hook(&state);
        }
    }

    pub async fn wait_for_hydration(&self) {
        let mut hydrated = self.inner.hydrated_tx.subscribe();
        // The sender lives in `inner`, which outlives this call.
        let _ = hydrated.wait_for(|done| *done).await;
    }

    /// Load the stored payload again and merge it into the store.
    ///
    /// Failures are logged as well as returned; the store is left as it was.
    pub async fn rehydrate(&self) -> Result<(), PersistError> {
        self.inner.hydrate().await
    }

    /// Delete the stored payload. The in-memory state is untouched.
    pub async fn clear_storage(&self) -> Result<(), StorageError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.writes.send(WriteOp::Remove(done_tx)).is_err() {
            return self.inner.storage.remove(&self.inner.name).await;
        }
        match done_rx.await {
            Ok(result) => result,
            Err(_) => self.inner.storage.remove(&self.inner.name).await,
        }
    }
}

impl<S: State> Drop for Persist<S> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::MemoryStorage;
    use crate::store::Record;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn stored(storage: &MemoryStorage, name: &str) -> Value {
        serde_json::from_str(&storage.peek(name).unwrap()).unwrap()
    }

    fn counter() -> Store<Record> {
        Store::new(
            Record::new()
                .with("count", 0)
                .with("name", "anon")
                .with_action("noop", |_| {}),
        )
    }

    /// Delays reads so tests can update the store mid-hydration.
    struct SlowStorage(MemoryStorage);

    #[async_trait]
    impl StateStorage for SlowStorage {
        async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
            self.0.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.0.remove(key).await
        }
    }

    /// Holds a payload it refuses to hand out.
    struct UnreadableStorage(MemoryStorage);

    #[async_trait]
    impl StateStorage for UnreadableStorage {
        async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Backend("device busy".into()))
        }

        async fn set(&self, key: &str, value: String) -> Result<(), StorageError> {
            self.0.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<(), StorageError> {
            self.0.remove(key).await
        }
    }

    struct BrokenStorage;

    #[async_trait]
    impl StateStorage for BrokenStorage {
        async fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Ok(None)
        }

        async fn set(&self, _key: &str, _value: String) -> Result<(), StorageError> {
            Err(StorageError::Backend("quota exceeded".into()))
        }

        async fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn hydration_merges_into_live_state() {
        let storage = MemoryStorage::new().with("app", r#"{"state":{"count":5},"version":0}"#);
        let store = counter();

        let persisted = persist(&store, PersistOptions::new("app", storage));
        persisted.wait_for_hydration().await;

        assert!(persisted.has_hydrated());
        assert_eq!(store.get_state_selective("count"), Some(json!(5)));
        assert_eq!(store.get_state_selective("name"), Some(json!("anon")));
        assert!(store.get_state().action("noop").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn updates_after_hydration_are_written_in_order() {
        let storage = MemoryStorage::new();
        let store = counter();
        let persisted = persist(&store, PersistOptions::new("app", storage.clone()));
        persisted.wait_for_hydration().await;

        store.set_state_selective("count", json!(1));
        store.set_state_selective("count", json!(2));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            stored(&storage, "app"),
            json!({"state": {"count": 2, "name": "anon"}, "version": 0})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn updates_during_hydration_are_not_written_until_merged() {
        let backing = MemoryStorage::new().with("app", r#"{"state":{"count":5},"version":0}"#);
        let store = counter();
        let persisted = persist(&store, PersistOptions::new("app", SlowStorage(backing.clone())));

        tokio::time::sleep(Duration::from_millis(10)).await;
        store.set_state_selective("name", json!("early"));
        assert_eq!(
            stored(&backing, "app"),
            json!({"state": {"count": 5}, "version": 0})
        );

        persisted.wait_for_hydration().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            stored(&backing, "app"),
            json!({"state": {"count": 5, "name": "early"}, "version": 0})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn older_versions_are_migrated() {
        let storage = MemoryStorage::new().with("app", r#"{"state":{"total":9},"version":1}"#);
        let store = counter();

        let options = PersistOptions::new("app", storage.clone())
            .with_version(2)
            .with_migrate(|mut value, from| {
                assert_eq!(from, 1);
                let total = value
                    .as_object_mut()
                    .and_then(|state| state.remove("total"))
                    .ok_or_else(|| "missing total".to_string())?;
                Ok(json!({ "count": total }))
            });
        let persisted = persist(&store, options);
        persisted.wait_for_hydration().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.get_state_selective("count"), Some(json!(9)));
        assert_eq!(stored(&storage, "app")["version"], json!(2));
    }

    #[tokio::test]
    #[traced_test]
    async fn version_mismatch_without_migration_is_discarded() {
        let storage = MemoryStorage::new().with("app", r#"{"state":{"count":5},"version":3}"#);
        let store = counter();

        let persisted = persist(&store, PersistOptions::new("app", storage));
        persisted.wait_for_hydration().await;

        assert_eq!(store.get_state_selective("count"), Some(json!(0)));
        assert!(logs_contain("discarding persisted state"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn failed_read_leaves_stored_payload_untouched() {
        let backing = MemoryStorage::new().with("app", r#"{"state":{"count":42},"version":0}"#);
        let store = counter();

        let storage = UnreadableStorage(backing.clone());
        let persisted = persist(&store, PersistOptions::new("app", storage));
        persisted.wait_for_hydration().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(persisted.has_hydrated());
        assert_eq!(store.get_state_selective("count"), Some(json!(0)));
        assert_eq!(stored(&backing, "app"), json!({"state": {"count": 42}, "version": 0}));
        assert!(logs_contain("discarding persisted state"));
    }

    #[tokio::test(start_paused = true)]
    async fn version_mismatch_does_not_overwrite_storage() {
        let storage = MemoryStorage::new().with("app", r#"{"state":{"count":5},"version":3}"#);
        let store = counter();

        let persisted = persist(&store, PersistOptions::new("app", storage.clone()));
        persisted.wait_for_hydration().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(stored(&storage, "app"), json!({"state": {"count": 5}, "version": 3}));
    }

    #[tokio::test]
    #[traced_test]
    async fn corrupt_payload_falls_back_to_current_state() {
        let storage = MemoryStorage::new().with("app", "not json");
        let store = counter();

        let persisted = persist(&store, PersistOptions::new("app", storage));
        persisted.wait_for_hydration().await;

        assert!(persisted.has_hydrated());
        assert_eq!(store.get_state_selective("count"), Some(json!(0)));
        assert!(logs_contain("discarding persisted state"));
        assert!(matches!(persisted.rehydrate().await, Err(PersistError::Decode(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn partialize_limits_what_is_written() {
        let storage = MemoryStorage::new();
        let store = counter();
        let options = PersistOptions::new("app", storage.clone())
            .with_partialize(|state: &Record| json!({ "count": state.get("count") }));
        let persisted = persist(&store, options);
        persisted.wait_for_hydration().await;

        store.set_state_selective("count", json!(3));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(stored(&storage, "app"), json!({"state": {"count": 3}, "version": 0}));
    }

    #[tokio::test]
    async fn custom_merge_can_prefer_live_state() {
        let storage = MemoryStorage::new()
            .with("app", r#"{"state":{"count":5,"name":"saved"},"version":0}"#);
        let store = counter();
        let options = PersistOptions::new("app", storage).with_merge(|value, _current: &Record| {
            let saved: Record = serde_json::from_value(value)?;
            let name = saved.get("name").cloned().unwrap_or(Value::Null);
            Ok(Next::Merge(Record::new().with("name", name)))
        });
        let persisted = persist(&store, options);
        persisted.wait_for_hydration().await;

        assert_eq!(store.get_state_selective("count"), Some(json!(0)));
        assert_eq!(store.get_state_selective("name"), Some(json!("saved")));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_storage_leaves_memory_alone() {
        let storage = MemoryStorage::new();
        let store = counter();
        let persisted = persist(&store, PersistOptions::new("app", storage.clone()));
        persisted.wait_for_hydration().await;
        store.set_state_selective("count", json!(4));

        persisted.clear_storage().await.unwrap();

        assert_eq!(storage.peek("app"), None);
        assert_eq!(store.get_state_selective("count"), Some(json!(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn hydration_hooks_fire_once() {
        let storage = SlowStorage(MemoryStorage::new());
        let store = counter();
        let persisted = persist(&store, PersistOptions::new("app", storage));
        let fired = Arc::new(AtomicUsize::new(0));

        let pending = fired.clone();
        persisted.on_finish_hydration(move |_| {
            pending.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!persisted.has_hydrated());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        persisted.wait_for_hydration().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let immediate = fired.clone();
        persisted.on_finish_hydration(move |state: &Record| {
            assert_eq!(state.get("count"), Some(&json!(0)));
            immediate.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn write_failures_are_logged_not_fatal() {
        let store = counter();
        let persisted = persist(&store, PersistOptions::new("app", BrokenStorage));
        persisted.wait_for_hydration().await;

        store.set_state_selective("count", json!(1));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(store.get_state_selective("count"), Some(json!(1)));
        assert!(logs_contain("failed to write persisted state"));
    }
}
