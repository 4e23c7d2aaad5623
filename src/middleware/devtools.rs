use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::error::DevtoolsError;
use crate::store::{Change, Next, State, Store, StoreApi, Subscription};

/// Label carried by updates the devtools bridge applies itself.
pub const DEVTOOLS_LABEL: &str = "@devtools";

const ANONYMOUS: &str = "anonymous";

/// A devtools endpoint, such as a browser extension or a debugging socket.
pub trait DevtoolsConnection: Send + Sync {
    /// Announce the store with its current state.
    fn init(&self, state: &Value) -> Result<(), DevtoolsError>;

    /// Report one update.
    fn send(&self, action: &str, state: &Value) -> Result<(), DevtoolsError>;
}

/// Time-travel commands sent back by the devtools.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DevtoolsMessage {
    /// Show the state serialized in the payload.
    JumpToState(String),
    /// Same as `JumpToState`, triggered from the action list.
    JumpToAction(String),
    /// Make the current state the new baseline.
    Commit,
    /// Go back to the baseline.
    Reset,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DevtoolsOptions {
    /// Instance name shown in the devtools.
    pub name: String,
    /// When false the store is left alone entirely.
    pub enabled: bool,
}

impl Default for DevtoolsOptions {
    fn default() -> Self {
        Self {
            name: "cannery".to_string(),
            enabled: true,
        }
    }
}

impl DevtoolsOptions {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

struct Bridge<S: State> {
    name: String,
    api: StoreApi<S>,
    connection: Mutex<Option<Arc<dyn DevtoolsConnection>>>,
    baseline: Mutex<Arc<S>>,
}

impl<S> Bridge<S>
where
    S: State + Serialize,
    S::Patch: DeserializeOwned,
{
    fn connection(&self) -> Option<Arc<dyn DevtoolsConnection>> {
        self.connection.lock().clone()
    }

    fn disconnect(&self, error: &DevtoolsError) {
        tracing::warn!(name = %self.name, %error, "devtools connection failed, disconnecting");
        self.connection.lock().take();
    }

    fn init(&self, state: &S) {
        let Some(connection) = self.connection() else {
            return;
        };
        let result = serde_json::to_value(state)
            .map_err(|e| DevtoolsError::Send(e.to_string()))
            .and_then(|state| connection.init(&state));
        if let Err(error) = result {
            self.disconnect(&error);
        }
    }

    fn forward(&self, change: &Change<'_, S>) {
        if change.label == Some(DEVTOOLS_LABEL) {
            return;
        }
        let Some(connection) = self.connection() else {
            return;
        };
        let action = change.label.unwrap_or(ANONYMOUS);
        let result = serde_json::to_value(change.state)
            .map_err(|e| DevtoolsError::Send(e.to_string()))
            .and_then(|state| connection.send(action, &state));
        if let Err(error) = result {
            self.disconnect(&error);
        }
    }

    fn handle(&self, message: DevtoolsMessage) -> Result<(), DevtoolsError> {
        match message {
            DevtoolsMessage::JumpToState(payload) | DevtoolsMessage::JumpToAction(payload) => {
                let patch: S::Patch = serde_json::from_str(&payload)
                    .map_err(|e| DevtoolsError::Malformed(e.to_string()))?;
                let baseline = Arc::clone(&self.baseline.lock());
                self.api.set_state_as(DEVTOOLS_LABEL, move |_| {
                    let mut next = (*baseline).clone();
                    next.merge(patch);
                    Some(Next::Replace(next))
                });
            }
            DevtoolsMessage::Commit => {
                let current = self.api.get_state().ok_or(DevtoolsError::Disconnected)?;
                *self.baseline.lock() = Arc::clone(&current);
                self.init(&current);
            }
            DevtoolsMessage::Reset => {
                let baseline = Arc::clone(&self.baseline.lock());
                self.api
                    .set_state_as(DEVTOOLS_LABEL, |_| Some(Next::Replace((*baseline).clone())));
                self.init(&baseline);
            }
        }
        Ok(())
    }
}

/// Mirror `store` to a devtools `connection` and apply its time-travel
/// `messages`.
///
/// Every update is sent with its label (or `"anonymous"`). Jumps rebuild the
/// state from the baseline (initially the state at connection time) by merging
/// the serialized payload into it, so actions in a [`Record`](crate::Record)
/// survive. Updates applied this way are not sent back.
///
/// With `enabled: false`, or with neither a connection nor a message channel,
/// the store is left untouched.
///
/// # Panics
///
/// Panics if `messages` is given outside a tokio runtime.
pub fn devtools<S>(
    store: &Store<S>,
    options: DevtoolsOptions,
    connection: Option<Arc<dyn DevtoolsConnection>>,
    messages: Option<mpsc::Receiver<DevtoolsMessage>>,
) -> Devtools
where
    S: State + Serialize,
    S::Patch: DeserializeOwned,
{
    if !options.enabled || (connection.is_none() && messages.is_none()) {
        tracing::debug!(name = %options.name, "devtools disabled");
        return Devtools::inactive();
    }

    let initial = store.get_state();
    let bridge = Arc::new(Bridge {
        name: options.name,
        api: store.api(),
        connection: Mutex::new(connection),
        baseline: Mutex::new(Arc::clone(&initial)),
    });
    bridge.init(&initial);

    let forwarding = Arc::clone(&bridge);
    let subscription = store.subscribe_changes(move |change| forwarding.forward(change));

    let inbound = messages.map(|mut rx| {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                tracing::debug!(name = %bridge.name, ?message, "devtools message");
                if let Err(error) = bridge.handle(message) {
                    tracing::warn!(name = %bridge.name, %error, "ignoring devtools message");
                }
            }
        })
        .abort_handle()
    });

    let connected: Arc<dyn Fn() -> bool + Send + Sync> = {
        let bridge = Arc::clone(&bridge);
        Arc::new(move || bridge.connection.lock().is_some())
    };

    Devtools {
        subscription: Some(subscription),
        inbound,
        connected: Some(connected),
    }
}

/// Handle returned by [`devtools`]. Dropping it detaches the bridge.
pub struct Devtools {
    subscription: Option<Subscription>,
    inbound: Option<AbortHandle>,
    connected: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl Devtools {
    fn inactive() -> Self {
        Self {
            subscription: None,
            inbound: None,
            connected: None,
        }
    }

    /// Whether the bridge is attached to the store at all.
    pub fn is_active(&self) -> bool {
        self.subscription.is_some()
    }

    /// Whether updates are still reaching a connection.
    pub fn is_connected(&self) -> bool {
        self.connected.as_ref().is_some_and(|connected| connected())
    }
}

impl Drop for Devtools {
    fn drop(&mut self) {
        if let Some(subscription) = &self.subscription {
            subscription.unsubscribe();
        }
        if let Some(inbound) = &self.inbound {
            inbound.abort();
        }
    }
}

impl std::fmt::Debug for Devtools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Devtools")
            .field("active", &self.is_active())
            .field("connected", &self.is_connected())
            .finish()
    }
}
