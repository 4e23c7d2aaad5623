//! The state container.
//!
//! A [`Store`] holds one immutable snapshot of a [`State`] and publishes a new
//! snapshot on every update. Updates either merge a patch into the current
//! state or replace it outright; subscribers hear about each one synchronously.

mod record;
mod state;
mod store;
mod subscription;

pub use record::{Action, Record, Slot};
pub use state::{FieldUpdate, Keyed, Next, State};
pub use store::{Change, Store, StoreApi};
pub use subscription::Subscription;

pub(crate) use subscription::Registry;
