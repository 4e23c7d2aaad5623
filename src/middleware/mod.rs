//! Middlewares that wrap a [`Store`](crate::Store) from the outside.
//!
//! - [`persist()`]: hydrate from and write through to a [`StateStorage`]
//! - [`devtools()`]: mirror updates to a [`DevtoolsConnection`] and accept
//!   time-travel commands

mod devtools;
mod persist;
mod storage;

pub use devtools::{
    devtools, Devtools, DevtoolsConnection, DevtoolsMessage, DevtoolsOptions, DEVTOOLS_LABEL,
};
pub use persist::{persist, Persist, PersistOptions};
pub use storage::{MemoryStorage, StateStorage};
