//! # Cannery
//!
//! State containers with subscriptions, plus the asynchronous machinery that
//! usually sits next to them.
//!
//! ## Store (state container)
//!
//! - [`Store<S>`] holds an immutable snapshot and publishes a new one on every
//!   update; subscribers are told synchronously, in registration order
//! - [`Record`] is a dynamic, key-ordered state with data and actions,
//!   composable from [slices](crate::slice)
//! - Selective reads and writes of single fields through [`Keyed`]
//!
//! ## Effects (asynchronous work)
//!
//! - [`effect`]: fire-and-forget runs, a cancellable executor with timeouts and
//!   a retry executor with backoff
//! - [`swr`]: stale-while-revalidate fetching over a shared cache
//! - [`scheduler`]: prioritised units with dependencies and bounded concurrency
//! - [`reducer`]: reducer dispatch with one cancellable side effect
//!
//! ## Middleware
//!
//! - [`middleware::persist()`] keeps a store in sync with a storage backend
//! - [`middleware::devtools()`] mirrors updates to a devtools connection
//!
//! Everything asynchronous runs on tokio; the library never installs a
//! tracing subscriber.

pub mod effect;
pub mod error;
pub mod middleware;
pub mod reducer;
pub mod scheduler;
pub mod slice;
pub mod store;
pub mod swr;

// Re-export main types for convenience
pub use error::{DevtoolsError, EffectError, PersistError, SchedulerError, StorageError};
pub use slice::{combine_slices, create_slice, Slice};
pub use store::{
    Action, Change, FieldUpdate, Keyed, Next, Record, Slot, State, Store, StoreApi, Subscription,
};
