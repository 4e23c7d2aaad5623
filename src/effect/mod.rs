//! Running asynchronous units of work next to a store.
//!
//! - [`run`] / [`EffectStore`]: fire-and-forget with callbacks
//! - [`CancellableEffect`]: one run at a time, timeout and cancellation
//! - [`RetryEffect`]: bounded retries with constant, linear or exponential backoff
//!
//! Every executor reports an [`EffectState`] through [`EffectStatus`].

mod cancellable;
mod retry;
mod runner;
mod status;
mod task;

pub use cancellable::{CancellableEffect, CancellableOptions};
pub use retry::{RetryEffect, RetryOptions, RetryState, RetryStrategy};
pub use runner::{run, Callbacks, EffectStore, Handlers};
pub use status::{EffectState, EffectStatus, ExecutorPhase};
pub use task::Unit;

pub(crate) use task::{boxed_unit, TaskSlot};
