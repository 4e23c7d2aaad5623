//! Stale-while-revalidate data fetching.
//!
//! An [`SwrEffect`] answers from the [`SwrCache`] first and refreshes in the
//! background. Instances on the same key share fetches and results.

mod cache;
mod signals;
mod swr;

pub use cache::SwrCache;
pub use signals::{RevalidateSignal, RevalidateSignals};
pub use swr::{SwrBuilder, SwrEffect, SwrOptions, SwrState};
