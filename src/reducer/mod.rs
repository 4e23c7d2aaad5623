//! Reducer-style dispatch with a single cancellable side effect.

mod reducer;

pub use reducer::{EffectAction, ReducerBuilder, ReducerEffect};
