//! Composing one store out of independently defined slices.

mod slice;

pub use slice::{combine_slices, create_slice, Slice};
