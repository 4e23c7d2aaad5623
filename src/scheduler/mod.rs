//! Bounded-concurrency execution of prioritised units with dependencies.

mod priority;
mod resource;
mod scheduler;

pub use priority::{Priority, PriorityLevel};
pub use resource::{Resource, ResourceStatus};
pub use scheduler::{EffectScheduler, ScheduledEffect, SchedulerOptions};
