use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::AbortHandle;

/// A repeatable unit of work: each call produces a fresh future.
pub type Unit<T, E> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

pub(crate) fn boxed_unit<T, E, F, Fut>(unit: F) -> Unit<T, E>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, Result<T, E>> { Box::pin(unit()) })
}

#[derive(Default)]
struct SlotState {
    generation: u64,
    in_flight: bool,
    handle: Option<AbortHandle>,
}

/// Tracks the single in-flight task of an executor.
///
/// Every run takes a new generation number. A task may only apply its result
/// while its generation is still current, so results arriving after a
/// cancellation or a newer run are dropped silently.
#[derive(Default)]
pub(crate) struct TaskSlot {
    state: Mutex<SlotState>,
}

impl TaskSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Abort whatever is running and start a new generation.
    pub(crate) fn begin(&self) -> u64 {
        let mut state = self.state.lock();
        if let Some(handle) = state.handle.take() {
            tracing::debug!(generation = state.generation, "superseding in-flight task");
            handle.abort();
        }
        state.generation += 1;
        state.in_flight = true;
        state.generation
    }

    /// Record the abort handle of the task spawned for `generation`.
    pub(crate) fn attach(&self, generation: u64, handle: AbortHandle) {
        let mut state = self.state.lock();
        if state.generation != generation {
            handle.abort();
        } else if state.in_flight {
            state.handle = Some(handle);
        }
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.generation == generation && state.in_flight
    }

    /// Claim the right to publish the result of `generation`.
    ///
    /// Returns `false` if the run was cancelled or superseded.
    pub(crate) fn finish(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation || !state.in_flight {
            return false;
        }
        state.in_flight = false;
        state.handle = None;
        true
    }

    /// Abort the in-flight task, if any. Returns whether something was running.
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
        let was_running = state.in_flight;
        state.in_flight = false;
        state.generation += 1;
        was_running
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.lock().in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_generation_cannot_finish() {
        let slot = TaskSlot::new();
        let first = slot.begin();
        let second = slot.begin();

        assert!(!slot.finish(first));
        assert!(slot.is_current(second));
        assert!(slot.finish(second));
        assert!(!slot.is_running());
    }

    #[test]
    fn cancel_reports_whether_anything_ran() {
        let slot = TaskSlot::new();
        assert!(!slot.cancel());

        let generation = slot.begin();
        assert!(slot.cancel());
        assert!(!slot.cancel());
        assert!(!slot.finish(generation));
    }
}
