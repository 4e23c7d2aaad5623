use crate::store::State;

/// Lifecycle of an executor's current run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExecutorPhase {
    #[default]
    Idle,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutorPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutorPhase::Succeeded | ExecutorPhase::Failed | ExecutorPhase::Cancelled
        )
    }
}

/// The `{ data, error, is_loading }` triple every executor reports.
#[derive(Clone, Debug, PartialEq)]
pub struct EffectState<T, E> {
    pub data: Option<T>,
    pub error: Option<E>,
    pub is_loading: bool,
    pub phase: ExecutorPhase,
}

impl<T, E> Default for EffectState<T, E> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            is_loading: false,
            phase: ExecutorPhase::Idle,
        }
    }
}

impl<T, E> EffectState<T, E> {
    /// A fresh run: previous data and error cleared.
    pub fn loading() -> Self {
        Self {
            is_loading: true,
            phase: ExecutorPhase::Running,
            ..Self::default()
        }
    }

    pub fn succeeded(data: T) -> Self {
        Self {
            data: Some(data),
            phase: ExecutorPhase::Succeeded,
            ..Self::default()
        }
    }

    pub fn failed(error: E) -> Self {
        Self {
            error: Some(error),
            phase: ExecutorPhase::Failed,
            ..Self::default()
        }
    }
}

impl<T, E> EffectState<T, E>
where
    T: Clone,
    E: Clone,
{
    /// Stop loading without reporting anything.
    pub fn cancelled(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            is_loading: false,
            phase: ExecutorPhase::Cancelled,
        }
    }
}

// Executor status is always written whole, so the patch is the full value.
impl<T, E> State for EffectState<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    type Patch = Self;

    fn merge(&mut self, patch: Self) {
        *self = patch;
    }
}

/// Uniform read access to an executor's status, so a binding layer can
/// render any executor the same way.
pub trait EffectStatus {
    type Data: Clone;
    type Error: Clone;

    fn effect_state(&self) -> EffectState<Self::Data, Self::Error>;

    fn data(&self) -> Option<Self::Data> {
        self.effect_state().data
    }

    fn error(&self) -> Option<Self::Error> {
        self.effect_state().error
    }

    fn is_loading(&self) -> bool {
        self.effect_state().is_loading
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_clears_previous_results() {
        let state: EffectState<i32, String> = EffectState::loading();
        assert!(state.is_loading);
        assert_eq!(state.data, None);
        assert_eq!(state.error, None);
        assert_eq!(state.phase, ExecutorPhase::Running);
    }

    #[test]
    fn cancelled_is_not_an_error() {
        let state: EffectState<i32, String> = EffectState::loading().cancelled();
        assert!(!state.is_loading);
        assert_eq!(state.error, None);
        assert!(state.phase.is_terminal());
    }
}
