use super::priority::Priority;

/// Where a scheduled unit is in its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceStatus {
    /// Queued, or removed while running.
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// What the scheduler knows about one unit.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource<T, E> {
    pub id: String,
    pub status: ResourceStatus,
    pub data: Option<T>,
    pub error: Option<E>,
    pub is_loading: bool,
    pub dependencies: Vec<String>,
    pub priority: Priority,
}

impl<T, E> Resource<T, E> {
    pub(crate) fn queued(id: String, dependencies: Vec<String>, priority: Priority) -> Self {
        Self {
            id,
            status: ResourceStatus::Idle,
            data: None,
            error: None,
            is_loading: false,
            dependencies,
            priority,
        }
    }

    pub(crate) fn start(&mut self) {
        self.status = ResourceStatus::Loading;
        self.is_loading = true;
        self.data = None;
        self.error = None;
    }

    pub(crate) fn settle(&mut self, outcome: Result<T, E>) {
        self.is_loading = false;
        match outcome {
            Ok(data) => {
                self.status = ResourceStatus::Success;
                self.data = Some(data);
            }
            Err(error) => {
                self.status = ResourceStatus::Error;
                self.error = Some(error);
            }
        }
    }

    /// Failed without an error value to report.
    pub(crate) fn abandon(&mut self) {
        self.status = ResourceStatus::Error;
        self.is_loading = false;
        self.data = None;
        self.error = None;
    }

    pub(crate) fn reset(&mut self) {
        self.status = ResourceStatus::Idle;
        self.is_loading = false;
        self.data = None;
        self.error = None;
    }

    pub fn is_success(&self) -> bool {
        self.status == ResourceStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == ResourceStatus::Error
    }
}
