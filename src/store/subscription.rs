use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Something that holds subscriber entries and can drop the inactive ones.
pub(crate) trait Registry: Send + Sync {
    fn prune(&self);
}

/// Handle returned by `subscribe`.
///
/// Dropping the handle does **not** unsubscribe; the listener stays registered
/// until [`unsubscribe`](Subscription::unsubscribe) is called or its owner is
/// dropped.
#[derive(Clone)]
pub struct Subscription {
    active: Arc<AtomicBool>,
    registry: Weak<dyn Registry>,
}

impl Subscription {
    pub(crate) fn new(active: Arc<AtomicBool>, registry: Weak<dyn Registry>) -> Self {
        Self { active, registry }
    }

    /// Stop delivering notifications to this listener. Calling it again is a no-op.
    ///
    /// Safe to call from inside a notification pass: listeners of that pass
    /// that have not run yet are skipped once unsubscribed.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.prune();
        }
    }

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}
