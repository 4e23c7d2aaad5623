use tokio::sync::broadcast;

/// Environment events that make cached data worth re-checking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RevalidateSignal {
    /// The application regained focus.
    Focus,
    /// Network connectivity came back.
    Reconnect,
}

/// Fan-out point for [`RevalidateSignal`]s.
///
/// The host application calls [`focus`](Self::focus) or
/// [`reconnect`](Self::reconnect); every [`SwrEffect`](super::SwrEffect) built
/// with this hub hears it.
#[derive(Clone, Debug)]
pub struct RevalidateSignals {
    tx: broadcast::Sender<RevalidateSignal>,
}

impl RevalidateSignals {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn focus(&self) {
        self.emit(RevalidateSignal::Focus);
    }

    pub fn reconnect(&self) {
        self.emit(RevalidateSignal::Reconnect);
    }

    /// Send `signal` to every listener. Returns how many received it.
    pub fn emit(&self, signal: RevalidateSignal) -> usize {
        // No receivers is not an error here.
        let delivered = self.tx.send(signal).unwrap_or(0);
        tracing::trace!(?signal, delivered, "revalidate signal");
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RevalidateSignal> {
        self.tx.subscribe()
    }
}

impl Default for RevalidateSignals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_listener_hears_a_signal() {
        let signals = RevalidateSignals::new();
        let mut a = signals.subscribe();
        let mut b = signals.subscribe();

        assert_eq!(signals.emit(RevalidateSignal::Reconnect), 2);
        assert_eq!(a.recv().await.unwrap(), RevalidateSignal::Reconnect);
        assert_eq!(b.recv().await.unwrap(), RevalidateSignal::Reconnect);
    }

    #[test]
    fn emitting_without_listeners_is_fine() {
        let signals = RevalidateSignals::new();
        assert_eq!(signals.emit(RevalidateSignal::Focus), 0);
    }
}
