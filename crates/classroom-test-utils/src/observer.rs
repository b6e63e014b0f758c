//! Observer that records every event it receives.

use classroom_session::model::ConnectionState;
use classroom_session::{SessionEvent, SessionObserver};
use std::sync::{Arc, Mutex};

/// Records events in delivery order.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingObserver {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every event so far, in delivery order.
    #[must_use]
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Event names so far, in delivery order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(SessionEvent::name).collect()
    }

    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.name() == name)
            .count()
    }

    /// States reported by `ConnectionStateChanged`, in order.
    #[must_use]
    pub fn states(&self) -> Vec<ConnectionState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::ConnectionStateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Wait until at least `count` events named `name` were seen.
    pub async fn wait_for(&self, name: &str, count: usize) -> bool {
        crate::wait_until(|| self.count(name) >= count).await
    }
}

impl SessionObserver for RecordingObserver {
    fn on_event(&self, event: &SessionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
