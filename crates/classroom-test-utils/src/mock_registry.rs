//! Mock membership & stream registry.
//!
//! Stands in for the signaling-driven registry. `refresh` answers with a
//! scripted snapshot; the sink handed over on `start` is captured so a
//! test can push synthetic deltas into the session.

use async_trait::async_trait;
use classroom_session::registry::{
    Registry, RegistryContext, RegistryEvent, RegistrySink, RegistrySnapshot, SignalingState,
};
use classroom_session::EduError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Mock registry.
#[derive(Default)]
pub struct MockRegistry {
    snapshot: Mutex<RegistrySnapshot>,
    refresh_error: Mutex<Option<EduError>>,
    start_error: Mutex<Option<EduError>>,
    sink: Mutex<Option<RegistrySink>>,
    context: Mutex<Option<RegistryContext>>,
    start_count: AtomicUsize,
    refresh_count: AtomicUsize,
    stop_count: AtomicUsize,
}

impl MockRegistry {
    /// Registry with an empty room.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_snapshot(crate::fixtures::snapshot(Vec::new(), Vec::new()))
    }

    /// Registry whose every refresh answers with `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: RegistrySnapshot) -> Arc<Self> {
        let registry = Self::default();
        *registry.snapshot.lock().unwrap() = snapshot;
        Arc::new(registry)
    }

    /// Replace the snapshot later refreshes answer with.
    pub fn set_snapshot(&self, snapshot: RegistrySnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    /// Make later refreshes fail (`None` to recover).
    pub fn set_refresh_error(&self, error: Option<EduError>) {
        *self.refresh_error.lock().unwrap() = error;
    }

    /// Make later starts fail (`None` to recover).
    pub fn set_start_error(&self, error: Option<EduError>) {
        *self.start_error.lock().unwrap() = error;
    }

    /// Sink captured on the most recent start, cleared on stop.
    #[must_use]
    pub fn sink(&self) -> Option<RegistrySink> {
        self.sink.lock().unwrap().clone()
    }

    #[must_use]
    pub fn context(&self) -> Option<RegistryContext> {
        self.context.lock().unwrap().clone()
    }

    /// Push an event through the captured sink.
    ///
    /// # Panics
    ///
    /// Panics if the registry is not started.
    pub async fn push(&self, event: RegistryEvent) {
        let sink = self.sink().expect("registry not started");
        sink.deliver(event).await.expect("deliver registry event");
    }

    pub async fn signal(&self, state: SignalingState) {
        self.push(RegistryEvent::Signaling(state)).await;
    }

    #[must_use]
    pub fn start_count(&self) -> usize {
        self.start_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn refresh_count(&self) -> usize {
        self.refresh_count.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn stop_count(&self) -> usize {
        self.stop_count.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` refreshes were served.
    pub async fn wait_for_refreshes(&self, count: usize) -> bool {
        crate::wait_until(|| self.refresh_count() >= count).await
    }
}

#[async_trait]
impl Registry for MockRegistry {
    fn start(&self, ctx: RegistryContext, sink: RegistrySink) -> Result<(), EduError> {
        self.start_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.start_error.lock().unwrap().clone() {
            return Err(error);
        }
        *self.context.lock().unwrap() = Some(ctx);
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    async fn refresh(&self) -> Result<RegistrySnapshot, EduError> {
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.refresh_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }

    fn stop(&self) {
        self.stop_count.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = None;
    }
}
