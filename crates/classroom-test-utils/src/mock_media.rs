//! Mock media engine for session testing.
//!
//! Every connection the engine creates appends to one shared call log, so
//! a test can assert on the exact media traffic of a session regardless
//! of which connection carried it.

use async_trait::async_trait;
use classroom_session::media::{
    ConnectionPurpose, ConnectionSpec, MediaConnection, MediaEngine, SubscriptionDelta,
};
use classroom_session::model::{
    CameraSource, MediaKinds, ScreenSource, Stream, StreamId, SubscribeOptions, ViewHandle,
};
use classroom_session::EduError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One recorded media connection call.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaCall {
    Publish(StreamId),
    Unpublish(StreamId),
    SetLocalEnabled {
        stream_id: StreamId,
        kinds: MediaKinds,
        enabled: bool,
    },
    Subscribe {
        stream_id: StreamId,
        options: SubscribeOptions,
    },
    UpdateSubscription {
        stream_id: StreamId,
        delta: SubscriptionDelta,
    },
    Unsubscribe(StreamId),
    SelectCamera {
        stream_id: StreamId,
        camera: CameraSource,
    },
    StartScreenCapture(StreamId),
    StopScreenCapture(StreamId),
    SetView {
        stream_id: StreamId,
        view: Option<ViewHandle>,
    },
    Release(ConnectionPurpose),
}

impl MediaCall {
    /// Operation name, matching the media metric label.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            MediaCall::Publish(_) => "publish",
            MediaCall::Unpublish(_) => "unpublish",
            MediaCall::SetLocalEnabled { .. } => "set_local_enabled",
            MediaCall::Subscribe { .. } => "subscribe",
            MediaCall::UpdateSubscription { .. } => "update_subscription",
            MediaCall::Unsubscribe(_) => "unsubscribe",
            MediaCall::SelectCamera { .. } => "select_camera",
            MediaCall::StartScreenCapture(_) => "start_screen_capture",
            MediaCall::StopScreenCapture(_) => "stop_screen_capture",
            MediaCall::SetView { .. } => "set_view",
            MediaCall::Release(_) => "release",
        }
    }
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<MediaCall>>,
    failures: Mutex<HashMap<&'static str, EduError>>,
}

impl Shared {
    fn record(&self, call: MediaCall) -> Result<(), EduError> {
        let operation = call.operation();
        self.calls.lock().unwrap().push(call);
        match self.failures.lock().unwrap().get(operation) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Mock media engine.
#[derive(Default)]
pub struct MockMediaEngine {
    shared: Arc<Shared>,
    specs: Mutex<Vec<ConnectionSpec>>,
    fail_creation: Mutex<Option<EduError>>,
}

impl MockMediaEngine {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Engine whose connection construction always fails.
    #[must_use]
    pub fn failing(error: EduError) -> Arc<Self> {
        let engine = Self::default();
        *engine.fail_creation.lock().unwrap() = Some(error);
        Arc::new(engine)
    }

    /// Fail every later connection call of `operation`.
    pub fn fail(&self, operation: &'static str, error: EduError) {
        self.shared
            .failures
            .lock()
            .unwrap()
            .insert(operation, error);
    }

    /// Let `operation` succeed again.
    pub fn recover(&self, operation: &'static str) {
        self.shared.failures.lock().unwrap().remove(operation);
    }

    /// Every connection call so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<MediaCall> {
        self.shared.calls.lock().unwrap().clone()
    }

    #[must_use]
    pub fn call_count(&self, operation: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.operation() == operation)
            .count()
    }

    /// Wait until at least `count` calls of `operation` were made.
    pub async fn wait_for_calls(&self, operation: &str, count: usize) -> bool {
        crate::wait_until(|| self.call_count(operation) >= count).await
    }

    /// Parameters of every connection created, in order.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionSpec> {
        self.specs.lock().unwrap().clone()
    }
}

impl MediaEngine for MockMediaEngine {
    fn create_connection(&self, spec: ConnectionSpec) -> Result<Arc<dyn MediaConnection>, EduError> {
        if let Some(error) = self.fail_creation.lock().unwrap().clone() {
            return Err(error);
        }
        let purpose = spec.purpose;
        self.specs.lock().unwrap().push(spec);
        Ok(Arc::new(MockMediaConnection {
            purpose,
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// Connection handed out by [`MockMediaEngine`].
pub struct MockMediaConnection {
    purpose: ConnectionPurpose,
    shared: Arc<Shared>,
}

#[async_trait]
impl MediaConnection for MockMediaConnection {
    async fn publish(&self, stream: &Stream) -> Result<(), EduError> {
        self.shared
            .record(MediaCall::Publish(stream.stream_id.clone()))
    }

    async fn unpublish(&self, stream_id: &StreamId) -> Result<(), EduError> {
        self.shared.record(MediaCall::Unpublish(stream_id.clone()))
    }

    async fn set_local_enabled(
        &self,
        stream_id: &StreamId,
        kinds: MediaKinds,
        enabled: bool,
    ) -> Result<(), EduError> {
        self.shared.record(MediaCall::SetLocalEnabled {
            stream_id: stream_id.clone(),
            kinds,
            enabled,
        })
    }

    async fn subscribe(&self, stream: &Stream, options: SubscribeOptions) -> Result<(), EduError> {
        self.shared.record(MediaCall::Subscribe {
            stream_id: stream.stream_id.clone(),
            options,
        })
    }

    async fn update_subscription(
        &self,
        stream_id: &StreamId,
        delta: SubscriptionDelta,
    ) -> Result<(), EduError> {
        self.shared.record(MediaCall::UpdateSubscription {
            stream_id: stream_id.clone(),
            delta,
        })
    }

    async fn unsubscribe(&self, stream_id: &StreamId) -> Result<(), EduError> {
        self.shared.record(MediaCall::Unsubscribe(stream_id.clone()))
    }

    async fn select_camera(
        &self,
        stream_id: &StreamId,
        camera: &CameraSource,
    ) -> Result<(), EduError> {
        self.shared.record(MediaCall::SelectCamera {
            stream_id: stream_id.clone(),
            camera: camera.clone(),
        })
    }

    async fn start_screen_capture(
        &self,
        stream_id: &StreamId,
        _source: &ScreenSource,
    ) -> Result<(), EduError> {
        self.shared
            .record(MediaCall::StartScreenCapture(stream_id.clone()))
    }

    async fn stop_screen_capture(&self, stream_id: &StreamId) -> Result<(), EduError> {
        self.shared
            .record(MediaCall::StopScreenCapture(stream_id.clone()))
    }

    fn set_view(&self, stream_id: &StreamId, view: Option<ViewHandle>) -> Result<(), EduError> {
        self.shared.record(MediaCall::SetView {
            stream_id: stream_id.clone(),
            view,
        })
    }

    fn release(&self) {
        let _ = self.shared.record(MediaCall::Release(self.purpose));
    }
}
