//! Media connection manager.
//!
//! Maps each stream id to at most one underlying media connection and
//! tracks where each stream is in its create → publish → unpublish →
//! destroy lifecycle. The manager is owned by the session executor and all
//! bookkeeping is synchronous; the connection calls themselves are async
//! and are spawned by the executor, which applies their outcome here once
//! the completion lands back in its mailbox.
//!
//! # Connections
//!
//! - One lazily created *default* connection per session carries every
//!   remote subscription, and the camera stream too when the session is
//!   configured to reuse it.
//! - A camera stream without reuse, and every screen-share stream, gets a
//!   dedicated connection that is released with the stream.

use crate::errors::EduError;
use crate::model::{
    CameraSource, MediaKinds, RoomId, ScreenSource, SourceKind, Stream, StreamId,
    SubscribeOptions, VideoQuality, ViewHandle,
};
use crate::observability::metrics;

use async_trait::async_trait;
use common::secret::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Record the outcome of one media connection call.
pub(crate) fn tracked(operation: &'static str, result: Result<(), EduError>) -> Result<(), EduError> {
    match &result {
        Ok(()) => metrics::record_media_call(operation, "success"),
        Err(e) => {
            metrics::record_media_call(operation, "error");
            warn!(
                target: "classroom.media",
                operation = operation,
                error_code = e.error_code(),
                error = %e,
                "Media call failed"
            );
        }
    }
    result
}

/// Why a connection is being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPurpose {
    /// Session-wide connection for subscriptions (and reused camera).
    Default,
    /// Dedicated camera connection.
    Camera,
    /// Dedicated screen-capture connection.
    Screen,
}

/// Parameters for creating one media connection.
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    pub room_id: RoomId,
    /// Stream the connection publishes, if dedicated.
    pub stream_id: Option<StreamId>,
    pub media_token: Option<SecretString>,
    pub region: String,
    pub purpose: ConnectionPurpose,
}

/// Changes to apply to an existing subscription. `None` leaves the field
/// as is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionDelta {
    pub audio: Option<bool>,
    pub video: Option<bool>,
    pub quality: Option<VideoQuality>,
}

impl SubscriptionDelta {
    /// Fields that differ between two option sets.
    #[must_use]
    pub fn between(current: SubscribeOptions, wanted: SubscribeOptions) -> Self {
        Self {
            audio: (current.audio != wanted.audio).then_some(wanted.audio),
            video: (current.video != wanted.video).then_some(wanted.video),
            quality: (current.quality != wanted.quality).then_some(wanted.quality),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none() && self.quality.is_none()
    }

    #[must_use]
    pub fn apply(&self, mut options: SubscribeOptions) -> SubscribeOptions {
        if let Some(audio) = self.audio {
            options.audio = audio;
        }
        if let Some(video) = self.video {
            options.video = video;
        }
        if let Some(quality) = self.quality {
            options.quality = quality;
        }
        options
    }
}

/// Factory for media connections. Construction is synchronous; a failure
/// is a media error surfaced to the caller of `CreateLocalStream`.
pub trait MediaEngine: Send + Sync {
    fn create_connection(&self, spec: ConnectionSpec) -> Result<Arc<dyn MediaConnection>, EduError>;
}

/// One underlying real-time media connection.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    async fn publish(&self, stream: &Stream) -> Result<(), EduError>;

    async fn unpublish(&self, stream_id: &StreamId) -> Result<(), EduError>;

    /// Enable or disable local capture tracks without tearing down.
    async fn set_local_enabled(
        &self,
        stream_id: &StreamId,
        kinds: MediaKinds,
        enabled: bool,
    ) -> Result<(), EduError>;

    async fn subscribe(&self, stream: &Stream, options: SubscribeOptions) -> Result<(), EduError>;

    async fn update_subscription(
        &self,
        stream_id: &StreamId,
        delta: SubscriptionDelta,
    ) -> Result<(), EduError>;

    async fn unsubscribe(&self, stream_id: &StreamId) -> Result<(), EduError>;

    async fn select_camera(
        &self,
        stream_id: &StreamId,
        camera: &CameraSource,
    ) -> Result<(), EduError>;

    async fn start_screen_capture(
        &self,
        stream_id: &StreamId,
        source: &ScreenSource,
    ) -> Result<(), EduError>;

    async fn stop_screen_capture(&self, stream_id: &StreamId) -> Result<(), EduError>;

    /// Bind or clear a render target. Synchronous: views are GUI-side.
    fn set_view(&self, stream_id: &StreamId, view: Option<ViewHandle>) -> Result<(), EduError>;

    /// Tear down the connection. Idempotent.
    fn release(&self);
}

/// Where a local stream is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPhase {
    Created,
    Published,
}

struct LocalSlot {
    connection: Arc<dyn MediaConnection>,
    owns_connection: bool,
    stream: Stream,
    phase: LocalPhase,
    camera: CameraSource,
}

/// What a subscribe request needs to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribePlan {
    /// Already subscribed with the same options.
    Noop,
    Fresh,
    /// Already subscribed; only the differing parts are re-applied.
    Delta(SubscriptionDelta),
}

/// Executor-owned stream → connection mapping.
pub struct MediaConnectionManager {
    engine: Arc<dyn MediaEngine>,
    region: String,
    reuse_default_connection: bool,
    room_id: Option<RoomId>,
    media_token: Option<SecretString>,
    default_connection: Option<Arc<dyn MediaConnection>>,
    local: HashMap<StreamId, LocalSlot>,
    subscriptions: HashMap<StreamId, SubscribeOptions>,
}

impl MediaConnectionManager {
    pub fn new(engine: Arc<dyn MediaEngine>, region: String, reuse_default_connection: bool) -> Self {
        Self {
            engine,
            region,
            reuse_default_connection,
            room_id: None,
            media_token: None,
            default_connection: None,
            local: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Bind to a joined room. Connections are created lazily afterwards.
    pub fn bind(&mut self, room_id: RoomId, media_token: Option<SecretString>) {
        self.room_id = Some(room_id);
        self.media_token = media_token;
    }

    fn create(
        &self,
        stream_id: Option<&StreamId>,
        purpose: ConnectionPurpose,
    ) -> Result<Arc<dyn MediaConnection>, EduError> {
        let room_id = self
            .room_id
            .clone()
            .ok_or_else(|| EduError::InvalidState("media is not bound to a room".to_string()))?;

        let spec = ConnectionSpec {
            room_id,
            stream_id: stream_id.cloned(),
            media_token: self.media_token.clone(),
            region: self.region.clone(),
            purpose,
        };

        match self.engine.create_connection(spec) {
            Ok(connection) => {
                metrics::record_media_call("create_connection", "success");
                debug!(
                    target: "classroom.media",
                    purpose = ?purpose,
                    "Media connection created"
                );
                Ok(connection)
            }
            Err(e) => {
                metrics::record_media_call("create_connection", "error");
                warn!(
                    target: "classroom.media",
                    purpose = ?purpose,
                    error = %e,
                    "Media connection construction failed"
                );
                Err(e)
            }
        }
    }

    /// The session-wide connection, created on first use.
    pub fn default_connection(&mut self) -> Result<Arc<dyn MediaConnection>, EduError> {
        if let Some(connection) = &self.default_connection {
            return Ok(Arc::clone(connection));
        }
        let connection = self.create(None, ConnectionPurpose::Default)?;
        self.default_connection = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Register a new local stream and bind it to a connection.
    pub fn create_local(
        &mut self,
        stream: Stream,
        camera: CameraSource,
    ) -> Result<Arc<dyn MediaConnection>, EduError> {
        if self.local.contains_key(&stream.stream_id) {
            return Err(EduError::InvalidState(format!(
                "stream {} already created",
                stream.stream_id
            )));
        }

        let (connection, owns_connection) = match stream.source {
            SourceKind::Screen => (
                self.create(Some(&stream.stream_id), ConnectionPurpose::Screen)?,
                true,
            ),
            _ if self.reuse_default_connection => (self.default_connection()?, false),
            _ => (
                self.create(Some(&stream.stream_id), ConnectionPurpose::Camera)?,
                true,
            ),
        };

        info!(
            target: "classroom.media",
            stream_id = %stream.stream_id,
            source = ?stream.source,
            dedicated = owns_connection,
            "Local stream created"
        );

        self.local.insert(
            stream.stream_id.clone(),
            LocalSlot {
                connection: Arc::clone(&connection),
                owns_connection,
                stream,
                phase: LocalPhase::Created,
                camera,
            },
        );
        Ok(connection)
    }

    #[must_use]
    pub fn is_local(&self, stream_id: &StreamId) -> bool {
        self.local.contains_key(stream_id)
    }

    #[must_use]
    pub fn local_phase(&self, stream_id: &StreamId) -> Option<LocalPhase> {
        self.local.get(stream_id).map(|slot| slot.phase)
    }

    #[must_use]
    pub fn local_stream(&self, stream_id: &StreamId) -> Option<Stream> {
        self.local.get(stream_id).map(|slot| slot.stream.clone())
    }

    #[must_use]
    pub fn local_connection(&self, stream_id: &StreamId) -> Option<Arc<dyn MediaConnection>> {
        self.local
            .get(stream_id)
            .map(|slot| Arc::clone(&slot.connection))
    }

    #[must_use]
    pub fn local_camera(&self, stream_id: &StreamId) -> Option<CameraSource> {
        self.local.get(stream_id).map(|slot| slot.camera.clone())
    }

    /// First local stream of the given source kind.
    #[must_use]
    pub fn local_by_source(&self, source: SourceKind) -> Option<Stream> {
        self.local
            .values()
            .find(|slot| slot.stream.source == source)
            .map(|slot| slot.stream.clone())
    }

    pub fn mark_published(&mut self, stream: &Stream) {
        if let Some(slot) = self.local.get_mut(&stream.stream_id) {
            slot.stream = stream.clone();
            slot.phase = LocalPhase::Published;
        }
    }

    pub fn mark_unpublished(&mut self, stream_id: &StreamId) {
        if let Some(slot) = self.local.get_mut(stream_id) {
            slot.phase = LocalPhase::Created;
        }
    }

    pub fn update_local(&mut self, stream: &Stream) {
        if let Some(slot) = self.local.get_mut(&stream.stream_id) {
            slot.stream = stream.clone();
        }
    }

    pub fn set_camera(&mut self, stream_id: &StreamId, camera: CameraSource) {
        if let Some(slot) = self.local.get_mut(stream_id) {
            slot.camera = camera;
        }
    }

    /// Forget a local stream, releasing its dedicated connection.
    pub fn remove_local(&mut self, stream_id: &StreamId) -> Option<Stream> {
        let slot = self.local.remove(stream_id)?;
        if slot.owns_connection {
            slot.connection.release();
        }
        debug!(
            target: "classroom.media",
            stream_id = %stream_id,
            "Local stream destroyed"
        );
        Some(slot.stream)
    }

    /// Decide what a subscribe request has to do.
    #[must_use]
    pub fn plan_subscribe(&self, stream_id: &StreamId, wanted: SubscribeOptions) -> SubscribePlan {
        match self.subscriptions.get(stream_id) {
            None => SubscribePlan::Fresh,
            Some(current) => {
                let delta = SubscriptionDelta::between(*current, wanted);
                if delta.is_empty() {
                    SubscribePlan::Noop
                } else {
                    SubscribePlan::Delta(delta)
                }
            }
        }
    }

    #[must_use]
    pub fn subscription(&self, stream_id: &StreamId) -> Option<SubscribeOptions> {
        self.subscriptions.get(stream_id).copied()
    }

    pub fn record_subscription(&mut self, stream_id: StreamId, options: SubscribeOptions) {
        self.subscriptions.insert(stream_id, options);
    }

    /// Returns true if the stream was subscribed.
    pub fn remove_subscription(&mut self, stream_id: &StreamId) -> bool {
        self.subscriptions.remove(stream_id).is_some()
    }

    /// Bind or clear the render target of a local or subscribed stream.
    pub fn set_view(&mut self, stream_id: &StreamId, view: Option<ViewHandle>) -> Result<(), EduError> {
        let connection = if let Some(slot) = self.local.get(stream_id) {
            Arc::clone(&slot.connection)
        } else if self.subscriptions.contains_key(stream_id) {
            self.default_connection()?
        } else {
            return Err(EduError::NotFound(format!(
                "stream {stream_id} is neither local nor subscribed"
            )));
        };

        let result = connection.set_view(stream_id, view);
        metrics::record_media_call("set_view", if result.is_ok() { "success" } else { "error" });
        result
    }

    /// Release every connection and forget all mappings.
    pub fn release_all(&mut self) {
        let local = self.local.len();
        let subscriptions = self.subscriptions.len();

        for (_, slot) in self.local.drain() {
            if slot.owns_connection {
                slot.connection.release();
            }
        }
        if let Some(connection) = self.default_connection.take() {
            connection.release();
        }
        self.subscriptions.clear();
        self.room_id = None;
        self.media_token = None;

        info!(
            target: "classroom.media",
            local_streams = local,
            subscriptions = subscriptions,
            "Media connections released"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::UserId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Conn {
        released: AtomicUsize,
        views: Mutex<Vec<(StreamId, Option<ViewHandle>)>>,
    }

    #[async_trait]
    impl MediaConnection for Conn {
        async fn publish(&self, _: &Stream) -> Result<(), EduError> {
            Ok(())
        }
        async fn unpublish(&self, _: &StreamId) -> Result<(), EduError> {
            Ok(())
        }
        async fn set_local_enabled(&self, _: &StreamId, _: MediaKinds, _: bool) -> Result<(), EduError> {
            Ok(())
        }
        async fn subscribe(&self, _: &Stream, _: SubscribeOptions) -> Result<(), EduError> {
            Ok(())
        }
        async fn update_subscription(&self, _: &StreamId, _: SubscriptionDelta) -> Result<(), EduError> {
            Ok(())
        }
        async fn unsubscribe(&self, _: &StreamId) -> Result<(), EduError> {
            Ok(())
        }
        async fn select_camera(&self, _: &StreamId, _: &CameraSource) -> Result<(), EduError> {
            Ok(())
        }
        async fn start_screen_capture(&self, _: &StreamId, _: &ScreenSource) -> Result<(), EduError> {
            Ok(())
        }
        async fn stop_screen_capture(&self, _: &StreamId) -> Result<(), EduError> {
            Ok(())
        }
        fn set_view(&self, stream_id: &StreamId, view: Option<ViewHandle>) -> Result<(), EduError> {
            self.views.lock().unwrap().push((stream_id.clone(), view));
            Ok(())
        }
        fn release(&self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Engine {
        created: Mutex<Vec<(ConnectionPurpose, Arc<Conn>)>>,
        fail: bool,
    }

    impl MediaEngine for Engine {
        fn create_connection(&self, spec: ConnectionSpec) -> Result<Arc<dyn MediaConnection>, EduError> {
            if self.fail {
                return Err(EduError::media(3, "no device"));
            }
            let conn = Arc::new(Conn::default());
            self.created.lock().unwrap().push((spec.purpose, conn.clone()));
            Ok(conn)
        }
    }

    fn stream(id: &str, source: SourceKind) -> Stream {
        Stream {
            stream_id: StreamId::new(id),
            owner_id: UserId::new("u-local"),
            stream_name: id.to_string(),
            source,
            has_audio: true,
            has_video: true,
        }
    }

    fn manager(engine: Arc<Engine>, reuse: bool) -> MediaConnectionManager {
        let mut manager = MediaConnectionManager::new(engine, "global".to_string(), reuse);
        manager.bind(RoomId::new("room-1"), None);
        manager
    }

    #[test]
    fn test_camera_reuses_default_connection() {
        let engine = Arc::new(Engine::default());
        let mut manager = manager(engine.clone(), true);

        manager
            .create_local(stream("1", SourceKind::Camera), CameraSource::Front)
            .unwrap();
        let default = manager.default_connection().unwrap();

        let created = engine.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, ConnectionPurpose::Default);
        drop(default);
    }

    #[test]
    fn test_screen_gets_dedicated_connection_released_on_remove() {
        let engine = Arc::new(Engine::default());
        let mut manager = manager(engine.clone(), true);

        manager
            .create_local(stream("2", SourceKind::Screen), CameraSource::Front)
            .unwrap();
        assert_eq!(manager.local_phase(&StreamId::new("2")), Some(LocalPhase::Created));

        manager.remove_local(&StreamId::new("2")).unwrap();
        let created = engine.created.lock().unwrap();
        assert_eq!(created[0].0, ConnectionPurpose::Screen);
        assert_eq!(created[0].1.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_create_is_state_error() {
        let engine = Arc::new(Engine::default());
        let mut manager = manager(engine, false);

        manager
            .create_local(stream("1", SourceKind::Camera), CameraSource::Front)
            .unwrap();
        let second = manager.create_local(stream("1", SourceKind::Camera), CameraSource::Back);
        assert!(matches!(second, Err(EduError::InvalidState(_))));
    }

    #[test]
    fn test_construction_failure_is_media_error() {
        let engine = Arc::new(Engine {
            fail: true,
            ..Engine::default()
        });
        let mut manager = manager(engine, false);

        let result = manager.create_local(stream("1", SourceKind::Camera), CameraSource::Front);
        assert!(matches!(result, Err(EduError::Media { .. })));
        assert!(!manager.is_local(&StreamId::new("1")));
    }

    #[test]
    fn test_unbound_manager_rejects_creation() {
        let mut manager =
            MediaConnectionManager::new(Arc::new(Engine::default()), "global".to_string(), true);
        let result = manager.create_local(stream("1", SourceKind::Camera), CameraSource::Front);
        assert!(matches!(result, Err(EduError::InvalidState(_))));
    }

    #[test]
    fn test_subscribe_plan_reapplies_only_differences() {
        let mut manager = manager(Arc::new(Engine::default()), true);
        let id = StreamId::new("remote-1");

        assert_eq!(
            manager.plan_subscribe(&id, SubscribeOptions::default()),
            SubscribePlan::Fresh
        );
        manager.record_subscription(id.clone(), SubscribeOptions::default());
        assert_eq!(
            manager.plan_subscribe(&id, SubscribeOptions::default()),
            SubscribePlan::Noop
        );

        let wanted = SubscribeOptions {
            video: false,
            ..SubscribeOptions::default()
        };
        assert_eq!(
            manager.plan_subscribe(&id, wanted),
            SubscribePlan::Delta(SubscriptionDelta {
                audio: None,
                video: Some(false),
                quality: None,
            })
        );
    }

    #[test]
    fn test_set_view_requires_known_stream() {
        let engine = Arc::new(Engine::default());
        let mut manager = manager(engine.clone(), true);
        let id = StreamId::new("remote-1");

        assert!(matches!(
            manager.set_view(&id, Some(ViewHandle(9))),
            Err(EduError::NotFound(_))
        ));

        manager.record_subscription(id.clone(), SubscribeOptions::default());
        manager.set_view(&id, Some(ViewHandle(9))).unwrap();
        assert!(manager.remove_subscription(&id));
        assert!(matches!(
            manager.set_view(&id, None),
            Err(EduError::NotFound(_))
        ));
    }

    #[test]
    fn test_release_all_releases_every_owned_connection() {
        let engine = Arc::new(Engine::default());
        let mut manager = manager(engine.clone(), false);

        manager
            .create_local(stream("1", SourceKind::Camera), CameraSource::Front)
            .unwrap();
        manager
            .create_local(stream("2", SourceKind::Screen), CameraSource::Front)
            .unwrap();
        manager.default_connection().unwrap();

        manager.release_all();

        let created = engine.created.lock().unwrap();
        assert_eq!(created.len(), 3);
        assert!(created
            .iter()
            .all(|(_, conn)| conn.released.load(Ordering::SeqCst) == 1));
        assert!(!manager.is_local(&StreamId::new("1")));
    }
}
