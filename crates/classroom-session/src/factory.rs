//! Process-wide session factory.
//!
//! Owns what every session shares: configuration, the control-plane
//! transport, the media engine and the stream-id generator. Each session
//! gets its own registry, since the registry is bound to one room.

use crate::actors::{SessionActor, SessionHandle};
use crate::config::SessionConfig;
use crate::control_plane::{ControlPlane, ControlPlaneHelper};
use crate::ids::StreamIdGenerator;
use crate::media::MediaEngine;
use crate::registry::Registry;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct SessionFactory {
    config: SessionConfig,
    helper: ControlPlaneHelper,
    engine: Arc<dyn MediaEngine>,
    ids: Arc<StreamIdGenerator>,
    cancel_token: CancellationToken,
}

impl SessionFactory {
    /// Create a factory with an entropy-seeded stream-id generator.
    pub fn new(
        config: SessionConfig,
        control_plane: Arc<dyn ControlPlane>,
        engine: Arc<dyn MediaEngine>,
    ) -> Self {
        Self::with_generator(config, control_plane, engine, StreamIdGenerator::from_entropy())
    }

    /// Create a factory whose stream ids are reproducible.
    pub fn with_seed(
        config: SessionConfig,
        control_plane: Arc<dyn ControlPlane>,
        engine: Arc<dyn MediaEngine>,
        seed: u64,
    ) -> Self {
        Self::with_generator(
            config,
            control_plane,
            engine,
            StreamIdGenerator::with_seed(seed),
        )
    }

    fn with_generator(
        config: SessionConfig,
        control_plane: Arc<dyn ControlPlane>,
        engine: Arc<dyn MediaEngine>,
        ids: StreamIdGenerator,
    ) -> Self {
        let helper = ControlPlaneHelper::new(
            control_plane,
            config.app_id.clone(),
            config.auth_token.clone(),
            config.operation_timeout,
        );
        Self {
            config,
            helper,
            engine,
            ids: Arc::new(ids),
            cancel_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Spawn a session executor bound to `registry`.
    ///
    /// The session is cancelled together with the factory via
    /// [`SessionFactory::shutdown`], or on its own via
    /// [`SessionHandle::cancel`].
    pub fn create_session(&self, registry: Arc<dyn Registry>) -> (SessionHandle, JoinHandle<()>) {
        let (handle, task) = SessionActor::spawn(
            &self.config,
            self.helper.clone(),
            Arc::clone(&self.engine),
            registry,
            Arc::clone(&self.ids),
            self.cancel_token.child_token(),
        );
        info!(
            target: "classroom.actor.session",
            session_id = %handle.session_id(),
            "Session created"
        );
        (handle, task)
    }

    /// Cancel every session this factory created. Connected sessions are
    /// left on the way out.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// Number of stream ids issued so far across all sessions.
    #[must_use]
    pub fn issued_stream_ids(&self) -> usize {
        self.ids.issued_count()
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("config", &self.config)
            .field("issued_stream_ids", &self.ids.issued_count())
            .finish_non_exhaustive()
    }
}
