//! One session wired to mock collaborators.

use crate::fixtures::{join_options, test_config};
use crate::mock_control_plane::MockControlPlane;
use crate::mock_media::MockMediaEngine;
use crate::mock_registry::MockRegistry;
use crate::observer::RecordingObserver;
use classroom_session::model::Role;
use classroom_session::{EduError, SessionConfig, SessionFactory, SessionHandle, UserService};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Session under test plus handles on every mock behind it.
pub struct TestSession {
    pub factory: SessionFactory,
    pub handle: SessionHandle,
    pub task: JoinHandle<()>,
    pub control_plane: Arc<MockControlPlane>,
    pub engine: Arc<MockMediaEngine>,
    pub registry: Arc<MockRegistry>,
    pub observer: Arc<RecordingObserver>,
}

impl TestSession {
    /// Spawn a session with [`test_config`] and a registered observer.
    pub async fn start(
        control_plane: Arc<MockControlPlane>,
        engine: Arc<MockMediaEngine>,
        registry: Arc<MockRegistry>,
    ) -> Self {
        Self::start_with_config(test_config(), control_plane, engine, registry).await
    }

    pub async fn start_with_config(
        config: SessionConfig,
        control_plane: Arc<MockControlPlane>,
        engine: Arc<MockMediaEngine>,
        registry: Arc<MockRegistry>,
    ) -> Self {
        let factory = SessionFactory::with_seed(
            config,
            control_plane.clone(),
            engine.clone(),
            42,
        );
        let (handle, task) = factory.create_session(registry.clone());
        let observer = RecordingObserver::new();
        handle
            .register_event_handler(observer.clone())
            .await
            .expect("register observer");

        Self {
            factory,
            handle,
            task,
            control_plane,
            engine,
            registry,
            observer,
        }
    }

    /// Session against accepting mocks and an empty room.
    pub async fn accepting() -> Self {
        Self::start(
            MockControlPlane::accepting(),
            MockMediaEngine::new(),
            MockRegistry::new(),
        )
        .await
    }

    /// Join [`crate::fixtures::TEST_ROOM`] as `user_id`.
    pub async fn join_as(&self, user_id: &str, role: Role) -> Result<(), EduError> {
        self.handle.join_session(join_options(user_id, role)).await
    }

    /// Join and return the user service, failing the test on error.
    pub async fn joined(&self, user_id: &str, role: Role) -> UserService {
        self.join_as(user_id, role).await.expect("join");
        self.handle.user_service().await.expect("user service")
    }
}
