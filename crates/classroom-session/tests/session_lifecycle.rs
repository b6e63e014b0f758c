//! Connection state machine tests.
//!
//! Drives a real session executor against mock collaborators to verify:
//! - Join, full-role rejection and join failure transitions
//! - Leave before join and repeated leave
//! - Join while a join is in flight
//! - Leave while the enter call is in flight (epoch drop)
//! - Signaling disconnect, reconnect and abort

#![allow(clippy::unwrap_used, clippy::expect_used)]

use classroom_session::model::{ConnectionState, JoinOptions, LocalStreamConfig, Role, UserId};
use classroom_session::registry::SignalingState;
use classroom_session::EduError;
use classroom_test_utils::*;
use std::time::Duration;

/// Route session logs to the test harness (`RUST_LOG=classroom=debug`).
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Join
// ============================================================================

#[tokio::test]
async fn test_happy_path_join() {
    init_tracing();
    let registry = MockRegistry::with_snapshot(snapshot(
        vec![
            user_entry("alice", Role::Participant),
            user_entry("bob", Role::Host),
        ],
        vec![camera_stream("200", "bob")],
    ));
    let session =
        TestSession::start(MockControlPlane::accepting(), MockMediaEngine::new(), registry).await;

    session.join_as("alice", Role::Participant).await.unwrap();

    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Connected
    );
    let info = session.handle.session_info().await.unwrap();
    assert_eq!(info.room_status.online_users_count, 2);
    assert_eq!(info.room_info.room_name, "Physics 101");

    assert_eq!(
        session.observer.states(),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
    assert_eq!(session.observer.count("remote_users_joined"), 1);
    assert_eq!(session.observer.count("remote_streams_added"), 1);

    assert_eq!(session.control_plane.call_count("enter"), 1);
    assert_eq!(session.registry.start_count(), 1);
    assert_eq!(session.registry.refresh_count(), 1);

    let users = session.handle.full_user_list().await.unwrap();
    assert_eq!(users.len(), 2);
    assert_eq!(users.first().unwrap().user_id, UserId::new("alice"));
    assert_eq!(session.handle.user_count(Role::Host).await.unwrap(), 1);
}

#[tokio::test]
async fn test_enter_call_carries_session_context() {
    let session = TestSession::accepting().await;
    session.join_as("alice", Role::Host).await.unwrap();

    let calls = session.control_plane.calls();
    let enter = calls.first().unwrap();
    assert_eq!(enter.ctx.app_id, "test-app");
    assert_eq!(enter.ctx.room_id.as_str(), TEST_ROOM);
    assert_eq!(enter.ctx.user_id.as_str(), "alice");

    let context = session.registry.context().unwrap();
    assert_eq!(context.local_user.role, Role::Host);
}

#[tokio::test]
async fn test_full_role_rejection() {
    let session = TestSession::start(
        MockControlPlane::builder().role_full().build(),
        MockMediaEngine::new(),
        MockRegistry::new(),
    )
    .await;

    let result = session.join_as("carol", Role::Assistant).await;

    assert_eq!(result, Err(EduError::RoleFull));
    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::FullRoleAborted
    );
    assert_eq!(
        session.observer.states(),
        vec![ConnectionState::Connecting, ConnectionState::FullRoleAborted]
    );
    assert!(matches!(
        session.handle.user_service().await,
        Err(EduError::InvalidState(_))
    ));
    assert_eq!(session.registry.start_count(), 0);
}

#[tokio::test]
async fn test_enter_failure_aborts_and_join_can_be_retried() {
    let session = TestSession::start(
        MockControlPlane::builder()
            .reject_enter(EduError::control_plane(503, "unavailable"))
            .build(),
        MockMediaEngine::new(),
        MockRegistry::new(),
    )
    .await;

    let result = session.join_as("alice", Role::Participant).await;
    assert!(matches!(result, Err(EduError::ControlPlane { code: 503, .. })));
    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Aborted
    );

    // Leaving after the failure keeps the observer for the retry
    session.handle.leave_session().await.unwrap();
    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Aborted
    );

    session.control_plane.set_enter(Ok(enter_response("s2")));
    session.join_as("alice", Role::Participant).await.unwrap();

    assert_eq!(
        session.observer.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Aborted,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
}

#[tokio::test]
async fn test_leave_after_full_role_rejection_is_a_noop() {
    let session = TestSession::start(
        MockControlPlane::builder().role_full().build(),
        MockMediaEngine::new(),
        MockRegistry::new(),
    )
    .await;
    assert_eq!(
        session.join_as("carol", Role::Participant).await,
        Err(EduError::RoleFull)
    );
    session.observer.clear();

    session.handle.leave_session().await.unwrap();

    assert!(session.observer.events().is_empty());
    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::FullRoleAborted
    );
    assert_eq!(session.registry.stop_count(), 0);
}

#[tokio::test]
async fn test_registry_start_failure_aborts_join() {
    let registry = MockRegistry::new();
    registry.set_start_error(Some(EduError::Signaling("handshake refused".to_string())));
    let session =
        TestSession::start(MockControlPlane::accepting(), MockMediaEngine::new(), registry).await;

    let result = session.join_as("alice", Role::Participant).await;

    assert!(matches!(result, Err(EduError::Signaling(_))));
    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Aborted
    );
}

#[tokio::test]
async fn test_invalid_options_fail_without_state_change() {
    let session = TestSession::accepting().await;

    let missing_user = JoinOptions {
        user_id: UserId::new(""),
        ..join_options("alice", Role::Participant)
    };
    let missing_role = JoinOptions {
        role: None,
        ..join_options("alice", Role::Participant)
    };

    assert!(matches!(
        session.handle.join_session(missing_user).await,
        Err(EduError::Validation(_))
    ));
    assert!(matches!(
        session.handle.join_session(missing_role).await,
        Err(EduError::Validation(_))
    ));

    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Disconnected
    );
    assert!(session.observer.events().is_empty());
    assert_eq!(session.control_plane.call_count("enter"), 0);
}

#[tokio::test]
async fn test_join_while_joining_is_a_state_error() {
    let session = TestSession::start(
        MockControlPlane::builder().hold("enter").build(),
        MockMediaEngine::new(),
        MockRegistry::new(),
    )
    .await;

    let handle = session.handle.clone();
    let first = tokio::spawn(async move {
        handle
            .join_session(join_options("alice", Role::Participant))
            .await
    });
    assert!(session.control_plane.wait_for_calls("enter", 1).await);

    let second = session.join_as("alice", Role::Participant).await;
    assert!(matches!(second, Err(EduError::InvalidState(_))));
    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Connecting
    );

    session.control_plane.release("enter");
    first.await.unwrap().unwrap();

    let third = session.join_as("alice", Role::Participant).await;
    assert!(matches!(third, Err(EduError::InvalidState(_))));
    assert_eq!(session.control_plane.call_count("enter"), 1);
}

// ============================================================================
// Leave
// ============================================================================

#[tokio::test]
async fn test_leave_before_join_is_a_noop() {
    let session = TestSession::accepting().await;

    session.handle.leave_session().await.unwrap();

    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Disconnected
    );
    assert!(session.observer.events().is_empty());
    assert_eq!(session.registry.stop_count(), 0);
}

#[tokio::test]
async fn test_leave_twice_tears_down_once() {
    let session = TestSession::accepting().await;
    let service = session.joined("alice", Role::Participant).await;
    service
        .create_local_stream(LocalStreamConfig::default())
        .await
        .unwrap();

    session.handle.leave_session().await.unwrap();
    session.handle.leave_session().await.unwrap();

    assert_eq!(session.registry.stop_count(), 1);
    assert_eq!(session.engine.call_count("release"), 1);
    assert_eq!(
        session.observer.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ]
    );
    assert!(session.handle.full_user_list().await.unwrap().is_empty());
    assert!(session.handle.local_user().await.unwrap().is_none());

    // Observers were cleared by the first leave
    session.join_as("alice", Role::Participant).await.unwrap();
    assert_eq!(session.observer.states().len(), 3);
}

#[tokio::test]
async fn test_leave_rejects_commands_from_existing_services() {
    let session = TestSession::accepting().await;
    let service = session.joined("alice", Role::Participant).await;

    session.handle.leave_session().await.unwrap();

    let result = service.send_room_message("still here?").await;
    assert!(matches!(result, Err(EduError::InvalidState(_))));
    assert_eq!(session.control_plane.call_count("send_room_message"), 0);
}

#[tokio::test]
async fn test_leave_while_entering_drops_the_late_response() {
    let session = TestSession::start(
        MockControlPlane::builder().hold("enter").build(),
        MockMediaEngine::new(),
        MockRegistry::new(),
    )
    .await;

    let handle = session.handle.clone();
    let join = tokio::spawn(async move {
        handle
            .join_session(join_options("alice", Role::Participant))
            .await
    });
    assert!(session.control_plane.wait_for_calls("enter", 1).await);

    session.handle.leave_session().await.unwrap();
    assert!(matches!(
        join.await.unwrap(),
        Err(EduError::InvalidState(_))
    ));

    session.control_plane.release("enter");
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Disconnected
    );
    assert_eq!(session.registry.start_count(), 0);
}

#[tokio::test]
async fn test_cancel_leaves_a_connected_session() {
    let session = TestSession::accepting().await;
    session.join_as("alice", Role::Participant).await.unwrap();

    session.handle.cancel();
    session.task.await.unwrap();

    assert_eq!(session.registry.stop_count(), 1);
    assert_eq!(
        session.observer.states().last(),
        Some(&ConnectionState::Disconnected)
    );
}

// ============================================================================
// Signaling
// ============================================================================

#[tokio::test]
async fn test_reconnect_without_changes_fires_no_membership_events() {
    let registry = MockRegistry::with_snapshot(snapshot(
        vec![
            user_entry("alice", Role::Participant),
            user_entry("bob", Role::Host),
        ],
        vec![camera_stream("200", "bob")],
    ));
    let session =
        TestSession::start(MockControlPlane::accepting(), MockMediaEngine::new(), registry).await;
    session.join_as("alice", Role::Participant).await.unwrap();
    session.observer.clear();

    session.registry.signal(SignalingState::Disconnected).await;
    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Reconnecting
    );

    session.registry.signal(SignalingState::Connected).await;
    assert!(session.registry.wait_for_refreshes(2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Connected
    );
    assert_eq!(
        session.observer.names(),
        vec!["connection_state_changed", "connection_state_changed"]
    );
    assert_eq!(
        session.observer.states(),
        vec![ConnectionState::Reconnecting, ConnectionState::Connected]
    );
    assert_eq!(session.handle.full_user_list().await.unwrap().len(), 2);
    assert_eq!(session.handle.full_stream_list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_reconnect_reports_changes_made_during_the_gap() {
    init_tracing();
    let registry = MockRegistry::with_snapshot(snapshot(
        vec![
            user_entry("alice", Role::Participant),
            user_entry("bob", Role::Host),
        ],
        vec![camera_stream("200", "bob")],
    ));
    let session =
        TestSession::start(MockControlPlane::accepting(), MockMediaEngine::new(), registry).await;
    session.join_as("alice", Role::Participant).await.unwrap();
    session.observer.clear();

    session.registry.signal(SignalingState::Disconnected).await;
    session.registry.set_snapshot(snapshot(
        vec![
            user_entry("alice", Role::Participant),
            user_entry("bob", Role::Host),
            user_entry("carol", Role::Participant),
        ],
        Vec::new(),
    ));
    session.registry.signal(SignalingState::Connected).await;

    assert!(session.observer.wait_for("remote_users_joined", 1).await);
    assert!(session.observer.wait_for("remote_streams_removed", 1).await);
    assert_eq!(session.observer.count("remote_users_left"), 0);
    assert_eq!(
        session.handle.session_info().await.unwrap().room_status.online_users_count,
        3
    );
}

#[tokio::test]
async fn test_signaling_abort_aborts_the_session() {
    init_tracing();
    let session = TestSession::accepting().await;
    session.join_as("alice", Role::Participant).await.unwrap();

    session
        .registry
        .signal(SignalingState::Aborted("kicked".to_string()))
        .await;

    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Aborted
    );
    assert_eq!(session.registry.stop_count(), 1);
    assert!(matches!(
        session.handle.user_service().await,
        Err(EduError::InvalidState(_))
    ));

    // Nothing left to tear down: leave succeeds without a transition
    session.handle.leave_session().await.unwrap();
    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Aborted
    );
    assert_eq!(session.registry.stop_count(), 1);
    assert_eq!(
        session.observer.states().last(),
        Some(&ConnectionState::Aborted)
    );
}

#[tokio::test]
async fn test_stale_registry_events_are_dropped_after_rejoin() {
    let session = TestSession::accepting().await;
    session.join_as("alice", Role::Participant).await.unwrap();
    let stale_sink = session.registry.sink().unwrap();

    session.handle.leave_session().await.unwrap();
    session.join_as("alice", Role::Participant).await.unwrap();
    let observer = RecordingObserver::new();
    session
        .handle
        .register_event_handler(observer.clone())
        .await
        .unwrap();

    stale_sink
        .signaling(SignalingState::Disconnected)
        .await
        .unwrap();

    assert_eq!(
        session.handle.connection_state().await.unwrap(),
        ConnectionState::Connected
    );
    assert!(observer.events().is_empty());
}
