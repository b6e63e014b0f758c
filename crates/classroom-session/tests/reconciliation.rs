//! Membership, stream and property reconciliation through a live executor.
//!
//! Synthetic registry pushes for local and remote owners verify that:
//! - Local changes only ever surface as `Local*` events
//! - Property changes for one key arrive in order
//! - The chat permission is kept out of the property set
//! - Messages authored locally are not echoed

#![allow(clippy::unwrap_used, clippy::expect_used)]

use classroom_session::model::{PropertyUpdate, Role, StreamId, UserId, CHAT_ALLOWED_KEY};
use classroom_session::registry::{
    RegistryEvent, RoomStatusChange, ScenePropertyChange, StreamsChange, UserListChange,
    UserPropertyChange,
};
use classroom_session::SessionEvent;
use classroom_test_utils::*;
use serde_json::json;

async fn joined_with_bob() -> TestSession {
    let registry = MockRegistry::with_snapshot(snapshot(
        vec![
            user_entry("alice", Role::Participant),
            user_entry("bob", Role::Host),
        ],
        Vec::new(),
    ));
    let session =
        TestSession::start(MockControlPlane::accepting(), MockMediaEngine::new(), registry).await;
    session.join_as("alice", Role::Participant).await.unwrap();
    session.observer.clear();
    session
}

/// Round trip through the mailbox so earlier pushes are applied.
async fn settle(session: &TestSession) {
    session.handle.connection_state().await.unwrap();
}

// ============================================================================
// Local / remote exclusivity
// ============================================================================

#[tokio::test]
async fn test_local_streams_never_surface_as_remote() {
    let session = joined_with_bob().await;

    session
        .registry
        .push(RegistryEvent::StreamsChanged(StreamsChange {
            added: vec![camera_stream("300", "alice"), camera_stream("301", "bob")],
            ..StreamsChange::default()
        }))
        .await;
    settle(&session).await;

    let events = session.observer.events();
    assert_eq!(session.observer.count("local_stream_added"), 1);
    assert_eq!(session.observer.count("remote_streams_added"), 1);
    for event in &events {
        if let SessionEvent::RemoteStreamsAdded { streams, .. } = event {
            assert_eq!(streams.len(), 1);
            assert!(streams.iter().all(|s| s.owner_id == UserId::new("bob")));
        }
        if let SessionEvent::LocalStreamAdded { stream, .. } = event {
            assert_eq!(stream.stream_id, StreamId::new("300"));
        }
    }

    session
        .registry
        .push(RegistryEvent::StreamsChanged(StreamsChange {
            removed: vec![camera_stream("300", "alice")],
            ..StreamsChange::default()
        }))
        .await;
    settle(&session).await;

    assert_eq!(session.observer.count("local_stream_removed"), 1);
    assert_eq!(session.observer.count("remote_streams_removed"), 0);
}

#[tokio::test]
async fn test_local_user_is_excluded_from_membership_events() {
    let session = joined_with_bob().await;

    session
        .registry
        .push(RegistryEvent::UserListChanged(UserListChange {
            users: vec![
                user_entry("alice", Role::Participant),
                user_entry("carol", Role::Participant),
            ],
            is_add: true,
            operator: None,
        }))
        .await;
    session
        .registry
        .push(RegistryEvent::UserListChanged(UserListChange {
            users: vec![user_entry("alice", Role::Participant)],
            is_add: false,
            operator: None,
        }))
        .await;
    settle(&session).await;

    let events = session.observer.events();
    assert_eq!(events.len(), 1);
    match events.first().unwrap() {
        SessionEvent::RemoteUsersJoined { users } => {
            assert_eq!(users.len(), 1);
            assert_eq!(users.first().unwrap().user_id, UserId::new("carol"));
        }
        other => unreachable!("unexpected event {other:?}"),
    }
    assert!(session.handle.local_user().await.unwrap().is_some());
}

#[tokio::test]
async fn test_local_property_changes_route_to_the_local_handler() {
    let session = joined_with_bob().await;

    session
        .registry
        .push(RegistryEvent::UserPropertiesChanged(UserPropertyChange {
            user_id: UserId::new("alice"),
            update: PropertyUpdate::upsert("hand_raised", json!(true)),
            operator_id: Some("bob".to_string()),
        }))
        .await;
    settle(&session).await;

    assert_eq!(
        session.observer.names(),
        vec!["local_user_properties_updated"]
    );
    let local = session.handle.local_user().await.unwrap().unwrap();
    assert_eq!(local.properties.get("hand_raised"), Some(&json!(true)));
}

// ============================================================================
// Departure
// ============================================================================

#[tokio::test]
async fn test_departing_user_takes_their_streams() {
    let session = joined_with_bob().await;
    session
        .registry
        .push(RegistryEvent::StreamsChanged(StreamsChange {
            added: vec![camera_stream("301", "bob")],
            ..StreamsChange::default()
        }))
        .await;
    session.observer.clear();

    let operator = user_ref("alice", Role::Participant);
    session
        .registry
        .push(RegistryEvent::UserListChanged(UserListChange {
            users: vec![user_entry("bob", Role::Host)],
            is_add: false,
            operator: Some(operator.clone()),
        }))
        .await;
    settle(&session).await;

    assert_eq!(
        session.observer.names(),
        vec!["remote_users_left", "remote_streams_removed"]
    );
    match session.observer.events().first().unwrap() {
        SessionEvent::RemoteUsersLeft { users, operator: op } => {
            assert_eq!(users.first().unwrap().user_name, "bob");
            assert_eq!(op.as_ref(), Some(&operator));
        }
        other => unreachable!("unexpected event {other:?}"),
    }
    assert!(session.handle.full_stream_list().await.unwrap().is_empty());
    assert_eq!(
        session.handle.session_info().await.unwrap().room_status.online_users_count,
        1
    );
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn test_property_changes_for_one_key_arrive_in_order() {
    let session = joined_with_bob().await;

    for value in ["v1", "v2", "v3"] {
        session
            .registry
            .push(RegistryEvent::UserPropertiesChanged(UserPropertyChange {
                user_id: UserId::new("bob"),
                update: PropertyUpdate::upsert("status", json!(value)),
                operator_id: None,
            }))
            .await;
    }
    settle(&session).await;

    let seen: Vec<serde_json::Value> = session
        .observer
        .events()
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::RemoteUserPropertiesUpdated { changed, .. } => {
                changed.get("status").cloned()
            }
            _ => None,
        })
        .collect();
    assert_eq!(seen, vec![json!("v1"), json!("v2"), json!("v3")]);

    let bob = session
        .handle
        .user_list(Role::Host)
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(bob.properties.get("status"), Some(&json!("v3")));
}

#[tokio::test]
async fn test_chat_permission_is_kept_out_of_properties() {
    let session = joined_with_bob().await;

    session
        .registry
        .push(RegistryEvent::UserPropertiesChanged(UserPropertyChange {
            user_id: UserId::new("bob"),
            update: PropertyUpdate::upsert(CHAT_ALLOWED_KEY, json!(false)),
            operator_id: Some("alice".to_string()),
        }))
        .await;
    settle(&session).await;

    let bob = session
        .handle
        .user_list(Role::Host)
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert!(!bob.chat_allowed);
    assert!(!bob.properties.contains_key(CHAT_ALLOWED_KEY));
    assert_eq!(session.observer.count("remote_user_properties_updated"), 1);

    session
        .registry
        .push(RegistryEvent::UserPropertiesChanged(UserPropertyChange {
            user_id: UserId::new("bob"),
            update: PropertyUpdate::delete([CHAT_ALLOWED_KEY]),
            operator_id: None,
        }))
        .await;
    settle(&session).await;

    let bob = session
        .handle
        .user_list(Role::Host)
        .await
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert!(bob.chat_allowed);
}

#[tokio::test]
async fn test_room_properties_and_status() {
    let session = joined_with_bob().await;

    session
        .registry
        .push(RegistryEvent::ScenePropertiesChanged(ScenePropertyChange {
            update: PropertyUpdate::upsert("topic", json!("optics"))
                .with_cause(json!({"cmd": 1})),
            operator_id: Some("bob".to_string()),
        }))
        .await;
    session
        .registry
        .push(RegistryEvent::RoomStatusChanged(RoomStatusChange {
            course_state: Some(classroom_session::model::CourseState::Started),
            start_time: Some(1_700_000_000_000),
            chat_allowed: None,
            operator: Some(user_ref("bob", Role::Host)),
        }))
        .await;
    settle(&session).await;

    assert_eq!(
        session.observer.names(),
        vec!["room_properties_updated", "room_status_updated"]
    );
    let info = session.handle.session_info().await.unwrap();
    assert_eq!(info.room_properties.get("topic"), Some(&json!("optics")));
    assert_eq!(
        info.room_status.course_state,
        classroom_session::model::CourseState::Started
    );
    assert_eq!(info.room_status.start_time, Some(1_700_000_000_000));
}

// ============================================================================
// Messages
// ============================================================================

#[tokio::test]
async fn test_messages_from_others_are_delivered_and_own_are_not() {
    let session = joined_with_bob().await;

    session
        .registry
        .push(RegistryEvent::RoomMessage(chat_message(
            user_ref("bob", Role::Host),
            "open your books",
        )))
        .await;
    session
        .registry
        .push(RegistryEvent::RoomMessage(chat_message(
            user_ref("alice", Role::Participant),
            "ok",
        )))
        .await;
    session
        .registry
        .push(RegistryEvent::UserMessage(chat_message(
            user_ref("bob", Role::Host),
            "see me after class",
        )))
        .await;
    settle(&session).await;

    assert_eq!(
        session.observer.names(),
        vec!["room_message_received", "user_message_received"]
    );
}

#[tokio::test]
async fn test_unregistered_observer_stops_receiving() {
    let session = joined_with_bob().await;
    let extra = RecordingObserver::new();
    let id = session
        .handle
        .register_event_handler(extra.clone())
        .await
        .unwrap();

    session
        .registry
        .push(RegistryEvent::RoomMessage(chat_message(
            user_ref("bob", Role::Host),
            "first",
        )))
        .await;
    settle(&session).await;
    assert!(session.handle.unregister_event_handler(id).await.unwrap());
    assert!(!session.handle.unregister_event_handler(id).await.unwrap());

    session
        .registry
        .push(RegistryEvent::RoomMessage(chat_message(
            user_ref("bob", Role::Host),
            "second",
        )))
        .await;
    settle(&session).await;

    assert_eq!(extra.count("room_message_received"), 1);
    assert_eq!(session.observer.count("room_message_received"), 2);
}
