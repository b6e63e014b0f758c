//! Pre-configured test data for session testing.
//!
//! Provides builders and test data for:
//! - Session configuration
//! - Join options for each role
//! - Registry users and streams
//! - Control-plane enter payloads
//! - Chat messages

use classroom_session::control_plane::EnterResponse;
use classroom_session::model::{
    ChatMessage, CourseState, JoinOptions, Properties, Role, RoomId, RoomStatus, SourceKind,
    Stream, StreamId, UserId, UserRef,
};
use classroom_session::registry::{RegistrySnapshot, UserEntry};
use classroom_session::SessionConfig;
use common::secret::SecretString;
use std::time::Duration;
use uuid::Uuid;

/// Room every fixture joins.
pub const TEST_ROOM: &str = "room-101";

/// Configuration for tests: short timeout, no auto-subscribe.
#[must_use]
pub fn test_config() -> SessionConfig {
    SessionConfig {
        app_id: "test-app".to_string(),
        auth_token: SecretString::from("test-auth-token"),
        region: "global".to_string(),
        reuse_default_connection: true,
        operation_timeout: Duration::from_secs(5),
        mailbox_capacity: 64,
        auto_subscribe: false,
    }
}

/// Join options for `user_id` in [`TEST_ROOM`].
#[must_use]
pub fn join_options(user_id: &str, role: Role) -> JoinOptions {
    JoinOptions {
        user_id: UserId::new(user_id),
        user_name: user_id.to_string(),
        room_id: RoomId::new(TEST_ROOM),
        room_name: "Physics 101".to_string(),
        role: Some(role),
        user_properties: Properties::new(),
    }
}

/// Enter payload assigning `stream_id` (empty means the role is full).
#[must_use]
pub fn enter_response(stream_id: &str) -> EnterResponse {
    EnterResponse {
        stream_id: StreamId::new(stream_id),
        media_token: Some(SecretString::from(format!("rtc-{}", Uuid::new_v4()))),
        room_name: "Physics 101".to_string(),
        course_state: CourseState::Pending,
        start_time: None,
        room_chat_allowed: true,
        user_chat_allowed: true,
        room_properties: Properties::new(),
        user_properties: Properties::new(),
    }
}

/// Registry entry for a user without properties.
#[must_use]
pub fn user_entry(user_id: &str, role: Role) -> UserEntry {
    UserEntry {
        user_id: UserId::new(user_id),
        user_name: user_id.to_string(),
        role,
        properties: Properties::new(),
    }
}

#[must_use]
pub fn user_ref(user_id: &str, role: Role) -> UserRef {
    user_entry(user_id, role).to_ref()
}

/// Camera stream with both tracks enabled.
#[must_use]
pub fn camera_stream(stream_id: &str, owner: &str) -> Stream {
    Stream {
        stream_id: StreamId::new(stream_id),
        owner_id: UserId::new(owner),
        stream_name: "camera".to_string(),
        source: SourceKind::Camera,
        has_audio: true,
        has_video: true,
    }
}

/// Snapshot containing `users` and `streams`, with a room status that
/// matches [`enter_response`].
#[must_use]
pub fn snapshot(users: Vec<UserEntry>, streams: Vec<Stream>) -> RegistrySnapshot {
    RegistrySnapshot {
        users,
        streams,
        room_properties: Properties::new(),
        room_status: RoomStatus {
            course_state: CourseState::Pending,
            start_time: None,
            chat_allowed: true,
            online_users_count: 0,
        },
    }
}

/// Chat message stamped with the current wall clock.
#[must_use]
pub fn chat_message(from: UserRef, text: &str) -> ChatMessage {
    ChatMessage {
        from,
        text: text.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    }
}
