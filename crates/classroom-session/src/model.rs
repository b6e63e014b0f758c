//! Session data model.
//!
//! Everything here is a plain value. Snapshots handed out of the session
//! executor are copies, so nothing crosses the executor boundary by
//! reference.

use crate::errors::EduError;

pub use common::types::{RoomId, StreamId, UserId};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Property key carrying the session-local chat permission.
///
/// It is extracted into the per-user extra record (or the room status for
/// scene properties) instead of the generic property set.
pub const CHAT_ALLOWED_KEY: &str = "chatAllowed";

/// Key/value property set, last writer wins per key.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Aborted,
    FullRoleAborted,
}

impl ConnectionState {
    /// Returns the state as a string for logs and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Aborted => "aborted",
            ConnectionState::FullRoleAborted => "full_role_aborted",
        }
    }

    /// Terminal states require a fresh join; there is no auto-recovery.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Aborted | ConnectionState::FullRoleAborted
        )
    }

    /// A join is in progress or established.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }

    /// Whether the transition table allows moving to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::{
            Aborted, Connected, Connecting, Disconnected, FullRoleAborted, Reconnecting,
        };
        match (*self, next) {
            (Disconnected | Aborted | FullRoleAborted, Connecting)
            | (Connecting, Connected | FullRoleAborted | Disconnected)
            | (Connected, Reconnecting)
            | (Reconnecting, Connected)
            | (Connected | Reconnecting | Aborted | FullRoleAborted, Disconnected) => true,
            (current, Aborted) => !matches!(current, Aborted),
            _ => false,
        }
    }
}

/// Participant role. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Assistant,
    Participant,
}

impl Role {
    /// Returns the role as a string for logs and the wire.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Assistant => "assistant",
            Role::Participant => "participant",
        }
    }
}

/// Course lifecycle as driven by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CourseState {
    #[default]
    Pending,
    Started,
    Stopped,
}

/// Capture source of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Camera,
    Screen,
    #[default]
    None,
}

/// Video quality tier for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Low,
    #[default]
    High,
}

/// Camera device selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CameraSource {
    #[default]
    Front,
    Back,
    Device(String),
}

/// Screen-capture region selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreenSource {
    /// Whole display by index.
    Display(u32),
    /// Single window by native handle.
    Window(u64),
    /// Rectangle of a display.
    Region {
        display: u32,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
}

/// Opaque render target supplied by the GUI layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewHandle(pub u64);

/// Selects which tracks an enablement change applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaKinds {
    pub audio: bool,
    pub video: bool,
}

impl MediaKinds {
    pub const AUDIO: MediaKinds = MediaKinds {
        audio: true,
        video: false,
    };
    pub const VIDEO: MediaKinds = MediaKinds {
        audio: false,
        video: true,
    };
    pub const ALL: MediaKinds = MediaKinds {
        audio: true,
        video: true,
    };

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

/// Options for subscribing to a remote stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    pub audio: bool,
    pub video: bool,
    pub quality: VideoQuality,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            quality: VideoQuality::High,
        }
    }
}

/// Compact reference to a user, used for operators and message senders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub user_id: UserId,
    pub user_name: String,
    pub role: Role,
}

/// Snapshot of a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub user_id: UserId,
    pub user_name: String,
    pub role: Role,
    /// Custom properties, excluding the chat permission key.
    pub properties: Properties,
    /// Session-local chat permission (from the extra-property record).
    pub chat_allowed: bool,
}

impl User {
    #[must_use]
    pub fn to_ref(&self) -> UserRef {
        UserRef {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            role: self.role,
        }
    }
}

/// Snapshot of a publishable/subscribable media unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub stream_id: StreamId,
    pub owner_id: UserId,
    pub stream_name: String,
    pub source: SourceKind,
    pub has_audio: bool,
    pub has_video: bool,
}

impl Stream {
    /// Copy with the selected tracks set to `enabled`.
    #[must_use]
    pub fn with_enabled(&self, kinds: MediaKinds, enabled: bool) -> Stream {
        let mut next = self.clone();
        if kinds.audio {
            next.has_audio = enabled;
        }
        if kinds.video {
            next.has_video = enabled;
        }
        next
    }
}

/// Static room identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub room_name: String,
}

/// Mutable room status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoomStatus {
    pub course_state: CourseState,
    /// Course start time in unix milliseconds, if started.
    pub start_time: Option<i64>,
    /// Room-wide chat permission.
    pub chat_allowed: bool,
    pub online_users_count: u32,
}

/// Session snapshot as returned by `GetSessionInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub room_info: RoomInfo,
    pub room_status: RoomStatus,
    pub room_properties: Properties,
    pub connection_state: ConnectionState,
}

/// Arguments to `JoinSession`.
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    pub user_id: UserId,
    pub user_name: String,
    pub room_id: RoomId,
    pub room_name: String,
    /// Must be resolved before joining.
    pub role: Option<Role>,
    /// Initial user properties sent with the enter call.
    pub user_properties: Properties,
}

impl JoinOptions {
    /// Structural validation; returns the resolved role.
    pub fn validate(&self) -> Result<Role, EduError> {
        if self.user_id.is_empty() {
            return Err(EduError::Validation("user id must not be empty".to_string()));
        }
        if self.room_id.is_empty() {
            return Err(EduError::Validation("room id must not be empty".to_string()));
        }
        self.role
            .ok_or_else(|| EduError::Validation("role must be resolved before joining".to_string()))
    }

    /// Identity of the joining user.
    pub fn user_ref(&self, role: Role) -> UserRef {
        UserRef {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            role,
        }
    }
}

/// Arguments to `CreateLocalStream`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStreamConfig {
    pub stream_name: String,
    pub source: SourceKind,
    pub enable_audio: bool,
    pub enable_video: bool,
    pub camera: CameraSource,
}

impl Default for LocalStreamConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            source: SourceKind::Camera,
            enable_audio: true,
            enable_video: true,
            camera: CameraSource::Front,
        }
    }
}

/// Whether a property update adds/overwrites keys or removes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyAction {
    Upsert,
    Delete,
}

/// A property mutation, as issued locally or reported by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub action: PropertyAction,
    /// For deletes only the keys matter.
    pub properties: Properties,
    /// Opaque application-defined reason carried to every observer.
    pub cause: Option<serde_json::Value>,
}

impl PropertyUpdate {
    /// Single-key upsert.
    pub fn upsert(key: impl Into<String>, value: serde_json::Value) -> Self {
        let mut properties = Properties::new();
        properties.insert(key.into(), value);
        Self {
            action: PropertyAction::Upsert,
            properties,
            cause: None,
        }
    }

    /// Removal of the given keys.
    pub fn delete<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            action: PropertyAction::Delete,
            properties: keys
                .into_iter()
                .map(|k| (k.into(), serde_json::Value::Null))
                .collect(),
            cause: None,
        }
    }

    #[must_use]
    pub fn with_cause(mut self, cause: serde_json::Value) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// Target of a chat permission change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatTarget {
    Room,
    User(UserId),
}

/// A chat message received through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub from: UserRef,
    pub text: String,
    /// Server timestamp in unix milliseconds.
    pub timestamp: i64,
}
