//! Session executor message types.
//!
//! Everything that reaches session state goes through one of these
//! messages: user calls, read-only queries, asynchronous completions and
//! registry pushes. Completions carry the epoch they were issued under.

use crate::control_plane::ControlPlaneResponse;
use crate::errors::EduError;
use crate::events::{ObserverId, SessionObserver, StreamOperation};
use crate::model::{
    CameraSource, ChatTarget, ConnectionState, CourseState, LocalStreamConfig, MediaKinds,
    PropertyUpdate, Role, ScreenSource, SessionInfo, Stream, StreamId, SubscribeOptions, User,
    UserId, UserRef, ViewHandle,
};
use crate::registry::{RegistryEvent, RegistrySnapshot};
use crate::user_service::RoleCapabilities;

use std::sync::Arc;
use tokio::sync::oneshot;

/// Successful outcome of a user command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Snapshot of the affected stream after the operation.
    Stream(Stream),
    Done,
}

/// Reply channel for a user command.
pub type CommandResponder = oneshot::Sender<Result<CommandOutcome, EduError>>;

/// What the user-facing service asks the executor to do.
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    CreateLocalStream(LocalStreamConfig),
    Publish(StreamId),
    Unpublish(StreamId),
    Subscribe {
        stream_id: StreamId,
        options: SubscribeOptions,
    },
    Unsubscribe(StreamId),
    /// Mute (`enabled == false`) or unmute.
    SetEnabled {
        stream_id: StreamId,
        kinds: MediaKinds,
        enabled: bool,
    },
    SwitchCamera {
        stream_id: StreamId,
        camera: CameraSource,
    },
    SetStreamView {
        stream_id: StreamId,
        view: Option<ViewHandle>,
    },
    SendRoomMessage {
        text: String,
    },
    SendUserMessage {
        to: UserId,
        text: String,
    },
    SetRoomProperties(PropertyUpdate),
    SetUserProperties {
        user_id: UserId,
        update: PropertyUpdate,
    },
    UpdateCourseState(CourseState),
    AllowChat {
        target: ChatTarget,
        allowed: bool,
    },
    StartShareScreen(ScreenSource),
    StopShareScreen,
    /// Create a stream record owned by another participant.
    CreateStreamFor {
        user_id: UserId,
        config: LocalStreamConfig,
    },
}

impl UserCommand {
    /// Stream operation reported to observers on completion, if any.
    #[must_use]
    pub const fn stream_operation(&self) -> Option<StreamOperation> {
        match self {
            UserCommand::CreateLocalStream(_) | UserCommand::CreateStreamFor { .. } => {
                Some(StreamOperation::Create)
            }
            UserCommand::Publish(_) => Some(StreamOperation::Publish),
            UserCommand::Unpublish(_) => Some(StreamOperation::Unpublish),
            UserCommand::Subscribe { .. } => Some(StreamOperation::Subscribe),
            UserCommand::Unsubscribe(_) => Some(StreamOperation::Unsubscribe),
            UserCommand::SetEnabled { enabled: false, .. } => Some(StreamOperation::Mute),
            UserCommand::SetEnabled { enabled: true, .. } => Some(StreamOperation::Unmute),
            UserCommand::SwitchCamera { .. } => Some(StreamOperation::SwitchCamera),
            UserCommand::StartShareScreen(_) => Some(StreamOperation::StartShareScreen),
            UserCommand::StopShareScreen => Some(StreamOperation::StopShareScreen),
            UserCommand::SetStreamView { .. }
            | UserCommand::SendRoomMessage { .. }
            | UserCommand::SendUserMessage { .. }
            | UserCommand::SetRoomProperties(_)
            | UserCommand::SetUserProperties { .. }
            | UserCommand::UpdateCourseState(_)
            | UserCommand::AllowChat { .. } => None,
        }
    }

    /// Bounded command name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            UserCommand::CreateLocalStream(_) => "create_local_stream",
            UserCommand::Publish(_) => "publish",
            UserCommand::Unpublish(_) => "unpublish",
            UserCommand::Subscribe { .. } => "subscribe",
            UserCommand::Unsubscribe(_) => "unsubscribe",
            UserCommand::SetEnabled { enabled: false, .. } => "mute",
            UserCommand::SetEnabled { enabled: true, .. } => "unmute",
            UserCommand::SwitchCamera { .. } => "switch_camera",
            UserCommand::SetStreamView { .. } => "set_stream_view",
            UserCommand::SendRoomMessage { .. } => "send_room_message",
            UserCommand::SendUserMessage { .. } => "send_user_message",
            UserCommand::SetRoomProperties(_) => "set_room_properties",
            UserCommand::SetUserProperties { .. } => "set_user_properties",
            UserCommand::UpdateCourseState(_) => "update_course_state",
            UserCommand::AllowChat { .. } => "allow_chat",
            UserCommand::StartShareScreen(_) => "start_share_screen",
            UserCommand::StopShareScreen => "stop_share_screen",
            UserCommand::CreateStreamFor { .. } => "create_stream_for",
        }
    }
}

/// Why a full registry refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// Baseline after entering; the pending join resolves when it lands.
    Initial,
    /// Reconciliation after the signaling channel came back.
    Reconnect,
}

/// Seed for building a user-facing service on the caller's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserServiceSeed {
    pub local_user: UserRef,
    pub capabilities: RoleCapabilities,
}

/// Messages sent to the session executor.
pub enum SessionMessage {
    /// Enter the room.
    Join {
        options: crate::model::JoinOptions,
        respond_to: oneshot::Sender<Result<(), EduError>>,
    },

    /// Leave the room. Idempotent.
    Leave {
        respond_to: oneshot::Sender<Result<(), EduError>>,
    },

    GetSessionInfo {
        respond_to: oneshot::Sender<SessionInfo>,
    },

    GetConnectionState {
        respond_to: oneshot::Sender<ConnectionState>,
    },

    GetUserService {
        respond_to: oneshot::Sender<Result<UserServiceSeed, EduError>>,
    },

    /// Users with `role`, or every user (local first) when `None`.
    GetUserList {
        role: Option<Role>,
        respond_to: oneshot::Sender<Vec<User>>,
    },

    GetFullStreamList {
        respond_to: oneshot::Sender<Vec<Stream>>,
    },

    GetLocalUser {
        respond_to: oneshot::Sender<Option<User>>,
    },

    RegisterObserver {
        observer: Arc<dyn SessionObserver>,
        respond_to: oneshot::Sender<ObserverId>,
    },

    UnregisterObserver {
        id: ObserverId,
        respond_to: oneshot::Sender<bool>,
    },

    /// User-facing operation.
    Command {
        command: UserCommand,
        respond_to: CommandResponder,
    },

    /// Control-plane enter call finished.
    EnterCompleted {
        epoch: u64,
        result: Result<ControlPlaneResponse, EduError>,
    },

    /// Full registry pull finished.
    RefreshCompleted {
        epoch: u64,
        reason: RefreshReason,
        result: Result<RegistrySnapshot, EduError>,
    },

    /// Spawned command work finished.
    OperationCompleted {
        epoch: u64,
        key: super::pending::OperationKey,
        outcome: Result<CommandOutcome, EduError>,
    },

    /// Registry push.
    Registry { epoch: u64, event: RegistryEvent },
}

impl SessionMessage {
    /// Message name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            SessionMessage::Join { .. } => "join",
            SessionMessage::Leave { .. } => "leave",
            SessionMessage::GetSessionInfo { .. } => "get_session_info",
            SessionMessage::GetConnectionState { .. } => "get_connection_state",
            SessionMessage::GetUserService { .. } => "get_user_service",
            SessionMessage::GetUserList { .. } => "get_user_list",
            SessionMessage::GetFullStreamList { .. } => "get_full_stream_list",
            SessionMessage::GetLocalUser { .. } => "get_local_user",
            SessionMessage::RegisterObserver { .. } => "register_observer",
            SessionMessage::UnregisterObserver { .. } => "unregister_observer",
            SessionMessage::Command { .. } => "command",
            SessionMessage::EnterCompleted { .. } => "enter_completed",
            SessionMessage::RefreshCompleted { .. } => "refresh_completed",
            SessionMessage::OperationCompleted { .. } => "operation_completed",
            SessionMessage::Registry { .. } => "registry",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_mute_and_unmute_are_distinct_operations() {
        let mute = UserCommand::SetEnabled {
            stream_id: StreamId::new("1"),
            kinds: MediaKinds::ALL,
            enabled: false,
        };
        let unmute = UserCommand::SetEnabled {
            stream_id: StreamId::new("1"),
            kinds: MediaKinds::ALL,
            enabled: true,
        };
        assert_eq!(mute.stream_operation(), Some(StreamOperation::Mute));
        assert_eq!(unmute.stream_operation(), Some(StreamOperation::Unmute));
        assert_eq!(mute.name(), "mute");
    }

    #[test]
    fn test_non_stream_commands_have_no_stream_operation() {
        let command = UserCommand::SendRoomMessage {
            text: "hello".to_string(),
        };
        assert_eq!(command.stream_operation(), None);
        assert_eq!(
            UserCommand::UpdateCourseState(CourseState::Started).stream_operation(),
            None
        );
    }
}
