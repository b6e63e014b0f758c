//! Role-gated user-facing service.
//!
//! One implementation serves every role. The role selects a
//! [`RoleCapabilities`] set at construction time, and role-specific
//! operations check it before anything is enqueued: a denied call fails
//! with `PermissionDenied` and never reaches the network.
//!
//! Every method enqueues a command onto the session executor and resolves
//! with the single outcome of that command.

use crate::actors::messages::{CommandOutcome, SessionMessage, UserCommand, UserServiceSeed};
use crate::errors::EduError;
use crate::model::{
    CameraSource, ChatTarget, CourseState, LocalStreamConfig, MediaKinds, PropertyUpdate, Role,
    ScreenSource, Stream, StreamId, SubscribeOptions, UserId, UserRef, ViewHandle,
};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Operations a role may perform beyond the common set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoleCapabilities {
    pub can_change_course_state: bool,
    pub can_moderate_chat: bool,
    pub can_manage_others_streams: bool,
    pub can_share_screen: bool,
}

impl RoleCapabilities {
    #[must_use]
    pub const fn for_role(role: Role) -> Self {
        match role {
            Role::Host => Self {
                can_change_course_state: true,
                can_moderate_chat: true,
                can_manage_others_streams: true,
                can_share_screen: true,
            },
            // Chat moderation and managing others' streams stay host-only
            Role::Assistant | Role::Participant => Self {
                can_change_course_state: false,
                can_moderate_chat: false,
                can_manage_others_streams: false,
                can_share_screen: false,
            },
        }
    }
}

/// Handle to the user-facing operations of a joined session.
///
/// Cheap to clone. Obtained from `SessionHandle::user_service` once the
/// session is connected.
#[derive(Clone)]
pub struct UserService {
    sender: mpsc::Sender<SessionMessage>,
    local_user: UserRef,
    capabilities: RoleCapabilities,
}

impl UserService {
    pub(crate) fn new(sender: mpsc::Sender<SessionMessage>, seed: UserServiceSeed) -> Self {
        Self {
            sender,
            local_user: seed.local_user,
            capabilities: seed.capabilities,
        }
    }

    #[must_use]
    pub fn local_user(&self) -> &UserRef {
        &self.local_user
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.local_user.role
    }

    #[must_use]
    pub fn capabilities(&self) -> RoleCapabilities {
        self.capabilities
    }

    fn require(&self, allowed: bool, operation: &str) -> Result<(), EduError> {
        if allowed {
            return Ok(());
        }
        debug!(
            target: "classroom.user_service",
            role = self.local_user.role.as_str(),
            operation = operation,
            "Operation denied for role"
        );
        Err(EduError::PermissionDenied(format!(
            "role {} may not {operation}",
            self.local_user.role.as_str()
        )))
    }

    async fn execute(&self, command: UserCommand) -> Result<CommandOutcome, EduError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionMessage::Command {
                command,
                respond_to: tx,
            })
            .await
            .map_err(|e| EduError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| EduError::Internal(format!("response receive failed: {e}")))?
    }

    async fn execute_stream(&self, command: UserCommand) -> Result<Stream, EduError> {
        match self.execute(command).await? {
            CommandOutcome::Stream(stream) => Ok(stream),
            CommandOutcome::Done => Err(EduError::Internal(
                "stream operation completed without a stream".to_string(),
            )),
        }
    }

    async fn execute_done(&self, command: UserCommand) -> Result<(), EduError> {
        self.execute(command).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Create a local capture. The session assigns a fresh stream id.
    pub async fn create_local_stream(&self, config: LocalStreamConfig) -> Result<Stream, EduError> {
        self.execute_stream(UserCommand::CreateLocalStream(config))
            .await
    }

    /// Publish a local stream. A second call while the first is in flight
    /// shares its outcome; publishing a published stream succeeds at once.
    pub async fn publish_stream(&self, stream_id: StreamId) -> Result<Stream, EduError> {
        self.execute_stream(UserCommand::Publish(stream_id)).await
    }

    pub async fn unpublish_stream(&self, stream_id: StreamId) -> Result<Stream, EduError> {
        self.execute_stream(UserCommand::Unpublish(stream_id)).await
    }

    pub async fn subscribe_stream(
        &self,
        stream_id: StreamId,
        options: SubscribeOptions,
    ) -> Result<Stream, EduError> {
        self.execute_stream(UserCommand::Subscribe { stream_id, options })
            .await
    }

    pub async fn unsubscribe_stream(&self, stream_id: StreamId) -> Result<Stream, EduError> {
        self.execute_stream(UserCommand::Unsubscribe(stream_id))
            .await
    }

    /// Disable the selected tracks without tearing down the connection.
    ///
    /// For a remote stream this is a receive-side mute unless the role may
    /// manage other participants' streams, in which case the remote stream
    /// record is updated on the control plane.
    pub async fn mute_stream(&self, stream_id: StreamId, kinds: MediaKinds) -> Result<Stream, EduError> {
        self.set_enabled(stream_id, kinds, false).await
    }

    pub async fn unmute_stream(
        &self,
        stream_id: StreamId,
        kinds: MediaKinds,
    ) -> Result<Stream, EduError> {
        self.set_enabled(stream_id, kinds, true).await
    }

    async fn set_enabled(
        &self,
        stream_id: StreamId,
        kinds: MediaKinds,
        enabled: bool,
    ) -> Result<Stream, EduError> {
        if kinds.is_empty() {
            return Err(EduError::Validation(
                "at least one of audio or video must be selected".to_string(),
            ));
        }
        self.execute_stream(UserCommand::SetEnabled {
            stream_id,
            kinds,
            enabled,
        })
        .await
    }

    pub async fn switch_camera(
        &self,
        stream_id: StreamId,
        camera: CameraSource,
    ) -> Result<Stream, EduError> {
        self.execute_stream(UserCommand::SwitchCamera { stream_id, camera })
            .await
    }

    /// Bind (`Some`) or clear (`None`) the render target of a stream.
    pub async fn set_stream_view(
        &self,
        stream_id: StreamId,
        view: Option<ViewHandle>,
    ) -> Result<(), EduError> {
        self.execute_done(UserCommand::SetStreamView { stream_id, view })
            .await
    }

    // ------------------------------------------------------------------
    // Messages and properties
    // ------------------------------------------------------------------

    pub async fn send_room_message(&self, text: impl Into<String>) -> Result<(), EduError> {
        let text = non_empty_text(text.into())?;
        self.execute_done(UserCommand::SendRoomMessage { text })
            .await
    }

    pub async fn send_user_message(
        &self,
        to: UserId,
        text: impl Into<String>,
    ) -> Result<(), EduError> {
        let text = non_empty_text(text.into())?;
        if to.is_empty() {
            return Err(EduError::Validation("recipient must not be empty".to_string()));
        }
        self.execute_done(UserCommand::SendUserMessage { to, text })
            .await
    }

    pub async fn set_room_properties(&self, update: PropertyUpdate) -> Result<(), EduError> {
        non_empty_update(&update)?;
        self.execute_done(UserCommand::SetRoomProperties(update))
            .await
    }

    /// Set properties of the local user, or of another user when the role
    /// may manage other participants.
    pub async fn set_user_properties(
        &self,
        user_id: UserId,
        update: PropertyUpdate,
    ) -> Result<(), EduError> {
        non_empty_update(&update)?;
        if user_id != self.local_user.user_id {
            self.require(
                self.capabilities.can_manage_others_streams,
                "set another user's properties",
            )?;
        }
        self.execute_done(UserCommand::SetUserProperties { user_id, update })
            .await
    }

    // ------------------------------------------------------------------
    // Capability-gated
    // ------------------------------------------------------------------

    pub async fn update_course_state(&self, state: CourseState) -> Result<(), EduError> {
        self.require(
            self.capabilities.can_change_course_state,
            "change the course state",
        )?;
        self.execute_done(UserCommand::UpdateCourseState(state))
            .await
    }

    /// Allow or restrict chat for one user or the whole room.
    pub async fn allow_chat(&self, target: ChatTarget, allowed: bool) -> Result<(), EduError> {
        self.require(self.capabilities.can_moderate_chat, "moderate chat")?;
        self.execute_done(UserCommand::AllowChat { target, allowed })
            .await
    }

    /// Start sharing the screen on a new stream, distinct from the camera
    /// stream.
    pub async fn start_share_screen(&self, source: ScreenSource) -> Result<Stream, EduError> {
        self.require(self.capabilities.can_share_screen, "share the screen")?;
        self.execute_stream(UserCommand::StartShareScreen(source))
            .await
    }

    pub async fn stop_share_screen(&self) -> Result<Stream, EduError> {
        self.require(self.capabilities.can_share_screen, "share the screen")?;
        self.execute_stream(UserCommand::StopShareScreen).await
    }

    /// Create a stream owned by another participant.
    pub async fn create_stream_for(
        &self,
        user_id: UserId,
        config: LocalStreamConfig,
    ) -> Result<Stream, EduError> {
        self.require(
            self.capabilities.can_manage_others_streams,
            "create streams for other participants",
        )?;
        if user_id == self.local_user.user_id {
            return Err(EduError::Validation(
                "use create_local_stream for the local user".to_string(),
            ));
        }
        self.execute_stream(UserCommand::CreateStreamFor { user_id, config })
            .await
    }
}

fn non_empty_text(text: String) -> Result<String, EduError> {
    if text.trim().is_empty() {
        return Err(EduError::Validation("message must not be empty".to_string()));
    }
    Ok(text)
}

fn non_empty_update(update: &PropertyUpdate) -> Result<(), EduError> {
    if update.properties.is_empty() {
        return Err(EduError::Validation(
            "property update must name at least one key".to_string(),
        ));
    }
    Ok(())
}

impl std::fmt::Debug for UserService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserService")
            .field("local_user", &self.local_user)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}
