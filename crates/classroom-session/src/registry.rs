//! Membership & stream registry seam.
//!
//! The registry is an external collaborator: it tracks the canonical list
//! of online users and streams from signaling-channel deltas and periodic
//! pulls. The session only consumes it:
//!
//! - [`Registry::start`] hands the registry a [`RegistrySink`]; every change
//!   the registry observes is pushed through it onto the session executor.
//! - [`Registry::refresh`] performs a full pull, used for the initial
//!   baseline after join and for reconciliation after a reconnect.
//! - [`Registry::stop`] unregisters on leave.
//!
//! A sink is bound to the session epoch it was created under. Events
//! delivered through a sink from an earlier epoch are dropped by the
//! executor, so a registry that keeps pushing after `stop` cannot leak
//! changes into a later join.

use crate::actors::messages::SessionMessage;
use crate::errors::EduError;
use crate::model::{
    ChatMessage, CourseState, Properties, PropertyUpdate, Role, RoomId, RoomStatus, Stream,
    UserId, UserRef,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Identity the registry is started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryContext {
    pub room_id: RoomId,
    pub local_user: UserRef,
}

/// A user as reported by the registry, with raw properties.
///
/// The chat permission key may be present in `properties`; the session
/// extracts it.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEntry {
    pub user_id: UserId,
    pub user_name: String,
    pub role: Role,
    pub properties: Properties,
}

impl UserEntry {
    #[must_use]
    pub fn to_ref(&self) -> UserRef {
        UserRef {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            role: self.role,
        }
    }
}

/// Full registry pull.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegistrySnapshot {
    /// Online users. May include the local user.
    pub users: Vec<UserEntry>,
    pub streams: Vec<Stream>,
    pub room_properties: Properties,
    /// `online_users_count` is ignored; the session derives it.
    pub room_status: RoomStatus,
}

/// Users joined (`is_add`) or left.
#[derive(Debug, Clone, PartialEq)]
pub struct UserListChange {
    pub users: Vec<UserEntry>,
    pub is_add: bool,
    pub operator: Option<UserRef>,
}

/// Stream deltas in one registry batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamsChange {
    pub added: Vec<Stream>,
    pub modified: Vec<Stream>,
    pub removed: Vec<Stream>,
    pub operator: Option<UserRef>,
}

/// Per-user property delta.
#[derive(Debug, Clone, PartialEq)]
pub struct UserPropertyChange {
    pub user_id: UserId,
    pub update: PropertyUpdate,
    pub operator_id: Option<String>,
}

/// Room (scene) property delta.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenePropertyChange {
    pub update: PropertyUpdate,
    pub operator_id: Option<String>,
}

/// Room status delta. Absent fields are unchanged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RoomStatusChange {
    pub course_state: Option<CourseState>,
    pub start_time: Option<i64>,
    pub chat_allowed: Option<bool>,
    pub operator: Option<UserRef>,
}

/// Signaling-channel connection notifications relayed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingState {
    Connected,
    Disconnected,
    /// Permanent failure; the session aborts.
    Aborted(String),
}

/// Everything the registry can push to a session.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    UserListChanged(UserListChange),
    StreamsChanged(StreamsChange),
    UserPropertiesChanged(UserPropertyChange),
    ScenePropertiesChanged(ScenePropertyChange),
    RoomStatusChanged(RoomStatusChange),
    RoomMessage(ChatMessage),
    UserMessage(ChatMessage),
    Signaling(SignalingState),
}

impl RegistryEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            RegistryEvent::UserListChanged(_) => "user_list_changed",
            RegistryEvent::StreamsChanged(_) => "streams_changed",
            RegistryEvent::UserPropertiesChanged(_) => "user_properties_changed",
            RegistryEvent::ScenePropertiesChanged(_) => "scene_properties_changed",
            RegistryEvent::RoomStatusChanged(_) => "room_status_changed",
            RegistryEvent::RoomMessage(_) => "room_message",
            RegistryEvent::UserMessage(_) => "user_message",
            RegistryEvent::Signaling(_) => "signaling",
        }
    }
}

/// Delivery endpoint handed to the registry on start.
///
/// Holds only a weak reference to the session mailbox: a registry that
/// outlives its session gets `Internal` errors instead of keeping the
/// executor alive.
#[derive(Clone)]
pub struct RegistrySink {
    mailbox: mpsc::WeakSender<SessionMessage>,
    epoch: u64,
}

impl RegistrySink {
    pub(crate) fn new(mailbox: mpsc::WeakSender<SessionMessage>, epoch: u64) -> Self {
        Self { mailbox, epoch }
    }

    /// Session epoch this sink was issued under.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Deliver an event, waiting for mailbox capacity.
    ///
    /// Events from one sink are applied in delivery order.
    pub async fn deliver(&self, event: RegistryEvent) -> Result<(), EduError> {
        let sender = self.upgrade()?;
        sender
            .send(SessionMessage::Registry {
                epoch: self.epoch,
                event,
            })
            .await
            .map_err(|e| EduError::Internal(format!("channel send failed: {e}")))
    }

    /// Deliver from a synchronous callback thread. Fails if the mailbox is
    /// full rather than blocking the caller.
    pub fn try_deliver(&self, event: RegistryEvent) -> Result<(), EduError> {
        let sender = self.upgrade()?;
        sender
            .try_send(SessionMessage::Registry {
                epoch: self.epoch,
                event,
            })
            .map_err(|e| EduError::Internal(format!("channel send failed: {e}")))
    }

    pub async fn users_changed(&self, change: UserListChange) -> Result<(), EduError> {
        self.deliver(RegistryEvent::UserListChanged(change)).await
    }

    pub async fn streams_changed(&self, change: StreamsChange) -> Result<(), EduError> {
        self.deliver(RegistryEvent::StreamsChanged(change)).await
    }

    pub async fn user_properties_changed(
        &self,
        change: UserPropertyChange,
    ) -> Result<(), EduError> {
        self.deliver(RegistryEvent::UserPropertiesChanged(change))
            .await
    }

    pub async fn scene_properties_changed(
        &self,
        change: ScenePropertyChange,
    ) -> Result<(), EduError> {
        self.deliver(RegistryEvent::ScenePropertiesChanged(change))
            .await
    }

    pub async fn room_status_changed(&self, change: RoomStatusChange) -> Result<(), EduError> {
        self.deliver(RegistryEvent::RoomStatusChanged(change)).await
    }

    pub async fn signaling(&self, state: SignalingState) -> Result<(), EduError> {
        self.deliver(RegistryEvent::Signaling(state)).await
    }

    fn upgrade(&self) -> Result<mpsc::Sender<SessionMessage>, EduError> {
        self.mailbox
            .upgrade()
            .ok_or_else(|| EduError::Internal("session mailbox closed".to_string()))
    }
}

impl std::fmt::Debug for RegistrySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrySink")
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// Membership & stream registry, consumed through callbacks.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Begin pushing changes for `ctx` into `sink`.
    fn start(&self, ctx: RegistryContext, sink: RegistrySink) -> Result<(), EduError>;

    /// Full pull of the current room state.
    async fn refresh(&self) -> Result<RegistrySnapshot, EduError>;

    /// Stop pushing changes and drop the sink.
    fn stop(&self);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_tags_events_with_epoch() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = RegistrySink::new(tx.downgrade(), 7);

        sink.signaling(SignalingState::Disconnected).await.unwrap();

        let message = rx.recv().await.unwrap();
        assert!(matches!(
            message,
            SessionMessage::Registry {
                epoch: 7,
                event: RegistryEvent::Signaling(SignalingState::Disconnected),
            }
        ));
    }

    #[tokio::test]
    async fn test_sink_fails_once_session_is_gone() {
        let (tx, rx) = mpsc::channel(4);
        let sink = RegistrySink::new(tx.downgrade(), 1);
        drop(tx);
        drop(rx);

        let result = sink.signaling(SignalingState::Connected).await;
        assert!(matches!(result, Err(EduError::Internal(_))));
        assert!(sink
            .try_deliver(RegistryEvent::Signaling(SignalingState::Connected))
            .is_err());
    }

    #[tokio::test]
    async fn test_try_deliver_reports_full_mailbox() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = RegistrySink::new(tx.downgrade(), 1);

        sink.try_deliver(RegistryEvent::Signaling(SignalingState::Connected))
            .unwrap();
        let second = sink.try_deliver(RegistryEvent::Signaling(SignalingState::Connected));
        assert!(matches!(second, Err(EduError::Internal(_))));
    }
}
