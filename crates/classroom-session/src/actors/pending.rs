//! In-flight operation table.
//!
//! At most one operation per key is issued. A second request for a busy
//! key either joins the in-flight one (identical request: every caller
//! gets the single outcome) or is rejected (different request for the
//! same stream or property: never raced).

use super::messages::{CommandResponder, UserCommand};
use crate::errors::EduError;

use std::collections::HashMap;
use uuid::Uuid;

/// Resource class an operation serializes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationSlot {
    CreateStream,
    /// Publish and unpublish of one stream.
    Publication,
    /// Mute and unmute of one stream.
    Enablement,
    /// Subscribe and unsubscribe of one remote stream.
    Subscription,
    Camera,
    ScreenShare,
    RoomProperties,
    UserProperties,
    Message,
    CourseState,
    Chat,
}

/// Key of one in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub slot: OperationSlot,
    pub target: String,
}

impl OperationKey {
    pub fn new(slot: OperationSlot, target: impl Into<String>) -> Self {
        Self {
            slot,
            target: target.into(),
        }
    }

    /// Key for a command, or `None` for commands applied synchronously.
    ///
    /// Commands that never conflict (messages, new captures) get a unique
    /// key so they are never de-duplicated.
    #[must_use]
    pub fn for_command(command: &UserCommand) -> Option<Self> {
        let key = match command {
            UserCommand::CreateLocalStream(_) | UserCommand::CreateStreamFor { .. } => {
                Self::new(OperationSlot::CreateStream, Uuid::new_v4().to_string())
            }
            UserCommand::Publish(id) | UserCommand::Unpublish(id) => {
                Self::new(OperationSlot::Publication, id.as_str())
            }
            UserCommand::SetEnabled { stream_id, .. } => {
                Self::new(OperationSlot::Enablement, stream_id.as_str())
            }
            UserCommand::Subscribe { stream_id, .. } | UserCommand::Unsubscribe(stream_id) => {
                Self::new(OperationSlot::Subscription, stream_id.as_str())
            }
            UserCommand::SwitchCamera { stream_id, .. } => {
                Self::new(OperationSlot::Camera, stream_id.as_str())
            }
            UserCommand::StartShareScreen(_) | UserCommand::StopShareScreen => {
                Self::new(OperationSlot::ScreenShare, "local")
            }
            UserCommand::SendRoomMessage { .. } | UserCommand::SendUserMessage { .. } => {
                Self::new(OperationSlot::Message, Uuid::new_v4().to_string())
            }
            UserCommand::SetRoomProperties(update) => Self::new(
                OperationSlot::RoomProperties,
                update.properties.keys().cloned().collect::<Vec<_>>().join(","),
            ),
            UserCommand::SetUserProperties { user_id, update } => Self::new(
                OperationSlot::UserProperties,
                format!(
                    "{user_id}:{}",
                    update.properties.keys().cloned().collect::<Vec<_>>().join(",")
                ),
            ),
            UserCommand::UpdateCourseState(_) => Self::new(OperationSlot::CourseState, "room"),
            UserCommand::AllowChat { target, .. } => {
                Self::new(OperationSlot::Chat, format!("{target:?}"))
            }
            UserCommand::SetStreamView { .. } => return None,
        };
        Some(key)
    }
}

/// Result of asking to start an operation.
pub enum Admission {
    /// Key was free; the caller must now issue the work.
    Issue,
    /// Identical request already in flight; the responder was attached.
    Joined,
    /// A different request holds the key. The responder is handed back.
    Rejected(CommandResponder),
}

struct PendingEntry {
    command: UserCommand,
    waiters: Vec<CommandResponder>,
}

/// Executor-owned table of in-flight operations.
#[derive(Default)]
pub struct PendingOperations {
    entries: HashMap<OperationKey, PendingEntry>,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(
        &mut self,
        key: OperationKey,
        command: &UserCommand,
        respond_to: CommandResponder,
    ) -> Admission {
        match self.entries.get_mut(&key) {
            Some(entry) if entry.command == *command => {
                entry.waiters.push(respond_to);
                Admission::Joined
            }
            Some(_) => Admission::Rejected(respond_to),
            None => {
                self.entries.insert(
                    key,
                    PendingEntry {
                        command: command.clone(),
                        waiters: vec![respond_to],
                    },
                );
                Admission::Issue
            }
        }
    }

    /// Remove an entry, returning its command and waiters.
    pub fn take(&mut self, key: &OperationKey) -> Option<(UserCommand, Vec<CommandResponder>)> {
        self.entries
            .remove(key)
            .map(|entry| (entry.command, entry.waiters))
    }

    /// Fail everything in flight. Returns the number of operations failed.
    pub fn fail_all(&mut self, error: &EduError) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            for waiter in entry.waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
        count
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::CommandOutcome;
    use crate::model::{MediaKinds, StreamId};
    use tokio::sync::oneshot;

    fn publish(id: &str) -> UserCommand {
        UserCommand::Publish(StreamId::new(id))
    }

    #[tokio::test]
    async fn test_identical_requests_share_one_outcome() {
        let mut pending = PendingOperations::new();
        let command = publish("1");
        let key = OperationKey::for_command(&command).unwrap();

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        assert!(matches!(pending.admit(key.clone(), &command, tx1), Admission::Issue));
        assert!(matches!(pending.admit(key.clone(), &command, tx2), Admission::Joined));

        let (command, waiters) = pending.take(&key).unwrap();
        assert_eq!(command, publish("1"));
        assert_eq!(waiters.len(), 2);
        for waiter in waiters {
            waiter.send(Ok(CommandOutcome::Done)).unwrap();
        }
        assert_eq!(rx1.await.unwrap(), Ok(CommandOutcome::Done));
        assert_eq!(rx2.await.unwrap(), Ok(CommandOutcome::Done));
        assert!(pending.take(&key).is_none());
    }

    #[tokio::test]
    async fn test_conflicting_request_is_rejected() {
        let mut pending = PendingOperations::new();
        let publish = publish("1");
        let unpublish = UserCommand::Unpublish(StreamId::new("1"));
        let key = OperationKey::for_command(&publish).unwrap();
        assert_eq!(OperationKey::for_command(&unpublish), Some(key.clone()));

        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        pending.admit(key.clone(), &publish, tx1);
        assert!(matches!(
            pending.admit(key, &unpublish, tx2),
            Admission::Rejected(_)
        ));
    }

    #[test]
    fn test_messages_are_never_deduplicated() {
        let command = UserCommand::SendRoomMessage {
            text: "hi".to_string(),
        };
        assert_ne!(
            OperationKey::for_command(&command),
            OperationKey::for_command(&command)
        );
    }

    #[test]
    fn test_mute_and_unmute_share_a_key() {
        let mute = UserCommand::SetEnabled {
            stream_id: StreamId::new("1"),
            kinds: MediaKinds::AUDIO,
            enabled: false,
        };
        let unmute = UserCommand::SetEnabled {
            stream_id: StreamId::new("1"),
            kinds: MediaKinds::AUDIO,
            enabled: true,
        };
        assert_eq!(
            OperationKey::for_command(&mute),
            OperationKey::for_command(&unmute)
        );
    }

    #[tokio::test]
    async fn test_fail_all_notifies_every_waiter() {
        let mut pending = PendingOperations::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        let a = publish("1");
        let b = publish("2");
        pending.admit(OperationKey::for_command(&a).unwrap(), &a, tx1);
        pending.admit(OperationKey::for_command(&b).unwrap(), &b, tx2);

        let error = EduError::InvalidState("session left".to_string());
        assert_eq!(pending.fail_all(&error), 2);
        assert_eq!(rx1.await.unwrap(), Err(error.clone()));
        assert_eq!(rx2.await.unwrap(), Err(error));
    }
}
