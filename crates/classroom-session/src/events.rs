//! Observer events and the observer registry.
//!
//! Events are owned values. The executor builds them from its state and
//! hands every observer a shared reference to the same value; observers
//! that need to keep one clone it.

use crate::errors::EduError;
use crate::model::{
    ChatMessage, ConnectionState, Properties, RoomStatus, SessionInfo, Stream, StreamId, User,
    UserRef,
};

use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream operation reported through [`SessionEvent::StreamOperationCompleted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamOperation {
    Create,
    Publish,
    Unpublish,
    Subscribe,
    Unsubscribe,
    Mute,
    Unmute,
    SwitchCamera,
    StartShareScreen,
    StopShareScreen,
}

impl StreamOperation {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            StreamOperation::Create => "create",
            StreamOperation::Publish => "publish",
            StreamOperation::Unpublish => "unpublish",
            StreamOperation::Subscribe => "subscribe",
            StreamOperation::Unsubscribe => "unsubscribe",
            StreamOperation::Mute => "mute",
            StreamOperation::Unmute => "unmute",
            StreamOperation::SwitchCamera => "switch_camera",
            StreamOperation::StartShareScreen => "start_share_screen",
            StreamOperation::StopShareScreen => "stop_share_screen",
        }
    }
}

/// Normalized event delivered to observers, in executor order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Every state transition, with a snapshot taken after it applied.
    ConnectionStateChanged {
        state: ConnectionState,
        session: SessionInfo,
    },
    RemoteUsersJoined {
        users: Vec<User>,
    },
    /// Users carry their last known state before eviction.
    RemoteUsersLeft {
        users: Vec<User>,
        operator: Option<UserRef>,
    },
    /// A known remote user changed name or role.
    RemoteUserUpdated {
        user: User,
        operator: Option<UserRef>,
    },
    RemoteUserPropertiesUpdated {
        user: User,
        changed: Properties,
        cause: Option<serde_json::Value>,
        operator_id: Option<String>,
    },
    LocalUserPropertiesUpdated {
        user: User,
        changed: Properties,
        cause: Option<serde_json::Value>,
        operator_id: Option<String>,
    },
    RemoteStreamsAdded {
        streams: Vec<Stream>,
        operator: Option<UserRef>,
    },
    RemoteStreamsUpdated {
        streams: Vec<Stream>,
        operator: Option<UserRef>,
    },
    RemoteStreamsRemoved {
        streams: Vec<Stream>,
        operator: Option<UserRef>,
    },
    LocalStreamAdded {
        stream: Stream,
        operator: Option<UserRef>,
    },
    LocalStreamUpdated {
        stream: Stream,
        operator: Option<UserRef>,
    },
    LocalStreamRemoved {
        stream: Stream,
        operator: Option<UserRef>,
    },
    RoomPropertiesUpdated {
        changed: Properties,
        cause: Option<serde_json::Value>,
        operator_id: Option<String>,
    },
    RoomStatusUpdated {
        status: RoomStatus,
        operator: Option<UserRef>,
    },
    RoomMessageReceived {
        message: ChatMessage,
    },
    UserMessageReceived {
        message: ChatMessage,
    },
    /// Outcome of a user-initiated stream operation. `error` is `None` on
    /// success.
    StreamOperationCompleted {
        operation: StreamOperation,
        stream_id: StreamId,
        stream: Option<Stream>,
        error: Option<EduError>,
    },
}

impl SessionEvent {
    /// Bounded event name, used as a metric label.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            SessionEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            SessionEvent::RemoteUsersJoined { .. } => "remote_users_joined",
            SessionEvent::RemoteUsersLeft { .. } => "remote_users_left",
            SessionEvent::RemoteUserUpdated { .. } => "remote_user_updated",
            SessionEvent::RemoteUserPropertiesUpdated { .. } => "remote_user_properties_updated",
            SessionEvent::LocalUserPropertiesUpdated { .. } => "local_user_properties_updated",
            SessionEvent::RemoteStreamsAdded { .. } => "remote_streams_added",
            SessionEvent::RemoteStreamsUpdated { .. } => "remote_streams_updated",
            SessionEvent::RemoteStreamsRemoved { .. } => "remote_streams_removed",
            SessionEvent::LocalStreamAdded { .. } => "local_stream_added",
            SessionEvent::LocalStreamUpdated { .. } => "local_stream_updated",
            SessionEvent::LocalStreamRemoved { .. } => "local_stream_removed",
            SessionEvent::RoomPropertiesUpdated { .. } => "room_properties_updated",
            SessionEvent::RoomStatusUpdated { .. } => "room_status_updated",
            SessionEvent::RoomMessageReceived { .. } => "room_message_received",
            SessionEvent::UserMessageReceived { .. } => "user_message_received",
            SessionEvent::StreamOperationCompleted { .. } => "stream_operation_completed",
        }
    }
}

/// Callback surface registered with a session.
///
/// Called on the session executor; implementations must not block.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

/// Channel-backed observer for callers that prefer to consume events as a
/// stream. A closed receiver silently drops events.
impl SessionObserver for mpsc::UnboundedSender<SessionEvent> {
    fn on_event(&self, event: &SessionEvent) {
        let _ = self.send(event.clone());
    }
}

/// Handle returned by `register_event_handler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

/// Observer set, owned by the session executor.
#[derive(Default)]
pub struct ObserverRegistry {
    next_id: u64,
    observers: Vec<(ObserverId, Arc<dyn SessionObserver>)>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, observer: Arc<dyn SessionObserver>) -> ObserverId {
        self.next_id += 1;
        let id = ObserverId(self.next_id);
        self.observers.push((id, observer));
        id
    }

    /// Returns true if the observer was registered.
    pub fn unregister(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(existing, _)| *existing != id);
        self.observers.len() != before
    }

    /// Drops every observer. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.observers.len();
        self.observers.clear();
        removed
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Delivers one event to every registered observer.
    ///
    /// The observer list is snapshotted first, so an observer registered or
    /// removed while delivery is running only affects later events.
    pub fn dispatch(&self, event: &SessionEvent) {
        let snapshot: Vec<Arc<dyn SessionObserver>> = self
            .observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in snapshot {
            observer.on_event(event);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{CourseState, RoomInfo};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collector {
        names: Mutex<Vec<&'static str>>,
    }

    impl SessionObserver for Collector {
        fn on_event(&self, event: &SessionEvent) {
            self.names.lock().unwrap().push(event.name());
        }
    }

    fn state_event(state: ConnectionState) -> SessionEvent {
        SessionEvent::ConnectionStateChanged {
            state,
            session: SessionInfo {
                room_info: RoomInfo::default(),
                room_status: RoomStatus {
                    course_state: CourseState::Pending,
                    ..RoomStatus::default()
                },
                room_properties: Properties::new(),
                connection_state: state,
            },
        }
    }

    #[test]
    fn test_register_dispatch_unregister() {
        let mut registry = ObserverRegistry::new();
        let first = Arc::new(Collector::default());
        let second = Arc::new(Collector::default());

        let first_id = registry.register(first.clone());
        registry.register(second.clone());
        assert_eq!(registry.len(), 2);

        registry.dispatch(&state_event(ConnectionState::Connecting));
        assert!(registry.unregister(first_id));
        assert!(!registry.unregister(first_id));
        registry.dispatch(&state_event(ConnectionState::Connected));

        assert_eq!(first.names.lock().unwrap().len(), 1);
        assert_eq!(second.names.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_clear_reports_removed_count() {
        let mut registry = ObserverRegistry::new();
        registry.register(Arc::new(Collector::default()));
        registry.register(Arc::new(Collector::default()));

        assert_eq!(registry.clear(), 2);
        assert_eq!(registry.clear(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_channel_observer_receives_clones() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut registry = ObserverRegistry::new();
        registry.register(Arc::new(tx));

        registry.dispatch(&state_event(ConnectionState::Connected));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "connection_state_changed");
    }

    #[test]
    fn test_observer_ids_are_not_reused() {
        let mut registry = ObserverRegistry::new();
        let a = registry.register(Arc::new(Collector::default()));
        registry.unregister(a);
        let b = registry.register(Arc::new(Collector::default()));
        assert_ne!(a, b);
    }
}
