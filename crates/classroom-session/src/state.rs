//! Membership, stream and property reconciliation.
//!
//! `SessionState` is the executor's view of the room. Every mutation is a
//! plain method that returns the observer events it produced, in the order
//! they must be delivered. Nothing here performs I/O.
//!
//! # Local vs remote
//!
//! Every incoming change is routed by comparing the owner id with the
//! local user id. Changes to the local user or its streams only ever
//! produce `Local*` events; they never surface through the `Remote*`
//! events, whatever the registry reports.
//!
//! # Extra-property records
//!
//! The chat permission is session-local policy, not a custom property. It
//! is stripped from incoming property sets into a per-user record that is
//! created when a user is added and erased when the user leaves.

use crate::events::SessionEvent;
use crate::model::{
    ConnectionState, Properties, PropertyAction, PropertyUpdate, RoomInfo, RoomStatus,
    SessionInfo, Stream, StreamId, User, UserId, UserRef, CHAT_ALLOWED_KEY,
};
use crate::registry::{
    RegistrySnapshot, RoomStatusChange, ScenePropertyChange, StreamsChange, UserEntry,
    UserListChange, UserPropertyChange,
};

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Per-user session-local record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UserExtras {
    chat_allowed: bool,
}

impl Default for UserExtras {
    fn default() -> Self {
        Self { chat_allowed: true }
    }
}

/// A user as stored by the session: custom properties only.
#[derive(Debug, Clone, PartialEq)]
struct UserRecord {
    user_id: UserId,
    user_name: String,
    role: crate::model::Role,
    properties: Properties,
}

impl UserRecord {
    fn to_ref(&self) -> UserRef {
        UserRef {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            role: self.role,
        }
    }
}

/// Split the chat key out of a property set.
fn split_chat(mut properties: Properties) -> (Properties, Option<serde_json::Value>) {
    let chat = properties.remove(CHAT_ALLOWED_KEY);
    (properties, chat)
}

/// Chat permission carried by a raw property value. Anything but an
/// explicit `false` allows chat.
fn chat_flag(value: &serde_json::Value) -> bool {
    value.as_bool().unwrap_or(true)
}

/// Apply an upsert/delete to `target`; returns the keys that actually
/// changed, with their new value (`Null` for deleted keys).
fn apply_update(target: &mut Properties, action: PropertyAction, changes: &Properties) -> Properties {
    let mut changed = Properties::new();
    for (key, value) in changes {
        match action {
            PropertyAction::Upsert => {
                if target.get(key) != Some(value) {
                    target.insert(key.clone(), value.clone());
                    changed.insert(key.clone(), value.clone());
                }
            }
            PropertyAction::Delete => {
                if target.remove(key).is_some() {
                    changed.insert(key.clone(), serde_json::Value::Null);
                }
            }
        }
    }
    changed
}

/// Keys that differ between two property sets, valued as in `next`.
fn diff_properties(current: &Properties, next: &Properties) -> Properties {
    let mut changed = Properties::new();
    for (key, value) in next {
        if current.get(key) != Some(value) {
            changed.insert(key.clone(), value.clone());
        }
    }
    for key in current.keys() {
        if !next.contains_key(key) {
            changed.insert(key.clone(), serde_json::Value::Null);
        }
    }
    changed
}

/// Executor-owned room state.
#[derive(Debug, Default)]
pub struct SessionState {
    local: Option<UserRecord>,
    room_info: RoomInfo,
    room_status: RoomStatus,
    room_properties: Properties,
    remote_users: BTreeMap<UserId, UserRecord>,
    extras: HashMap<UserId, UserExtras>,
    streams: BTreeMap<StreamId, Stream>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed state from the enter response.
    pub fn begin(
        &mut self,
        local: UserEntry,
        room_info: RoomInfo,
        room_status: RoomStatus,
        room_properties: Properties,
    ) {
        self.clear();
        let (properties, chat) = split_chat(local.properties);
        self.extras.insert(
            local.user_id.clone(),
            UserExtras {
                chat_allowed: chat.as_ref().map_or(true, chat_flag),
            },
        );
        self.local = Some(UserRecord {
            user_id: local.user_id,
            user_name: local.user_name,
            role: local.role,
            properties,
        });
        self.room_info = room_info;
        let (room_properties, room_chat) = split_chat(room_properties);
        self.room_properties = room_properties;
        self.room_status = room_status;
        if let Some(chat) = room_chat {
            self.room_status.chat_allowed = chat_flag(&chat);
        }
        self.update_online_count();
    }

    /// Drop everything, including all extra-property records.
    pub fn clear(&mut self) {
        self.local = None;
        self.room_info = RoomInfo::default();
        self.room_status = RoomStatus::default();
        self.room_properties.clear();
        self.remote_users.clear();
        self.extras.clear();
        self.streams.clear();
    }

    fn local_id(&self) -> Option<&UserId> {
        self.local.as_ref().map(|record| &record.user_id)
    }

    #[must_use]
    pub fn is_local_user(&self, user_id: &UserId) -> bool {
        self.local_id() == Some(user_id)
    }

    fn project(&self, record: &UserRecord) -> User {
        User {
            user_id: record.user_id.clone(),
            user_name: record.user_name.clone(),
            role: record.role,
            properties: record.properties.clone(),
            chat_allowed: self
                .extras
                .get(&record.user_id)
                .copied()
                .unwrap_or_default()
                .chat_allowed,
        }
    }

    fn update_online_count(&mut self) {
        let local = usize::from(self.local.is_some());
        self.room_status.online_users_count =
            u32::try_from(self.remote_users.len() + local).unwrap_or(u32::MAX);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    #[must_use]
    pub fn local_user(&self) -> Option<User> {
        self.local.as_ref().map(|record| self.project(record))
    }

    #[must_use]
    pub fn local_ref(&self) -> Option<UserRef> {
        self.local.as_ref().map(UserRecord::to_ref)
    }

    #[must_use]
    pub fn remote_user(&self, user_id: &UserId) -> Option<User> {
        self.remote_users
            .get(user_id)
            .map(|record| self.project(record))
    }

    /// Local user first, then remote users by id.
    #[must_use]
    pub fn full_user_list(&self) -> Vec<User> {
        self.local
            .iter()
            .chain(self.remote_users.values())
            .map(|record| self.project(record))
            .collect()
    }

    #[must_use]
    pub fn stream(&self, stream_id: &StreamId) -> Option<&Stream> {
        self.streams.get(stream_id)
    }

    #[must_use]
    pub fn full_stream_list(&self) -> Vec<Stream> {
        self.streams.values().cloned().collect()
    }

    #[must_use]
    pub fn room_info(&self) -> &RoomInfo {
        &self.room_info
    }

    #[must_use]
    pub fn room_status(&self) -> &RoomStatus {
        &self.room_status
    }

    #[must_use]
    pub fn session_info(&self, connection_state: ConnectionState) -> SessionInfo {
        SessionInfo {
            room_info: self.room_info.clone(),
            room_status: self.room_status.clone(),
            room_properties: self.room_properties.clone(),
            connection_state,
        }
    }

    // ------------------------------------------------------------------
    // Local stream bookkeeping
    // ------------------------------------------------------------------

    /// Record a local stream after a successful publish or update.
    pub fn upsert_local_stream(
        &mut self,
        stream: Stream,
        operator: Option<UserRef>,
    ) -> Option<SessionEvent> {
        match self.streams.get(&stream.stream_id) {
            Some(existing) if *existing == stream => None,
            Some(_) => {
                self.streams.insert(stream.stream_id.clone(), stream.clone());
                Some(SessionEvent::LocalStreamUpdated { stream, operator })
            }
            None => {
                self.streams.insert(stream.stream_id.clone(), stream.clone());
                Some(SessionEvent::LocalStreamAdded { stream, operator })
            }
        }
    }

    /// Forget a local stream after a successful unpublish.
    pub fn remove_local_stream(
        &mut self,
        stream_id: &StreamId,
        operator: Option<UserRef>,
    ) -> Option<SessionEvent> {
        let stream = self.streams.remove(stream_id)?;
        Some(SessionEvent::LocalStreamRemoved { stream, operator })
    }

    // ------------------------------------------------------------------
    // Registry deltas
    // ------------------------------------------------------------------

    /// Users joined or left.
    pub fn apply_user_list(&mut self, change: UserListChange) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        if change.is_add {
            let mut joined = Vec::new();
            let mut updated = Vec::new();
            for entry in change.users {
                if self.is_local_user(&entry.user_id) {
                    continue;
                }
                let known = self.remote_users.contains_key(&entry.user_id);
                if known {
                    updated.extend(self.update_identity(&entry, change.operator.clone()));
                }
                let (properties, chat) = split_chat(entry.properties);
                let extras = self.extras.entry(entry.user_id.clone()).or_default();
                if let Some(chat) = &chat {
                    extras.chat_allowed = chat_flag(chat);
                }
                if known {
                    updated.extend(self.reconcile_user_properties(&entry.user_id, properties, None));
                    continue;
                }
                let record = UserRecord {
                    user_id: entry.user_id,
                    user_name: entry.user_name,
                    role: entry.role,
                    properties,
                };
                joined.push(self.project(&record));
                self.remote_users.insert(record.user_id.clone(), record);
            }
            if !joined.is_empty() {
                debug!(
                    target: "classroom.registry",
                    count = joined.len(),
                    "Remote users joined"
                );
                events.push(SessionEvent::RemoteUsersJoined { users: joined });
            }
            events.extend(updated);
        } else {
            let mut left = Vec::new();
            let mut orphaned = Vec::new();
            for entry in change.users {
                if self.is_local_user(&entry.user_id) {
                    continue;
                }
                let Some(record) = self.remote_users.get(&entry.user_id) else {
                    continue;
                };
                // Capture last known state before eviction
                left.push(self.project(record));
                self.remote_users.remove(&entry.user_id);
                self.extras.remove(&entry.user_id);

                let owned: Vec<StreamId> = self
                    .streams
                    .values()
                    .filter(|stream| stream.owner_id == entry.user_id)
                    .map(|stream| stream.stream_id.clone())
                    .collect();
                for stream_id in owned {
                    if let Some(stream) = self.streams.remove(&stream_id) {
                        orphaned.push(stream);
                    }
                }
            }
            if !left.is_empty() {
                debug!(
                    target: "classroom.registry",
                    count = left.len(),
                    "Remote users left"
                );
                events.push(SessionEvent::RemoteUsersLeft {
                    users: left,
                    operator: change.operator.clone(),
                });
            }
            if !orphaned.is_empty() {
                events.push(SessionEvent::RemoteStreamsRemoved {
                    streams: orphaned,
                    operator: change.operator,
                });
            }
        }

        self.update_online_count();
        events
    }

    /// Stream deltas, routed local vs remote by owner id.
    pub fn apply_streams(&mut self, change: StreamsChange) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let mut remote_added = Vec::new();
        let mut remote_updated = Vec::new();
        let mut remote_removed = Vec::new();

        for stream in change.added.into_iter().chain(change.modified) {
            let is_local = self.is_local_user(&stream.owner_id);
            let previous = self.streams.get(&stream.stream_id).cloned();
            if previous.as_ref() == Some(&stream) {
                continue;
            }
            self.streams.insert(stream.stream_id.clone(), stream.clone());

            match (is_local, previous.is_some()) {
                (true, false) => events.push(SessionEvent::LocalStreamAdded {
                    stream,
                    operator: change.operator.clone(),
                }),
                (true, true) => events.push(SessionEvent::LocalStreamUpdated {
                    stream,
                    operator: change.operator.clone(),
                }),
                (false, false) => remote_added.push(stream),
                (false, true) => remote_updated.push(stream),
            }
        }

        for stream in change.removed {
            let Some(removed) = self.streams.remove(&stream.stream_id) else {
                continue;
            };
            if self.is_local_user(&removed.owner_id) {
                events.push(SessionEvent::LocalStreamRemoved {
                    stream: removed,
                    operator: change.operator.clone(),
                });
            } else {
                remote_removed.push(removed);
            }
        }

        if !remote_added.is_empty() {
            events.push(SessionEvent::RemoteStreamsAdded {
                streams: remote_added,
                operator: change.operator.clone(),
            });
        }
        if !remote_updated.is_empty() {
            events.push(SessionEvent::RemoteStreamsUpdated {
                streams: remote_updated,
                operator: change.operator.clone(),
            });
        }
        if !remote_removed.is_empty() {
            events.push(SessionEvent::RemoteStreamsRemoved {
                streams: remote_removed,
                operator: change.operator,
            });
        }

        events
    }

    /// Per-user property delta.
    pub fn apply_user_properties(&mut self, change: UserPropertyChange) -> Vec<SessionEvent> {
        let UserPropertyChange {
            user_id,
            update,
            operator_id,
        } = change;
        let is_local = self.is_local_user(&user_id);

        let (changes, chat) = split_chat(update.properties);

        let record = if is_local {
            self.local.as_mut()
        } else {
            self.remote_users.get_mut(&user_id)
        };
        let Some(record) = record else {
            debug!(
                target: "classroom.registry",
                user_id = %user_id,
                "Property change for unknown user ignored"
            );
            return Vec::new();
        };

        let changed = apply_update(&mut record.properties, update.action, &changes);

        let mut chat_changed = false;
        if let Some(chat) = &chat {
            let extras = self.extras.entry(user_id.clone()).or_default();
            // Deleting the key restores the default permission
            let next = match update.action {
                PropertyAction::Upsert => chat_flag(chat),
                PropertyAction::Delete => true,
            };
            chat_changed = extras.chat_allowed != next;
            extras.chat_allowed = next;
        }

        if changed.is_empty() && !chat_changed {
            return Vec::new();
        }

        let user = if is_local {
            self.local_user()
        } else {
            self.remote_user(&user_id)
        };
        let Some(user) = user else {
            return Vec::new();
        };

        let event = if is_local {
            SessionEvent::LocalUserPropertiesUpdated {
                user,
                changed,
                cause: update.cause,
                operator_id,
            }
        } else {
            SessionEvent::RemoteUserPropertiesUpdated {
                user,
                changed,
                cause: update.cause,
                operator_id,
            }
        };
        vec![event]
    }

    /// Room (scene) property delta.
    pub fn apply_scene_properties(&mut self, change: ScenePropertyChange) -> Vec<SessionEvent> {
        let ScenePropertyChange {
            update,
            operator_id,
        } = change;
        let (changes, chat) = split_chat(update.properties);
        let mut events = Vec::new();

        let changed = apply_update(&mut self.room_properties, update.action, &changes);
        if !changed.is_empty() {
            events.push(SessionEvent::RoomPropertiesUpdated {
                changed,
                cause: update.cause,
                operator_id,
            });
        }

        if let Some(chat) = &chat {
            let next = match update.action {
                PropertyAction::Upsert => chat_flag(chat),
                PropertyAction::Delete => true,
            };
            if self.room_status.chat_allowed != next {
                self.room_status.chat_allowed = next;
                events.push(SessionEvent::RoomStatusUpdated {
                    status: self.room_status.clone(),
                    operator: None,
                });
            }
        }

        events
    }

    /// Course state / room chat delta.
    pub fn apply_room_status(&mut self, change: RoomStatusChange) -> Vec<SessionEvent> {
        let before = self.room_status.clone();
        if let Some(course_state) = change.course_state {
            self.room_status.course_state = course_state;
        }
        if let Some(start_time) = change.start_time {
            self.room_status.start_time = Some(start_time);
        }
        if let Some(chat_allowed) = change.chat_allowed {
            self.room_status.chat_allowed = chat_allowed;
        }

        if self.room_status == before {
            return Vec::new();
        }
        vec![SessionEvent::RoomStatusUpdated {
            status: self.room_status.clone(),
            operator: change.operator,
        }]
    }

    /// Reconcile against a full pull, firing events only for real
    /// differences.
    pub fn apply_snapshot(&mut self, snapshot: RegistrySnapshot) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        // Users
        let mut incoming: BTreeMap<UserId, UserEntry> = BTreeMap::new();
        let mut local_entry = None;
        for entry in snapshot.users {
            if self.is_local_user(&entry.user_id) {
                local_entry = Some(entry);
            } else {
                incoming.insert(entry.user_id.clone(), entry);
            }
        }

        let departed: Vec<UserEntry> = self
            .remote_users
            .values()
            .filter(|record| !incoming.contains_key(&record.user_id))
            .map(|record| UserEntry {
                user_id: record.user_id.clone(),
                user_name: record.user_name.clone(),
                role: record.role,
                properties: Properties::new(),
            })
            .collect();
        if !departed.is_empty() {
            events.extend(self.apply_user_list(UserListChange {
                users: departed,
                is_add: false,
                operator: None,
            }));
        }

        let mut arrivals = Vec::new();
        for entry in incoming.into_values() {
            if !self.remote_users.contains_key(&entry.user_id) {
                arrivals.push(entry);
                continue;
            }
            events.extend(self.update_identity(&entry, None));
            let (properties, chat) = split_chat(entry.properties);
            events.extend(self.reconcile_user_properties(&entry.user_id, properties, chat));
        }
        if !arrivals.is_empty() {
            events.extend(self.apply_user_list(UserListChange {
                users: arrivals,
                is_add: true,
                operator: None,
            }));
        }

        if let Some(entry) = local_entry {
            let (properties, chat) = split_chat(entry.properties);
            events.extend(self.reconcile_user_properties(&entry.user_id, properties, chat));
        }

        // Streams
        let incoming_streams: BTreeMap<StreamId, Stream> = snapshot
            .streams
            .into_iter()
            .map(|stream| (stream.stream_id.clone(), stream))
            .collect();
        let removed: Vec<Stream> = self
            .streams
            .values()
            .filter(|stream| !incoming_streams.contains_key(&stream.stream_id))
            .cloned()
            .collect();
        events.extend(self.apply_streams(StreamsChange {
            added: incoming_streams.into_values().collect(),
            modified: Vec::new(),
            removed,
            operator: None,
        }));

        // Room properties and status
        let (room_properties, room_chat) = split_chat(snapshot.room_properties);
        let changed = diff_properties(&self.room_properties, &room_properties);
        if !changed.is_empty() {
            self.room_properties = room_properties;
            events.push(SessionEvent::RoomPropertiesUpdated {
                changed,
                cause: None,
                operator_id: None,
            });
        }

        let mut status = snapshot.room_status;
        if let Some(chat) = &room_chat {
            status.chat_allowed = chat_flag(chat);
        }
        events.extend(self.apply_room_status(RoomStatusChange {
            course_state: Some(status.course_state),
            start_time: status.start_time,
            chat_allowed: Some(status.chat_allowed),
            operator: None,
        }));

        self.update_online_count();
        events
    }

    /// Bring a known remote user's name and role in line with `entry`.
    fn update_identity(&mut self, entry: &UserEntry, operator: Option<UserRef>) -> Option<SessionEvent> {
        let record = self.remote_users.get_mut(&entry.user_id)?;
        if record.user_name == entry.user_name && record.role == entry.role {
            return None;
        }
        debug!(
            target: "classroom.registry",
            user_id = %entry.user_id,
            from_role = record.role.as_str(),
            to_role = entry.role.as_str(),
            "Remote user updated"
        );
        record.user_name.clone_from(&entry.user_name);
        record.role = entry.role;
        let record = record.clone();
        Some(SessionEvent::RemoteUserUpdated {
            user: self.project(&record),
            operator,
        })
    }

    fn reconcile_user_properties(
        &mut self,
        user_id: &UserId,
        properties: Properties,
        chat: Option<serde_json::Value>,
    ) -> Vec<SessionEvent> {
        let current = if self.is_local_user(user_id) {
            self.local.as_ref()
        } else {
            self.remote_users.get(user_id)
        };
        let Some(current) = current else {
            return Vec::new();
        };

        let changed = diff_properties(&current.properties, &properties);
        let mut update_props = Properties::new();
        let mut deleted = Properties::new();
        for (key, value) in changed {
            if value.is_null() && !properties.contains_key(&key) {
                deleted.insert(key, value);
            } else {
                update_props.insert(key, value);
            }
        }
        if let Some(chat) = chat {
            update_props.insert(CHAT_ALLOWED_KEY.to_string(), chat);
        }

        let mut events = Vec::new();
        if !update_props.is_empty() {
            events.extend(self.apply_user_properties(UserPropertyChange {
                user_id: user_id.clone(),
                update: PropertyUpdate {
                    action: PropertyAction::Upsert,
                    properties: update_props,
                    cause: None,
                },
                operator_id: None,
            }));
        }
        if !deleted.is_empty() {
            events.extend(self.apply_user_properties(UserPropertyChange {
                user_id: user_id.clone(),
                update: PropertyUpdate {
                    action: PropertyAction::Delete,
                    properties: deleted,
                    cause: None,
                },
                operator_id: None,
            }));
        }
        events
    }
}
