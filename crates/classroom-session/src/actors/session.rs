//! `SessionActor` - the session executor.
//!
//! One actor owns everything mutable about one classroom session: the
//! connection state machine, the reconciled room state, the media
//! connection mapping, the in-flight operation table and the observer set.
//! User calls, control-plane completions, media completions and registry
//! pushes all arrive as [`SessionMessage`]s and are applied one at a time.
//!
//! # Connection state machine
//!
//! ```text
//! Disconnected ──join──▶ Connecting ──enter ok──▶ Connected ◀──reconnect── Reconnecting
//!      ▲                    │  │                     │  └──signaling lost──▶     │
//!      │                    │  └─no role slot─▶ FullRoleAborted                  │
//!      │                    └─enter failed───▶ Aborted ◀──signaling abort───────┘
//!      └──────────────────── leave (from any state) ─────────────────────────────
//! ```
//!
//! # Epochs
//!
//! Join, leave and abort each advance the session epoch. Asynchronous work
//! is tagged with the epoch it was issued under, and a completion from an
//! earlier epoch is dropped. There is no mid-flight cancellation.

use super::messages::{
    CommandOutcome, CommandResponder, RefreshReason, SessionMessage, UserCommand, UserServiceSeed,
};
use super::metrics::MailboxMonitor;
use super::pending::{Admission, OperationKey, PendingOperations};
use crate::config::SessionConfig;
use crate::control_plane::{ControlPlaneHelper, ControlPlaneRequest, ControlPlaneResponse};
use crate::errors::EduError;
use crate::events::{ObserverId, ObserverRegistry, SessionEvent, SessionObserver};
use crate::ids::StreamIdGenerator;
use crate::media::{
    tracked, LocalPhase, MediaConnectionManager, MediaEngine, SubscribePlan, SubscriptionDelta,
};
use crate::model::{
    CameraSource, ConnectionState, JoinOptions, LocalStreamConfig, Properties, Role, RoomId,
    RoomInfo, RoomStatus, SessionInfo, SourceKind, Stream, StreamId, SubscribeOptions, User,
    UserRef, CHAT_ALLOWED_KEY,
};
use crate::observability::metrics;
use crate::registry::{
    Registry, RegistryContext, RegistryEvent, RegistrySink, SignalingState, UserEntry,
};
use crate::state::SessionState;
use crate::user_service::{RoleCapabilities, UserService};

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

type OperationFuture = Pin<Box<dyn Future<Output = Result<CommandOutcome, EduError>> + Send>>;

/// How a command proceeds once admitted.
enum Start {
    /// Resolved without any collaborator call.
    Immediate(CommandOutcome),
    /// Collaborator work to spawn; its outcome comes back as a message.
    Spawn(OperationFuture),
}

/// Identity of the join in progress or established.
#[derive(Debug, Clone)]
struct JoinIdentity {
    room_id: RoomId,
    room_name: String,
    local: UserRef,
    user_properties: Properties,
}

/// Handle to a session executor.
///
/// This is the public coordinator surface. Cheap to clone; every clone
/// talks to the same executor.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    session_id: String,
}

impl SessionHandle {
    /// Session identifier (log correlation only).
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> Result<T, EduError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| EduError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| EduError::Internal(format!("response receive failed: {e}")))
    }

    /// Enter the room.
    ///
    /// Malformed options fail immediately with a validation error and no
    /// state change. Otherwise resolves once the session is connected and
    /// the initial registry refresh has been applied, or with the failure
    /// that aborted the join.
    pub async fn join_session(&self, options: JoinOptions) -> Result<(), EduError> {
        options.validate()?;
        self.request(|respond_to| SessionMessage::Join {
            options,
            respond_to,
        })
        .await?
    }

    /// Leave the room. Succeeds without side effects when already left.
    pub async fn leave_session(&self) -> Result<(), EduError> {
        self.request(|respond_to| SessionMessage::Leave { respond_to })
            .await?
    }

    /// Role-gated user-facing operations. Fails until connected.
    pub async fn user_service(&self) -> Result<UserService, EduError> {
        let seed = self
            .request(|respond_to| SessionMessage::GetUserService { respond_to })
            .await??;
        Ok(UserService::new(self.sender.clone(), seed))
    }

    pub async fn session_info(&self) -> Result<SessionInfo, EduError> {
        self.request(|respond_to| SessionMessage::GetSessionInfo { respond_to })
            .await
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, EduError> {
        self.request(|respond_to| SessionMessage::GetConnectionState { respond_to })
            .await
    }

    /// Number of users (local included) with `role`.
    pub async fn user_count(&self, role: Role) -> Result<usize, EduError> {
        Ok(self.user_list(role).await?.len())
    }

    /// Users (local included) with `role`.
    pub async fn user_list(&self, role: Role) -> Result<Vec<User>, EduError> {
        self.request(|respond_to| SessionMessage::GetUserList {
            role: Some(role),
            respond_to,
        })
        .await
    }

    /// Every user, local first.
    pub async fn full_user_list(&self) -> Result<Vec<User>, EduError> {
        self.request(|respond_to| SessionMessage::GetUserList {
            role: None,
            respond_to,
        })
        .await
    }

    pub async fn full_stream_list(&self) -> Result<Vec<Stream>, EduError> {
        self.request(|respond_to| SessionMessage::GetFullStreamList { respond_to })
            .await
    }

    pub async fn local_user(&self) -> Result<Option<User>, EduError> {
        self.request(|respond_to| SessionMessage::GetLocalUser { respond_to })
            .await
    }

    /// Register an observer. Events generated after registration are
    /// delivered in executor order.
    pub async fn register_event_handler(
        &self,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<ObserverId, EduError> {
        self.request(|respond_to| SessionMessage::RegisterObserver {
            observer,
            respond_to,
        })
        .await
    }

    /// Returns true if the observer was registered.
    pub async fn unregister_event_handler(&self, id: ObserverId) -> Result<bool, EduError> {
        self.request(|respond_to| SessionMessage::UnregisterObserver { id, respond_to })
            .await
    }

    /// Stop the executor. A connected session is left first.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    session_id: String,
    receiver: mpsc::Receiver<SessionMessage>,
    /// Weak so that spawned work never keeps the executor alive.
    mailbox_sender: mpsc::WeakSender<SessionMessage>,
    cancel_token: CancellationToken,
    helper: ControlPlaneHelper,
    registry: Arc<dyn Registry>,
    ids: Arc<StreamIdGenerator>,
    auto_subscribe: bool,
    media: MediaConnectionManager,
    state: SessionState,
    connection_state: ConnectionState,
    epoch: u64,
    observers: ObserverRegistry,
    pending: PendingOperations,
    /// Stream ids allocated by create and share operations in flight.
    in_creation: HashMap<OperationKey, StreamId>,
    pending_join: Option<oneshot::Sender<Result<(), EduError>>>,
    identity: Option<JoinIdentity>,
    /// Self-stream id assigned by the enter call, used by the first camera.
    assigned_stream_id: Option<StreamId>,
    user_service: Option<UserServiceSeed>,
    registry_started: bool,
    mailbox: MailboxMonitor,
}

impl SessionActor {
    /// Spawn a new session executor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        config: &SessionConfig,
        helper: ControlPlaneHelper,
        engine: Arc<dyn MediaEngine>,
        registry: Arc<dyn Registry>,
        ids: Arc<StreamIdGenerator>,
        cancel_token: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel(config.mailbox_capacity);

        let actor = Self {
            session_id: session_id.clone(),
            receiver,
            mailbox_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            helper,
            registry,
            ids,
            auto_subscribe: config.auto_subscribe,
            media: MediaConnectionManager::new(
                engine,
                config.region.clone(),
                config.reuse_default_connection,
            ),
            state: SessionState::new(),
            connection_state: ConnectionState::Disconnected,
            epoch: 0,
            observers: ObserverRegistry::new(),
            pending: PendingOperations::new(),
            in_creation: HashMap::new(),
            pending_join: None,
            identity: None,
            assigned_stream_id: None,
            user_service: None,
            registry_started: false,
            mailbox: MailboxMonitor::new(&session_id, config.mailbox_capacity),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            cancel_token,
            session_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "classroom.actor.session", fields(session_id = %self.session_id))]
    async fn run(mut self) {
        metrics::session_started();
        info!(
            target: "classroom.actor.session",
            session_id = %self.session_id,
            "SessionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "classroom.actor.session",
                        session_id = %self.session_id,
                        "SessionActor received cancellation signal"
                    );
                    self.shutdown();
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.handle_message(message);
                            self.mailbox.record_depth(self.receiver.len());
                            self.mailbox.record_processed();
                        }
                        None => {
                            info!(
                                target: "classroom.actor.session",
                                session_id = %self.session_id,
                                "SessionActor channel closed, exiting"
                            );
                            self.shutdown();
                            break;
                        }
                    }
                }
            }
        }

        metrics::session_ended();
        info!(
            target: "classroom.actor.session",
            session_id = %self.session_id,
            messages_processed = self.mailbox.messages_processed(),
            peak_mailbox_depth = self.mailbox.peak_depth(),
            late_completions = self.mailbox.late_completions(),
            "SessionActor stopped"
        );
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Join {
                options,
                respond_to,
            } => self.handle_join(options, respond_to),

            SessionMessage::Leave { respond_to } => {
                let result = self.handle_leave();
                let _ = respond_to.send(result);
            }

            SessionMessage::GetSessionInfo { respond_to } => {
                let _ = respond_to.send(self.state.session_info(self.connection_state));
            }

            SessionMessage::GetConnectionState { respond_to } => {
                let _ = respond_to.send(self.connection_state);
            }

            SessionMessage::GetUserService { respond_to } => {
                let result = self
                    .user_service
                    .clone()
                    .ok_or_else(|| EduError::InvalidState("session is not connected".to_string()));
                let _ = respond_to.send(result);
            }

            SessionMessage::GetUserList { role, respond_to } => {
                let users = self
                    .state
                    .full_user_list()
                    .into_iter()
                    .filter(|user| role.map_or(true, |role| user.role == role))
                    .collect();
                let _ = respond_to.send(users);
            }

            SessionMessage::GetFullStreamList { respond_to } => {
                let _ = respond_to.send(self.state.full_stream_list());
            }

            SessionMessage::GetLocalUser { respond_to } => {
                let _ = respond_to.send(self.state.local_user());
            }

            SessionMessage::RegisterObserver {
                observer,
                respond_to,
            } => {
                let id = self.observers.register(observer);
                debug!(
                    target: "classroom.actor.session",
                    observer_id = ?id,
                    observers = self.observers.len(),
                    "Observer registered"
                );
                let _ = respond_to.send(id);
            }

            SessionMessage::UnregisterObserver { id, respond_to } => {
                let _ = respond_to.send(self.observers.unregister(id));
            }

            SessionMessage::Command {
                command,
                respond_to,
            } => self.handle_command(command, respond_to),

            SessionMessage::EnterCompleted { epoch, result } => {
                self.handle_enter_completed(epoch, result);
            }

            SessionMessage::RefreshCompleted {
                epoch,
                reason,
                result,
            } => self.handle_refresh_completed(epoch, reason, result),

            SessionMessage::OperationCompleted {
                epoch,
                key,
                outcome,
            } => self.handle_operation_completed(epoch, &key, outcome),

            SessionMessage::Registry { epoch, event } => self.handle_registry_event(epoch, event),
        }
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Spawn collaborator work whose result re-enters the mailbox.
    fn spawn_task<F>(&self, work: F)
    where
        F: Future<Output = SessionMessage> + Send + 'static,
    {
        let mailbox = self.mailbox_sender.clone();
        tokio::spawn(async move {
            let message = work.await;
            if let Some(sender) = mailbox.upgrade() {
                let _ = sender.send(message).await;
            }
        });
    }

    fn spawn_operation(&self, key: OperationKey, work: OperationFuture) {
        let epoch = self.epoch;
        self.spawn_task(async move {
            SessionMessage::OperationCompleted {
                epoch,
                key,
                outcome: work.await,
            }
        });
    }

    fn spawn_refresh(&self, reason: RefreshReason) {
        let epoch = self.epoch;
        let registry = Arc::clone(&self.registry);
        self.spawn_task(async move {
            SessionMessage::RefreshCompleted {
                epoch,
                reason,
                result: registry.refresh().await,
            }
        });
    }

    /// Whether a tagged completion belongs to the current epoch.
    fn is_current(&mut self, epoch: u64, what: &'static str) -> bool {
        if epoch == self.epoch {
            return true;
        }
        self.mailbox.record_late_completion();
        debug!(
            target: "classroom.actor.session",
            epoch = epoch,
            current_epoch = self.epoch,
            what = what,
            "Dropping completion from an earlier epoch"
        );
        false
    }

    fn dispatch(&self, events: Vec<SessionEvent>) {
        for event in events {
            metrics::record_event_dispatched(event.name());
            self.observers.dispatch(&event);
        }
    }

    /// Apply a transition from the table and notify observers.
    fn transition(&mut self, next: ConnectionState) -> bool {
        let current = self.connection_state;
        if !current.can_transition_to(next) {
            warn!(
                target: "classroom.actor.session",
                from = current.as_str(),
                to = next.as_str(),
                "Illegal connection state transition ignored"
            );
            return false;
        }

        self.connection_state = next;
        metrics::record_state_transition(next.as_str());
        info!(
            target: "classroom.actor.session",
            session_id = %self.session_id,
            from = current.as_str(),
            to = next.as_str(),
            epoch = self.epoch,
            "Connection state changed"
        );

        self.dispatch(vec![SessionEvent::ConnectionStateChanged {
            state: next,
            session: self.state.session_info(next),
        }]);
        true
    }

    fn finish_join(&mut self, result: Result<(), EduError>) {
        if let Some(respond_to) = self.pending_join.take() {
            let _ = respond_to.send(result);
        }
    }

    /// Release collaborators and fail everything in flight. Advances the
    /// epoch so late completions become no-ops.
    fn release_resources(&mut self, error: &EduError) {
        self.epoch += 1;
        let failed = self.pending.fail_all(error);
        self.in_creation.clear();
        if self.registry_started {
            self.registry.stop();
            self.registry_started = false;
        }
        self.media.release_all();
        self.assigned_stream_id = None;
        if failed > 0 {
            debug!(
                target: "classroom.actor.session",
                failed = failed,
                "In-flight operations failed on teardown"
            );
        }
    }

    fn abort(&mut self, error: EduError, next: ConnectionState) {
        warn!(
            target: "classroom.actor.session",
            session_id = %self.session_id,
            state = self.connection_state.as_str(),
            error_code = error.error_code(),
            error = %error,
            "Session aborted"
        );
        self.transition(next);
        self.release_resources(&error);
        self.state.clear();
        self.user_service = None;
        self.finish_join(Err(error));
    }

    fn shutdown(&mut self) {
        let _ = self.handle_leave();
    }

    fn local_context(&self) -> Result<(RoomId, UserRef), EduError> {
        let local = self
            .state
            .local_ref()
            .ok_or_else(|| EduError::InvalidState("session is not connected".to_string()))?;
        Ok((self.state.room_info().room_id.clone(), local))
    }

    // ------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------

    fn handle_join(&mut self, options: JoinOptions, respond_to: oneshot::Sender<Result<(), EduError>>) {
        if self.connection_state.is_active() {
            let _ = respond_to.send(Err(EduError::InvalidState(format!(
                "cannot join while {}",
                self.connection_state.as_str()
            ))));
            return;
        }

        let role = match options.validate() {
            Ok(role) => role,
            Err(e) => {
                let _ = respond_to.send(Err(e));
                return;
            }
        };

        self.epoch += 1;
        let identity = JoinIdentity {
            room_id: options.room_id.clone(),
            room_name: options.room_name.clone(),
            local: options.user_ref(role),
            user_properties: options.user_properties.clone(),
        };
        self.identity = Some(identity.clone());
        self.pending_join = Some(respond_to);
        self.transition(ConnectionState::Connecting);

        let helper = self.helper.clone();
        let epoch = self.epoch;
        let request = ControlPlaneRequest::Enter {
            user_name: identity.local.user_name.clone(),
            role,
            room_name: identity.room_name.clone(),
            user_properties: identity.user_properties.clone(),
        };
        self.spawn_task(async move {
            let result = helper
                .call(&identity.room_id, &identity.local.user_id, request)
                .await;
            SessionMessage::EnterCompleted { epoch, result }
        });
    }

    fn handle_enter_completed(&mut self, epoch: u64, result: Result<ControlPlaneResponse, EduError>) {
        if !self.is_current(epoch, "enter") {
            return;
        }
        if self.connection_state != ConnectionState::Connecting {
            return;
        }
        let Some(identity) = self.identity.clone() else {
            return;
        };

        let response = match result {
            Ok(ControlPlaneResponse::Entered(response)) => response,
            Ok(ControlPlaneResponse::Done) => {
                self.abort(
                    EduError::Internal("enter returned no payload".to_string()),
                    ConnectionState::Aborted,
                );
                return;
            }
            Err(e) => {
                self.abort(e, ConnectionState::Aborted);
                return;
            }
        };

        if response.stream_id.is_empty() {
            self.abort(EduError::RoleFull, ConnectionState::FullRoleAborted);
            return;
        }

        let mut user_properties = if response.user_properties.is_empty() {
            identity.user_properties.clone()
        } else {
            response.user_properties.clone()
        };
        user_properties.insert(
            CHAT_ALLOWED_KEY.to_string(),
            serde_json::Value::Bool(response.user_chat_allowed),
        );
        let room_name = if response.room_name.is_empty() {
            identity.room_name.clone()
        } else {
            response.room_name.clone()
        };

        self.state.begin(
            UserEntry {
                user_id: identity.local.user_id.clone(),
                user_name: identity.local.user_name.clone(),
                role: identity.local.role,
                properties: user_properties,
            },
            RoomInfo {
                room_id: identity.room_id.clone(),
                room_name,
            },
            RoomStatus {
                course_state: response.course_state,
                start_time: response.start_time,
                chat_allowed: response.room_chat_allowed,
                online_users_count: 0,
            },
            response.room_properties,
        );
        self.media
            .bind(identity.room_id.clone(), response.media_token);
        self.assigned_stream_id = Some(response.stream_id);

        // Constructed once per join, on first reaching Connected
        if self.user_service.is_none() {
            self.user_service = Some(UserServiceSeed {
                local_user: identity.local.clone(),
                capabilities: RoleCapabilities::for_role(identity.local.role),
            });
        }

        let sink = RegistrySink::new(self.mailbox_sender.clone(), self.epoch);
        let ctx = RegistryContext {
            room_id: identity.room_id,
            local_user: identity.local,
        };
        if let Err(e) = self.registry.start(ctx, sink) {
            self.abort(e, ConnectionState::Aborted);
            return;
        }
        self.registry_started = true;

        self.transition(ConnectionState::Connected);
        self.spawn_refresh(RefreshReason::Initial);
    }

    fn handle_refresh_completed(
        &mut self,
        epoch: u64,
        reason: RefreshReason,
        result: Result<crate::registry::RegistrySnapshot, EduError>,
    ) {
        if !self.is_current(epoch, "refresh") {
            return;
        }

        match result {
            Ok(snapshot) => {
                let events = self.state.apply_snapshot(snapshot);
                debug!(
                    target: "classroom.registry",
                    reason = ?reason,
                    events = events.len(),
                    "Registry snapshot reconciled"
                );
                self.after_reconcile(&events);
                self.dispatch(events);
            }
            Err(e) => {
                warn!(
                    target: "classroom.registry",
                    reason = ?reason,
                    error = %e,
                    "Registry refresh failed, keeping incremental state"
                );
            }
        }

        if reason == RefreshReason::Initial {
            self.finish_join(Ok(()));
        }
    }

    fn handle_leave(&mut self) -> Result<(), EduError> {
        // A failed join already released everything; observers stay for
        // the next attempt.
        if self.connection_state == ConnectionState::Disconnected
            || self.connection_state.is_terminal()
        {
            debug!(
                target: "classroom.actor.session",
                session_id = %self.session_id,
                state = self.connection_state.as_str(),
                "Leave on a session that is not joined"
            );
            return Ok(());
        }

        let error = EduError::InvalidState("session left".to_string());
        self.transition(ConnectionState::Disconnected);
        self.finish_join(Err(error.clone()));
        self.release_resources(&error);
        self.state.clear();
        self.user_service = None;
        self.identity = None;
        let observers = self.observers.clear();

        info!(
            target: "classroom.actor.session",
            session_id = %self.session_id,
            observers_cleared = observers,
            "Session left"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------

    fn handle_registry_event(&mut self, epoch: u64, event: RegistryEvent) {
        if !self.is_current(epoch, event.name()) {
            return;
        }

        if let RegistryEvent::Signaling(signal) = event {
            self.handle_signaling(signal);
            return;
        }

        if !matches!(
            self.connection_state,
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            debug!(
                target: "classroom.registry",
                event = event.name(),
                state = self.connection_state.as_str(),
                "Registry event ignored outside an established session"
            );
            return;
        }

        let events = match event {
            RegistryEvent::UserListChanged(change) => self.state.apply_user_list(change),
            RegistryEvent::StreamsChanged(change) => self.state.apply_streams(change),
            RegistryEvent::UserPropertiesChanged(change) => {
                self.state.apply_user_properties(change)
            }
            RegistryEvent::ScenePropertiesChanged(change) => {
                self.state.apply_scene_properties(change)
            }
            RegistryEvent::RoomStatusChanged(change) => self.state.apply_room_status(change),
            RegistryEvent::RoomMessage(message) => {
                if self.state.is_local_user(&message.from.user_id) {
                    Vec::new()
                } else {
                    vec![SessionEvent::RoomMessageReceived { message }]
                }
            }
            RegistryEvent::UserMessage(message) => {
                if self.state.is_local_user(&message.from.user_id) {
                    Vec::new()
                } else {
                    vec![SessionEvent::UserMessageReceived { message }]
                }
            }
            RegistryEvent::Signaling(_) => Vec::new(),
        };

        self.after_reconcile(&events);
        self.dispatch(events);
    }

    fn handle_signaling(&mut self, signal: SignalingState) {
        match (signal, self.connection_state) {
            (SignalingState::Disconnected, ConnectionState::Connected) => {
                self.transition(ConnectionState::Reconnecting);
            }
            (SignalingState::Connected, ConnectionState::Reconnecting) => {
                self.transition(ConnectionState::Connected);
                self.spawn_refresh(RefreshReason::Reconnect);
            }
            (SignalingState::Aborted(reason), state) if state.is_active() => {
                self.abort(EduError::Signaling(reason), ConnectionState::Aborted);
            }
            (signal, state) => {
                debug!(
                    target: "classroom.registry",
                    signal = ?signal,
                    state = state.as_str(),
                    "Signaling notification needs no transition"
                );
            }
        }
    }

    /// Media housekeeping driven by reconciled changes. Runs before the
    /// events reach observers.
    fn after_reconcile(&mut self, events: &[SessionEvent]) {
        let local_id = self.state.local_ref().map(|local| local.user_id);
        let by_other = |operator: &Option<UserRef>| {
            operator
                .as_ref()
                .is_some_and(|op| Some(&op.user_id) != local_id.as_ref())
        };

        for event in events {
            match event {
                SessionEvent::RemoteStreamsRemoved { streams, .. } => {
                    for stream in streams {
                        self.release_subscription(&stream.stream_id);
                    }
                }
                SessionEvent::RemoteStreamsAdded { streams, .. } if self.auto_subscribe => {
                    for stream in streams {
                        // Nobody waits on automatic subscriptions
                        let (tx, _rx) = oneshot::channel();
                        self.handle_command(
                            UserCommand::Subscribe {
                                stream_id: stream.stream_id.clone(),
                                options: SubscribeOptions::default(),
                            },
                            tx,
                        );
                    }
                }
                SessionEvent::LocalStreamUpdated { stream, operator } if by_other(operator) => {
                    self.enforce_local_update(stream);
                }
                SessionEvent::LocalStreamRemoved { stream, operator } if by_other(operator) => {
                    self.enforce_local_removal(&stream.stream_id);
                }
                _ => {}
            }
        }
    }

    fn release_subscription(&mut self, stream_id: &StreamId) {
        if !self.media.remove_subscription(stream_id) {
            return;
        }
        let Ok(connection) = self.media.default_connection() else {
            return;
        };
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            let _ = tracked("unsubscribe", connection.unsubscribe(&stream_id).await);
        });
    }

    /// Someone else changed our stream (host mute): apply it to capture.
    fn enforce_local_update(&mut self, stream: &Stream) {
        let Some(current) = self.media.local_stream(&stream.stream_id) else {
            return;
        };
        let Some(connection) = self.media.local_connection(&stream.stream_id) else {
            return;
        };
        self.media.update_local(stream);

        let mut changes = Vec::new();
        if current.has_audio != stream.has_audio {
            changes.push((crate::model::MediaKinds::AUDIO, stream.has_audio));
        }
        if current.has_video != stream.has_video {
            changes.push((crate::model::MediaKinds::VIDEO, stream.has_video));
        }
        if changes.is_empty() {
            return;
        }

        info!(
            target: "classroom.media",
            stream_id = %stream.stream_id,
            audio = stream.has_audio,
            video = stream.has_video,
            "Applying remote change to local capture"
        );
        let stream_id = stream.stream_id.clone();
        tokio::spawn(async move {
            for (kinds, enabled) in changes {
                let _ = tracked(
                    "set_local_enabled",
                    connection.set_local_enabled(&stream_id, kinds, enabled).await,
                );
            }
        });
    }

    /// Someone else closed our stream: stop sending it.
    fn enforce_local_removal(&mut self, stream_id: &StreamId) {
        if self.media.local_phase(stream_id) != Some(LocalPhase::Published) {
            return;
        }
        let Some(connection) = self.media.local_connection(stream_id) else {
            return;
        };
        self.media.mark_unpublished(stream_id);

        info!(
            target: "classroom.media",
            stream_id = %stream_id,
            "Local stream closed remotely, unpublishing"
        );
        let stream_id = stream_id.clone();
        tokio::spawn(async move {
            let _ = tracked("unpublish", connection.unpublish(&stream_id).await);
        });
    }

    // ------------------------------------------------------------------
    // User commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: UserCommand, respond_to: CommandResponder) {
        if !matches!(
            self.connection_state,
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            let _ = respond_to.send(Err(EduError::InvalidState(format!(
                "{} requires a connected session (current: {})",
                command.name(),
                self.connection_state.as_str()
            ))));
            return;
        }

        if let Err(e) = self.authorize(&command) {
            let _ = respond_to.send(Err(e));
            return;
        }

        if let UserCommand::SetStreamView { stream_id, view } = &command {
            let result = self
                .media
                .set_view(stream_id, *view)
                .map(|()| CommandOutcome::Done);
            let _ = respond_to.send(result);
            return;
        }

        let Some(key) = OperationKey::for_command(&command) else {
            let _ = respond_to.send(Err(EduError::Internal(format!(
                "{} has no operation key",
                command.name()
            ))));
            return;
        };

        match self.pending.admit(key.clone(), &command, respond_to) {
            Admission::Issue => {}
            Admission::Joined => {
                debug!(
                    target: "classroom.actor.session",
                    command = command.name(),
                    target_key = %key.target,
                    "Joined identical in-flight operation"
                );
                return;
            }
            Admission::Rejected(respond_to) => {
                let _ = respond_to.send(Err(EduError::InvalidState(format!(
                    "another operation on {} is in flight",
                    key.target
                ))));
                return;
            }
        }

        match self.start_command(&key, &command) {
            Ok(Start::Spawn(work)) => self.spawn_operation(key, work),
            Ok(Start::Immediate(outcome)) => self.reply(&key, Ok(outcome)),
            Err(e) => self.reply(&key, Err(e)),
        }
    }

    /// Check role-gated commands against the role of the current join.
    /// A service obtained under an earlier join may carry another role.
    fn authorize(&self, command: &UserCommand) -> Result<(), EduError> {
        let capabilities = self
            .user_service
            .as_ref()
            .map(|seed| seed.capabilities)
            .unwrap_or_default();
        let (allowed, operation) = match command {
            UserCommand::UpdateCourseState(_) => (
                capabilities.can_change_course_state,
                "change the course state",
            ),
            UserCommand::AllowChat { .. } => (capabilities.can_moderate_chat, "moderate chat"),
            UserCommand::StartShareScreen(_) | UserCommand::StopShareScreen => {
                (capabilities.can_share_screen, "share the screen")
            }
            UserCommand::CreateStreamFor { .. } => (
                capabilities.can_manage_others_streams,
                "create streams for other participants",
            ),
            UserCommand::SetUserProperties { user_id, .. } if !self.state.is_local_user(user_id) => (
                capabilities.can_manage_others_streams,
                "set another user's properties",
            ),
            _ => return Ok(()),
        };
        if allowed {
            return Ok(());
        }

        let role = self
            .user_service
            .as_ref()
            .map_or("none", |seed| seed.local_user.role.as_str());
        warn!(
            target: "classroom.actor.session",
            session_id = %self.session_id,
            role = role,
            command = command.name(),
            "Command denied for the current role"
        );
        Err(EduError::PermissionDenied(format!(
            "role {role} may not {operation}"
        )))
    }

    fn handle_operation_completed(
        &mut self,
        epoch: u64,
        key: &OperationKey,
        outcome: Result<CommandOutcome, EduError>,
    ) {
        if !self.is_current(epoch, "operation") {
            return;
        }
        let Some((command, waiters)) = self.pending.take(key) else {
            return;
        };
        let allocated = self.in_creation.get(key).cloned();
        self.apply_completion(key, &command, &outcome);
        self.respond(&command, waiters, outcome, allocated);
    }

    /// Resolve an entry that completed without spawned work.
    fn reply(&mut self, key: &OperationKey, outcome: Result<CommandOutcome, EduError>) {
        if let Some((command, waiters)) = self.pending.take(key) {
            self.respond(&command, waiters, outcome, None);
        }
    }

    /// Reply to every waiter. `allocated` names the stream a failed
    /// create or share was building.
    fn respond(
        &mut self,
        command: &UserCommand,
        waiters: Vec<CommandResponder>,
        outcome: Result<CommandOutcome, EduError>,
        allocated: Option<StreamId>,
    ) {
        if let Some(operation) = command.stream_operation() {
            let stream = match &outcome {
                Ok(CommandOutcome::Stream(stream)) => Some(stream.clone()),
                _ => None,
            };
            let stream_id = stream
                .as_ref()
                .map(|stream| stream.stream_id.clone())
                .or_else(|| command_stream_id(command))
                .or(allocated)
                .unwrap_or_default();
            self.dispatch(vec![SessionEvent::StreamOperationCompleted {
                operation,
                stream_id,
                stream,
                error: outcome.as_ref().err().cloned(),
            }]);
        }

        if let Err(e) = &outcome {
            debug!(
                target: "classroom.actor.session",
                command = command.name(),
                error = %e,
                "Command failed"
            );
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    /// Pick an id for a new capture. The first camera uses the id the
    /// enter call assigned.
    fn allocate_stream_id(&mut self, source: SourceKind) -> Result<StreamId, EduError> {
        if source == SourceKind::Camera {
            if let Some(assigned) = self.assigned_stream_id.take() {
                if !self.media.is_local(&assigned) && self.state.stream(&assigned).is_none() {
                    return Ok(assigned);
                }
            }
        }
        let state = &self.state;
        let media = &self.media;
        self.ids
            .next_stream_id(|candidate| state.stream(candidate).is_some() || media.is_local(candidate))
            .ok_or_else(|| EduError::Internal("stream id space exhausted".to_string()))
    }

    fn known_stream(&self, stream_id: &StreamId) -> Result<Stream, EduError> {
        if let Some(stream) = self.media.local_stream(stream_id) {
            return Ok(stream);
        }
        self.state
            .stream(stream_id)
            .cloned()
            .ok_or_else(|| EduError::NotFound(format!("stream {stream_id}")))
    }

    /// Validate a command against current state and build its work.
    #[allow(clippy::too_many_lines)]
    fn start_command(&mut self, key: &OperationKey, command: &UserCommand) -> Result<Start, EduError> {
        let (room_id, local) = self.local_context()?;
        let helper = self.helper.clone();

        match command.clone() {
            UserCommand::CreateLocalStream(config) => self.start_create(key, &local, config),

            UserCommand::Publish(stream_id) => {
                let stream = self.require_local(&stream_id, "published")?;
                if self.media.local_phase(&stream_id) == Some(LocalPhase::Published) {
                    return Ok(Start::Immediate(CommandOutcome::Stream(stream)));
                }
                let connection = self.local_connection(&stream_id)?;
                Ok(Start::Spawn(Box::pin(async move {
                    helper
                        .call_done(
                            &room_id,
                            &local.user_id,
                            ControlPlaneRequest::UpsertStream {
                                owner: local.user_id.clone(),
                                stream: stream.clone(),
                            },
                        )
                        .await?;
                    tracked("publish", connection.publish(&stream).await)?;
                    Ok(CommandOutcome::Stream(stream))
                })))
            }

            UserCommand::Unpublish(stream_id) => {
                let stream = self.require_local(&stream_id, "unpublished")?;
                if self.media.local_phase(&stream_id) != Some(LocalPhase::Published) {
                    return Ok(Start::Immediate(CommandOutcome::Stream(stream)));
                }
                let connection = self.local_connection(&stream_id)?;
                // Record before media, the reverse of publish
                Ok(Start::Spawn(Box::pin(async move {
                    helper
                        .call_done(
                            &room_id,
                            &local.user_id,
                            ControlPlaneRequest::RemoveStream {
                                owner: local.user_id.clone(),
                                stream_id: stream_id.clone(),
                            },
                        )
                        .await?;
                    tracked("unpublish", connection.unpublish(&stream_id).await)?;
                    Ok(CommandOutcome::Stream(stream))
                })))
            }

            UserCommand::SetEnabled {
                stream_id,
                kinds,
                enabled,
            } => self.start_set_enabled(&room_id, &local, &stream_id, kinds, enabled),

            UserCommand::Subscribe { stream_id, options } => {
                let stream = self.require_remote(&stream_id, "subscribed")?;
                let plan = self.media.plan_subscribe(&stream_id, options);
                if plan == SubscribePlan::Noop {
                    return Ok(Start::Immediate(CommandOutcome::Stream(stream)));
                }
                let connection = self.media.default_connection()?;
                Ok(Start::Spawn(Box::pin(async move {
                    match plan {
                        SubscribePlan::Delta(delta) => tracked(
                            "update_subscription",
                            connection.update_subscription(&stream_id, delta).await,
                        )?,
                        _ => tracked("subscribe", connection.subscribe(&stream, options).await)?,
                    }
                    Ok(CommandOutcome::Stream(stream))
                })))
            }

            UserCommand::Unsubscribe(stream_id) => {
                let stream = self.known_stream(&stream_id)?;
                if self.media.subscription(&stream_id).is_none() {
                    return Ok(Start::Immediate(CommandOutcome::Stream(stream)));
                }
                let connection = self.media.default_connection()?;
                Ok(Start::Spawn(Box::pin(async move {
                    tracked("unsubscribe", connection.unsubscribe(&stream_id).await)?;
                    Ok(CommandOutcome::Stream(stream))
                })))
            }

            UserCommand::SwitchCamera { stream_id, camera } => {
                let stream = self.require_local(&stream_id, "switched")?;
                if stream.source != SourceKind::Camera {
                    return Err(EduError::InvalidState(format!(
                        "stream {stream_id} is not a camera stream"
                    )));
                }
                if self.media.local_camera(&stream_id).as_ref() == Some(&camera) {
                    return Ok(Start::Immediate(CommandOutcome::Stream(stream)));
                }
                let connection = self.local_connection(&stream_id)?;
                Ok(Start::Spawn(Box::pin(async move {
                    tracked(
                        "select_camera",
                        connection.select_camera(&stream_id, &camera).await,
                    )?;
                    Ok(CommandOutcome::Stream(stream))
                })))
            }

            UserCommand::StartShareScreen(source) => {
                if self.media.local_by_source(SourceKind::Screen).is_some() {
                    return Err(EduError::InvalidState(
                        "screen share already active".to_string(),
                    ));
                }
                let stream_id = self.allocate_stream_id(SourceKind::Screen)?;
                let stream = Stream {
                    stream_id: stream_id.clone(),
                    owner_id: local.user_id.clone(),
                    stream_name: "screen".to_string(),
                    source: SourceKind::Screen,
                    has_audio: false,
                    has_video: true,
                };
                let connection = self
                    .media
                    .create_local(stream.clone(), CameraSource::default())?;
                self.in_creation.insert(key.clone(), stream_id.clone());
                Ok(Start::Spawn(Box::pin(async move {
                    tracked(
                        "start_screen_capture",
                        connection.start_screen_capture(&stream_id, &source).await,
                    )?;
                    helper
                        .call_done(
                            &room_id,
                            &local.user_id,
                            ControlPlaneRequest::UpsertStream {
                                owner: local.user_id.clone(),
                                stream: stream.clone(),
                            },
                        )
                        .await?;
                    tracked("publish", connection.publish(&stream).await)?;
                    Ok(CommandOutcome::Stream(stream))
                })))
            }

            UserCommand::StopShareScreen => {
                let stream = self
                    .media
                    .local_by_source(SourceKind::Screen)
                    .ok_or_else(|| EduError::InvalidState("no active screen share".to_string()))?;
                let published =
                    self.media.local_phase(&stream.stream_id) == Some(LocalPhase::Published);
                let connection = self.local_connection(&stream.stream_id)?;
                Ok(Start::Spawn(Box::pin(async move {
                    let stream_id = stream.stream_id.clone();
                    if published {
                        helper
                            .call_done(
                                &room_id,
                                &local.user_id,
                                ControlPlaneRequest::RemoveStream {
                                    owner: local.user_id.clone(),
                                    stream_id: stream_id.clone(),
                                },
                            )
                            .await?;
                        tracked("unpublish", connection.unpublish(&stream_id).await)?;
                    }
                    tracked(
                        "stop_screen_capture",
                        connection.stop_screen_capture(&stream_id).await,
                    )?;
                    Ok(CommandOutcome::Stream(stream))
                })))
            }

            UserCommand::CreateStreamFor { user_id, config } => {
                if self.state.remote_user(&user_id).is_none() {
                    return Err(EduError::NotFound(format!("user {user_id}")));
                }
                let stream_id = self.allocate_stream_id(SourceKind::None)?;
                self.in_creation.insert(key.clone(), stream_id.clone());
                let stream = stream_from_config(stream_id, user_id.clone(), &config);
                Ok(Start::Spawn(Box::pin(async move {
                    helper
                        .call_done(
                            &room_id,
                            &local.user_id,
                            ControlPlaneRequest::UpsertStream {
                                owner: user_id,
                                stream: stream.clone(),
                            },
                        )
                        .await?;
                    Ok(CommandOutcome::Stream(stream))
                })))
            }

            UserCommand::SendRoomMessage { text } => Ok(control_plane_only(
                helper,
                room_id,
                local,
                ControlPlaneRequest::SendRoomMessage { text },
            )),

            UserCommand::SendUserMessage { to, text } => Ok(control_plane_only(
                helper,
                room_id,
                local,
                ControlPlaneRequest::SendUserMessage { to, text },
            )),

            UserCommand::SetRoomProperties(update) => Ok(control_plane_only(
                helper,
                room_id,
                local,
                ControlPlaneRequest::UpdateRoomProperties(update),
            )),

            UserCommand::SetUserProperties { user_id, update } => {
                if user_id != local.user_id && self.state.remote_user(&user_id).is_none() {
                    return Err(EduError::NotFound(format!("user {user_id}")));
                }
                Ok(control_plane_only(
                    helper,
                    room_id,
                    local,
                    ControlPlaneRequest::UpdateUserProperties { user_id, update },
                ))
            }

            UserCommand::UpdateCourseState(state) => Ok(control_plane_only(
                helper,
                room_id,
                local,
                ControlPlaneRequest::UpdateCourseState(state),
            )),

            UserCommand::AllowChat { target, allowed } => {
                if let crate::model::ChatTarget::User(user_id) = &target {
                    if !self.state.is_local_user(user_id) && self.state.remote_user(user_id).is_none() {
                        return Err(EduError::NotFound(format!("user {user_id}")));
                    }
                }
                Ok(control_plane_only(
                    helper,
                    room_id,
                    local,
                    ControlPlaneRequest::AllowChat { target, allowed },
                ))
            }

            UserCommand::SetStreamView { .. } => Err(EduError::Internal(
                "stream views are applied synchronously".to_string(),
            )),
        }
    }

    fn start_create(
        &mut self,
        key: &OperationKey,
        local: &UserRef,
        config: LocalStreamConfig,
    ) -> Result<Start, EduError> {
        if config.source == SourceKind::Screen {
            return Err(EduError::Validation(
                "use start_share_screen for screen captures".to_string(),
            ));
        }
        let stream_id = self.allocate_stream_id(config.source)?;
        let stream = stream_from_config(stream_id.clone(), local.user_id.clone(), &config);
        let connection = self
            .media
            .create_local(stream.clone(), config.camera.clone())?;

        if config.source != SourceKind::Camera || !config.enable_video {
            return Ok(Start::Immediate(CommandOutcome::Stream(stream)));
        }

        self.in_creation.insert(key.clone(), stream_id.clone());
        let camera = config.camera;
        Ok(Start::Spawn(Box::pin(async move {
            tracked(
                "select_camera",
                connection.select_camera(&stream_id, &camera).await,
            )?;
            Ok(CommandOutcome::Stream(stream))
        })))
    }

    fn start_set_enabled(
        &mut self,
        room_id: &RoomId,
        local: &UserRef,
        stream_id: &StreamId,
        kinds: crate::model::MediaKinds,
        enabled: bool,
    ) -> Result<Start, EduError> {
        let helper = self.helper.clone();
        let room_id = room_id.clone();
        let local = local.clone();
        let stream_id = stream_id.clone();

        if let Some(stream) = self.media.local_stream(&stream_id) {
            let next = stream.with_enabled(kinds, enabled);
            if next == stream {
                return Ok(Start::Immediate(CommandOutcome::Stream(stream)));
            }
            let published = self.media.local_phase(&stream_id) == Some(LocalPhase::Published);
            let connection = self.local_connection(&stream_id)?;
            return Ok(Start::Spawn(Box::pin(async move {
                tracked(
                    "set_local_enabled",
                    connection.set_local_enabled(&stream_id, kinds, enabled).await,
                )?;
                if published {
                    helper
                        .call_done(
                            &room_id,
                            &local.user_id,
                            ControlPlaneRequest::UpsertStream {
                                owner: local.user_id.clone(),
                                stream: next.clone(),
                            },
                        )
                        .await?;
                }
                Ok(CommandOutcome::Stream(next))
            })));
        }

        let stream = self.require_remote(&stream_id, "muted remotely")?;
        let manages_others = self
            .user_service
            .as_ref()
            .is_some_and(|seed| seed.capabilities.can_manage_others_streams);

        if manages_others {
            let next = stream.with_enabled(kinds, enabled);
            return Ok(Start::Spawn(Box::pin(async move {
                helper
                    .call_done(
                        &room_id,
                        &local.user_id,
                        ControlPlaneRequest::UpsertStream {
                            owner: next.owner_id.clone(),
                            stream: next.clone(),
                        },
                    )
                    .await?;
                Ok(CommandOutcome::Stream(next))
            })));
        }

        // Receive-side mute
        if self.media.subscription(&stream_id).is_none() {
            return Err(EduError::InvalidState(format!(
                "stream {stream_id} is not subscribed"
            )));
        }
        let delta = receive_delta(kinds, enabled);
        let connection = self.media.default_connection()?;
        Ok(Start::Spawn(Box::pin(async move {
            tracked(
                "update_subscription",
                connection.update_subscription(&stream_id, delta).await,
            )?;
            Ok(CommandOutcome::Stream(stream))
        })))
    }

    fn require_local(&self, stream_id: &StreamId, verb: &str) -> Result<Stream, EduError> {
        if let Some(stream) = self.media.local_stream(stream_id) {
            return Ok(stream);
        }
        match self.state.stream(stream_id) {
            Some(_) => Err(EduError::InvalidState(format!(
                "stream {stream_id} is not a local capture and cannot be {verb}"
            ))),
            None => Err(EduError::NotFound(format!("stream {stream_id}"))),
        }
    }

    fn require_remote(&self, stream_id: &StreamId, verb: &str) -> Result<Stream, EduError> {
        let stream = self
            .state
            .stream(stream_id)
            .cloned()
            .ok_or_else(|| EduError::NotFound(format!("stream {stream_id}")))?;
        if self.state.is_local_user(&stream.owner_id) || self.media.is_local(stream_id) {
            return Err(EduError::InvalidState(format!(
                "stream {stream_id} is local and cannot be {verb}"
            )));
        }
        Ok(stream)
    }

    fn local_connection(
        &self,
        stream_id: &StreamId,
    ) -> Result<Arc<dyn crate::media::MediaConnection>, EduError> {
        self.media
            .local_connection(stream_id)
            .ok_or_else(|| EduError::NotFound(format!("stream {stream_id}")))
    }

    /// Apply the effect of completed work to session state.
    fn apply_completion(
        &mut self,
        key: &OperationKey,
        command: &UserCommand,
        outcome: &Result<CommandOutcome, EduError>,
    ) {
        let local = self.state.local_ref();
        let creating = self.in_creation.remove(key);

        let stream = match outcome {
            Ok(CommandOutcome::Stream(stream)) => Some(stream.clone()),
            Ok(CommandOutcome::Done) => None,
            Err(_) => {
                match command {
                    UserCommand::CreateLocalStream(_) => {
                        if let Some(stream_id) = creating {
                            self.media.remove_local(&stream_id);
                        }
                    }
                    UserCommand::StartShareScreen(_) => {
                        if let Some(stream_id) = creating {
                            if self.media.local_phase(&stream_id) != Some(LocalPhase::Published) {
                                self.media.remove_local(&stream_id);
                            }
                        }
                    }
                    _ => {}
                }
                return;
            }
        };
        let Some(stream) = stream else {
            return;
        };

        let mut events = Vec::new();
        match command {
            UserCommand::Publish(_) | UserCommand::StartShareScreen(_) => {
                self.media.mark_published(&stream);
                events.extend(self.state.upsert_local_stream(stream, local));
            }
            UserCommand::Unpublish(stream_id) => {
                self.media.mark_unpublished(stream_id);
                events.extend(self.state.remove_local_stream(stream_id, local));
            }
            UserCommand::StopShareScreen => {
                self.media.remove_local(&stream.stream_id);
                events.extend(self.state.remove_local_stream(&stream.stream_id, local));
            }
            UserCommand::SetEnabled {
                stream_id,
                kinds,
                enabled,
            } => {
                if self.media.is_local(stream_id) {
                    let published =
                        self.media.local_phase(stream_id) == Some(LocalPhase::Published);
                    self.media.update_local(&stream);
                    if published {
                        events.extend(self.state.upsert_local_stream(stream, local));
                    }
                } else if let Some(current) = self.media.subscription(stream_id) {
                    let manages_others = self
                        .user_service
                        .as_ref()
                        .is_some_and(|seed| seed.capabilities.can_manage_others_streams);
                    if !manages_others {
                        let next = receive_delta(*kinds, *enabled).apply(current);
                        self.media.record_subscription(stream_id.clone(), next);
                    }
                }
            }
            UserCommand::Subscribe { stream_id, options } => {
                self.media.record_subscription(stream_id.clone(), *options);
                if self.state.stream(stream_id).is_none() {
                    // Stream vanished while the subscription was in flight
                    self.release_subscription(stream_id);
                }
            }
            UserCommand::Unsubscribe(stream_id) => {
                self.media.remove_subscription(stream_id);
            }
            UserCommand::SwitchCamera { stream_id, camera } => {
                self.media.set_camera(stream_id, camera.clone());
            }
            _ => {}
        }

        self.dispatch(events);
    }
}

/// Work that is a single control-plane call.
fn control_plane_only(
    helper: ControlPlaneHelper,
    room_id: RoomId,
    local: UserRef,
    request: ControlPlaneRequest,
) -> Start {
    Start::Spawn(Box::pin(async move {
        helper.call_done(&room_id, &local.user_id, request).await?;
        Ok(CommandOutcome::Done)
    }))
}

fn stream_from_config(
    stream_id: StreamId,
    owner_id: crate::model::UserId,
    config: &LocalStreamConfig,
) -> Stream {
    let stream_name = if config.stream_name.is_empty() {
        match config.source {
            SourceKind::Screen => "screen".to_string(),
            SourceKind::Camera | SourceKind::None => "camera".to_string(),
        }
    } else {
        config.stream_name.clone()
    };
    Stream {
        stream_id,
        owner_id,
        stream_name,
        source: config.source,
        has_audio: config.enable_audio,
        has_video: config.enable_video,
    }
}

/// Subscription change for a receive-side mute of the selected tracks.
fn receive_delta(kinds: crate::model::MediaKinds, enabled: bool) -> SubscriptionDelta {
    SubscriptionDelta {
        audio: kinds.audio.then_some(enabled),
        video: kinds.video.then_some(enabled),
        quality: None,
    }
}

fn command_stream_id(command: &UserCommand) -> Option<StreamId> {
    match command {
        UserCommand::Publish(id)
        | UserCommand::Unpublish(id)
        | UserCommand::Unsubscribe(id)
        | UserCommand::Subscribe { stream_id: id, .. }
        | UserCommand::SetEnabled { stream_id: id, .. }
        | UserCommand::SwitchCamera { stream_id: id, .. }
        | UserCommand::SetStreamView { stream_id: id, .. } => Some(id.clone()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{MediaKinds, UserId, VideoQuality};

    #[test]
    fn test_receive_delta_only_touches_selected_tracks() {
        let delta = receive_delta(MediaKinds::VIDEO, false);
        assert_eq!(delta.audio, None);
        assert_eq!(delta.video, Some(false));
        assert_eq!(delta.quality, None);

        let current = SubscribeOptions {
            audio: true,
            video: true,
            quality: VideoQuality::Low,
        };
        let next = delta.apply(current);
        assert!(next.audio);
        assert!(!next.video);
        assert_eq!(next.quality, VideoQuality::Low);
    }

    #[test]
    fn test_stream_from_config_names_unnamed_streams() {
        let config = LocalStreamConfig {
            enable_audio: false,
            ..LocalStreamConfig::default()
        };
        let stream = stream_from_config(StreamId::new("7"), UserId::new("alice"), &config);

        assert_eq!(stream.stream_name, "camera");
        assert_eq!(stream.source, SourceKind::Camera);
        assert!(!stream.has_audio);
        assert!(stream.has_video);

        let named = LocalStreamConfig {
            stream_name: "document camera".to_string(),
            ..LocalStreamConfig::default()
        };
        let stream = stream_from_config(StreamId::new("8"), UserId::new("alice"), &named);
        assert_eq!(stream.stream_name, "document camera");
    }

    #[test]
    fn test_command_stream_id_for_stream_commands() {
        let id = StreamId::new("42");
        assert_eq!(
            command_stream_id(&UserCommand::Publish(id.clone())),
            Some(id.clone())
        );
        assert_eq!(
            command_stream_id(&UserCommand::SetEnabled {
                stream_id: id.clone(),
                kinds: MediaKinds::ALL,
                enabled: false,
            }),
            Some(id)
        );
        assert_eq!(command_stream_id(&UserCommand::StopShareScreen), None);
    }
}
