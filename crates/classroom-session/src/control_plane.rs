//! Control-plane operation helper.
//!
//! Wraps each request to the remote control plane with:
//! - parameter assembly from the session context (app id, auth token,
//!   room id, user id)
//! - a correlation id for tracing
//! - a timeout guard that normalizes an ambiguous outcome to
//!   [`EduError::Timeout`]
//!
//! Every call yields exactly one `Result`. The helper never touches
//! session state: the executor spawns the call and the outcome comes back
//! as a mailbox message, whichever thread the transport completed on.
//! Server-side effects of a timed-out call are discovered by the next full
//! registry refresh.
//!
//! # Security
//!
//! - The auth token and issued media tokens are `SecretString`
//! - Tokens and message bodies are never logged

use crate::errors::EduError;
use crate::model::{
    ChatTarget, CourseState, Properties, PropertyUpdate, Role, RoomId, Stream, StreamId, UserId,
};
use crate::observability::metrics;

use async_trait::async_trait;
use common::secret::SecretString;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-call parameters assembled from session context.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub app_id: String,
    /// Redacted in Debug by `SecretString`.
    pub auth_token: SecretString,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub correlation_id: Uuid,
}

/// Operation-specific request fields.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlPlaneRequest {
    /// Enter the room; the response assigns the self-stream id.
    Enter {
        user_name: String,
        role: Role,
        room_name: String,
        user_properties: Properties,
    },
    /// Create or update a stream record for `owner`.
    UpsertStream { owner: UserId, stream: Stream },
    RemoveStream { owner: UserId, stream_id: StreamId },
    SendRoomMessage { text: String },
    SendUserMessage { to: UserId, text: String },
    UpdateRoomProperties(PropertyUpdate),
    UpdateUserProperties { user_id: UserId, update: PropertyUpdate },
    UpdateCourseState(CourseState),
    AllowChat { target: ChatTarget, allowed: bool },
}

impl ControlPlaneRequest {
    /// Bounded operation name for logs and metric labels.
    #[must_use]
    pub const fn operation(&self) -> &'static str {
        match self {
            ControlPlaneRequest::Enter { .. } => "enter",
            ControlPlaneRequest::UpsertStream { .. } => "upsert_stream",
            ControlPlaneRequest::RemoveStream { .. } => "remove_stream",
            ControlPlaneRequest::SendRoomMessage { .. } => "send_room_message",
            ControlPlaneRequest::SendUserMessage { .. } => "send_user_message",
            ControlPlaneRequest::UpdateRoomProperties(_) => "update_room_properties",
            ControlPlaneRequest::UpdateUserProperties { .. } => "update_user_properties",
            ControlPlaneRequest::UpdateCourseState(_) => "update_course_state",
            ControlPlaneRequest::AllowChat { .. } => "allow_chat",
        }
    }
}

/// Payload of a successful enter call.
#[derive(Debug, Clone, Default)]
pub struct EnterResponse {
    /// Assigned self-stream id. Empty means no role slot remains.
    pub stream_id: StreamId,
    /// Already-issued media token for the media engine.
    pub media_token: Option<SecretString>,
    pub room_name: String,
    pub course_state: CourseState,
    pub start_time: Option<i64>,
    pub room_chat_allowed: bool,
    pub user_chat_allowed: bool,
    pub room_properties: Properties,
    pub user_properties: Properties,
}

/// Successful control-plane outcome.
#[derive(Debug, Clone)]
pub enum ControlPlaneResponse {
    Entered(EnterResponse),
    Done,
}

/// Request/response transport to the control plane.
///
/// Implementations map transport failures to `EduError::ControlPlane`
/// carrying the server's error code.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn execute(
        &self,
        ctx: CallContext,
        request: ControlPlaneRequest,
    ) -> Result<ControlPlaneResponse, EduError>;
}

/// Shared by every session a factory creates.
#[derive(Clone)]
pub struct ControlPlaneHelper {
    transport: Arc<dyn ControlPlane>,
    app_id: String,
    auth_token: SecretString,
    timeout: Duration,
}

impl ControlPlaneHelper {
    pub fn new(
        transport: Arc<dyn ControlPlane>,
        app_id: String,
        auth_token: SecretString,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            app_id,
            auth_token,
            timeout,
        }
    }

    /// Assemble call parameters for one request.
    #[must_use]
    pub fn context(&self, room_id: &RoomId, user_id: &UserId) -> CallContext {
        CallContext {
            app_id: self.app_id.clone(),
            auth_token: self.auth_token.clone(),
            room_id: room_id.clone(),
            user_id: user_id.clone(),
            correlation_id: Uuid::new_v4(),
        }
    }

    /// Issue one request and normalize its outcome.
    pub async fn call(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        request: ControlPlaneRequest,
    ) -> Result<ControlPlaneResponse, EduError> {
        let operation = request.operation();
        let ctx = self.context(room_id, user_id);
        let correlation_id = ctx.correlation_id;
        let start = Instant::now();

        debug!(
            target: "classroom.control_plane",
            operation = operation,
            room_id = %room_id,
            correlation_id = %correlation_id,
            "Issuing control-plane call"
        );

        let result = match tokio::time::timeout(self.timeout, self.transport.execute(ctx, request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(EduError::Timeout(format!(
                "{operation} did not complete within {}ms",
                self.timeout.as_millis()
            ))),
        };

        let elapsed = start.elapsed();
        match &result {
            Ok(_) => {
                metrics::record_control_plane_call(operation, "success", elapsed);
                debug!(
                    target: "classroom.control_plane",
                    operation = operation,
                    correlation_id = %correlation_id,
                    elapsed_ms = elapsed.as_millis(),
                    "Control-plane call succeeded"
                );
            }
            Err(e) => {
                metrics::record_control_plane_call(operation, "error", elapsed);
                warn!(
                    target: "classroom.control_plane",
                    operation = operation,
                    correlation_id = %correlation_id,
                    error_code = e.error_code(),
                    error = %e,
                    "Control-plane call failed"
                );
            }
        }

        result
    }

    /// Call that must not return a payload.
    pub async fn call_done(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        request: ControlPlaneRequest,
    ) -> Result<(), EduError> {
        self.call(room_id, user_id, request).await.map(|_| ())
    }
}

impl std::fmt::Debug for ControlPlaneHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneHelper")
            .field("app_id", &self.app_id)
            .field("auth_token", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
