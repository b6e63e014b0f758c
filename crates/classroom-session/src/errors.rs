//! Classroom session error types.
//!
//! Every failure is classified into one of four kinds (see [`ErrorKind`]).
//! Validation and state errors are produced synchronously by the session
//! executor before any network call is issued. Transport and media errors
//! come back through an operation's completion path.
//!
//! `EduError` is `Clone` because a de-duplicated operation delivers the same
//! outcome to every caller waiting on it.

use thiserror::Error;

/// Error taxonomy used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing call arguments.
    Validation,
    /// Operation is invalid for the current connection or resource state.
    State,
    /// Control-plane or signaling-channel failure, including timeouts.
    Transport,
    /// Underlying media-connection failure.
    Media,
}

/// Classroom session error type.
///
/// Numeric codes (see [`EduError::error_code`]) are partitioned by subsystem:
/// - 1xxx: validation and state
/// - 2xxx: control plane
/// - 3xxx: signaling channel
/// - 4xxx: media connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EduError {
    /// Call arguments are malformed or missing.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation not valid for the current session or stream state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The local role lacks the capability for this operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The control plane accepted the enter call but no role slot remains.
    #[error("No role slot available")]
    RoleFull,

    /// Referenced user or stream is unknown to this session.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Control plane rejected or failed the call.
    #[error("Control plane error {code}: {message}")]
    ControlPlane { code: i32, message: String },

    /// Call did not complete in time; the server-side effect is unknown.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Signaling channel failure.
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Media connection construction or operation failed.
    #[error("Media error {code}: {message}")]
    Media { code: i32, message: String },

    /// Internal error (executor mailbox closed, responder dropped).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EduError {
    /// Shorthand for a control-plane failure.
    pub fn control_plane(code: i32, message: impl Into<String>) -> Self {
        EduError::ControlPlane {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for a media failure.
    pub fn media(code: i32, message: impl Into<String>) -> Self {
        EduError::Media {
            code,
            message: message.into(),
        }
    }

    /// Returns the taxonomy kind for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            EduError::Validation(_) => ErrorKind::Validation,
            EduError::InvalidState(_)
            | EduError::PermissionDenied(_)
            | EduError::RoleFull
            | EduError::NotFound(_)
            | EduError::Internal(_) => ErrorKind::State,
            EduError::ControlPlane { .. } | EduError::Timeout(_) | EduError::Signaling(_) => {
                ErrorKind::Transport
            }
            EduError::Media { .. } => ErrorKind::Media,
        }
    }

    /// Returns the numeric error code for this error.
    #[must_use]
    pub fn error_code(&self) -> i32 {
        match self {
            EduError::Validation(_) => 1001,
            EduError::InvalidState(_) => 1002,
            EduError::PermissionDenied(_) => 1003,
            EduError::RoleFull => 1004,
            EduError::NotFound(_) => 1005,
            EduError::Internal(_) => 1099,
            EduError::ControlPlane { code, .. } => 2000 + subsystem_offset(*code),
            EduError::Timeout(_) => 2408,
            EduError::Signaling(_) => 3001,
            EduError::Media { code, .. } => 4000 + subsystem_offset(*code),
        }
    }

    /// Returns a caller-safe message (no transport internals).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            EduError::Validation(msg)
            | EduError::InvalidState(msg)
            | EduError::PermissionDenied(msg) => msg.clone(),
            EduError::RoleFull => "No seat is available for this role".to_string(),
            EduError::NotFound(_) => "Requested user or stream not found".to_string(),
            EduError::ControlPlane { .. } => "The classroom service rejected the request".to_string(),
            EduError::Timeout(_) => "The request timed out, please retry".to_string(),
            EduError::Signaling(_) => "Lost connection to the classroom".to_string(),
            EduError::Media { .. } => "A media device or connection failed".to_string(),
            EduError::Internal(_) => "An internal error occurred".to_string(),
        }
    }
}

/// Collaborator codes are embedded when they fit in the subsystem block.
fn subsystem_offset(code: i32) -> i32 {
    if (1..1000).contains(&code) {
        code
    } else {
        0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            EduError::Validation("empty user id".to_string()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            EduError::InvalidState("not joined".to_string()).kind(),
            ErrorKind::State
        );
        assert_eq!(EduError::RoleFull.kind(), ErrorKind::State);
        assert_eq!(
            EduError::PermissionDenied("host only".to_string()).kind(),
            ErrorKind::State
        );
        assert_eq!(
            EduError::control_plane(17, "rejected").kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            EduError::Timeout("enter".to_string()).kind(),
            ErrorKind::Transport
        );
        assert_eq!(
            EduError::Signaling("aborted".to_string()).kind(),
            ErrorKind::Transport
        );
        assert_eq!(EduError::media(3, "no camera").kind(), ErrorKind::Media);
    }

    #[test]
    fn test_error_codes_partitioned_by_subsystem() {
        assert_eq!(EduError::Validation(String::new()).error_code(), 1001);
        assert_eq!(EduError::RoleFull.error_code(), 1004);

        // Collaborator codes are embedded in the subsystem block
        assert_eq!(EduError::control_plane(17, "x").error_code(), 2017);
        assert_eq!(EduError::media(3, "x").error_code(), 4003);

        // Out-of-range collaborator codes collapse to the block base
        assert_eq!(EduError::control_plane(20_404, "x").error_code(), 2000);
        assert_eq!(EduError::media(-1, "x").error_code(), 4000);

        assert_eq!(EduError::Signaling(String::new()).error_code(), 3001);
    }

    #[test]
    fn test_client_messages_hide_transport_details() {
        let err = EduError::control_plane(500, "upstream 10.0.0.12:8443 refused");
        assert!(!err.client_message().contains("10.0.0.12"));

        let err = EduError::Internal("mailbox closed".to_string());
        assert_eq!(err.client_message(), "An internal error occurred");

        let err = EduError::PermissionDenied("only hosts can change course state".to_string());
        assert_eq!(err.client_message(), "only hosts can change course state");
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", EduError::control_plane(17, "role mismatch")),
            "Control plane error 17: role mismatch"
        );
        assert_eq!(format!("{}", EduError::RoleFull), "No role slot available");
    }
}
