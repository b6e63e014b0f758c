//! Secret wrappers for already-issued credentials.
//!
//! The classroom crates never mint credentials; they only carry the auth
//! token handed to the session factory and the media tokens returned by the
//! control plane on enter. Both travel as [`SecretString`], whose `Debug`
//! output is redacted, so deriving `Debug` on a request or config struct
//! cannot leak a token into `tracing` output.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct EnterRequest {
//!     user_id: String,
//!     auth_token: SecretString,
//! }
//!
//! let req = EnterRequest {
//!     user_id: "alice".to_string(),
//!     auth_token: SecretString::from("issued-token"),
//! };
//!
//! assert!(!format!("{req:?}").contains("issued-token"));
//! assert_eq!(req.auth_token.expose_secret(), "issued-token");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_media_token_debug_is_redacted() {
        let token = SecretString::from("rtc-token-006abc");
        let debug_str = format!("{token:?}");

        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains("006abc"));
    }

    #[test]
    fn test_enter_payload_deserializes_token() {
        #[allow(dead_code)]
        #[derive(Debug, Deserialize)]
        struct EnterPayload {
            stream_id: String,
            media_token: SecretString,
        }

        let json = r#"{"stream_id": "s1", "media_token": "rtc-secret"}"#;
        let payload: EnterPayload = serde_json::from_str(json).expect("deserialize");

        assert_eq!(payload.media_token.expose_secret(), "rtc-secret");
        assert!(!format!("{payload:?}").contains("rtc-secret"));
    }
}
