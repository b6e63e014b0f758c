//! Identifier newtypes shared by the classroom crates.
//!
//! Identifiers are issued by the control plane (rooms, users) or by the
//! session factory's stream id generator, so they are opaque strings here.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an identifier issued elsewhere.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw identifier.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is empty (never valid on the wire).
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Identifier of one classroom instance.
    RoomId
);

string_id!(
    /// Identifier of a participant.
    UserId
);

string_id!(
    /// Session-wide unique identifier of a publishable media unit.
    StreamId
);

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_raw_value() {
        let id = StreamId::new("1024");
        assert_eq!(id.to_string(), "1024");
        assert_eq!(id.as_str(), "1024");
    }

    #[test]
    fn test_blank_ids_are_empty() {
        assert!(UserId::new("").is_empty());
        assert!(UserId::new("   ").is_empty());
        assert!(!UserId::new("alice").is_empty());
    }

    #[test]
    fn test_serializes_transparently() {
        let room = RoomId::from("room-1");
        let json = serde_json::to_string(&room).unwrap();
        assert_eq!(json, "\"room-1\"");

        let back: RoomId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, room);
    }
}
