//! # Classroom Test Utilities
//!
//! In-memory implementations of every collaborator the session coordinator
//! consumes, plus fixtures, for isolated testing without a real control
//! plane, signaling channel or media engine.
//!
//! ## Modules
//!
//! - `mock_control_plane` - Scriptable control plane with gated calls
//! - `mock_media` - Media engine that records every connection call
//! - `mock_registry` - Registry with scripted snapshots and a captured sink
//! - `observer` - Observer that records every event it sees
//! - `fixtures` - Users, streams, join options and configs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use classroom_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let control_plane = MockControlPlane::builder()
//!         .enter_with(enter_response("s1"))
//!         .build();
//!     let engine = MockMediaEngine::new();
//!     let registry = MockRegistry::new();
//!
//!     let harness = TestSession::start(control_plane, engine, registry).await;
//!     harness.join(join_options("alice", Role::Participant)).await.unwrap();
//! }
//! ```

pub mod fixtures;
pub mod harness;
pub mod mock_control_plane;
pub mod mock_media;
pub mod mock_registry;
pub mod observer;

pub use fixtures::*;
pub use harness::TestSession;
pub use mock_control_plane::{MockControlPlane, MockControlPlaneBuilder, RecordedCall};
pub use mock_media::{MediaCall, MockMediaConnection, MockMediaEngine};
pub use mock_registry::MockRegistry;
pub use observer::RecordingObserver;

use std::time::Duration;

/// How long the wait helpers poll before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll `condition` until it holds or [`WAIT_TIMEOUT`] elapses.
///
/// Returns whether the condition became true.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
