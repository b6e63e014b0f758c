//! Classroom Session Coordinator
//!
//! Coordinates a multi-party real-time classroom session. It reconciles
//! local actions (join, publish, mute, set properties) against a remote
//! control plane and a signaling-driven membership registry, keeps a
//! consistent view of users and streams across network churn, and drives
//! the media connections that carry audio and video.
//!
//! # Architecture
//!
//! ```text
//! SessionFactory (one per process)
//! ├── ControlPlaneHelper   (shared, wraps the control-plane transport)
//! ├── MediaEngine          (shared, builds media connections)
//! ├── StreamIdGenerator    (shared, explicitly owned RNG)
//! └── spawns N SessionActors
//!     └── SessionActor (one per joined classroom)
//!         ├── owns SessionState (users, streams, properties)
//!         ├── owns MediaConnectionManager (stream → connection)
//!         ├── owns PendingOperations (one in flight per key)
//!         └── consumes a Registry through a RegistrySink
//! ```
//!
//! Three differently paced sources feed one executor: user calls,
//! control-plane and media completions, and registry pushes. Nothing
//! outside the executor mutates session state, so no locks are needed.
//!
//! # Modules
//!
//! - [`actors`] - Session executor and its public handle
//! - [`config`] - Configuration from environment
//! - [`control_plane`] - Control-plane seam and operation helper
//! - [`errors`] - Error type with subsystem-partitioned codes
//! - [`events`] - Observer events and observer registry
//! - [`factory`] - Process-wide session factory
//! - [`media`] - Media engine seam and connection manager
//! - [`registry`] - Membership and stream registry seam
//! - [`state`] - Reconciliation of users, streams and properties
//! - [`user_service`] - Role-gated user-facing operations

pub mod actors;
pub mod config;
pub mod control_plane;
pub mod errors;
pub mod events;
pub mod factory;
pub mod ids;
pub mod media;
pub mod model;
pub mod observability;
pub mod registry;
pub mod state;
pub mod user_service;

pub use actors::SessionHandle;
pub use config::SessionConfig;
pub use errors::{EduError, ErrorKind};
pub use events::{ObserverId, SessionEvent, SessionObserver, StreamOperation};
pub use factory::SessionFactory;
pub use user_service::{RoleCapabilities, UserService};
