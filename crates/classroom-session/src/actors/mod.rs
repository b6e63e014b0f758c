//! Session executor.
//!
//! Each joined classroom session is driven by one actor:
//!
//! ```text
//! SessionHandle / UserService (any number of clones)
//!         │  mpsc
//!         ▼
//! SessionActor (one per session)
//! ├── owns connection state, reconciled room state, observers
//! ├── owns the stream → media connection mapping
//! └── spawns control-plane, media and registry work; results re-enter
//!     the mailbox tagged with the epoch they were issued under
//! ```
//!
//! # Modules
//!
//! - [`session`] - `SessionActor` and its public `SessionHandle`
//! - [`messages`] - Message types for the executor mailbox
//! - [`pending`] - In-flight operation table
//! - [`metrics`] - Mailbox monitoring

pub mod messages;
pub mod metrics;
pub mod pending;
pub mod session;

pub use messages::{CommandOutcome, RefreshReason, SessionMessage, UserCommand, UserServiceSeed};
pub use metrics::{MailboxLevel, MailboxMonitor};
pub use pending::{OperationKey, OperationSlot, PendingOperations};
pub use session::{SessionActor, SessionHandle};
