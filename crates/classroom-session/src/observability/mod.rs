//! Observability for the classroom session coordinator.
//!
//! # Privacy by Default
//!
//! Actor loops use `#[instrument(skip_all)]` with explicit field
//! allow-listing. Auth and media tokens are `SecretString` and never
//! appear in logs or labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `classroom_sessions_active` | Gauge | none | Running session executors |
//! | `classroom_state_transitions_total` | Counter | `state` | Connection state changes |
//! | `classroom_control_plane_calls_total` | Counter | `operation`, `status` | Control-plane outcomes |
//! | `classroom_control_plane_latency_seconds` | Histogram | `operation` | Control-plane round trip |
//! | `classroom_media_calls_total` | Counter | `operation`, `status` | Media connection outcomes |
//! | `classroom_events_dispatched_total` | Counter | `event` | Observer fan-out volume |
//! | `classroom_mailbox_depth` | Gauge | none | Executor backpressure |
//! | `classroom_late_completions_total` | Counter | none | Completions dropped by epoch |

pub mod metrics;

pub use metrics::{
    record_control_plane_call, record_event_dispatched, record_late_completion,
    record_media_call, record_state_transition, session_ended, session_started,
    set_mailbox_depth,
};
