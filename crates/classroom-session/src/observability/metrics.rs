//! Metrics definitions for the classroom session coordinator.
//!
//! All metrics follow Prometheus naming conventions:
//! - `classroom_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `state`: 6 values (connection states)
//! - `operation`: bounded by control-plane request and media call kinds (~15 values)
//! - `status`: 2 values (success, error)
//! - `event`: bounded by `SessionEvent` variants (16 values)
//!
//! No identifier (room, user, stream) is ever used as a label.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ============================================================================
// Session Metrics
// ============================================================================

/// A session executor started.
///
/// Metric: `classroom_sessions_active`
pub fn session_started() {
    gauge!("classroom_sessions_active").increment(1.0);
}

/// A session executor stopped.
///
/// Metric: `classroom_sessions_active`
pub fn session_ended() {
    gauge!("classroom_sessions_active").decrement(1.0);
}

/// Record a connection state transition.
///
/// Metric: `classroom_state_transitions_total`
/// Labels: `state`
pub fn record_state_transition(state: &'static str) {
    counter!("classroom_state_transitions_total", "state" => state).increment(1);
}

/// Set the executor mailbox depth.
///
/// Metric: `classroom_mailbox_depth`
pub fn set_mailbox_depth(depth: usize) {
    // usize to f64 conversion is safe for realistic mailbox depths
    #[allow(clippy::cast_precision_loss)]
    gauge!("classroom_mailbox_depth").set(depth as f64);
}

// ============================================================================
// Collaborator Metrics
// ============================================================================

/// Record a control-plane call outcome and its latency.
///
/// Metrics: `classroom_control_plane_calls_total`, `classroom_control_plane_latency_seconds`
/// Labels: `operation`, `status`
pub fn record_control_plane_call(operation: &'static str, status: &'static str, duration: Duration) {
    counter!(
        "classroom_control_plane_calls_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    histogram!("classroom_control_plane_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Record a media connection call outcome.
///
/// Metric: `classroom_media_calls_total`
/// Labels: `operation`, `status`
pub fn record_media_call(operation: &'static str, status: &'static str) {
    counter!(
        "classroom_media_calls_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

// ============================================================================
// Event Metrics
// ============================================================================

/// Record one event fanned out to observers.
///
/// Metric: `classroom_events_dispatched_total`
/// Labels: `event`
pub fn record_event_dispatched(event: &'static str) {
    counter!("classroom_events_dispatched_total", "event" => event).increment(1);
}

/// Record a completion dropped because its epoch is stale.
///
/// Metric: `classroom_late_completions_total`
pub fn record_late_completion() {
    counter!("classroom_late_completions_total").increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use metrics_util::MetricKind;

    #[test]
    fn test_metric_functions_without_recorder() {
        // No recorder installed: calls are no-ops and must not panic
        session_started();
        session_ended();
        record_state_transition("connected");
        set_mailbox_depth(0);
        record_control_plane_call("enter", "success", Duration::from_millis(12));
        record_media_call("publish", "error");
        record_event_dispatched("remote_users_joined");
        record_late_completion();
    }

    #[test]
    fn test_metrics_are_recorded_with_bounded_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            session_started();
            record_state_transition("connecting");
            record_state_transition("connected");
            record_control_plane_call("enter", "success", Duration::from_millis(25));
            record_media_call("publish", "success");
            record_event_dispatched("connection_state_changed");
            record_late_completion();
            set_mailbox_depth(3);
        });

        let metrics = snapshotter.snapshot().into_vec();

        let transitions: Vec<_> = metrics
            .iter()
            .filter(|(key, ..)| key.key().name() == "classroom_state_transitions_total")
            .collect();
        assert_eq!(transitions.len(), 2);

        let late = metrics
            .iter()
            .find(|(key, ..)| key.key().name() == "classroom_late_completions_total")
            .unwrap();
        assert_eq!(late.0.kind(), MetricKind::Counter);
        assert_eq!(late.3, DebugValue::Counter(1));

        let latency = metrics
            .iter()
            .find(|(key, ..)| key.key().name() == "classroom_control_plane_latency_seconds")
            .unwrap();
        assert_eq!(latency.0.kind(), MetricKind::Histogram);
        assert!(latency
            .0
            .key()
            .labels()
            .all(|label| label.key() == "operation"));
    }
}
