//! Session executor mailbox monitoring.
//!
//! Depth thresholds scale with the configured mailbox capacity:
//! - Normal: depth <= capacity / 5
//! - Warning: capacity / 5 < depth <= capacity * 4 / 5
//! - Critical: depth > capacity * 4 / 5 (senders are about to block)

use crate::observability::metrics;

use tracing::{debug, warn};

/// Mailbox level for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxLevel {
    Normal,
    Warning,
    Critical,
}

/// Tracks mailbox depth for one session executor.
#[derive(Debug)]
pub struct MailboxMonitor {
    /// Session identifier for log correlation.
    session_id: String,
    normal_threshold: usize,
    warning_threshold: usize,
    depth: usize,
    peak_depth: usize,
    messages_processed: u64,
    late_completions: u64,
}

impl MailboxMonitor {
    #[must_use]
    pub fn new(session_id: impl Into<String>, capacity: usize) -> Self {
        let normal_threshold = (capacity / 5).max(1);
        let warning_threshold = (capacity.saturating_mul(4) / 5).max(normal_threshold);
        Self {
            session_id: session_id.into(),
            normal_threshold,
            warning_threshold,
            depth: 0,
            peak_depth: 0,
            messages_processed: 0,
            late_completions: 0,
        }
    }

    /// Record the number of messages still queued after a dequeue.
    pub fn record_depth(&mut self, depth: usize) {
        let previous_level = self.current_level();
        self.depth = depth;
        self.peak_depth = self.peak_depth.max(depth);
        metrics::set_mailbox_depth(depth);

        let level = self.current_level();
        if level == previous_level {
            return;
        }
        match level {
            MailboxLevel::Critical => warn!(
                target: "classroom.actor.mailbox",
                session_id = %self.session_id,
                depth = depth,
                threshold = self.warning_threshold,
                "Mailbox depth critical"
            ),
            MailboxLevel::Warning => debug!(
                target: "classroom.actor.mailbox",
                session_id = %self.session_id,
                depth = depth,
                "Mailbox depth elevated"
            ),
            MailboxLevel::Normal => {}
        }
    }

    pub fn record_processed(&mut self) {
        self.messages_processed += 1;
    }

    /// Record a completion dropped because its epoch is stale.
    pub fn record_late_completion(&mut self) {
        self.late_completions += 1;
        metrics::record_late_completion();
    }

    #[must_use]
    pub fn current_depth(&self) -> usize {
        self.depth
    }

    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth
    }

    #[must_use]
    pub fn messages_processed(&self) -> u64 {
        self.messages_processed
    }

    #[must_use]
    pub fn late_completions(&self) -> u64 {
        self.late_completions
    }

    #[must_use]
    pub fn current_level(&self) -> MailboxLevel {
        if self.depth > self.warning_threshold {
            MailboxLevel::Critical
        } else if self.depth > self.normal_threshold {
            MailboxLevel::Warning
        } else {
            MailboxLevel::Normal
        }
    }
}
