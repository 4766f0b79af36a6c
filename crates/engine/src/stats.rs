//! Scheduler runtime statistics and control-surface snapshot.

use chrono::{DateTime, Utc};

/// Cumulative counters, updated only by the scheduler loop after each job
/// completes.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EngineStats {
    /// Completed processing attempts (success, retry, or terminal failure).
    pub total_processed: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    /// Attempts that ended in a scheduled retry.
    pub total_retries: u64,
}

/// Point-in-time scheduler state for the ops control surface.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SchedulerStatus {
    pub is_running: bool,
    /// Claimable jobs at the last poll.
    pub queue_depth: usize,
    pub last_poll_at: Option<DateTime<Utc>>,
}
