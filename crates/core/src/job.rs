//! Job model, state machine, and retry policy.
//!
//! Job rows are persisted on the external platform and referenced by opaque
//! id; this module owns every mutation applied to them after creation. The
//! lease (`locked_until`) is the cross-process mutual-exclusion point: a row
//! in `Processing` with an expired lease is indistinguishable from an
//! orphaned job and becomes reclaimable.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::GenerationRequest;
use crate::error::GenerationError;
use crate::id::{CorrelationId, FileId, JobId};

/// Externally-visible job status.
///
/// Retry-pending is not a distinct status: a retryable failure keeps the job
/// in `Processing` with `scheduled_retry_at` set and the lease cleared, so
/// the `attempts` history survives.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Queued,
    Processing,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry policy: bounded attempts with a fixed backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retryable failures before the job fails terminally.
    pub max_attempts: u32,
    /// Backoff delays indexed by attempt number (1-based). Attempts beyond
    /// the schedule reuse the last entry.
    pub schedule: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            schedule: vec![
                Duration::from_secs(60),
                Duration::from_secs(300),
                Duration::from_secs(900),
            ],
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let idx = (attempt as usize - 1).min(self.schedule.len().saturating_sub(1));
        self.schedule.get(idx).copied().unwrap_or(Duration::ZERO)
    }

    /// Whether a job that has now failed `attempt` times may retry.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

/// A document-generation job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJob {
    /// Platform-assigned identifier.
    pub id: JobId,
    pub status: JobStatus,
    /// Failed processing attempts so far (starts at 0).
    pub attempts: u32,
    /// Lease expiry; non-null and in the future means another worker owns
    /// the job.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub locked_until: Option<DateTime<Utc>>,
    /// The job is not eligible for claiming before this time.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scheduled_retry_at: Option<DateTime<Utc>>,
    /// Idempotency key, unique across all jobs.
    pub request_hash: String,
    /// The full request input.
    pub envelope: GenerationRequest,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub output_file_id: Option<FileId>,
    /// Last error, as `phase: message`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GenerationJob {
    /// Create a new queued job around a validated envelope.
    pub fn new(id: JobId, envelope: GenerationRequest, request_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Queued,
            attempts: 0,
            locked_until: None,
            scheduled_retry_at: None,
            request_hash,
            envelope,
            output_file_id: None,
            error: None,
            correlation_id: CorrelationId::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the lease has lapsed (an unset lease counts as lapsed).
    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map_or(true, |until| until <= now)
    }

    /// Whether a scheduler may claim this job right now.
    ///
    /// Eligible: `Queued`, or `Processing` with an expired lease (orphaned or
    /// retry-pending), provided any scheduled retry time has passed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        let status_ok = match self.status {
            JobStatus::Queued => true,
            JobStatus::Processing => self.is_lease_expired(now),
            _ => false,
        };
        status_ok && self.scheduled_retry_at.map_or(true, |at| at <= now)
    }

    /// Take the lease: the mutual-exclusion write. The caller is responsible
    /// for making this write conditional at the platform.
    pub fn mark_processing(&mut self, now: DateTime<Utc>, lock_ttl: Duration) {
        self.status = JobStatus::Processing;
        self.locked_until =
            Some(now + chrono::Duration::from_std(lock_ttl).unwrap_or_default());
        self.scheduled_retry_at = None;
        self.updated_at = now;
    }

    /// Terminal success: store the output reference and release the lease.
    pub fn mark_succeeded(&mut self, output_file_id: FileId) {
        self.status = JobStatus::Succeeded;
        self.output_file_id = Some(output_file_id);
        self.locked_until = None;
        self.scheduled_retry_at = None;
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt and either schedule a retry or fail
    /// terminally, per the error classification and retry policy.
    pub fn mark_failed_attempt(
        &mut self,
        error: &GenerationError,
        description: String,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) {
        self.attempts += 1;
        self.error = Some(description);
        self.locked_until = None;
        self.updated_at = now;

        if error.is_retryable() && policy.should_retry(self.attempts) {
            let delay = policy.delay_for_attempt(self.attempts);
            self.scheduled_retry_at =
                Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            // Stays in Processing: retry-pending, attempts history intact.
            self.status = JobStatus::Processing;
        } else {
            self.status = JobStatus::Failed;
            self.scheduled_retry_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::envelope::{OutputFormat, RenderOptions};
    use crate::error::GenerationError;
    use crate::id::TemplateId;

    fn test_envelope() -> GenerationRequest {
        GenerationRequest {
            template_id: Some(TemplateId::from("tpl-1")),
            templates: Vec::new(),
            template_strategy: None,
            output_format: OutputFormat::Pdf,
            locale: "en-US".to_string(),
            timezone: "UTC".to_string(),
            options: RenderOptions::default(),
            data: serde_json::json!({"invoice": {}}),
            parents: BTreeMap::new(),
            request_hash: None,
        }
    }

    fn test_job() -> GenerationJob {
        GenerationJob::new(JobId::from("job-1"), test_envelope(), "hash-1".to_string())
    }

    #[test]
    fn retry_schedule_is_60_300_900() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(300));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(900));
        // Beyond the schedule the last entry applies.
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(900));
    }

    #[test]
    fn lease_write_sets_processing_and_lock() {
        let mut job = test_job();
        let now = Utc::now();
        job.mark_processing(now, Duration::from_secs(120));

        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.locked_until, Some(now + chrono::Duration::seconds(120)));
        assert!(!job.is_lease_expired(now));
        assert!(!job.is_eligible(now));
        // After the lease lapses the job is reclaimable.
        let later = now + chrono::Duration::seconds(121);
        assert!(job.is_lease_expired(later));
        assert!(job.is_eligible(later));
    }

    #[test]
    fn retryable_failures_follow_the_backoff_schedule() {
        let mut job = test_job();
        let policy = RetryPolicy::default();
        let err = GenerationError::ConversionFailed("exit 1".to_string());

        let now = Utc::now();
        job.mark_processing(now, Duration::from_secs(120));
        job.mark_failed_attempt(&err, "convert: exit 1".to_string(), &policy, now);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.scheduled_retry_at, Some(now + chrono::Duration::seconds(60)));
        assert!(job.locked_until.is_none());
        // Not eligible until the retry time passes.
        assert!(!job.is_eligible(now));
        assert!(job.is_eligible(now + chrono::Duration::seconds(61)));

        job.mark_processing(now, Duration::from_secs(120));
        job.mark_failed_attempt(&err, "convert: exit 1".to_string(), &policy, now);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.scheduled_retry_at, Some(now + chrono::Duration::seconds(300)));

        job.mark_processing(now, Duration::from_secs(120));
        job.mark_failed_attempt(&err, "convert: exit 1".to_string(), &policy, now);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.scheduled_retry_at, Some(now + chrono::Duration::seconds(900)));

        // Fourth failure exhausts the policy.
        job.mark_processing(now, Duration::from_secs(120));
        job.mark_failed_attempt(&err, "convert: exit 1".to_string(), &policy, now);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.scheduled_retry_at.is_none());
    }

    #[test]
    fn non_retryable_failure_short_circuits_after_one_attempt() {
        let mut job = test_job();
        let policy = RetryPolicy::default();
        let err = GenerationError::TemplateNotFound("tpl-1".to_string());

        let now = Utc::now();
        job.mark_processing(now, Duration::from_secs(120));
        job.mark_failed_attempt(&err, "fetch_template: missing".to_string(), &policy, now);

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.error.as_deref().unwrap().starts_with("fetch_template"));
    }

    #[test]
    fn success_clears_lease_and_sets_output() {
        let mut job = test_job();
        let now = Utc::now();
        job.mark_processing(now, Duration::from_secs(120));
        job.mark_succeeded(FileId::from("file-9"));

        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.status.is_terminal());
        assert_eq!(job.output_file_id, Some(FileId::from("file-9")));
        assert!(job.locked_until.is_none());
    }

    #[test]
    fn canceled_is_terminal_and_never_eligible() {
        let mut job = test_job();
        job.status = JobStatus::Canceled;
        assert!(job.status.is_terminal());
        assert!(!job.is_eligible(Utc::now()));
    }
}
