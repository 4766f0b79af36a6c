//! Synchronous generation path.
//!
//! One request, one document: the caller waits for the result. The lease and
//! poll steps are bypassed (the job row is created already processing), but
//! everything else (gate, cache, pool, pipeline, state machine) is exactly
//! the batch machinery.

use chrono::Utc;
use thiserror::Error;

use docforge_core::{
    CorrelationId, FileId, GenerationError, GenerationRequest, JobId, JobStatus,
};

use crate::gate::GateOutcome;
use crate::pipeline::{self, PipelineDeps};
use crate::store::StoreError;

/// Typed result handed back to the caller (the UI layer reacts to it; the
/// engine has no callback surface).
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub job_id: JobId,
    pub output_file_id: FileId,
    pub correlation_id: CorrelationId,
    /// True when an earlier succeeded twin's output was reused.
    pub reused: bool,
    /// Merged intermediate bytes, when the envelope asked for them back.
    pub merged_intermediate: Option<Vec<u8>>,
    /// Human-readable descriptions of non-fatal link failures.
    pub link_failures: Vec<String>,
}

/// The single error surface of the interactive path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{error} (correlation {correlation_id})")]
pub struct InteractiveError {
    pub correlation_id: CorrelationId,
    pub error: GenerationError,
}

/// Synchronous generator sharing the batch pipeline.
pub struct InteractiveGenerator {
    deps: PipelineDeps,
}

impl InteractiveGenerator {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    /// Validate, gate, render, and link in one call.
    pub async fn generate(
        &self,
        envelope: GenerationRequest,
    ) -> Result<GenerationOutcome, InteractiveError> {
        let cid = CorrelationId::new();
        let fail = |error: GenerationError| InteractiveError {
            correlation_id: cid,
            error,
        };

        envelope.validate().map_err(fail)?;
        let gate = self.deps.gate();
        let request_hash = gate.ensure_hash(&envelope).map_err(fail)?;

        match gate.check(&request_hash, Utc::now(), None).await {
            Ok(GateOutcome::Reuse { job_id, output_file_id }) => {
                return Ok(GenerationOutcome {
                    job_id,
                    output_file_id,
                    correlation_id: cid,
                    reused: true,
                    merged_intermediate: None,
                    link_failures: Vec::new(),
                });
            }
            Ok(GateOutcome::Conflict { job_id, status }) => {
                return Err(fail(GenerationError::validation(format!(
                    "a job with this request hash already exists (job {job_id}, status {status})"
                ))));
            }
            Ok(GateOutcome::Proceed) => {}
            Err(e) => return Err(fail(classify_store_error(e))),
        }

        let mut job = match self.deps.jobs.insert(envelope, request_hash, cid).await {
            Ok(job) => job,
            // Lost the insert race to a concurrent caller: the uniqueness
            // constraint is the authority, surface the conflict.
            Err(StoreError::DuplicateHash(hash)) => {
                return Err(fail(GenerationError::validation(format!(
                    "a job with request hash {hash} already exists"
                ))));
            }
            Err(e) => return Err(fail(classify_store_error(e))),
        };

        job.mark_processing(Utc::now(), self.deps.config.lock_ttl);
        if let Err(e) = self.deps.jobs.update(&job).await {
            return Err(fail(classify_store_error(e)));
        }

        tracing::info!(job_id = %job.id, correlation_id = %cid, "interactive generation started");

        match pipeline::run(&self.deps, &job).await {
            Ok(output) => {
                job.mark_succeeded(output.output_file_id.clone());
                if let Err(e) = self.deps.jobs.update(&job).await {
                    tracing::error!(job_id = %job.id, error = %e, "failed to persist interactive success");
                }
                Ok(GenerationOutcome {
                    job_id: job.id,
                    output_file_id: output.output_file_id,
                    correlation_id: cid,
                    reused: false,
                    merged_intermediate: output.merged_intermediate,
                    link_failures: output
                        .link_failures
                        .iter()
                        .map(|e| e.to_string())
                        .collect(),
                })
            }
            Err(phase_error) => {
                // The job row still follows the state machine: a retryable
                // failure is left retry-pending for the batch scheduler.
                let description = phase_error.describe();
                job.mark_failed_attempt(
                    &phase_error.error,
                    description,
                    &self.deps.config.retry,
                    Utc::now(),
                );
                if let Err(e) = self.deps.jobs.update(&job).await {
                    tracing::error!(job_id = %job.id, error = %e, "failed to persist interactive failure");
                }
                if job.status == JobStatus::Failed {
                    tracing::error!(job_id = %job.id, correlation_id = %cid, "interactive generation failed terminally");
                } else {
                    tracing::warn!(job_id = %job.id, correlation_id = %cid, "interactive generation failed, batch retry scheduled");
                }
                Err(fail(phase_error.error))
            }
        }
    }
}

fn classify_store_error(e: StoreError) -> GenerationError {
    match e {
        StoreError::DuplicateHash(hash) => {
            GenerationError::validation(format!("duplicate request hash {hash}"))
        }
        other if other.is_retryable() => GenerationError::unknown(other.to_string()),
        other => GenerationError::validation(other.to_string()),
    }
}

impl std::fmt::Debug for InteractiveGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveGenerator").finish_non_exhaustive()
    }
}
