//! Idempotency gate: duplicate requests never produce duplicate renders.
//!
//! The uniqueness constraint on the request hash lives at the persistence
//! layer ([`crate::store::JobStore::insert`]); this gate adds the caller-side
//! pre-check over a bounded recency window. Only `Succeeded` twins are
//! reuse-eligible; a queued, processing, or failed twin blocks a new insert
//! and surfaces as a conflict rather than silently duplicating work.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use docforge_core::{hash, FileId, GenerationError, GenerationRequest, JobId, JobStatus};

use crate::store::{JobStore, StoreError};

/// Result of a gate check.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// No twin inside the window: process normally.
    Proceed,
    /// A succeeded twin exists: reuse its output, do not render.
    Reuse {
        job_id: JobId,
        output_file_id: FileId,
    },
    /// A non-reusable twin holds the hash.
    Conflict { job_id: JobId, status: JobStatus },
}

pub struct IdempotencyGate {
    store: Arc<dyn JobStore>,
    window: Duration,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn JobStore>, window: Duration) -> Self {
        Self { store, window }
    }

    /// Compute the authoritative request hash, rejecting a caller-supplied
    /// hash that disagrees.
    pub fn ensure_hash(&self, envelope: &GenerationRequest) -> Result<String, GenerationError> {
        let computed = hash::request_hash(envelope);
        if let Some(supplied) = &envelope.request_hash {
            if supplied != &computed {
                return Err(GenerationError::validation(format!(
                    "supplied request hash {supplied} does not match the envelope contents"
                )));
            }
        }
        Ok(computed)
    }

    /// Look for a twin job inside the recency window. `exclude` skips the
    /// job currently being processed so it never conflicts with itself.
    pub async fn check(
        &self,
        request_hash: &str,
        now: DateTime<Utc>,
        exclude: Option<&JobId>,
    ) -> Result<GateOutcome, StoreError> {
        let twins = self
            .store
            .find_by_hash(request_hash, self.window, now)
            .await?;

        let mut blocking: Option<&docforge_core::GenerationJob> = None;
        for twin in twins.iter().filter(|t| Some(&t.id) != exclude) {
            match twin.status {
                JobStatus::Succeeded => {
                    if let Some(file_id) = &twin.output_file_id {
                        tracing::info!(
                            job_id = %twin.id,
                            request_hash,
                            "reusing output of succeeded twin job"
                        );
                        return Ok(GateOutcome::Reuse {
                            job_id: twin.id.clone(),
                            output_file_id: file_id.clone(),
                        });
                    }
                }
                JobStatus::Canceled => {}
                _ => blocking = blocking.or(Some(twin)),
            }
        }

        if let Some(twin) = blocking {
            return Ok(GateOutcome::Conflict {
                job_id: twin.id.clone(),
                status: twin.status,
            });
        }
        Ok(GateOutcome::Proceed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use docforge_core::{CorrelationId, OutputFormat, RenderOptions, TemplateId};

    use super::*;
    use crate::memory::InMemoryStore;

    fn envelope() -> GenerationRequest {
        GenerationRequest {
            template_id: Some(TemplateId::from("tpl-1")),
            templates: Vec::new(),
            template_strategy: None,
            output_format: OutputFormat::Pdf,
            locale: "en-US".to_string(),
            timezone: "UTC".to_string(),
            options: RenderOptions::default(),
            data: serde_json::json!({"invoice": {"number": 1}}),
            parents: BTreeMap::new(),
            request_hash: None,
        }
    }

    fn gate(store: Arc<InMemoryStore>) -> IdempotencyGate {
        IdempotencyGate::new(store, Duration::from_secs(24 * 60 * 60))
    }

    #[tokio::test]
    async fn no_twin_means_proceed() {
        let store = InMemoryStore::arc();
        let outcome = gate(store).check("hash-1", Utc::now(), None).await.unwrap();
        assert_eq!(outcome, GateOutcome::Proceed);
    }

    #[tokio::test]
    async fn succeeded_twin_is_reused() {
        let store = InMemoryStore::arc();
        let mut job = store
            .insert(envelope(), "hash-1".to_string(), CorrelationId::new())
            .await
            .unwrap();
        job.mark_succeeded(FileId::from("file-42"));
        store.update(&job).await.unwrap();

        let outcome = gate(store).check("hash-1", Utc::now(), None).await.unwrap();
        assert_eq!(
            outcome,
            GateOutcome::Reuse {
                job_id: job.id,
                output_file_id: FileId::from("file-42"),
            }
        );
    }

    #[tokio::test]
    async fn in_flight_twin_is_a_conflict() {
        let store = InMemoryStore::arc();
        let job = store
            .insert(envelope(), "hash-1".to_string(), CorrelationId::new())
            .await
            .unwrap();

        let outcome = gate(store).check("hash-1", Utc::now(), None).await.unwrap();
        assert_eq!(
            outcome,
            GateOutcome::Conflict {
                job_id: job.id,
                status: JobStatus::Queued,
            }
        );
    }

    #[tokio::test]
    async fn failed_twin_blocks_instead_of_reusing() {
        let store = InMemoryStore::arc();
        let mut job = store
            .insert(envelope(), "hash-1".to_string(), CorrelationId::new())
            .await
            .unwrap();
        job.status = JobStatus::Failed;
        store.update(&job).await.unwrap();

        let outcome = gate(store).check("hash-1", Utc::now(), None).await.unwrap();
        assert!(matches!(outcome, GateOutcome::Conflict { .. }));
    }

    #[tokio::test]
    async fn processing_job_does_not_conflict_with_itself() {
        let store = InMemoryStore::arc();
        let job = store
            .insert(envelope(), "hash-1".to_string(), CorrelationId::new())
            .await
            .unwrap();

        let outcome = gate(store)
            .check("hash-1", Utc::now(), Some(&job.id))
            .await
            .unwrap();
        assert_eq!(outcome, GateOutcome::Proceed);
    }

    #[tokio::test]
    async fn stale_twin_outside_the_window_is_ignored() {
        let store = InMemoryStore::arc();
        let mut job = store
            .insert(envelope(), "hash-1".to_string(), CorrelationId::new())
            .await
            .unwrap();
        job.created_at = Utc::now() - chrono::Duration::days(3);
        job.mark_succeeded(FileId::from("file-1"));
        store.update(&job).await.unwrap();

        let outcome = gate(store).check("hash-1", Utc::now(), None).await.unwrap();
        assert_eq!(outcome, GateOutcome::Proceed);
    }

    #[test]
    fn mismatched_supplied_hash_is_rejected() {
        let store = InMemoryStore::arc();
        let gate = gate(store);

        let mut req = envelope();
        let good = gate.ensure_hash(&req).unwrap();

        req.request_hash = Some(good.clone());
        assert_eq!(gate.ensure_hash(&req).unwrap(), good);

        req.request_hash = Some("forged".to_string());
        assert!(gate.ensure_hash(&req).is_err());
    }
}
