//! Platform-backed job and content stores.
//!
//! The engine never talks to the platform directly; it goes through these
//! traits so the scheduler, gate, and pipeline can be driven against the
//! in-memory implementation in tests and against [`RemoteStore`] in
//! production.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use docforge_client::{RemoteClient, RemoteError};
use docforge_core::{
    CorrelationId, FileId, GenerationError, GenerationJob, GenerationRequest, JobId, RecordId,
    TemplateId,
};

/// Platform object type holding job rows.
const JOB_OBJECT: &str = "document_generation_job";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The request-hash uniqueness constraint rejected an insert.
    #[error("a job with request hash {0} already exists")]
    DuplicateHash(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::DuplicateHash(_) | StoreError::NotFound(_) => false,
            StoreError::Remote(e) => e.is_retryable(),
            StoreError::Storage(_) => true,
        }
    }
}

/// Job-row persistence on the external platform.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job row in `Queued`; the platform assigns the id and
    /// enforces request-hash uniqueness.
    async fn insert(
        &self,
        envelope: GenerationRequest,
        request_hash: String,
        correlation_id: CorrelationId,
    ) -> Result<GenerationJob, StoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<GenerationJob>, StoreError>;

    /// Persist the job's current state.
    async fn update(&self, job: &GenerationJob) -> Result<(), StoreError>;

    /// Jobs sharing `hash` created inside the recency window, newest first.
    async fn find_by_hash(
        &self,
        hash: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<GenerationJob>, StoreError>;

    /// Claimable jobs ordered by age, up to `limit`.
    async fn lease_candidates(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<GenerationJob>, StoreError>;

    /// Atomically take the lease on `observed`, guarded by the fields as
    /// this worker last saw them. Returns whether this claimant won; losers
    /// must skip the job. Only one concurrent claimant can ever win.
    async fn try_lease(
        &self,
        observed: &GenerationJob,
        locked_until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Extend the lease of a job this worker already owns.
    async fn renew_lease(
        &self,
        id: &JobId,
        locked_until: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Number of currently claimable jobs.
    async fn queue_depth(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Binary content on the external platform. Errors arrive pre-classified
/// into the generation taxonomy so the pipeline records them directly.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn fetch_template(
        &self,
        id: &TemplateId,
        cid: CorrelationId,
    ) -> Result<Vec<u8>, GenerationError>;

    async fn upload(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        cid: CorrelationId,
    ) -> Result<FileId, GenerationError>;

    async fn create_link(
        &self,
        file_id: &FileId,
        record_id: &RecordId,
        relation_key: &str,
        cid: CorrelationId,
    ) -> Result<(), GenerationError>;
}

/// Production store backed by the platform's REST surface.
pub struct RemoteStore {
    client: Arc<RemoteClient>,
}

impl RemoteStore {
    pub fn new(client: Arc<RemoteClient>) -> Self {
        Self { client }
    }

    fn decode_job(record: serde_json::Value) -> Result<GenerationJob, StoreError> {
        serde_json::from_value(record)
            .map_err(|e| StoreError::Storage(format!("malformed job row: {e}")))
    }
}

#[async_trait]
impl JobStore for RemoteStore {
    async fn insert(
        &self,
        envelope: GenerationRequest,
        request_hash: String,
        correlation_id: CorrelationId,
    ) -> Result<GenerationJob, StoreError> {
        let mut job = GenerationJob::new(JobId::from(""), envelope, request_hash.clone());
        job.correlation_id = correlation_id;

        let mut fields = serde_json::to_value(&job)
            .map_err(|e| StoreError::Storage(format!("unserializable job: {e}")))?;
        // The platform mints the id.
        if let Some(map) = fields.as_object_mut() {
            map.remove("id");
        }

        let id = match self.client.create(JOB_OBJECT, &fields, correlation_id).await {
            Ok(id) => id,
            Err(RemoteError::Api { status: 409, .. }) => {
                return Err(StoreError::DuplicateHash(request_hash));
            }
            Err(e) => return Err(e.into()),
        };
        job.id = JobId::new(id);
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Option<GenerationJob>, StoreError> {
        let filter = serde_json::json!({ "where": { "id": id.as_str() }, "limit": 1 });
        let mut records = self
            .client
            .query(JOB_OBJECT, &filter, CorrelationId::new())
            .await?;
        match records.pop() {
            Some(record) => Ok(Some(Self::decode_job(record)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, job: &GenerationJob) -> Result<(), StoreError> {
        let fields = serde_json::to_value(job)
            .map_err(|e| StoreError::Storage(format!("unserializable job: {e}")))?;
        self.client
            .update(JOB_OBJECT, job.id.as_str(), &fields, job.correlation_id)
            .await?;
        Ok(())
    }

    async fn find_by_hash(
        &self,
        hash: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<GenerationJob>, StoreError> {
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or_default();
        let filter = serde_json::json!({
            "where": { "requestHash": hash, "createdAfter": cutoff },
            "orderBy": [{ "field": "createdAt", "direction": "desc" }],
        });
        let records = self
            .client
            .query(JOB_OBJECT, &filter, CorrelationId::new())
            .await?;
        records.into_iter().map(Self::decode_job).collect()
    }

    async fn lease_candidates(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<GenerationJob>, StoreError> {
        let filter = serde_json::json!({
            "where": {
                "or": [
                    { "status": "QUEUED" },
                    { "status": "PROCESSING", "lockedUntilBefore": now },
                ],
                "scheduledRetryAtBefore": now,
            },
            "orderBy": [
                { "field": "priority", "direction": "desc" },
                { "field": "createdAt", "direction": "asc" },
            ],
            "limit": limit,
        });
        let records = self
            .client
            .query(JOB_OBJECT, &filter, CorrelationId::new())
            .await?;
        let jobs: Result<Vec<GenerationJob>, StoreError> =
            records.into_iter().map(Self::decode_job).collect();
        // The platform query is authoritative; eligibility is re-checked
        // locally so a lagging index can never hand out an owned job.
        Ok(jobs?.into_iter().filter(|j| j.is_eligible(now)).collect())
    }

    async fn try_lease(
        &self,
        observed: &GenerationJob,
        locked_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let set = serde_json::json!({
            "status": "PROCESSING",
            "lockedUntil": locked_until,
            "scheduledRetryAt": serde_json::Value::Null,
            "updatedAt": Utc::now(),
        });
        // Equality precondition on every field a competing claim would have
        // changed; the platform applies this atomically.
        let guard = serde_json::json!({
            "status": observed.status.as_str(),
            "lockedUntil": observed.locked_until,
            "scheduledRetryAt": observed.scheduled_retry_at,
            "attempts": observed.attempts,
        });
        let won = self
            .client
            .update_guarded(
                JOB_OBJECT,
                observed.id.as_str(),
                &set,
                &guard,
                observed.correlation_id,
            )
            .await?;
        Ok(won)
    }

    async fn renew_lease(
        &self,
        id: &JobId,
        locked_until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let fields = serde_json::json!({
            "lockedUntil": locked_until,
            "updatedAt": Utc::now(),
        });
        self.client
            .update(JOB_OBJECT, id.as_str(), &fields, CorrelationId::new())
            .await?;
        Ok(())
    }

    async fn queue_depth(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let candidates = self.lease_candidates(1000, now).await?;
        Ok(candidates.len())
    }
}

#[async_trait]
impl ContentStore for RemoteStore {
    async fn fetch_template(
        &self,
        id: &TemplateId,
        cid: CorrelationId,
    ) -> Result<Vec<u8>, GenerationError> {
        let file_id = FileId::new(id.as_str());
        match self.client.download(&file_id, cid).await {
            Ok(bytes) => Ok(bytes),
            Err(RemoteError::Api { status: 404, .. }) => {
                Err(GenerationError::TemplateNotFound(id.to_string()))
            }
            Err(RemoteError::Auth(msg)) => Err(GenerationError::AuthFailed(msg)),
            Err(e) => Err(GenerationError::unknown(e.to_string())),
        }
    }

    async fn upload(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        cid: CorrelationId,
    ) -> Result<FileId, GenerationError> {
        match self.client.upload(filename, bytes, cid).await {
            Ok(id) => Ok(id),
            Err(RemoteError::Auth(msg)) => Err(GenerationError::AuthFailed(msg)),
            Err(e) => Err(GenerationError::UploadFailed {
                status: e.status(),
                message: e.to_string(),
            }),
        }
    }

    async fn create_link(
        &self,
        file_id: &FileId,
        record_id: &RecordId,
        relation_key: &str,
        cid: CorrelationId,
    ) -> Result<(), GenerationError> {
        self.client
            .link(file_id, record_id, relation_key, cid)
            .await
            .map_err(|e| GenerationError::LinkFailed {
                relation: relation_key.to_string(),
                message: e.to_string(),
            })
    }
}
