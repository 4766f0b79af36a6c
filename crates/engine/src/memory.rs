//! In-memory job/content store for tests and development.
//!
//! Mirrors the platform contract the engine relies on, including genuinely
//! atomic lease claims and hash uniqueness on insert.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use docforge_core::{
    CorrelationId, FileId, GenerationError, GenerationJob, GenerationRequest, JobId, JobStatus,
    RecordId, TemplateId,
};

use crate::store::{ContentStore, JobStore, StoreError};

/// One recorded file-to-record link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedLink {
    pub file_id: FileId,
    pub record_id: RecordId,
    pub relation_key: String,
}

#[derive(Default)]
struct Content {
    templates: HashMap<TemplateId, Vec<u8>>,
    template_fetches: HashMap<TemplateId, u64>,
    uploads: HashMap<FileId, (String, Vec<u8>)>,
    links: Vec<RecordedLink>,
}

/// In-memory store for tests/dev.
#[derive(Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<JobId, GenerationJob>>,
    content: RwLock<Content>,
    job_seq: AtomicU64,
    upload_seq: AtomicU64,
    /// Fail this many upcoming uploads with a retryable 503.
    failing_uploads: AtomicU32,
    /// Relations whose link creation fails.
    failing_relations: RwLock<Vec<String>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn add_template(&self, id: TemplateId, bytes: Vec<u8>) {
        self.content.write().unwrap().templates.insert(id, bytes);
    }

    /// How many times a template was fetched (cache verification).
    pub fn template_fetches(&self, id: &TemplateId) -> u64 {
        self.content
            .read()
            .unwrap()
            .template_fetches
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn uploaded(&self, id: &FileId) -> Option<(String, Vec<u8>)> {
        self.content.read().unwrap().uploads.get(id).cloned()
    }

    pub fn upload_count(&self) -> usize {
        self.content.read().unwrap().uploads.len()
    }

    pub fn links(&self) -> Vec<RecordedLink> {
        self.content.read().unwrap().links.clone()
    }

    pub fn fail_next_uploads(&self, count: u32) {
        self.failing_uploads.store(count, Ordering::SeqCst);
    }

    pub fn fail_links_for(&self, relation_key: impl Into<String>) {
        self.failing_relations
            .write()
            .unwrap()
            .push(relation_key.into());
    }

    pub fn job_snapshot(&self, id: &JobId) -> Option<GenerationJob> {
        self.jobs.read().unwrap().get(id).cloned()
    }

    /// External-actor cancellation (never performed by the engine itself).
    pub fn cancel(&self, id: &JobId) {
        if let Some(job) = self.jobs.write().unwrap().get_mut(id) {
            job.status = JobStatus::Canceled;
            job.locked_until = None;
            job.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert(
        &self,
        envelope: GenerationRequest,
        request_hash: String,
        correlation_id: CorrelationId,
    ) -> Result<GenerationJob, StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let duplicate = jobs
            .values()
            .any(|j| j.request_hash == request_hash && j.status != JobStatus::Canceled);
        if duplicate {
            return Err(StoreError::DuplicateHash(request_hash));
        }

        let id = JobId::new(format!(
            "job-{}",
            self.job_seq.fetch_add(1, Ordering::SeqCst) + 1
        ));
        let mut job = GenerationJob::new(id.clone(), envelope, request_hash);
        job.correlation_id = correlation_id;
        jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> Result<Option<GenerationJob>, StoreError> {
        Ok(self.jobs.read().unwrap().get(id).cloned())
    }

    async fn update(&self, job: &GenerationJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if !jobs.contains_key(&job.id) {
            return Err(StoreError::NotFound(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn find_by_hash(
        &self,
        hash: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<GenerationJob>, StoreError> {
        let cutoff = now - chrono::Duration::from_std(window).unwrap_or_default();
        let mut matches: Vec<GenerationJob> = self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.request_hash == hash && j.created_at >= cutoff)
            .cloned()
            .collect();
        matches.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        Ok(matches)
    }

    async fn lease_candidates(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<GenerationJob>, StoreError> {
        let mut candidates: Vec<GenerationJob> = self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.is_eligible(now))
            .cloned()
            .collect();
        candidates.sort_by_key(|j| j.created_at);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn try_lease(
        &self,
        observed: &GenerationJob,
        locked_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let stored = jobs
            .get_mut(&observed.id)
            .ok_or_else(|| StoreError::NotFound(observed.id.clone()))?;

        // Equality precondition: the claim only wins while the row still
        // looks exactly like the claimant's snapshot.
        let unchanged = stored.status == observed.status
            && stored.locked_until == observed.locked_until
            && stored.scheduled_retry_at == observed.scheduled_retry_at
            && stored.attempts == observed.attempts;
        if !unchanged {
            return Ok(false);
        }

        stored.status = JobStatus::Processing;
        stored.locked_until = Some(locked_until);
        stored.scheduled_retry_at = None;
        stored.updated_at = Utc::now();
        Ok(true)
    }

    async fn renew_lease(
        &self,
        id: &JobId,
        locked_until: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let stored = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        // Renewal only applies while the job is still owned.
        if stored.status == JobStatus::Processing {
            stored.locked_until = Some(locked_until);
            stored.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn queue_depth(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(self
            .jobs
            .read()
            .unwrap()
            .values()
            .filter(|j| j.is_eligible(now))
            .count())
    }
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn fetch_template(
        &self,
        id: &TemplateId,
        _cid: CorrelationId,
    ) -> Result<Vec<u8>, GenerationError> {
        let mut content = self.content.write().unwrap();
        *content.template_fetches.entry(id.clone()).or_insert(0) += 1;
        content
            .templates
            .get(id)
            .cloned()
            .ok_or_else(|| GenerationError::TemplateNotFound(id.to_string()))
    }

    async fn upload(
        &self,
        filename: &str,
        bytes: Vec<u8>,
        _cid: CorrelationId,
    ) -> Result<FileId, GenerationError> {
        let remaining = self.failing_uploads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_uploads.store(remaining - 1, Ordering::SeqCst);
            return Err(GenerationError::UploadFailed {
                status: Some(503),
                message: "injected upload failure".to_string(),
            });
        }

        let id = FileId::new(format!(
            "file-{}",
            self.upload_seq.fetch_add(1, Ordering::SeqCst) + 1
        ));
        self.content
            .write()
            .unwrap()
            .uploads
            .insert(id.clone(), (filename.to_string(), bytes));
        Ok(id)
    }

    async fn create_link(
        &self,
        file_id: &FileId,
        record_id: &RecordId,
        relation_key: &str,
        _cid: CorrelationId,
    ) -> Result<(), GenerationError> {
        let failing = self
            .failing_relations
            .read()
            .unwrap()
            .iter()
            .any(|r| r == relation_key);
        if failing {
            return Err(GenerationError::LinkFailed {
                relation: relation_key.to_string(),
                message: "injected link failure".to_string(),
            });
        }

        self.content.write().unwrap().links.push(RecordedLink {
            file_id: file_id.clone(),
            record_id: record_id.clone(),
            relation_key: relation_key.to_string(),
        });
        Ok(())
    }
}
