//! Polling job scheduler.
//!
//! One scheduling loop per process instance; multiple instances may run
//! against the same platform queue. Mutual exclusion comes from the
//! conditional lease write, never from an in-process lock. Leases, not
//! ticks, are the unit of exclusivity, so in-flight jobs may span ticks.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use docforge_core::{GenerationJob, JobStatus};

use crate::gate::GateOutcome;
use crate::pipeline::{self, PipelineDeps};
use crate::stats::{EngineStats, SchedulerStatus};

/// How one processing attempt ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum JobOutcome {
    Succeeded,
    Retried,
    Failed,
}

/// The poll scheduler. Consumed by [`Scheduler::start`].
pub struct Scheduler {
    deps: PipelineDeps,
}

/// Handle to a running scheduler: control surface plus graceful shutdown.
pub struct SchedulerHandle {
    shutdown: Arc<Notify>,
    join: Option<tokio::task::JoinHandle<()>>,
    stats: Arc<Mutex<EngineStats>>,
    status: Arc<Mutex<SchedulerStatus>>,
}

impl SchedulerHandle {
    /// Stop leasing new batches, drain in-flight jobs, then return.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }

    /// Cumulative counters.
    pub fn stats(&self) -> EngineStats {
        self.stats.lock().unwrap().clone()
    }

    /// Point-in-time scheduler state.
    pub fn status(&self) -> SchedulerStatus {
        self.status.lock().unwrap().clone()
    }
}

impl Scheduler {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    /// Spawn the scheduling loop.
    pub fn start(self) -> SchedulerHandle {
        let shutdown = Arc::new(Notify::new());
        let stats = Arc::new(Mutex::new(EngineStats::default()));
        let status = Arc::new(Mutex::new(SchedulerStatus::default()));

        let join = tokio::spawn(scheduler_loop(
            self.deps,
            shutdown.clone(),
            stats.clone(),
            status.clone(),
        ));

        SchedulerHandle {
            shutdown,
            join: Some(join),
            stats,
            status,
        }
    }
}

async fn scheduler_loop(
    deps: PipelineDeps,
    shutdown: Arc<Notify>,
    stats: Arc<Mutex<EngineStats>>,
    status: Arc<Mutex<SchedulerStatus>>,
) {
    tracing::info!(
        batch_size = deps.config.batch_size,
        max_concurrency = deps.config.max_concurrency,
        "scheduler started"
    );
    status.lock().unwrap().is_running = true;

    // Caps parallel pipelines; the rest of a leased batch queues here
    // in-process until a slot frees.
    let slots = Arc::new(Semaphore::new(deps.config.max_concurrency));
    let mut in_flight: JoinSet<JobOutcome> = JoinSet::new();

    loop {
        // Collect attempts finished since the last tick. Stats are only
        // touched here, on the scheduler's own task.
        while let Some(result) = in_flight.try_join_next() {
            record_outcome(&stats, result);
        }

        let found = poll_tick(&deps, &slots, &mut in_flight, &status).await;

        let delay = if found {
            deps.config.active_interval
        } else {
            deps.config.idle_interval
        };

        tokio::select! {
            _ = shutdown.notified() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::info!(
        in_flight = in_flight.len(),
        "scheduler shutting down, draining in-flight jobs"
    );
    while let Some(result) = in_flight.join_next().await {
        record_outcome(&stats, result);
    }

    status.lock().unwrap().is_running = false;
    tracing::info!("scheduler stopped");
}

/// One poll: lease a batch and spawn each claimed job. Returns whether any
/// work was found (drives the adaptive interval).
async fn poll_tick(
    deps: &PipelineDeps,
    slots: &Arc<Semaphore>,
    in_flight: &mut JoinSet<JobOutcome>,
    status: &Arc<Mutex<SchedulerStatus>>,
) -> bool {
    let now = Utc::now();

    let candidates = match deps.jobs.lease_candidates(deps.config.batch_size, now).await {
        Ok(candidates) => candidates,
        Err(e) => {
            tracing::error!(error = %e, "failed to query lease candidates");
            return false;
        }
    };
    let depth = deps.jobs.queue_depth(now).await.unwrap_or(candidates.len());

    {
        let mut status = status.lock().unwrap();
        status.last_poll_at = Some(now);
        status.queue_depth = depth;
    }

    if candidates.is_empty() {
        return false;
    }
    tracing::debug!(candidates = candidates.len(), queue_depth = depth, "leasing batch");

    let mut claimed = 0usize;
    for mut job in candidates {
        let locked_until = now
            + chrono::Duration::from_std(deps.config.lock_ttl).unwrap_or_default();
        match deps.jobs.try_lease(&job, locked_until).await {
            Ok(true) => {}
            Ok(false) => {
                // Another scheduler instance won, or the row changed
                // (e.g. canceled) since the query.
                tracing::debug!(job_id = %job.id, "lost lease race, skipping");
                continue;
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "lease write failed");
                continue;
            }
        }
        job.mark_processing(now, deps.config.lock_ttl);
        claimed += 1;

        let deps = deps.clone();
        let slots = slots.clone();
        in_flight.spawn(async move { process_job(&deps, slots, job).await });
    }

    claimed > 0
}

/// Run one leased job, renewing the lease while the attempt is in flight so
/// a slow conversion never lets the job look abandoned.
async fn process_job(
    deps: &PipelineDeps,
    slots: Arc<Semaphore>,
    mut job: GenerationJob,
) -> JobOutcome {
    let job_id = job.id.clone();
    let renew_every = deps.config.lock_ttl / 3;

    let attempt = run_attempt(deps, slots, &mut job);
    tokio::pin!(attempt);
    loop {
        tokio::select! {
            outcome = &mut attempt => return outcome,
            _ = tokio::time::sleep(renew_every) => {
                let until = Utc::now()
                    + chrono::Duration::from_std(deps.config.lock_ttl).unwrap_or_default();
                if let Err(e) = deps.jobs.renew_lease(&job_id, until).await {
                    tracing::warn!(job_id = %job_id, error = %e, "lease renewal failed");
                }
            }
        }
    }
}

/// One processing attempt: wait for a slot, re-check the gate, run the
/// pipeline, and apply the state machine.
async fn run_attempt(
    deps: &PipelineDeps,
    slots: Arc<Semaphore>,
    job: &mut GenerationJob,
) -> JobOutcome {
    let _permit = slots
        .acquire_owned()
        .await
        .expect("scheduler semaphore closed");

    let job_id = job.id.clone();
    let cid = job.correlation_id;
    tracing::info!(job_id = %job_id, correlation_id = %cid, attempts = job.attempts, "processing job");

    // A twin may have succeeded since this job was enqueued; reuse its
    // output instead of rendering twice.
    match deps.gate().check(&job.request_hash, Utc::now(), Some(&job.id)).await {
        Ok(GateOutcome::Reuse { output_file_id, job_id: twin }) => {
            tracing::info!(job_id = %job_id, twin_job_id = %twin, "duplicate of succeeded job, reusing output");
            job.mark_succeeded(output_file_id);
            persist(deps, &job).await;
            return JobOutcome::Succeeded;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "gate pre-check failed, rendering anyway");
        }
    }

    match pipeline::run(deps, &job).await {
        Ok(output) => {
            job.mark_succeeded(output.output_file_id);
            persist(deps, &job).await;
            tracing::info!(job_id = %job_id, correlation_id = %cid, "job succeeded");
            JobOutcome::Succeeded
        }
        Err(phase_error) => {
            let description = phase_error.describe();
            job.mark_failed_attempt(
                &phase_error.error,
                description.clone(),
                &deps.config.retry,
                Utc::now(),
            );
            persist(deps, &job).await;

            if job.status == JobStatus::Failed {
                tracing::error!(job_id = %job_id, correlation_id = %cid, error = %description, attempts = job.attempts, "job failed terminally");
                JobOutcome::Failed
            } else {
                tracing::warn!(
                    job_id = %job_id,
                    correlation_id = %cid,
                    error = %description,
                    attempts = job.attempts,
                    retry_at = ?job.scheduled_retry_at,
                    "job attempt failed, retry scheduled"
                );
                JobOutcome::Retried
            }
        }
    }
}

async fn persist(deps: &PipelineDeps, job: &GenerationJob) {
    if let Err(e) = deps.jobs.update(job).await {
        // The lease will lapse and another instance will reclaim the job;
        // at-least-once processing absorbs the repeat.
        tracing::error!(job_id = %job.id, error = %e, "failed to persist job state");
    }
}

fn record_outcome(
    stats: &Arc<Mutex<EngineStats>>,
    result: Result<JobOutcome, tokio::task::JoinError>,
) {
    let mut stats = stats.lock().unwrap();
    match result {
        Ok(JobOutcome::Succeeded) => {
            stats.total_processed += 1;
            stats.total_succeeded += 1;
        }
        Ok(JobOutcome::Failed) => {
            stats.total_processed += 1;
            stats.total_failed += 1;
        }
        Ok(JobOutcome::Retried) => {
            stats.total_processed += 1;
            stats.total_retries += 1;
        }
        Err(e) => {
            stats.total_processed += 1;
            stats.total_failed += 1;
            tracing::error!(error = %e, "job task panicked");
        }
    }
}
