//! The per-job render pipeline shared by the scheduler and the interactive
//! path: fetch -> merge -> convert -> upload -> link.
//!
//! Phases within one job are strictly sequential (composite parts render
//! concurrently, but the join waits for all of them); errors are classified
//! once, tagged with the failing phase, and handed back to the caller which
//! owns the job state machine.

use std::sync::Arc;

use docforge_core::{
    CorrelationId, FileId, GenerationError, GenerationJob, Phase,
};

use crate::cache::TemplateCache;
use crate::composite::{self, PlanPart, RenderPlan};
use crate::config::EngineConfig;
use crate::convert::ConversionPool;
use crate::gate::IdempotencyGate;
use crate::merge::{MergeContext, TemplateMerger};
use crate::store::{ContentStore, JobStore};

/// Everything a pipeline run needs, shared by batch and interactive paths.
#[derive(Clone)]
pub struct PipelineDeps {
    pub jobs: Arc<dyn JobStore>,
    pub content: Arc<dyn ContentStore>,
    pub cache: Arc<TemplateCache>,
    pub pool: Arc<ConversionPool>,
    pub merger: Arc<dyn TemplateMerger>,
    pub config: Arc<EngineConfig>,
}

impl PipelineDeps {
    pub fn gate(&self) -> IdempotencyGate {
        IdempotencyGate::new(self.jobs.clone(), self.config.gate_window)
    }
}

/// A classified error tagged with the phase that raised it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseError {
    pub phase: Phase,
    pub error: GenerationError,
}

impl PhaseError {
    pub fn new(phase: Phase, error: GenerationError) -> Self {
        Self { phase, error }
    }

    /// The `phase: message` form recorded on the job row.
    pub fn describe(&self) -> String {
        self.error.describe(self.phase)
    }
}

impl core::fmt::Display for PhaseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Result of a successful pipeline run.
#[derive(Debug, Clone)]
pub struct RenderedOutput {
    pub output_file_id: FileId,
    /// Set when the merged intermediate was uploaded alongside the output.
    pub intermediate_file_id: Option<FileId>,
    /// Merged bytes, only when the envelope asked for them back.
    pub merged_intermediate: Option<Vec<u8>>,
    /// Non-fatal link errors, one per failed relation.
    pub link_failures: Vec<GenerationError>,
}

/// Drive one job through the full pipeline.
pub async fn run(
    deps: &PipelineDeps,
    job: &GenerationJob,
) -> Result<RenderedOutput, PhaseError> {
    let cid = job.correlation_id;
    let envelope = &job.envelope;

    envelope
        .validate()
        .map_err(|e| PhaseError::new(Phase::Validate, e))?;
    let plan =
        composite::resolve(envelope).map_err(|e| PhaseError::new(Phase::Validate, e))?;

    let ctx = MergeContext {
        locale: envelope.locale.clone(),
        timezone: envelope.timezone.clone(),
    };

    let (output_bytes, merged) = match plan {
        RenderPlan::Single { template_id, data } => {
            let template = deps
                .cache
                .get(&template_id, cid)
                .await
                .map_err(|e| PhaseError::new(Phase::FetchTemplate, e))?;
            let merged = deps
                .merger
                .merge(&template, &data, &ctx)
                .map_err(|e| {
                    PhaseError::new(Phase::Merge, GenerationError::unknown(e.to_string()))
                })?;
            let output = if envelope.output_format.requires_conversion() {
                deps.pool
                    .convert(&merged, envelope.output_format, cid)
                    .await
                    .map_err(|e| PhaseError::new(Phase::Convert, e))?
            } else {
                merged.clone()
            };
            (output, Some(merged))
        }
        RenderPlan::Concatenate { parts } => {
            // Parts render concurrently; try_join_all hands results back in
            // plan order no matter which conversion finishes first.
            let rendered = futures::future::try_join_all(
                parts.iter().map(|part| render_part(deps, part, envelope, &ctx, cid)),
            )
            .await?;
            let section_break = deps.config.converter.section_break_bytes.is_some();
            let joined = deps
                .pool
                .concatenate(rendered, envelope.output_format, section_break, cid)
                .await
                .map_err(|e| PhaseError::new(Phase::Convert, e))?;
            (joined, None)
        }
    };

    let filename = format!(
        "document-{}.{}",
        job.id,
        envelope.output_format.extension()
    );
    let output_file_id = deps
        .content
        .upload(&filename, output_bytes, cid)
        .await
        .map_err(|e| PhaseError::new(Phase::Upload, e))?;
    tracing::info!(
        correlation_id = %cid,
        job_id = %job.id,
        file_id = %output_file_id,
        "stored rendered output"
    );

    let mut intermediate_file_id = None;
    if envelope.options.store_merged_intermediate {
        if let Some(merged) = &merged {
            let name = format!("document-{}-merged.docx", job.id);
            let id = deps
                .content
                .upload(&name, merged.clone(), cid)
                .await
                .map_err(|e| PhaseError::new(Phase::Upload, e))?;
            intermediate_file_id = Some(id);
        }
    }

    let mut link_failures = Vec::new();
    for (parent_key, record_id) in envelope.link_targets() {
        let relation = deps.config.relation_key(parent_key);
        if let Err(e) = deps
            .content
            .create_link(&output_file_id, record_id, relation, cid)
            .await
        {
            // Non-fatal: the file stays stored and reachable.
            tracing::warn!(
                correlation_id = %cid,
                job_id = %job.id,
                relation,
                error = %e,
                "link creation failed"
            );
            link_failures.push(e);
        }
    }

    Ok(RenderedOutput {
        output_file_id,
        intermediate_file_id,
        merged_intermediate: if envelope.options.return_intermediate_to_caller {
            merged
        } else {
            None
        },
        link_failures,
    })
}

async fn render_part(
    deps: &PipelineDeps,
    part: &PlanPart,
    envelope: &docforge_core::GenerationRequest,
    ctx: &MergeContext,
    cid: CorrelationId,
) -> Result<Vec<u8>, PhaseError> {
    let template = deps
        .cache
        .get(&part.template_id, cid)
        .await
        .map_err(|e| PhaseError::new(Phase::FetchTemplate, e))?;
    let merged = deps
        .merger
        .merge(&template, &part.data, ctx)
        .map_err(|e| PhaseError::new(Phase::Merge, GenerationError::unknown(e.to_string())))?;
    if envelope.output_format.requires_conversion() {
        deps.pool
            .convert(&merged, envelope.output_format, cid)
            .await
            .map_err(|e| PhaseError::new(Phase::Convert, e))
    } else {
        Ok(merged)
    }
}
