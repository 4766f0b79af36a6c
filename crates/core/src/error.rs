//! Generation error model.
//!
//! Every pipeline failure is classified exactly once into this taxonomy; the
//! classification drives whether the job is retried with backoff or fails
//! terminally after a single attempt.

use thiserror::Error;

/// Result type used across the engine.
pub type GenerationResult<T> = Result<T, GenerationError>;

/// Pipeline phase in which an error occurred, recorded on the job for
/// diagnosis.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Validate,
    FetchTemplate,
    Merge,
    Convert,
    Upload,
    Link,
    Finalize,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Validate => "validate",
            Phase::FetchTemplate => "fetch_template",
            Phase::Merge => "merge",
            Phase::Convert => "convert",
            Phase::Upload => "upload",
            Phase::Link => "link",
            Phase::Finalize => "finalize",
        }
    }
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified generation failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The envelope failed validation. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced template does not exist on the platform. Never retried.
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// The external converter exceeded its deadline.
    #[error("conversion timed out after {timeout_ms}ms")]
    ConversionTimeout { timeout_ms: u64 },

    /// The external converter exited non-zero or produced no output.
    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    /// Storing the rendered output on the platform failed.
    #[error("upload failed (status {status:?}): {message}")]
    UploadFailed { status: Option<u16>, message: String },

    /// Linking the stored file to a business record failed. Non-fatal: the
    /// file remains stored and reachable.
    #[error("link failed for relation {relation}: {message}")]
    LinkFailed { relation: String, message: String },

    /// Outbound authentication failed even after a token refresh.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Anything unclassified. Retried, conservatively.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl GenerationError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Whether a job failing with this error is eligible for backoff retry.
    ///
    /// An `UploadFailed` with a 4xx status other than 401 is a rejected
    /// request that will not succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            GenerationError::Validation(_) | GenerationError::TemplateNotFound(_) => false,
            GenerationError::ConversionTimeout { .. }
            | GenerationError::ConversionFailed(_)
            | GenerationError::AuthFailed(_)
            | GenerationError::Unknown(_) => true,
            GenerationError::UploadFailed { status, .. } => match status {
                Some(code) if (400..500).contains(code) && *code != 401 => false,
                _ => true,
            },
            // Non-fatal; never drives the job state machine on its own.
            GenerationError::LinkFailed { .. } => false,
        }
    }

    /// Link failures are collected, logged, and do not fail the job.
    pub fn is_fatal_to_job(&self) -> bool {
        !matches!(self, GenerationError::LinkFailed { .. })
    }

    /// Render the `phase: message` form stored on the job's `error` field.
    pub fn describe(&self, phase: Phase) -> String {
        format!("{phase}: {self}")
    }
}
