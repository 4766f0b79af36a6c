//! Remote platform error model.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Authorization failed even after one token refresh.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// The platform rejected the request (4xx other than 401).
    #[error("platform rejected request ({status}): {body}")]
    Api { status: u16, body: String },

    /// Transport-level failure or a 5xx that outlived the retry budget.
    #[error("network error: {0}")]
    Network(String),

    /// The platform answered with a body we could not decode.
    #[error("decode error: {0}")]
    Decode(String),
}

impl RemoteError {
    /// HTTP status carried by the error, when there was a response at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Api { status, .. } => Some(*status),
            RemoteError::Auth(_) => Some(401),
            _ => None,
        }
    }

    /// Whether a *job-level* retry might succeed. Rejected requests (4xx)
    /// stay rejected; everything else is transient.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RemoteError::Api { .. })
    }
}
