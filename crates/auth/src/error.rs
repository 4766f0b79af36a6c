//! Authentication error model.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Neither acquisition strategy is configured. Raised at construction,
    /// never lazily at first call.
    #[error("no outbound credentials configured (need a refresh token or a signed-assertion key)")]
    NoCredentials,

    /// Building or signing the assertion failed.
    #[error("assertion error: {0}")]
    Assertion(String),

    /// The token endpoint rejected the grant or was unreachable.
    #[error("token exchange failed: {0}")]
    Exchange(String),
}
