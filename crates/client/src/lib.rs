//! `docforge-client` — retrying HTTP access to the record-keeping platform.
//!
//! Owns the transient retry/backoff policy (5xx up to 3 attempts at 1s/2s/4s)
//! and the single refresh-on-401 via `docforge-auth`. The job-level retry
//! policy in `docforge-engine` is layered outside of, and never interacts
//! with, these request-level retries.

pub mod error;
pub mod remote;
pub mod retry;

pub use error::RemoteError;
pub use remote::{RemoteClient, CORRELATION_HEADER};
pub use retry::{classify_status, HttpRetryPolicy, RetryDecision};
