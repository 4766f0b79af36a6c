//! `docforge-auth` — outbound bearer-token acquisition and caching.
//!
//! Two acquisition strategies (signed-assertion exchange, stored-refresh-token
//! exchange) behind one process-wide [`TokenManager`] with proactive refresh
//! near expiry and single-flight acquisition under concurrency. Reactive
//! refresh on 401 lives in `docforge-client`, which calls
//! [`TokenManager::invalidate`].

pub mod error;
pub mod exchange;
pub mod manager;
pub mod token;

pub use error::AuthError;
pub use exchange::{HttpTokenExchanger, TokenExchanger, TokenGrant};
pub use manager::{AuthConfig, JwtAssertionConfig, RefreshTokenConfig, TokenManager};
pub use token::{AuthToken, TokenSource};
