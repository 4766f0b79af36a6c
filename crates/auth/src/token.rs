//! Bearer token model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which acquisition strategy produced a token.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    /// Signed-assertion exchange (service principal).
    JwtAssertion,
    /// Stored-refresh-token exchange.
    RefreshToken,
}

/// A cached outbound bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
    pub source: TokenSource,
}

impl AuthToken {
    /// Whether the token is still usable at `now`, with `leeway` seconds of
    /// margin before the actual expiry.
    pub fn is_fresh(&self, now: DateTime<Utc>, leeway_secs: i64) -> bool {
        self.expires_at - chrono::Duration::seconds(leeway_secs) > now
    }
}
