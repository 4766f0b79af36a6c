//! Token cache and acquisition strategies.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::AuthError;
use crate::exchange::{TokenExchanger, TokenGrant};
use crate::token::AuthToken;

/// Seconds before expiry at which a token is refreshed proactively.
const EXPIRY_LEEWAY_SECS: i64 = 60;

/// Strategy A: signed-assertion exchange identifying a service principal.
#[derive(Debug, Clone)]
pub struct JwtAssertionConfig {
    /// RSA private key (PEM) used to sign the assertion.
    pub private_key_pem: String,
    /// Principal (username/subject) the assertion acts as.
    pub principal: String,
    /// Audience expected by the token endpoint.
    pub audience: String,
}

/// Strategy B: stored-refresh-token exchange (lower-friction local/CI path).
#[derive(Debug, Clone)]
pub struct RefreshTokenConfig {
    pub refresh_token: String,
    pub client_secret: Option<String>,
}

/// Outbound authentication configuration.
///
/// At least one strategy must be configured; when both are, the
/// refresh-token strategy wins.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub client_id: String,
    pub jwt_assertion: Option<JwtAssertionConfig>,
    pub refresh_token: Option<RefreshTokenConfig>,
}

#[derive(Debug, Serialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    exp: i64,
}

/// Process-wide token manager.
///
/// One shared instance per process; the cache lives behind an async mutex
/// held across the exchange so concurrent callers share a single in-flight
/// acquisition.
pub struct TokenManager {
    config: AuthConfig,
    exchanger: Arc<dyn TokenExchanger>,
    cached: Mutex<Option<AuthToken>>,
}

impl TokenManager {
    /// Build a manager, failing immediately when no strategy is configured.
    pub fn new(
        config: AuthConfig,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Result<Self, AuthError> {
        if config.jwt_assertion.is_none() && config.refresh_token.is_none() {
            return Err(AuthError::NoCredentials);
        }
        Ok(Self {
            config,
            exchanger,
            cached: Mutex::new(None),
        })
    }

    /// Return a valid bearer token value, acquiring or refreshing as needed.
    pub async fn bearer(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();

        if let Some(token) = cached.as_ref() {
            if token.is_fresh(now, EXPIRY_LEEWAY_SECS) {
                return Ok(token.value.clone());
            }
            tracing::debug!(source = ?token.source, "cached token near expiry, refreshing");
        }

        let grant = self.build_grant()?;
        let token = self.exchanger.exchange(&grant).await?;
        tracing::info!(source = ?token.source, expires_at = %token.expires_at, "acquired bearer token");
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Drop the cached token so the next caller acquires a fresh one.
    ///
    /// Called by the remote client when the platform answers 401.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        if cached.take().is_some() {
            tracing::warn!("cached token invalidated after authorization failure");
        }
    }

    /// Snapshot of the cached token, if any (for diagnostics).
    pub async fn current(&self) -> Option<AuthToken> {
        self.cached.lock().await.clone()
    }

    fn build_grant(&self) -> Result<TokenGrant, AuthError> {
        // Refresh-token takes precedence when both strategies are present.
        if let Some(refresh) = &self.config.refresh_token {
            return Ok(TokenGrant::RefreshToken {
                refresh_token: refresh.refresh_token.clone(),
                client_id: self.config.client_id.clone(),
                client_secret: refresh.client_secret.clone(),
            });
        }

        let assertion_cfg = self
            .config
            .jwt_assertion
            .as_ref()
            .ok_or(AuthError::NoCredentials)?;

        let claims = AssertionClaims {
            iss: self.config.client_id.clone(),
            sub: assertion_cfg.principal.clone(),
            aud: assertion_cfg.audience.clone(),
            exp: (Utc::now() + chrono::Duration::minutes(5)).timestamp(),
        };
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(
            assertion_cfg.private_key_pem.as_bytes(),
        )
        .map_err(|e| AuthError::Assertion(format!("invalid signing key: {e}")))?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &key,
        )
        .map_err(|e| AuthError::Assertion(format!("failed to sign assertion: {e}")))?;

        Ok(TokenGrant::JwtAssertion { assertion })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::token::TokenSource;

    /// Exchanger that counts calls and returns tokens with a fixed lifetime.
    struct CountingExchanger {
        calls: AtomicUsize,
        lifetime_secs: i64,
    }

    impl CountingExchanger {
        fn new(lifetime_secs: i64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                lifetime_secs,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenExchanger for CountingExchanger {
        async fn exchange(&self, grant: &TokenGrant) -> Result<AuthToken, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            // Simulate endpoint latency so concurrent callers overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(AuthToken {
                value: format!("token-{n}"),
                expires_at: Utc::now() + chrono::Duration::seconds(self.lifetime_secs),
                source: grant.source(),
            })
        }
    }

    fn refresh_only_config() -> AuthConfig {
        AuthConfig {
            client_id: "client-1".to_string(),
            jwt_assertion: None,
            refresh_token: Some(RefreshTokenConfig {
                refresh_token: "stored-refresh".to_string(),
                client_secret: None,
            }),
        }
    }

    #[test]
    fn construction_fails_without_credentials() {
        let exchanger = CountingExchanger::new(3600);
        let config = AuthConfig {
            client_id: "client-1".to_string(),
            jwt_assertion: None,
            refresh_token: None,
        };
        assert!(matches!(
            TokenManager::new(config, exchanger),
            Err(AuthError::NoCredentials)
        ));
    }

    #[tokio::test]
    async fn refresh_token_strategy_takes_precedence() {
        let exchanger = CountingExchanger::new(3600);
        let mut config = refresh_only_config();
        config.jwt_assertion = Some(JwtAssertionConfig {
            private_key_pem: "not a real key".to_string(),
            principal: "svc@example.org".to_string(),
            audience: "https://login.example.org".to_string(),
        });
        let manager = TokenManager::new(config, exchanger.clone()).unwrap();

        manager.bearer().await.unwrap();
        let token = manager.current().await.unwrap();
        assert_eq!(token.source, TokenSource::RefreshToken);
    }

    #[tokio::test]
    async fn cached_token_is_reused_until_near_expiry() {
        let exchanger = CountingExchanger::new(3600);
        let manager = TokenManager::new(refresh_only_config(), exchanger.clone()).unwrap();

        let a = manager.bearer().await.unwrap();
        let b = manager.bearer().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(exchanger.calls(), 1);
    }

    #[tokio::test]
    async fn near_expiry_token_triggers_proactive_refresh() {
        // Lifetime inside the 60s leeway window: every call refreshes.
        let exchanger = CountingExchanger::new(30);
        let manager = TokenManager::new(refresh_only_config(), exchanger.clone()).unwrap();

        let a = manager.bearer().await.unwrap();
        let b = manager.bearer().await.unwrap();
        assert_ne!(a, b);
        assert_eq!(exchanger.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_exchange() {
        let exchanger = CountingExchanger::new(3600);
        let manager =
            Arc::new(TokenManager::new(refresh_only_config(), exchanger.clone()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move { manager.bearer().await.unwrap() }));
        }
        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap());
        }

        assert_eq!(exchanger.calls(), 1);
        assert!(values.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn invalidate_forces_fresh_acquisition() {
        let exchanger = CountingExchanger::new(3600);
        let manager = TokenManager::new(refresh_only_config(), exchanger.clone()).unwrap();

        let a = manager.bearer().await.unwrap();
        manager.invalidate().await;
        let b = manager.bearer().await.unwrap();

        assert_ne!(a, b);
        assert_eq!(exchanger.calls(), 2);
    }
}
