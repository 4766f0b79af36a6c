//! Token exchange against the platform's token endpoint.
//!
//! The exchange itself sits behind a trait so the manager can be tested
//! without a live endpoint.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::error::AuthError;
use crate::token::{AuthToken, TokenSource};

/// A prepared grant, ready to be posted to the token endpoint.
#[derive(Debug, Clone)]
pub enum TokenGrant {
    /// `grant_type=urn:ietf:params:oauth:grant-type:jwt-bearer`
    JwtAssertion { assertion: String },
    /// `grant_type=refresh_token`
    RefreshToken {
        refresh_token: String,
        client_id: String,
        client_secret: Option<String>,
    },
}

impl TokenGrant {
    pub fn source(&self) -> TokenSource {
        match self {
            TokenGrant::JwtAssertion { .. } => TokenSource::JwtAssertion,
            TokenGrant::RefreshToken { .. } => TokenSource::RefreshToken,
        }
    }
}

/// Performs one grant exchange.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self, grant: &TokenGrant) -> Result<AuthToken, AuthError>;
}

/// Wire shape of the token endpoint response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Lifetime in seconds.
    expires_in: i64,
}

/// Production exchanger posting form-encoded grants over HTTPS.
pub struct HttpTokenExchanger {
    http: reqwest::Client,
    token_url: String,
}

impl HttpTokenExchanger {
    pub fn new(token_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token_url: token_url.into(),
        }
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn exchange(&self, grant: &TokenGrant) -> Result<AuthToken, AuthError> {
        let form: Vec<(&str, String)> = match grant {
            TokenGrant::JwtAssertion { assertion } => vec![
                (
                    "grant_type",
                    "urn:ietf:params:oauth:grant-type:jwt-bearer".to_string(),
                ),
                ("assertion", assertion.clone()),
            ],
            TokenGrant::RefreshToken {
                refresh_token,
                client_id,
                client_secret,
            } => {
                let mut form = vec![
                    ("grant_type", "refresh_token".to_string()),
                    ("refresh_token", refresh_token.clone()),
                    ("client_id", client_id.clone()),
                ];
                if let Some(secret) = client_secret {
                    form.push(("client_secret", secret.clone()));
                }
                form
            }
        };

        let resp = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Exchange(format!("token endpoint unreachable: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Exchange(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Exchange(format!("malformed token response: {e}")))?;

        Ok(AuthToken {
            value: parsed.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(parsed.expires_in),
            source: grant.source(),
        })
    }
}
