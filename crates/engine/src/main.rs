//! `docforge-worker` — batch worker process.
//!
//! Configuration comes from `DOCFORGE_*` environment variables; there is no
//! CLI surface.

use std::sync::Arc;

use anyhow::Context;

use docforge_auth::{
    AuthConfig, HttpTokenExchanger, JwtAssertionConfig, RefreshTokenConfig, TokenManager,
};
use docforge_client::RemoteClient;
use docforge_engine::{
    ContentStore, ConversionPool, EngineConfig, JobStore, PipelineDeps, RemoteStore, Scheduler,
    TemplateCache, TextTemplateMerger,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    docforge_observability::init();

    let base_url =
        std::env::var("DOCFORGE_BASE_URL").context("DOCFORGE_BASE_URL is required")?;
    let token_url =
        std::env::var("DOCFORGE_TOKEN_URL").context("DOCFORGE_TOKEN_URL is required")?;
    let client_id =
        std::env::var("DOCFORGE_CLIENT_ID").context("DOCFORGE_CLIENT_ID is required")?;

    let refresh_token = std::env::var("DOCFORGE_REFRESH_TOKEN").ok().map(|token| {
        RefreshTokenConfig {
            refresh_token: token,
            client_secret: std::env::var("DOCFORGE_CLIENT_SECRET").ok(),
        }
    });
    let jwt_assertion = match std::env::var("DOCFORGE_ASSERTION_KEY_FILE").ok() {
        Some(path) => {
            let pem = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read signing key at {path}"))?;
            Some(JwtAssertionConfig {
                private_key_pem: pem,
                principal: std::env::var("DOCFORGE_ASSERTION_PRINCIPAL")
                    .context("DOCFORGE_ASSERTION_PRINCIPAL is required with a signing key")?,
                audience: std::env::var("DOCFORGE_ASSERTION_AUDIENCE")
                    .unwrap_or_else(|_| token_url.clone()),
            })
        }
        None => None,
    };

    let tokens = Arc::new(
        TokenManager::new(
            AuthConfig {
                client_id,
                jwt_assertion,
                refresh_token,
            },
            Arc::new(HttpTokenExchanger::new(token_url)),
        )
        .context("failed to build token manager")?,
    );

    let mut config = EngineConfig::default();
    if let Some(n) = env_usize("DOCFORGE_BATCH_SIZE")? {
        config.batch_size = n;
    }
    if let Some(n) = env_usize("DOCFORGE_MAX_CONCURRENCY")? {
        config.max_concurrency = n;
    }
    if let Some(n) = env_usize("DOCFORGE_CONVERT_CONCURRENCY")? {
        config.convert_concurrency = n;
    }
    if let Ok(binary) = std::env::var("DOCFORGE_CONVERTER") {
        config.converter.binary = binary;
    }
    let config = Arc::new(config);

    let client = Arc::new(RemoteClient::new(base_url, tokens));
    let store = Arc::new(RemoteStore::new(client));
    let jobs: Arc<dyn JobStore> = store.clone();
    let content: Arc<dyn ContentStore> = store;

    let deps = PipelineDeps {
        cache: Arc::new(TemplateCache::new(content.clone(), config.cache_max_bytes)),
        pool: Arc::new(ConversionPool::new(
            config.converter.clone(),
            config.convert_concurrency,
        )),
        merger: Arc::new(TextTemplateMerger),
        jobs,
        content,
        config,
    };

    let handle = Scheduler::new(deps).start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");
    handle.shutdown().await;

    Ok(())
}

fn env_usize(name: &str) -> anyhow::Result<Option<usize>> {
    match std::env::var(name) {
        Ok(value) => {
            let parsed = value
                .parse::<usize>()
                .with_context(|| format!("{name} must be a positive integer, got '{value}'"))?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}
