//! Access token for the mapping provider
//!
//! `HttpTokenSource` calls the token-issuing endpoint (no request body, response
//! `{ token }`). `AccessTokenProvider` fronts it with the session cache: a hit
//! skips the network, a fetched token is stored, and failures are never cached.

use crate::cache::token::AccessTokenCache;
use crate::infra::config::Config;
use crate::infra::error::TokenFetchError;
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch_token(&self) -> Result<String, TokenFetchError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Extract the token from a response body; anything without a non-empty `token` is malformed
pub fn parse_token_response(body: &[u8]) -> Result<String, TokenFetchError> {
    let parsed: TokenResponse =
        serde_json::from_slice(body).map_err(|_| TokenFetchError::MissingToken)?;
    match parsed.token {
        Some(token) if !token.is_empty() => Ok(token),
        _ => Err(TokenFetchError::MissingToken),
    }
}

pub struct HttpTokenSource {
    url: String,
    client: reqwest::Client,
}

impl HttpTokenSource {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, TokenFetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url: url.to_string(), client })
    }

    pub fn from_config(config: &Config) -> Result<Self, TokenFetchError> {
        Self::new(config.token_url(), config.token_timeout())
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch_token(&self) -> Result<String, TokenFetchError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TokenFetchError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        parse_token_response(&body)
    }
}

pub struct AccessTokenProvider {
    cache: AccessTokenCache,
    source: Arc<dyn TokenSource>,
    metrics: Arc<Metrics>,
}

impl AccessTokenProvider {
    pub fn new(cache: AccessTokenCache, source: Arc<dyn TokenSource>, metrics: Arc<Metrics>) -> Self {
        Self { cache, source, metrics }
    }

    /// Cached token if still valid, otherwise fetch and cache a fresh one
    pub async fn token(&self) -> Result<String, TokenFetchError> {
        if let Some(token) = self.cache.get() {
            return Ok(token);
        }

        match self.source.fetch_token().await {
            Ok(token) => {
                self.cache.set(&token);
                info!("access_token_refreshed");
                Ok(token)
            }
            Err(e) => {
                self.metrics.record_token_fetch_failure();
                warn!(error = %e, "access_token_fetch_failed");
                Err(e)
            }
        }
    }

    pub fn cache(&self) -> &AccessTokenCache {
        &self.cache
    }
}
