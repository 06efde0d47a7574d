//! Remote geofence evaluation call
//!
//! POST `{latitude, longitude, accuracy}` as JSON; the response carries the
//! current neighborhood, the entry flag and nearby deals. One attempt per call,
//! no retry.

use crate::domain::types::{EvaluationRequest, GeofenceEvaluationResult};
use crate::infra::config::Config;
use crate::infra::error::EvaluationError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait EvaluationClient: Send + Sync {
    async fn evaluate(
        &self,
        request: &EvaluationRequest,
    ) -> Result<GeofenceEvaluationResult, EvaluationError>;
}

pub struct HttpEvaluationClient {
    url: String,
    client: reqwest::Client,
}

impl HttpEvaluationClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, EvaluationError> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url: url.to_string(), client })
    }

    pub fn from_config(config: &Config) -> Result<Self, EvaluationError> {
        Self::new(config.evaluation_url(), config.evaluation_timeout())
    }
}

#[async_trait]
impl EvaluationClient for HttpEvaluationClient {
    async fn evaluate(
        &self,
        request: &EvaluationRequest,
    ) -> Result<GeofenceEvaluationResult, EvaluationError> {
        let response = self.client.post(&self.url).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(EvaluationError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let result: GeofenceEvaluationResult =
            serde_json::from_slice(&body).map_err(|e| EvaluationError::Decode(e.to_string()))?;

        debug!(
            neighborhood = ?result.current_neighborhood.as_ref().map(|n| n.neighborhood_id.as_str()),
            entered_new = %result.entered_new_neighborhood,
            deals = %result.deals.len(),
            "evaluation_response"
        );
        Ok(result)
    }
}
