use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Does the actual work behind a paid feature. Implementations never touch
/// balances; charging and refunds are the gate's job.
#[async_trait]
pub trait FeatureHandler: Send + Sync {
    async fn handle(&self, feature_id: &str, user_id: &str, params: Value) -> anyhow::Result<Value>;
}

/// Forwards the request to `{base_url}/{feature_id}` on the worker service.
pub struct UpstreamFeatureHandler {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamFeatureHandler {
    pub fn new(base_url: &str, timeout: Option<Duration>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build().context("Failed to build HTTP client")?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FeatureHandler for UpstreamFeatureHandler {
    async fn handle(&self, feature_id: &str, user_id: &str, params: Value) -> anyhow::Result<Value> {
        let url = format!("{}/{}", self.base_url, feature_id);
        tracing::debug!(%url, user_id, "Forwarding feature request");

        let response = self
            .client
            .post(&url)
            .json(&json!({ "userId": user_id, "params": params }))
            .send()
            .await
            .with_context(|| format!("Feature service unreachable for {}", feature_id))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("Feature service returned {} for {}", status, feature_id));
        }

        response
            .json::<Value>()
            .await
            .context("Feature service returned an invalid body")
    }
}

/// Used when no worker service is configured. Every call fails, so the gate
/// refunds it.
pub struct UnavailableFeatureHandler;

#[async_trait]
impl FeatureHandler for UnavailableFeatureHandler {
    async fn handle(&self, feature_id: &str, _user_id: &str, _params: Value) -> anyhow::Result<Value> {
        Err(anyhow!("Feature {} is not available", feature_id))
    }
}
