use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::gateway::bill::Bill;
use crate::pricing::PriceCard;

/// Whose credentials paid for the upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    Gateway,
    Byok,
}

/// Everything an adapter needs to run one upstream call.
#[derive(Debug, Clone)]
pub struct ExecuteArgs {
    pub request_id: String,
    pub team_id: String,
    pub endpoint: String,
    /// Base model id, without any routing suffix.
    pub model: String,
    pub provider_id: Option<String>,
    pub provider_model_slug: Option<String>,
    pub body: Value,
    pub stream: bool,
    pub byok: Option<Value>,
    pub price_card: Arc<PriceCard>,
}

/// Raw upstream answer as the adapter received it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamResponse {
    pub status: u16,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct AdapterOutput {
    /// Provider-agnostic response body.
    pub normalized: Option<Value>,
    pub upstream: UpstreamResponse,
    pub bill: Bill,
    pub key_source: Option<KeySource>,
    pub byok_key_id: Option<String>,
}

impl AdapterOutput {
    pub fn new(normalized: Value, bill: Bill) -> Self {
        Self {
            upstream: UpstreamResponse {
                status: 200,
                body: normalized.clone(),
            },
            normalized: Some(normalized),
            bill,
            key_source: None,
            byok_key_id: None,
        }
    }

    pub fn with_key_source(mut self, source: KeySource, key_id: Option<String>) -> Self {
        self.key_source = Some(source);
        self.byok_key_id = key_id;
        self
    }
}

/// Wire-protocol translation for one upstream provider.
///
/// Any error (including non-2xx upstream answers) makes the orchestrator move
/// on to the next candidate.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name used for health keys, hints and price cards.
    fn name(&self) -> &str;

    async fn execute(&self, args: ExecuteArgs) -> Result<AdapterOutput>;
}
