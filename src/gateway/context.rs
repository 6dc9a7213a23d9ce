use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use crate::routing::{base_model, RouteHints};

/// One caller request as seen by the orchestrator.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub team_id: String,
    pub endpoint: String,
    /// Model id as requested, routing suffix included.
    pub model: String,
    pub body: Value,
    pub stream: bool,
    /// Extra pricing context merged under the usage context.
    pub pricing_options: Option<Value>,
    pub pricing_plan: Option<String>,
    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(team_id: impl Into<String>, endpoint: impl Into<String>, model: impl Into<String>, body: Value) -> Self {
        let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
        Self {
            request_id: Uuid::new_v4().to_string(),
            team_id: team_id.into(),
            endpoint: endpoint.into(),
            model: model.into(),
            body,
            stream,
            pricing_options: None,
            pricing_plan: None,
            started_at: Instant::now(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_pricing_options(mut self, options: Value) -> Self {
        self.pricing_options = Some(options);
        self
    }

    pub fn with_pricing_plan(mut self, plan: impl Into<String>) -> Self {
        self.pricing_plan = Some(plan.into());
        self
    }

    pub fn base_model(&self) -> &str {
        base_model(&self.model)
    }

    pub fn hints(&self) -> RouteHints {
        RouteHints::from_body(&self.body)
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64() * 1000.0
    }
}
