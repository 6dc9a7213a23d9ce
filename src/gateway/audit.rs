use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::error::GatewayError;
use crate::gateway::attempt::AttemptRecord;

/// A request that ended in a caller-visible error.
#[derive(Debug, Clone, Serialize)]
pub struct FailureEvent {
    pub request_id: String,
    pub team_id: String,
    pub endpoint: String,
    pub model: String,
    pub error: GatewayError,
    pub attempts: Vec<AttemptRecord>,
    pub elapsed_ms: f64,
}

/// Receiver of terminal request failures.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_failure(&self, event: &FailureEvent);
}

/// Writes failures to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record_failure(&self, event: &FailureEvent) {
        let attempts = event
            .attempts
            .iter()
            .map(|a| format!("{}:{}", a.provider, a.status.as_str()))
            .collect::<Vec<_>>()
            .join(",");
        warn!(
            "Request {} for team {} ({} {}) failed with {} after {:.0}ms [{}]",
            event.request_id,
            event.team_id,
            event.endpoint,
            event.model,
            event.error.error,
            event.elapsed_ms,
            attempts
        );
    }
}
