use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::gateway::adapter::{AdapterOutput, ExecuteArgs, KeySource, UpstreamResponse};
use crate::gateway::bill::Bill;
use crate::gateway::context::RequestContext;
use crate::gateway::executor::Gateway;
use crate::health::{Admission, CallOutcome};
use crate::pricing::PriceCard;
use crate::routing::RoutedChoice;

const INPUT_TOKEN_FIELDS: &[&str] = &["prompt_tokens", "input_tokens", "input_text_tokens"];
const OUTPUT_TOKEN_FIELDS: &[&str] = &["completion_tokens", "output_tokens", "output_text_tokens"];

/// Why a candidate was passed over without calling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Blocked,
    NoPricing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed,
    Blocked,
    NoPricing,
    Cancelled,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Blocked => "blocked",
            AttemptStatus::NoPricing => "no_pricing",
            AttemptStatus::Cancelled => "cancelled",
        }
    }
}

/// Trace of one candidate in the failover loop.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub provider: String,
    pub status: AttemptStatus,
    pub probe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AttemptRecord {
    fn new(provider: &str, status: AttemptStatus) -> Self {
        Self {
            provider: provider.to_string(),
            status,
            probe: false,
            generation_ms: None,
            error: None,
        }
    }
}

/// Successful execution of a request.
#[derive(Debug, Clone)]
pub struct RequestResult {
    pub provider: String,
    pub normalized: Option<Value>,
    pub upstream: UpstreamResponse,
    pub bill: Bill,
    pub key_source: Option<KeySource>,
    pub byok_key_id: Option<String>,
    /// Time spent inside the adapter call.
    pub generation_ms: f64,
    /// Time from request start until the provider was called.
    pub latency_ms: f64,
    pub throughput_tps: f64,
    /// Every candidate visited, in order.
    pub attempts: Vec<AttemptRecord>,
    /// Whether any executed candidate had a price card.
    pub pricing_found: bool,
}

pub(crate) enum AttemptOutcome {
    Success(Box<RequestResult>),
    Failed(Error),
    Skipped(SkipReason),
    Cancelled,
}

fn token_count(usage: &Value, fields: &[&str]) -> u64 {
    fields
        .iter()
        .find_map(|f| usage.get(*f).filter(|v| !v.is_null()))
        .and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|n| n.is_finite() && *n > 0.0)
        .map_or(0, |n| n as u64)
}

/// Input and output token counts from the normalized usage, else the bill usage.
fn usage_tokens(output: &AdapterOutput) -> (u64, u64) {
    let usage = output
        .normalized
        .as_ref()
        .and_then(|n| n.get("usage"))
        .or(output.bill.usage.as_ref())
        .cloned()
        .unwrap_or(Value::Null);
    (token_count(&usage, INPUT_TOKEN_FIELDS), token_count(&usage, OUTPUT_TOKEN_FIELDS))
}

fn attach_meta(normalized: &mut Value, meta: Value) {
    let Value::Object(body) = normalized else {
        return;
    };
    let entry = body.entry("meta").or_insert_with(|| json!({}));
    match (entry, meta) {
        (Value::Object(existing), Value::Object(extra)) => existing.extend(extra),
        (slot, meta) => *slot = meta,
    }
}

impl Gateway {
    /// Admission, pricing check, adapter call and health bookkeeping for
    /// one ranked candidate.
    pub(crate) async fn attempt_provider(
        &self,
        choice: &mut RoutedChoice,
        ctx: &RequestContext,
        cancel: &CancellationToken,
    ) -> (AttemptOutcome, AttemptRecord) {
        let adapter = choice.candidate.adapter.clone();
        let provider = adapter.name().to_string();
        let base = ctx.base_model().to_string();
        let endpoint = ctx.endpoint.as_str();

        let admission = match self
            .monitor
            .admit(endpoint, &provider, &base, &ctx.team_id, &ctx.request_id, Some(&choice.health))
            .await
        {
            Ok(admission) => admission,
            Err(e) => {
                warn!("Breaker admission for {} failed, admitting: {}", provider, e);
                Admission::Closed
            }
        };
        if admission == Admission::Blocked {
            debug!("Skipping {} for request {}: breaker blocked", provider, ctx.request_id);
            return (
                AttemptOutcome::Skipped(SkipReason::Blocked),
                AttemptRecord::new(&provider, AttemptStatus::Blocked),
            );
        }
        let is_probe = admission == Admission::Probe;

        let Some(card) = self.ensure_price_card(choice, &base, endpoint).await else {
            info!("Skipping {} for request {}: no price card for {} on {}", provider, ctx.request_id, base, endpoint);
            return (
                AttemptOutcome::Skipped(SkipReason::NoPricing),
                AttemptRecord::new(&provider, AttemptStatus::NoPricing),
            );
        };

        if let Err(e) = self.monitor.on_call_start(endpoint, &provider, &base).await {
            warn!("Failed to record call start for {}: {}", provider, e);
        }

        let args = ExecuteArgs {
            request_id: ctx.request_id.clone(),
            team_id: ctx.team_id.clone(),
            endpoint: ctx.endpoint.clone(),
            model: base.clone(),
            provider_id: choice.candidate.provider_id.clone(),
            provider_model_slug: choice.candidate.provider_model_slug.clone(),
            body: ctx.body.clone(),
            stream: ctx.stream,
            byok: choice.candidate.byok.clone(),
            price_card: card.clone(),
        };

        let started = Instant::now();
        let result = self.call_adapter(adapter.execute(args), cancel).await;
        let generation_ms = started.elapsed().as_secs_f64() * 1000.0;
        let end_to_end_ms = ctx.elapsed_ms();

        let mut record = AttemptRecord::new(&provider, AttemptStatus::Success);
        record.probe = is_probe;
        record.generation_ms = Some(generation_ms);

        match result {
            Ok(mut output) => {
                let (tokens_in, tokens_out) = usage_tokens(&output);
                let throughput_tps = if generation_ms > 0.0 {
                    (tokens_in + tokens_out) as f64 / (generation_ms / 1000.0)
                } else {
                    0.0
                };
                let latency_ms = (end_to_end_ms - generation_ms).max(0.0);

                if let Some(normalized) = output.normalized.as_mut() {
                    attach_meta(
                        normalized,
                        json!({
                            "throughput_tps": throughput_tps,
                            "generation_ms": generation_ms.round(),
                            "latency_ms": latency_ms.round(),
                            "finish_reason": output.bill.finish_reason,
                        }),
                    );
                }

                let outcome = CallOutcome::success(&provider, &base, end_to_end_ms).with_generation(
                    generation_ms,
                    tokens_in,
                    tokens_out,
                );
                self.finish_call(endpoint, &outcome, is_probe).await;

                let plan = ctx.pricing_plan.as_deref().unwrap_or(&self.settings.default_plan);
                if let Err(e) = output.bill.price(&card, ctx.pricing_options.as_ref(), plan) {
                    error!("Pricing request {} on {} failed, bill left unpriced: {}", ctx.request_id, provider, e);
                }

                info!(
                    "Request {} served by {} in {:.0}ms ({:.0}ms generation, {:.1} tok/s)",
                    ctx.request_id, provider, end_to_end_ms, generation_ms, throughput_tps
                );

                let result = RequestResult {
                    provider: provider.clone(),
                    normalized: output.normalized,
                    upstream: output.upstream,
                    bill: output.bill,
                    key_source: output.key_source,
                    byok_key_id: output.byok_key_id,
                    generation_ms,
                    latency_ms,
                    throughput_tps,
                    attempts: Vec::new(),
                    pricing_found: true,
                };
                (AttemptOutcome::Success(Box::new(result)), record)
            }
            Err(e) => {
                let outcome = CallOutcome::failure(&provider, &base, end_to_end_ms).with_generation(generation_ms, 0, 0);
                record.error = Some(e.to_string());

                if e.is_cancelled() {
                    // An aborted call says nothing about the provider.
                    if let Err(err) = self.monitor.on_call_end(endpoint, &outcome).await {
                        warn!("Failed to record call end for {}: {}", provider, err);
                    }
                    info!("Request {} cancelled while {} was running", ctx.request_id, provider);
                    record.status = AttemptStatus::Cancelled;
                    return (AttemptOutcome::Cancelled, record);
                }

                warn!("Provider {} failed request {}: {}", provider, ctx.request_id, e);
                self.finish_call(endpoint, &outcome, is_probe).await;
                record.status = AttemptStatus::Failed;
                (AttemptOutcome::Failed(e), record)
            }
        }
    }

    /// Cached card of the candidate, else one from the catalog.
    async fn ensure_price_card(&self, choice: &mut RoutedChoice, base: &str, endpoint: &str) -> Option<Arc<PriceCard>> {
        if let Some(card) = &choice.candidate.price_card {
            return Some(card.clone());
        }
        let provider = choice.candidate.name().to_string();
        match self.catalog.load_price_card(&provider, base, endpoint).await {
            Ok(Some(card)) => {
                choice.candidate.price_card = Some(card.clone());
                Some(card)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Loading price card for {} / {} / {} failed: {}", provider, base, endpoint, e);
                None
            }
        }
    }

    async fn call_adapter<F>(&self, call: F, cancel: &CancellationToken) -> Result<AdapterOutput>
    where
        F: std::future::Future<Output = Result<AdapterOutput>>,
    {
        let bounded = async {
            match self.settings.attempt_timeout_ms {
                Some(ms) => tokio::time::timeout(Duration::from_millis(ms), call)
                    .await
                    .unwrap_or_else(|_| Err(Error::Timeout(ms))),
                None => call.await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = bounded => result,
        }
    }

    /// Health update plus probe report or opening check.
    async fn finish_call(&self, endpoint: &str, outcome: &CallOutcome, is_probe: bool) {
        let provider = outcome.provider.as_str();
        let model = outcome.model.as_str();
        if let Err(e) = self.monitor.on_call_end(endpoint, outcome).await {
            warn!("Failed to record call end for {}: {}", provider, e);
        }
        let checked = if is_probe {
            self.monitor.report_probe_result(endpoint, provider, model, outcome.ok).await
        } else {
            self.monitor
                .maybe_open_on_recent_errors(endpoint, provider, model)
                .await
                .map(|_| ())
        };
        if let Err(e) = checked {
            warn!("Breaker update for {} failed: {}", provider, e);
        }
    }
}
