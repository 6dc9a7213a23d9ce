use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ErrorCode, GatewayError};
use crate::gateway::attempt::{AttemptOutcome, AttemptRecord, RequestResult};
use crate::gateway::audit::{AuditSink, FailureEvent, TracingAuditSink};
use crate::gateway::context::RequestContext;
use crate::health::HealthMonitor;
use crate::pricing::{PriceCatalog, DEFAULT_PRICING_PLAN};
use crate::routing::{RoutedChoice, Router, RoutingCandidate};

/// Failover loop settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSettings {
    /// Upper bound on ranked candidates visited per request.
    pub max_tries: usize,
    pub attempt_timeout_ms: Option<u64>,
    pub default_plan: String,
    /// Seed for routing randomness; entropy when unset.
    pub seed: Option<u64>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            max_tries: 5,
            attempt_timeout_ms: None,
            default_plan: DEFAULT_PRICING_PLAN.to_string(),
            seed: None,
        }
    }
}

/// Drives routing, breaker admission, pricing checks and provider calls
/// for each request.
pub struct Gateway {
    pub(super) monitor: Arc<HealthMonitor>,
    pub(super) router: Router,
    pub(super) catalog: Arc<dyn PriceCatalog>,
    pub(super) audit: Arc<dyn AuditSink>,
    pub(super) settings: ExecutionSettings,
    rng: Mutex<StdRng>,
}

impl Gateway {
    pub fn new(
        monitor: Arc<HealthMonitor>,
        router: Router,
        catalog: Arc<dyn PriceCatalog>,
        settings: ExecutionSettings,
    ) -> Self {
        let rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        info!(
            "Creating gateway (max tries {}, attempt timeout {:?}ms, plan {})",
            settings.max_tries, settings.attempt_timeout_ms, settings.default_plan
        );
        Self {
            monitor,
            router,
            catalog,
            audit: Arc::new(TracingAuditSink),
            settings,
            rng: Mutex::new(rng),
        }
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    /// Per-request generator so no lock is held across an await.
    fn request_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.rng.lock().gen())
    }

    /// Serve `ctx` from the first ranked candidate that succeeds.
    ///
    /// Blocked and unpriced candidates are skipped silently. Only running out
    /// of candidates, or `cancel` firing, produces an error.
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        candidates: &[RoutingCandidate],
        cancel: &CancellationToken,
    ) -> std::result::Result<RequestResult, GatewayError> {
        if candidates.is_empty() {
            return Err(self.fail(ctx, ErrorCode::UnsupportedModelOrEndpoint, None, Vec::new()).await);
        }

        let mut rng = self.request_rng();
        let ranked = self
            .router
            .route(candidates, &ctx.endpoint, &ctx.model, &ctx.hints(), &mut rng)
            .await;
        self.run_ranked(ctx, ranked, cancel).await
    }

    /// Walk `ranked` until a candidate succeeds or `max_tries` are used up.
    pub(crate) async fn run_ranked(
        &self,
        ctx: &RequestContext,
        mut ranked: Vec<RoutedChoice>,
        cancel: &CancellationToken,
    ) -> std::result::Result<RequestResult, GatewayError> {
        let max_tries = self.settings.max_tries.min(ranked.len());
        debug!(
            "Request {} has {} ranked candidates, trying up to {}",
            ctx.request_id,
            ranked.len(),
            max_tries
        );

        let mut attempts: Vec<AttemptRecord> = Vec::with_capacity(max_tries);
        let mut pricing_found = false;

        for choice in ranked.iter_mut().take(max_tries) {
            if cancel.is_cancelled() {
                return Err(self.fail(ctx, ErrorCode::ClientClosedRequest, None, attempts).await);
            }

            let (outcome, record) = self.attempt_provider(choice, ctx, cancel).await;
            attempts.push(record);

            match outcome {
                AttemptOutcome::Success(mut result) => {
                    result.attempts = attempts;
                    result.pricing_found = true;
                    return Ok(*result);
                }
                AttemptOutcome::Skipped(reason) => {
                    debug!("Candidate {} skipped: {:?}", choice.candidate.name(), reason);
                }
                AttemptOutcome::Failed(_) => pricing_found = true,
                AttemptOutcome::Cancelled => {
                    return Err(self.fail(ctx, ErrorCode::ClientClosedRequest, None, attempts).await);
                }
            }
        }

        if !pricing_found {
            return Err(self
                .fail(ctx, ErrorCode::PricingNotConfigured, Some("no_provider_pricing"), attempts)
                .await);
        }
        Err(self
            .fail(ctx, ErrorCode::UpstreamError, Some("all_candidates_failed"), attempts)
            .await)
    }

    async fn fail(
        &self,
        ctx: &RequestContext,
        code: ErrorCode,
        reason: Option<&str>,
        attempts: Vec<AttemptRecord>,
    ) -> GatewayError {
        let mut error = GatewayError::new(code, &ctx.request_id)
            .with_model(&ctx.model)
            .with_endpoint(&ctx.endpoint);
        if let Some(reason) = reason {
            error = error.with_reason(reason);
        }
        warn!(
            "Request {} failed: {} ({} attempts)",
            ctx.request_id,
            code,
            attempts.len()
        );

        let event = FailureEvent {
            request_id: ctx.request_id.clone(),
            team_id: ctx.team_id.clone(),
            endpoint: ctx.endpoint.clone(),
            model: ctx.model.clone(),
            error: error.clone(),
            attempts,
            elapsed_ms: ctx.elapsed_ms(),
        };
        self.audit.record_failure(&event).await;
        error
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::gateway::adapter::testing::{Script, ScriptedAdapter};
    use crate::gateway::adapter::ProviderAdapter;
    use crate::gateway::attempt::AttemptStatus;
    use crate::gateway::audit::testing::RecordingAuditSink;
    use crate::health::{BreakerState, HealthSettings, ManualClock, MemoryHealthStore, ProviderHealth, ProviderTunables};
    use crate::pricing::{Condition, ConditionOp, PriceCard, PriceRule, StaticPriceCatalog};
    use crate::routing::PresetTable;

    const NOW: i64 = 1_700_000_000_000;
    const ENDPOINT: &str = "chat.completions";
    const MODEL: &str = "gpt-4o";

    struct Harness {
        monitor: Arc<HealthMonitor>,
        catalog: Arc<StaticPriceCatalog>,
        audit: Arc<RecordingAuditSink>,
        settings: ExecutionSettings,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(NOW));
            let store = Arc::new(MemoryHealthStore::new(clock.clone()));
            Self {
                monitor: Arc::new(HealthMonitor::new(store, clock, HealthSettings::default())),
                catalog: Arc::new(StaticPriceCatalog::new()),
                audit: Arc::new(RecordingAuditSink::default()),
                settings: ExecutionSettings {
                    seed: Some(11),
                    ..Default::default()
                },
            }
        }

        fn price(&self, provider: &str) {
            self.catalog
                .insert(
                    PriceCard::new(provider, MODEL, ENDPOINT)
                        .with_rule(PriceRule::new("input_text_tokens", 1, "0.0000025"))
                        .with_rule(PriceRule::new("output_text_tokens", 1, "0.00001")),
                )
                .unwrap();
        }

        async fn open_breaker(&self, provider: &str) {
            let mut h = ProviderHealth::new(ENDPOINT, provider, MODEL, 800.0, ProviderTunables::default());
            h.breaker_state = BreakerState::Open;
            h.breaker_until_ms = NOW + 60_000;
            self.monitor.restore(&h).await.unwrap();
        }

        fn gateway(&self) -> Gateway {
            let router = Router::new(self.monitor.clone(), PresetTable::default());
            Gateway::new(self.monitor.clone(), router, self.catalog.clone(), self.settings.clone())
                .with_audit_sink(self.audit.clone())
        }
    }

    fn ctx(model: &str) -> RequestContext {
        RequestContext::new("team-1", ENDPOINT, model, json!({ "messages": [] })).with_request_id("req-1")
    }

    fn candidate(adapter: Arc<ScriptedAdapter>) -> RoutingCandidate {
        RoutingCandidate::new(adapter as Arc<dyn ProviderAdapter>)
    }

    fn statuses(attempts: &[AttemptRecord]) -> Vec<(String, AttemptStatus)> {
        attempts.iter().map(|a| (a.provider.clone(), a.status)).collect()
    }

    #[tokio::test]
    async fn test_blocked_then_unpriced_then_success() {
        let h = Harness::new();
        h.open_breaker("blocked").await;
        h.price("blocked");
        h.price("winner");

        let blocked = Arc::new(ScriptedAdapter::succeeding("blocked"));
        let unpriced = Arc::new(ScriptedAdapter::succeeding("unpriced"));
        let winner = Arc::new(ScriptedAdapter::succeeding("winner"));

        let mut ranked = Vec::new();
        for adapter in [&blocked, &unpriced, &winner] {
            let name = adapter.name().to_string();
            ranked.push(RoutedChoice {
                candidate: candidate(adapter.clone()),
                score: 1.0,
                health: h.monitor.read(ENDPOINT, &name, MODEL).await.unwrap(),
            });
        }

        let result = h
            .gateway()
            .run_ranked(&ctx(MODEL), ranked, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.provider, "winner");
        assert!(result.pricing_found);
        assert_eq!(
            statuses(&result.attempts),
            vec![
                ("blocked".to_string(), AttemptStatus::Blocked),
                ("unpriced".to_string(), AttemptStatus::NoPricing),
                ("winner".to_string(), AttemptStatus::Success),
            ]
        );
        assert_eq!(blocked.call_count(), 0);
        assert_eq!(unpriced.call_count(), 0);
        assert_eq!(winner.call_count(), 1);
    }

    #[tokio::test]
    async fn test_routing_drops_open_breakers() {
        let h = Harness::new();
        h.open_breaker("down").await;
        h.price("down");
        h.price("up");
        let down = Arc::new(ScriptedAdapter::succeeding("down"));
        let up = Arc::new(ScriptedAdapter::succeeding("up"));

        let result = h
            .gateway()
            .execute(&ctx("gpt-4o:fast"), &[candidate(down.clone()), candidate(up)], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.provider, "up");
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(down.call_count(), 0);
    }

    #[tokio::test]
    async fn test_success_is_priced_and_annotated() {
        let h = Harness::new();
        h.price("openai");
        let gateway = h.gateway();
        let adapter = Arc::new(ScriptedAdapter::succeeding("openai"));

        let result = gateway
            .execute(&ctx(MODEL), &[candidate(adapter)], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.provider, "openai");
        assert!(result.pricing_found);
        assert_eq!(result.bill.cost_cents, 1);
        assert_eq!(result.bill.pricing.as_ref().unwrap().cost_nanos, 7_500_000);
        assert_eq!(result.bill.usage.as_ref().unwrap()["pricing"]["total_cents"], json!(0));

        let meta = &result.normalized.as_ref().unwrap()["meta"];
        assert_eq!(meta["finish_reason"], json!("stop"));
        assert!(meta["throughput_tps"].is_number());
        assert!(meta["generation_ms"].is_number());

        let health = h.monitor.read(ENDPOINT, "openai", MODEL).await.unwrap();
        assert_eq!(health.inflight, 0);
        assert!(health.call_rate_60s > 0.0);
        assert!(h.audit.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_request_plan_and_options_drive_pricing() {
        let h = Harness::new();
        h.catalog
            .insert(
                PriceCard::new("openai", MODEL, ENDPOINT)
                    .with_rule(PriceRule::new("input_text_tokens", 1, "0.0000025"))
                    .with_rule(
                        PriceRule::new("input_text_tokens", 1, "0.000001")
                            .with_plan("enterprise")
                            .with_condition(Condition::new("region", ConditionOp::Eq, json!("eu"))),
                    )
                    .with_rule(PriceRule::new("output_text_tokens", 1, "0.000002").with_plan("enterprise")),
            )
            .unwrap();
        let adapter = Arc::new(ScriptedAdapter::succeeding("openai"));

        let request = ctx(MODEL)
            .with_pricing_plan("enterprise")
            .with_pricing_options(json!({ "region": "eu" }));
        let result = h
            .gateway()
            .execute(&request, &[candidate(adapter)], &CancellationToken::new())
            .await
            .unwrap();

        let pricing = result.bill.pricing.as_ref().unwrap();
        assert_eq!(pricing.cost_nanos, 2_000_000);
        assert_eq!(pricing.lines.len(), 2);
    }

    #[tokio::test]
    async fn test_candidate_slug_and_byok_reach_the_adapter() {
        let h = Harness::new();
        h.price("openai");
        let adapter = Arc::new(ScriptedAdapter::succeeding("openai"));
        let pool = [RoutingCandidate::new(adapter.clone() as Arc<dyn ProviderAdapter>)
            .with_model_slug("gpt-4o-2024-08-06")
            .with_byok(json!({ "key_id": "k-1" }))];

        let result = h
            .gateway()
            .execute(&ctx("gpt-4o:fast"), &pool, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.provider, "openai");

        let args = adapter.last_args.lock().clone().unwrap();
        assert_eq!(args.model, MODEL);
        assert_eq!(args.provider_model_slug.as_deref(), Some("gpt-4o-2024-08-06"));
        assert_eq!(args.byok, Some(json!({ "key_id": "k-1" })));
        assert_eq!(args.price_card.provider, "openai");
    }

    #[tokio::test]
    async fn test_failover_to_next_candidate() {
        let h = Harness::new();
        h.price("bad");
        h.price("good");
        let bad = Arc::new(ScriptedAdapter::new("bad", Script::UpstreamStatus(503)));
        let good = Arc::new(ScriptedAdapter::succeeding("good"));
        let gateway = h.gateway();

        // Whatever the sampled order, the request ends on "good".
        let result = gateway
            .execute(&ctx(MODEL), &[candidate(bad.clone()), candidate(good)], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.provider, "good");
        if bad.call_count() == 1 {
            assert_eq!(result.attempts[0].status, AttemptStatus::Failed);
            let health = h.monitor.read(ENDPOINT, "bad", MODEL).await.unwrap();
            assert!(health.error_ewma_10s > 0.0);
        }
    }

    #[tokio::test]
    async fn test_no_candidates_is_unsupported() {
        let h = Harness::new();
        let err = h
            .gateway()
            .execute(&ctx(MODEL), &[], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error, ErrorCode::UnsupportedModelOrEndpoint);
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.model.as_deref(), Some(MODEL));
        assert_eq!(h.audit.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_no_pricing_anywhere() {
        let h = Harness::new();
        let a = Arc::new(ScriptedAdapter::succeeding("a"));
        let b = Arc::new(ScriptedAdapter::succeeding("b"));
        let err = h
            .gateway()
            .execute(&ctx(MODEL), &[candidate(a.clone()), candidate(b.clone())], &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.error, ErrorCode::PricingNotConfigured);
        assert_eq!(err.reason.as_deref(), Some("no_provider_pricing"));
        assert_eq!(a.call_count() + b.call_count(), 0);

        let events = h.audit.events.lock();
        assert_eq!(events[0].attempts.len(), 2);
        assert!(events[0].attempts.iter().all(|a| a.status == AttemptStatus::NoPricing));
    }

    #[tokio::test]
    async fn test_all_candidates_fail() {
        let h = Harness::new();
        h.price("a");
        h.price("b");
        let err = h
            .gateway()
            .execute(
                &ctx(MODEL),
                &[
                    candidate(Arc::new(ScriptedAdapter::failing("a"))),
                    candidate(Arc::new(ScriptedAdapter::failing("b"))),
                ],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error, ErrorCode::UpstreamError);
        assert_eq!(err.reason.as_deref(), Some("all_candidates_failed"));
        assert_eq!(err.status_code(), 502);
    }

    #[tokio::test]
    async fn test_max_tries_caps_the_loop() {
        let mut h = Harness::new();
        h.settings.max_tries = 2;
        let adapters: Vec<Arc<ScriptedAdapter>> = (0..4)
            .map(|i| {
                let name = format!("p{}", i);
                h.price(&name);
                Arc::new(ScriptedAdapter::failing(&name))
            })
            .collect();
        let candidates: Vec<RoutingCandidate> = adapters.iter().cloned().map(candidate).collect();

        let err = h
            .gateway()
            .execute(&ctx(MODEL), &candidates, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error, ErrorCode::UpstreamError);
        assert_eq!(adapters.iter().map(|a| a.call_count()).sum::<usize>(), 2);
    }

    #[tokio::test]
    async fn test_attempt_timeout_counts_as_failure() {
        let mut h = Harness::new();
        h.settings.attempt_timeout_ms = Some(20);
        h.price("slow");
        let slow = Arc::new(ScriptedAdapter::succeeding("slow").with_delay(Duration::from_millis(500)));

        let err = h
            .gateway()
            .execute(&ctx(MODEL), &[candidate(slow)], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.error, ErrorCode::UpstreamError);

        let events = h.audit.events.lock();
        let error = events[0].attempts[0].error.clone().unwrap();
        assert!(error.contains("timed out"), "{}", error);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_and_still_records_call_end() {
        let h = Harness::new();
        h.price("hang");
        let hang = Arc::new(ScriptedAdapter::new("hang", Script::Hang));
        let gateway = Arc::new(h.gateway());
        let cancel = CancellationToken::new();

        let task = {
            let gateway = gateway.clone();
            let cancel = cancel.clone();
            let candidates = vec![candidate(hang.clone())];
            tokio::spawn(async move { gateway.execute(&ctx(MODEL), &candidates, &cancel).await })
        };

        while hang.call_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.error, ErrorCode::ClientClosedRequest);
        assert_eq!(err.status_code(), 499);

        let health = h.monitor.read(ENDPOINT, "hang", MODEL).await.unwrap();
        assert_eq!(health.inflight, 0);
        assert_eq!(health.breaker_state, BreakerState::Closed);
        assert_eq!(h.audit.events.lock()[0].attempts[0].status, AttemptStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = Harness::new();
        h.price("a");
        let a = Arc::new(ScriptedAdapter::succeeding("a"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .gateway()
            .execute(&ctx(MODEL), &[candidate(a.clone())], &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.error, ErrorCode::ClientClosedRequest);
        assert_eq!(a.call_count(), 0);
    }

    #[tokio::test]
    async fn test_repeated_failures_open_the_breaker() {
        let h = Harness::new();
        h.price("flaky");
        let gateway = h.gateway();
        let flaky = Arc::new(ScriptedAdapter::failing("flaky"));

        for i in 0..10 {
            let request = ctx(MODEL).with_request_id(format!("req-{}", i));
            let _ = gateway
                .execute(&request, &[candidate(flaky.clone())], &CancellationToken::new())
                .await;
        }

        let health = h.monitor.read(ENDPOINT, "flaky", MODEL).await.unwrap();
        assert_eq!(health.breaker_state, BreakerState::Open);
        // Once open, further requests are skipped without calling the adapter.
        assert!(flaky.call_count() < 10);
    }
}
