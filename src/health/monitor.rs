use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::health::clock::Clock;
use crate::health::ewma::{self, TAU_10S_MS, TAU_300S_MS, TAU_60S_MS};
use crate::health::record::{self, fields, ProviderHealth, ProviderTunables};
use crate::health::store::HealthStore;

/// Breaker and estimator settings shared by every provider.
#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub default_tunables: ProviderTunables,
    pub provider_tunables: HashMap<String, ProviderTunables>,
    pub half_open_probe_ratio: f64,
    pub half_open_ttl_secs: u64,
    pub half_open_min_probes: u32,
    pub open_min_total_floor: f64,
    pub open_min_total_frac: f64,
    pub default_latency_ms: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            default_tunables: ProviderTunables::default(),
            provider_tunables: HashMap::new(),
            half_open_probe_ratio: 0.05,
            half_open_ttl_secs: 20,
            half_open_min_probes: 5,
            open_min_total_floor: 8.0,
            open_min_total_frac: 0.10,
            default_latency_ms: 800.0,
        }
    }
}

impl HealthSettings {
    /// Configured tunables for `provider`, before any value stored in the hash.
    pub fn tunables_for(&self, provider: &str) -> ProviderTunables {
        self.provider_tunables
            .get(provider)
            .copied()
            .unwrap_or(self.default_tunables)
    }
}

/// What happened on one finished provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub provider: String,
    pub model: String,
    pub ok: bool,
    /// End-to-end latency observed by the gateway.
    pub latency_ms: f64,
    /// Time spent inside the provider call.
    pub generation_ms: Option<f64>,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl CallOutcome {
    pub fn success(provider: &str, model: &str, latency_ms: f64) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            ok: true,
            latency_ms,
            generation_ms: None,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    pub fn failure(provider: &str, model: &str, latency_ms: f64) -> Self {
        Self {
            ok: false,
            ..Self::success(provider, model, latency_ms)
        }
    }

    pub fn with_generation(mut self, generation_ms: f64, tokens_in: u64, tokens_out: u64) -> Self {
        self.generation_ms = Some(generation_ms);
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }
}

/// Health bookkeeping and circuit breaking on top of a [`HealthStore`].
///
/// Updates follow read-compute-write and may race with other gateway
/// instances; only `inflight` uses an atomic increment.
pub struct HealthMonitor {
    pub(crate) store: Arc<dyn HealthStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: HealthSettings,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn HealthStore>, clock: Arc<dyn Clock>, settings: HealthSettings) -> Self {
        info!(
            "Creating health monitor (probe ratio {}, min probes {}, volume floor {})",
            settings.half_open_probe_ratio, settings.half_open_min_probes, settings.open_min_total_floor
        );
        Self { store, clock, settings }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn health_key(endpoint: &str, model: &str) -> String {
        format!("health:{}:{}", endpoint, model)
    }

    pub(crate) fn half_open_key(endpoint: &str, model: &str, provider: &str) -> String {
        format!("health:half:{}:{}:{}", endpoint, model, provider)
    }

    pub(crate) async fn load_state_map(&self, endpoint: &str, model: &str) -> Result<HashMap<String, String>> {
        self.store.hash_get_all(&Self::health_key(endpoint, model)).await
    }

    pub(crate) fn snapshot(&self, endpoint: &str, provider: &str, model: &str, map: &HashMap<String, String>) -> ProviderHealth {
        ProviderHealth::from_fields(
            endpoint,
            provider,
            model,
            map,
            self.settings.default_latency_ms,
            self.settings.tunables_for(provider),
        )
    }

    pub async fn read(&self, endpoint: &str, provider: &str, model: &str) -> Result<ProviderHealth> {
        let map = self.load_state_map(endpoint, model).await?;
        Ok(self.snapshot(endpoint, provider, model, &map))
    }

    /// One store read for every provider of an (endpoint, model).
    pub async fn read_many(&self, endpoint: &str, model: &str, providers: &[String]) -> Result<HashMap<String, ProviderHealth>> {
        if providers.is_empty() {
            return Ok(HashMap::new());
        }
        let map = self.load_state_map(endpoint, model).await?;
        Ok(providers
            .iter()
            .map(|p| (p.clone(), self.snapshot(endpoint, p, model, &map)))
            .collect())
    }

    /// Overwrite the whole record of one provider.
    pub async fn restore(&self, health: &ProviderHealth) -> Result<()> {
        debug!("Restoring health record for {} ({} / {})", health.provider, health.endpoint, health.model);
        self.store
            .hash_set(&Self::health_key(&health.endpoint, &health.model), health.to_fields())
            .await
    }

    /// Persist provider tunables into the shared hash so every instance sees them.
    pub async fn set_tunables(&self, endpoint: &str, model: &str, provider: &str, tunables: ProviderTunables) -> Result<()> {
        info!("Setting breaker tunables for {} on {} / {}: {:?}", provider, endpoint, model, tunables);
        self.store
            .hash_set(&Self::health_key(endpoint, model), record::tunable_fields(provider, &tunables))
            .await
    }

    pub async fn on_call_start(&self, endpoint: &str, provider: &str, model: &str) -> Result<()> {
        let key = Self::health_key(endpoint, model);
        let inflight = self
            .store
            .hash_incr_by(&key, &record::field(provider, fields::INFLIGHT), 1)
            .await?;
        let map = self.store.hash_get_all(&key).await?;
        let soft_cap = self.snapshot(endpoint, provider, model, &map).tunables.load_soft_cap;
        let load = load_fraction(inflight, soft_cap);
        self.store
            .hash_set(&key, vec![(record::field(provider, fields::CURRENT_LOAD), load.to_string())])
            .await?;
        debug!("Call start {} on {} / {}: inflight={} load={:.4}", provider, endpoint, model, inflight, load);
        Ok(())
    }

    pub async fn on_call_end(&self, endpoint: &str, outcome: &CallOutcome) -> Result<()> {
        let provider = outcome.provider.as_str();
        let model = outcome.model.as_str();
        let key = Self::health_key(endpoint, model);
        let map = self.store.hash_get_all(&key).await?;
        let prev = self.snapshot(endpoint, provider, model, &map);
        let now = self.clock.now_ms();

        let mut next = apply_outcome(&prev, outcome, now);

        let inflight = self
            .store
            .hash_incr_by(&key, &record::field(provider, fields::INFLIGHT), -1)
            .await?;
        if inflight < 0 {
            // A start was lost (e.g. store flushed mid-call); never go negative.
            self.store
                .hash_set(&key, vec![(record::field(provider, fields::INFLIGHT), "0".to_string())])
                .await?;
        }
        next.inflight = inflight.max(0);
        next.current_load = load_fraction(next.inflight, next.tunables.load_soft_cap);

        debug!(
            "Call end {} on {} / {}: ok={} latency={}ms lat10={:.1} err10={:.3} rate60={:.3}",
            provider, endpoint, model, outcome.ok, outcome.latency_ms, next.latency_ewma_10s, next.error_ewma_10s, next.call_rate_60s
        );

        let fields: Vec<(String, String)> = next
            .to_fields()
            .into_iter()
            .filter(|(name, _)| !is_breaker_field(provider, name))
            .collect();
        self.store.hash_set(&key, fields).await
    }
}

fn is_breaker_field(provider: &str, name: &str) -> bool {
    // Breaker state is owned by the breaker transitions, and inflight by the
    // atomic counter; a stale read must not clobber either.
    [fields::BREAKER, fields::BREAKER_UNTIL_MS, fields::BREAKER_ATTEMPTS, fields::INFLIGHT]
        .iter()
        .any(|metric| record::field(provider, metric) == name)
}

pub(crate) fn load_fraction(inflight: i64, soft_cap: f64) -> f64 {
    (inflight.max(0) as f64 / soft_cap.max(1.0)).min(1.0)
}

/// Fold one finished call into the estimators of `prev`.
pub(crate) fn apply_outcome(prev: &ProviderHealth, outcome: &CallOutcome, now: i64) -> ProviderHealth {
    let d10 = ewma::decay_factor(now, prev.last_ts_10s, TAU_10S_MS);
    let d60 = ewma::decay_factor(now, prev.last_ts_60s, TAU_60S_MS);
    let d300 = ewma::decay_factor(now, prev.last_ts_300s, TAU_300S_MS);

    let latency = outcome.latency_ms.max(0.0);
    let err_sample = if outcome.ok { 0.0 } else { 1.0 };
    let ok_sample = if outcome.ok { 1.0 } else { 0.0 };

    let mut next = prev.clone();
    next.latency_ewma_10s = ewma::blend(prev.latency_ewma_10s, latency, d10);
    next.latency_ewma_60s = ewma::blend(prev.latency_ewma_60s, latency, d60);
    next.latency_ewma_300s = ewma::blend(prev.latency_ewma_300s, latency, d300);

    next.error_ewma_10s = ewma::blend(prev.error_ewma_10s, err_sample, d10);
    next.error_ewma_60s = ewma::blend(prev.error_ewma_60s, err_sample, d60);
    next.error_ewma_300s = ewma::blend(prev.error_ewma_300s, err_sample, d300);

    next.call_rate_10s = ewma::accumulate(prev.call_rate_10s, ewma::rate_increment(TAU_10S_MS), d10);
    next.call_rate_60s = ewma::accumulate(prev.call_rate_60s, ewma::rate_increment(TAU_60S_MS), d60);

    let tokens = outcome.tokens_in + outcome.tokens_out;
    if let Some(generation_ms) = outcome.generation_ms.filter(|g| *g > 0.0) {
        if tokens > 0 {
            let tps = tokens as f64 / (generation_ms / 1000.0).max(0.001);
            next.throughput_ewma_60s = ewma::blend(prev.throughput_ewma_60s, tps, d60);
        }
    }

    next.recent_ok_ewma_60s = ewma::accumulate(prev.recent_ok_ewma_60s, ok_sample, d60);
    next.recent_total_ewma_60s = ewma::accumulate(prev.recent_total_ewma_60s, 1.0, d60);

    next.last_ts_10s = now;
    next.last_ts_60s = now;
    next.last_ts_300s = now;
    next.last_updated_ms = now;
    next
}
