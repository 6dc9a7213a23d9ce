use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Circuit breaker state of one provider for one (endpoint, model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    /// Unknown or missing values decode as `Closed`.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("open") => BreakerState::Open,
            Some("half_open") => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// Per-provider breaker/load tunables stored beside the statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderTunables {
    pub error_open_threshold: f64,
    pub base_open_secs: f64,
    pub max_open_secs: f64,
    pub load_soft_cap: f64,
}

impl Default for ProviderTunables {
    fn default() -> Self {
        Self {
            error_open_threshold: 0.5,
            base_open_secs: 30.0,
            max_open_secs: 900.0,
            load_soft_cap: 500.0,
        }
    }
}

/// Snapshot of the health statistics of one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub endpoint: String,
    pub provider: String,
    pub model: String,

    pub latency_ewma_10s: f64,
    pub latency_ewma_60s: f64,
    pub latency_ewma_300s: f64,

    pub error_ewma_10s: f64,
    pub error_ewma_60s: f64,
    pub error_ewma_300s: f64,

    pub call_rate_10s: f64,
    pub call_rate_60s: f64,
    pub throughput_ewma_60s: f64,

    pub recent_ok_ewma_60s: f64,
    pub recent_total_ewma_60s: f64,

    pub inflight: i64,
    pub current_load: f64,

    pub breaker_state: BreakerState,
    pub breaker_until_ms: i64,
    pub breaker_attempts: u32,

    pub last_ts_10s: i64,
    pub last_ts_60s: i64,
    pub last_ts_300s: i64,
    pub last_updated_ms: i64,

    pub tunables: ProviderTunables,
}

impl ProviderHealth {
    /// Fresh record for a provider that has never been called.
    pub fn new(endpoint: &str, provider: &str, model: &str, default_latency_ms: f64, tunables: ProviderTunables) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            latency_ewma_10s: default_latency_ms,
            latency_ewma_60s: default_latency_ms,
            latency_ewma_300s: default_latency_ms,
            error_ewma_10s: 0.0,
            error_ewma_60s: 0.0,
            error_ewma_300s: 0.0,
            call_rate_10s: 0.0,
            call_rate_60s: 0.0,
            throughput_ewma_60s: 0.0,
            recent_ok_ewma_60s: 0.0,
            recent_total_ewma_60s: 0.0,
            inflight: 0,
            current_load: 0.0,
            breaker_state: BreakerState::Closed,
            breaker_until_ms: 0,
            breaker_attempts: 0,
            last_ts_10s: 0,
            last_ts_60s: 0,
            last_ts_300s: 0,
            last_updated_ms: 0,
            tunables,
        }
    }

    /// `max(latency_ewma_60s, 1.6 · latency_ewma_10s)`
    pub fn tail_latency_ms(&self) -> f64 {
        self.latency_ewma_60s.max(self.latency_ewma_10s * 1.6)
    }

    pub fn is_blocking(&self, now_ms: i64) -> bool {
        self.breaker_state == BreakerState::Open && self.breaker_until_ms > now_ms
    }

    /// Decode from the shared per-(endpoint, model) hash.
    ///
    /// Missing or malformed fields fall back to defaults; tunables absent from
    /// the hash come from `tunables`.
    pub(crate) fn from_fields(
        endpoint: &str,
        provider: &str,
        model: &str,
        map: &HashMap<String, String>,
        default_latency_ms: f64,
        tunables: ProviderTunables,
    ) -> Self {
        let num = |metric: &str, fallback: f64| -> f64 {
            map.get(&field(provider, metric))
                .and_then(|raw| raw.parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .unwrap_or(fallback)
        };

        let tunables = ProviderTunables {
            error_open_threshold: num(fields::ERROR_OPEN_THRESHOLD, tunables.error_open_threshold),
            base_open_secs: num(fields::BASE_OPEN_SECS, tunables.base_open_secs),
            max_open_secs: num(fields::MAX_OPEN_SECS, tunables.max_open_secs),
            load_soft_cap: num(fields::LOAD_SOFT_CAP, tunables.load_soft_cap),
        };

        Self {
            endpoint: endpoint.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            latency_ewma_10s: num(fields::LATENCY_10S, default_latency_ms),
            latency_ewma_60s: num(fields::LATENCY_60S, default_latency_ms),
            latency_ewma_300s: num(fields::LATENCY_300S, default_latency_ms),
            error_ewma_10s: num(fields::ERROR_10S, 0.0),
            error_ewma_60s: num(fields::ERROR_60S, 0.0),
            error_ewma_300s: num(fields::ERROR_300S, 0.0),
            call_rate_10s: num(fields::RATE_10S, 0.0),
            call_rate_60s: num(fields::RATE_60S, 0.0),
            throughput_ewma_60s: num(fields::THROUGHPUT_60S, 0.0),
            recent_ok_ewma_60s: num(fields::RECENT_OK_60S, 0.0),
            recent_total_ewma_60s: num(fields::RECENT_TOTAL_60S, 0.0),
            inflight: num(fields::INFLIGHT, 0.0).max(0.0) as i64,
            current_load: num(fields::CURRENT_LOAD, 0.0).clamp(0.0, 1.0),
            breaker_state: BreakerState::parse(map.get(&field(provider, fields::BREAKER)).map(String::as_str)),
            breaker_until_ms: num(fields::BREAKER_UNTIL_MS, 0.0) as i64,
            breaker_attempts: num(fields::BREAKER_ATTEMPTS, 0.0).max(0.0) as u32,
            last_ts_10s: num(fields::LAST_TS_10S, 0.0) as i64,
            last_ts_60s: num(fields::LAST_TS_60S, 0.0) as i64,
            last_ts_300s: num(fields::LAST_TS_300S, 0.0) as i64,
            last_updated_ms: num(fields::LAST_UPDATED, 0.0) as i64,
            tunables,
        }
    }

    /// Every field of the record, ready for `hash_set`.
    pub(crate) fn to_fields(&self) -> Vec<(String, String)> {
        let p = self.provider.as_str();
        vec![
            (field(p, fields::LATENCY_10S), self.latency_ewma_10s.to_string()),
            (field(p, fields::LATENCY_60S), self.latency_ewma_60s.to_string()),
            (field(p, fields::LATENCY_300S), self.latency_ewma_300s.to_string()),
            (field(p, fields::ERROR_10S), self.error_ewma_10s.to_string()),
            (field(p, fields::ERROR_60S), self.error_ewma_60s.to_string()),
            (field(p, fields::ERROR_300S), self.error_ewma_300s.to_string()),
            (field(p, fields::RATE_10S), self.call_rate_10s.to_string()),
            (field(p, fields::RATE_60S), self.call_rate_60s.to_string()),
            (field(p, fields::THROUGHPUT_60S), self.throughput_ewma_60s.to_string()),
            (field(p, fields::RECENT_OK_60S), self.recent_ok_ewma_60s.to_string()),
            (field(p, fields::RECENT_TOTAL_60S), self.recent_total_ewma_60s.to_string()),
            (field(p, fields::INFLIGHT), self.inflight.to_string()),
            (field(p, fields::CURRENT_LOAD), self.current_load.to_string()),
            (field(p, fields::BREAKER), self.breaker_state.as_str().to_string()),
            (field(p, fields::BREAKER_UNTIL_MS), self.breaker_until_ms.to_string()),
            (field(p, fields::BREAKER_ATTEMPTS), self.breaker_attempts.to_string()),
            (field(p, fields::LAST_TS_10S), self.last_ts_10s.to_string()),
            (field(p, fields::LAST_TS_60S), self.last_ts_60s.to_string()),
            (field(p, fields::LAST_TS_300S), self.last_ts_300s.to_string()),
            (field(p, fields::LAST_UPDATED), self.last_updated_ms.to_string()),
        ]
        .into_iter()
        .chain(tunable_fields(p, &self.tunables))
        .collect()
    }
}

pub(crate) fn tunable_fields(provider: &str, t: &ProviderTunables) -> Vec<(String, String)> {
    vec![
        (field(provider, fields::ERROR_OPEN_THRESHOLD), t.error_open_threshold.to_string()),
        (field(provider, fields::BASE_OPEN_SECS), t.base_open_secs.to_string()),
        (field(provider, fields::MAX_OPEN_SECS), t.max_open_secs.to_string()),
        (field(provider, fields::LOAD_SOFT_CAP), t.load_soft_cap.to_string()),
    ]
}

/// Hash field holding `metric` for `provider`.
pub(crate) fn field(provider: &str, metric: &str) -> String {
    format!("{}::{}", provider, metric)
}

pub(crate) mod fields {
    pub const LATENCY_10S: &str = "lat_ewma_10s";
    pub const LATENCY_60S: &str = "lat_ewma_60s";
    pub const LATENCY_300S: &str = "lat_ewma_300s";
    pub const ERROR_10S: &str = "err_ewma_10s";
    pub const ERROR_60S: &str = "err_ewma_60s";
    pub const ERROR_300S: &str = "err_ewma_300s";
    pub const RATE_10S: &str = "rate_10s";
    pub const RATE_60S: &str = "rate_60s";
    pub const THROUGHPUT_60S: &str = "tp_ewma_60s";
    pub const RECENT_OK_60S: &str = "rec_ok_ew_60s";
    pub const RECENT_TOTAL_60S: &str = "rec_tot_ew_60s";
    pub const INFLIGHT: &str = "inflight";
    pub const CURRENT_LOAD: &str = "current_load";
    pub const BREAKER: &str = "breaker";
    pub const BREAKER_UNTIL_MS: &str = "breaker_until_ms";
    pub const BREAKER_ATTEMPTS: &str = "breaker_attempts";
    pub const LAST_TS_10S: &str = "last_ts_10s";
    pub const LAST_TS_60S: &str = "last_ts_60s";
    pub const LAST_TS_300S: &str = "last_ts_300s";
    pub const LAST_UPDATED: &str = "last_updated";
    pub const ERROR_OPEN_THRESHOLD: &str = "err_open_th";
    pub const BASE_OPEN_SECS: &str = "base_open_secs";
    pub const MAX_OPEN_SECS: &str = "max_open_secs";
    pub const LOAD_SOFT_CAP: &str = "load_soft_cap";
}
