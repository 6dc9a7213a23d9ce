use serde::{Deserialize, Serialize};

use crate::health::ewma::{TAU_10S_MS, TAU_300S_MS, TAU_60S_MS};
use crate::health::record::{BreakerState, ProviderHealth};

const DEGRADED_TAIL_MS: f64 = 3000.0;
const DEGRADED_SUCCESS: f64 = 0.97;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Up,
    Degraded,
    Down,
    Probing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Up,
    Degraded,
    Down,
}

/// Public view of one provider's health.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicProviderHealth {
    pub provider: String,
    pub status: ProviderStatus,
    pub breaker: BreakerState,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub success_rate: f64,
    pub load: f64,
    pub rate_rps_10s: f64,
    pub rate_rps_60s: f64,
    pub tokens_per_sec_60s: f64,
    pub last_updated: i64,
    pub breaker_until_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConstants {
    pub t10s: f64,
    pub t60s: f64,
    pub t300s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: OverallStatus,
    pub ewma_time_constants_ms: TimeConstants,
    pub up: usize,
    pub degraded: usize,
    pub down: usize,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub success_rate: Option<f64>,
    pub providers: Vec<PublicProviderHealth>,
}

fn classify(breaker: BreakerState, tail_ms: f64, success_rate: f64) -> ProviderStatus {
    match breaker {
        BreakerState::Open => ProviderStatus::Down,
        BreakerState::HalfOpen => ProviderStatus::Probing,
        BreakerState::Closed if tail_ms > DEGRADED_TAIL_MS || success_rate < DEGRADED_SUCCESS => ProviderStatus::Degraded,
        BreakerState::Closed => ProviderStatus::Up,
    }
}

impl From<&ProviderHealth> for PublicProviderHealth {
    fn from(h: &ProviderHealth) -> Self {
        let success_rate = (1.0 - h.error_ewma_60s).clamp(0.0, 1.0);
        let tail = h.tail_latency_ms();
        Self {
            provider: h.provider.clone(),
            status: classify(h.breaker_state, tail, success_rate),
            breaker: h.breaker_state,
            p50_ms: h.latency_ewma_10s,
            p95_ms: tail,
            success_rate,
            load: h.current_load,
            rate_rps_10s: h.call_rate_10s,
            rate_rps_60s: h.call_rate_60s,
            tokens_per_sec_60s: h.throughput_ewma_60s,
            last_updated: h.last_updated_ms,
            breaker_until_ms: h.breaker_until_ms,
        }
    }
}

fn median(values: &[f64]) -> Option<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return None;
    }
    v.sort_by(|a, b| a.total_cmp(b));
    let mid = v.len() / 2;
    Some(if v.len() % 2 == 1 { v[mid] } else { (v[mid - 1] + v[mid]) / 2.0 })
}

fn mean(values: &[f64]) -> Option<f64> {
    let v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return None;
    }
    Some(v.iter().sum::<f64>() / v.len() as f64)
}

/// Summarise health snapshots for status pages and dashboards.
pub fn build_report(snapshots: &[ProviderHealth]) -> HealthReport {
    let providers: Vec<PublicProviderHealth> = snapshots.iter().map(PublicProviderHealth::from).collect();

    let count = |s: ProviderStatus| providers.iter().filter(|p| p.status == s).count();
    let (up, degraded, down) = (count(ProviderStatus::Up), count(ProviderStatus::Degraded), count(ProviderStatus::Down));

    let p50 = median(&providers.iter().map(|p| p.p50_ms).collect::<Vec<_>>());
    let p95 = median(&providers.iter().map(|p| p.p95_ms).collect::<Vec<_>>());
    let success = mean(&providers.iter().map(|p| p.success_rate).collect::<Vec<_>>());

    let status = if !providers.is_empty() && down == providers.len() {
        OverallStatus::Down
    } else if degraded > 0 || p95.unwrap_or(0.0) > DEGRADED_TAIL_MS || success.unwrap_or(1.0) < DEGRADED_SUCCESS {
        OverallStatus::Degraded
    } else {
        OverallStatus::Up
    };

    HealthReport {
        status,
        ewma_time_constants_ms: TimeConstants {
            t10s: TAU_10S_MS,
            t60s: TAU_60S_MS,
            t300s: TAU_300S_MS,
        },
        up,
        degraded,
        down,
        p50_ms: p50,
        p95_ms: p95,
        success_rate: success,
        providers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::record::ProviderTunables;

    fn health(provider: &str) -> ProviderHealth {
        let mut h = ProviderHealth::new("chat", provider, "m", 800.0, ProviderTunables::default());
        h.latency_ewma_60s = 900.0;
        h
    }

    #[test]
    fn test_classification() {
        let up = health("a");
        assert_eq!(PublicProviderHealth::from(&up).status, ProviderStatus::Up);

        let mut slow = health("b");
        slow.latency_ewma_10s = 2_000.0;
        assert_eq!(PublicProviderHealth::from(&slow).status, ProviderStatus::Degraded);

        let mut flaky = health("c");
        flaky.error_ewma_60s = 0.05;
        assert_eq!(PublicProviderHealth::from(&flaky).status, ProviderStatus::Degraded);

        let mut open = health("d");
        open.breaker_state = BreakerState::Open;
        assert_eq!(PublicProviderHealth::from(&open).status, ProviderStatus::Down);

        let mut probing = health("e");
        probing.breaker_state = BreakerState::HalfOpen;
        assert_eq!(PublicProviderHealth::from(&probing).status, ProviderStatus::Probing);
    }

    #[test]
    fn test_overall_status() {
        let report = build_report(&[health("a"), health("b")]);
        assert_eq!(report.status, OverallStatus::Up);
        assert_eq!(report.up, 2);
        assert_eq!(report.p95_ms, Some(1_280.0));

        let mut down_a = health("a");
        down_a.breaker_state = BreakerState::Open;
        let mut down_b = health("b");
        down_b.breaker_state = BreakerState::Open;
        assert_eq!(build_report(&[down_a.clone(), down_b]).status, OverallStatus::Down);

        let mut flaky = health("c");
        flaky.error_ewma_60s = 0.5;
        assert_eq!(build_report(&[down_a, flaky]).status, OverallStatus::Degraded);
    }

    #[test]
    fn test_empty_report() {
        let report = build_report(&[]);
        assert_eq!(report.status, OverallStatus::Up);
        assert!(report.p50_ms.is_none());
        assert_eq!(report.ewma_time_constants_ms.t60s, 60_000.0);
    }
}
