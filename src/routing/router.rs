use std::cmp::Ordering;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use crate::health::{HealthMonitor, ProviderHealth};
use crate::routing::candidate::{RouteHints, RoutedChoice, RoutingCandidate};
use crate::routing::presets::{parse_priority, PresetTable, RoutingPreset};

const MIN_SAMPLE_WEIGHT: f64 = 0.0001;

fn normalise(v: f64, min: f64, max: f64) -> f64 {
    if max == min {
        return 0.5;
    }
    ((v - min) / (max - min)).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy)]
struct Range {
    min: f64,
    max: f64,
}

impl Range {
    fn of(values: impl Iterator<Item = f64>) -> Self {
        values.fold(
            Range {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            },
            |r, v| Range {
                min: r.min.min(v),
                max: r.max.max(v),
            },
        )
    }
}

/// Score without the noise term.
fn base_score(h: &ProviderHealth, preset: &RoutingPreset, p50: Range, tail: Range, tps: Range) -> f64 {
    let succ = 1.0 - h.error_ewma_10s;
    let p50_curve = 1.0 / (1.0 + h.latency_ewma_10s / preset.l0);
    let p50_norm = 1.0 - normalise(h.latency_ewma_10s, p50.min, p50.max);
    let tail_norm = 1.0 - normalise(h.tail_latency_ms(), tail.min, tail.max);
    let tps_norm = if tps.max > 0.0 {
        normalise(h.throughput_ewma_60s, tps.min, tps.max)
    } else {
        0.0
    };

    preset.w_succ * succ + preset.w_p50 * (0.5 * p50_curve + 0.5 * p50_norm) + preset.w_tail * tail_norm
        + preset.w_tps * tps_norm
        - preset.w_load * h.current_load
}

/// Rank `pool` by score. Strict mode sorts by the noise-free score (stable on
/// ties); otherwise noise is added and the order is drawn by weighted
/// sampling without replacement.
pub fn rank_pool<R: Rng>(
    pool: Vec<(RoutingCandidate, ProviderHealth)>,
    preset: &RoutingPreset,
    strict: bool,
    rng: &mut R,
) -> Vec<RoutedChoice> {
    let p50 = Range::of(pool.iter().map(|(_, h)| h.latency_ewma_10s));
    let tail = Range::of(pool.iter().map(|(_, h)| h.tail_latency_ms()));
    let tps = Range::of(pool.iter().map(|(_, h)| h.throughput_ewma_60s));

    let mut scored: Vec<RoutedChoice> = pool
        .into_iter()
        .map(|(candidate, health)| {
            let noise = if strict { 0.0 } else { preset.noise * rng.gen::<f64>() };
            let raw = base_score(&health, preset, p50, tail, tps) + noise;
            let score = raw.max(0.0) * candidate.effective_weight();
            RoutedChoice { candidate, score, health }
        })
        .collect();

    if strict {
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        return scored;
    }
    weighted_order(scored, rng)
}

/// Draw proportionally to remaining score until the bag is empty.
fn weighted_order<R: Rng>(mut bag: Vec<RoutedChoice>, rng: &mut R) -> Vec<RoutedChoice> {
    let mut out = Vec::with_capacity(bag.len());
    while !bag.is_empty() {
        let weights: Vec<f64> = bag.iter().map(|c| c.score.max(MIN_SAMPLE_WEIGHT)).collect();
        let total: f64 = weights.iter().sum();
        let mut r = rng.gen::<f64>() * total;
        let mut idx = bag.len() - 1;
        for (i, w) in weights.iter().enumerate() {
            r -= w;
            if r <= 0.0 {
                idx = i;
                break;
            }
        }
        out.push(bag.remove(idx));
    }
    out
}

/// Health-aware candidate ranking.
pub struct Router {
    monitor: Arc<HealthMonitor>,
    presets: PresetTable,
}

impl Router {
    pub fn new(monitor: Arc<HealthMonitor>, presets: PresetTable) -> Self {
        Self { monitor, presets }
    }

    pub fn presets(&self) -> &PresetTable {
        &self.presets
    }

    /// Rank `candidates` for `model` on `endpoint`.
    ///
    /// Providers with an unexpired open breaker are left out unless that
    /// would leave nothing to try. A failed health read ranks on defaults.
    pub async fn route<R: Rng + Send>(
        &self,
        candidates: &[RoutingCandidate],
        endpoint: &str,
        model: &str,
        hints: &RouteHints,
        rng: &mut R,
    ) -> Vec<RoutedChoice> {
        let parsed = parse_priority(model);
        let preset = self.presets.get(parsed.priority);
        let filtered = hints.filter(candidates);

        let names: Vec<String> = filtered.iter().map(|c| c.name().to_string()).collect();
        let mut health_map = self
            .monitor
            .read_many(endpoint, &parsed.base, &names)
            .await
            .unwrap_or_else(|e| {
                warn!("Health read for {} / {} failed, routing on defaults: {}", endpoint, parsed.base, e);
                Default::default()
            });

        let settings = self.monitor.settings();
        let with_health: Vec<(RoutingCandidate, ProviderHealth)> = filtered
            .into_iter()
            .map(|c| {
                let health = health_map.remove(c.name()).unwrap_or_else(|| {
                    ProviderHealth::new(
                        endpoint,
                        c.name(),
                        &parsed.base,
                        settings.default_latency_ms,
                        settings.tunables_for(c.name()),
                    )
                });
                (c.clone(), health)
            })
            .collect();

        let now = self.monitor.now_ms();
        let viable_count = with_health.iter().filter(|(_, h)| !h.is_blocking(now)).count();
        let pool: Vec<(RoutingCandidate, ProviderHealth)> = if viable_count > 0 {
            with_health.into_iter().filter(|(_, h)| !h.is_blocking(now)).collect()
        } else {
            with_health
        };

        let ranked = rank_pool(pool, preset, parsed.priority.is_strict(), rng);
        debug!(
            "Routed {} on {} ({} mode): {}",
            model,
            endpoint,
            parsed.priority.as_str(),
            ranked
                .iter()
                .map(|c| format!("{}={:.4}", c.candidate.name(), c.score))
                .collect::<Vec<_>>()
                .join(", ")
        );
        ranked
    }
}
