use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::health::monitor::HealthMonitor;
use crate::health::record::{self, fields, BreakerState, ProviderHealth};

/// Breaker decision for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker open, or half-open and this request was not sampled.
    Blocked,
    /// Half-open and sampled as a recovery probe.
    Probe,
    /// Normal traffic.
    Closed,
}

/// Half-open probe window counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalfOpenProbe {
    pub probe_ratio: f64,
    pub ok_count: u32,
    pub total_count: u32,
}

const PROBE_RATIO_FIELD: &str = "p";
const PROBE_OK_FIELD: &str = "ok";
const PROBE_COUNT_FIELD: &str = "cnt";

/// Deterministic sampling: FNV-1a over `team|request` mapped to [0, 1].
pub fn allow_sample(team_id: &str, request_id: &str, ratio: f64) -> bool {
    sample_fraction(team_id, request_id) < ratio
}

pub(crate) fn sample_fraction(team_id: &str, request_id: &str) -> f64 {
    let mut h: u32 = 2_166_136_261;
    let seed = format!("{}|{}", team_id, request_id);
    for b in seed.bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(16_777_619);
    }
    h as f64 / u32::MAX as f64
}

/// Open window for the `attempts`-th consecutive open, in seconds.
pub fn open_duration_secs(base_open_secs: f64, max_open_secs: f64, attempts: u32) -> f64 {
    let exp = attempts.saturating_sub(1).min(62) as i32;
    (base_open_secs * 2f64.powi(exp)).min(max_open_secs)
}

impl HealthMonitor {
    /// Decide whether `provider` may be attempted now.
    ///
    /// Uses `snapshot` (the routing read) when given to avoid another store
    /// round trip.
    pub async fn admit(
        &self,
        endpoint: &str,
        provider: &str,
        model: &str,
        team_id: &str,
        request_id: &str,
        snapshot: Option<&ProviderHealth>,
    ) -> Result<Admission> {
        let fresh;
        let health = match snapshot {
            Some(h) => h,
            None => {
                fresh = self.read(endpoint, provider, model).await?;
                &fresh
            }
        };

        let now = self.clock.now_ms();
        let mut state = health.breaker_state;

        if state == BreakerState::Open {
            if now < health.breaker_until_ms {
                debug!("Breaker for {} on {} / {} is open, blocking", provider, endpoint, model);
                return Ok(Admission::Blocked);
            }
            self.store
                .hash_set(
                    &Self::health_key(endpoint, model),
                    vec![(record::field(provider, fields::BREAKER), BreakerState::HalfOpen.as_str().to_string())],
                )
                .await?;
            info!("Breaker for {} on {} / {} transitioning to half-open", provider, endpoint, model);
            state = BreakerState::HalfOpen;
        }

        if state == BreakerState::HalfOpen {
            let probe = self.ensure_half_open(endpoint, provider, model).await?;
            let admitted = allow_sample(team_id, request_id, probe.probe_ratio);
            debug!(
                "Breaker for {} on {} / {} is half-open, request {} {}",
                provider,
                endpoint,
                model,
                request_id,
                if admitted { "admitted as probe" } else { "blocked" }
            );
            return Ok(if admitted { Admission::Probe } else { Admission::Blocked });
        }

        Ok(Admission::Closed)
    }

    /// Record the result of a half-open probe and close or reopen when the
    /// window has enough samples.
    pub async fn report_probe_result(&self, endpoint: &str, provider: &str, model: &str, ok: bool) -> Result<()> {
        let key = Self::half_open_key(endpoint, model, provider);
        if self.read_half_open(endpoint, provider, model).await?.is_none() {
            debug!("Probe window for {} on {} / {} expired, dropping result", provider, endpoint, model);
            return Ok(());
        }
        self.store.hash_incr_by(&key, PROBE_COUNT_FIELD, 1).await?;
        if ok {
            self.store.hash_incr_by(&key, PROBE_OK_FIELD, 1).await?;
        }

        let Some(probe) = self.read_half_open(endpoint, provider, model).await? else {
            return Ok(());
        };

        if probe.total_count < self.settings.half_open_min_probes {
            return Ok(());
        }

        let health = self.read(endpoint, provider, model).await?;
        let error_rate = 1.0 - probe.ok_count as f64 / probe.total_count as f64;
        if probe.ok_count == probe.total_count {
            self.close_breaker(endpoint, provider, model).await?;
        } else if error_rate >= health.tunables.error_open_threshold {
            warn!(
                "Probe window for {} on {} / {} failed ({}/{} ok), reopening",
                provider, endpoint, model, probe.ok_count, probe.total_count
            );
            self.open_breaker(endpoint, provider, model).await?;
        }
        Ok(())
    }

    /// Open the breaker when the recent error rate is high and enough calls
    /// were seen to trust it. Returns whether the breaker was opened.
    pub async fn maybe_open_on_recent_errors(&self, endpoint: &str, provider: &str, model: &str) -> Result<bool> {
        let health = self.read(endpoint, provider, model).await?;
        if health.breaker_state == BreakerState::Open {
            return Ok(false);
        }

        let expected = health.call_rate_60s * 60.0;
        let min_needed = self
            .settings
            .open_min_total_floor
            .max(self.settings.open_min_total_frac * expected);

        let total = health.recent_total_ewma_60s;
        if total < min_needed {
            return Ok(false);
        }

        let error_rate = 1.0 - health.recent_ok_ewma_60s / total.max(1.0);
        if error_rate >= health.tunables.error_open_threshold {
            warn!(
                "Opening breaker for {} on {} / {}: error rate {:.3} over {:.1} recent calls",
                provider, endpoint, model, error_rate, total
            );
            self.open_breaker(endpoint, provider, model).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn read_half_open(&self, endpoint: &str, provider: &str, model: &str) -> Result<Option<HalfOpenProbe>> {
        let map = self
            .store
            .hash_get_all(&Self::half_open_key(endpoint, model, provider))
            .await?;
        if map.is_empty() {
            return Ok(None);
        }
        let num = |name: &str, fallback: f64| {
            map.get(name)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .unwrap_or(fallback)
        };
        Ok(Some(HalfOpenProbe {
            probe_ratio: num(PROBE_RATIO_FIELD, self.settings.half_open_probe_ratio),
            ok_count: num(PROBE_OK_FIELD, 0.0).max(0.0) as u32,
            total_count: num(PROBE_COUNT_FIELD, 0.0).max(0.0) as u32,
        }))
    }

    async fn ensure_half_open(&self, endpoint: &str, provider: &str, model: &str) -> Result<HalfOpenProbe> {
        let key = Self::half_open_key(endpoint, model, provider);
        self.store
            .hash_set_nx(&key, PROBE_RATIO_FIELD, &self.settings.half_open_probe_ratio.to_string())
            .await?;
        self.store
            .expire(&key, Duration::from_secs(self.settings.half_open_ttl_secs))
            .await?;
        Ok(self
            .read_half_open(endpoint, provider, model)
            .await?
            .unwrap_or(HalfOpenProbe {
                probe_ratio: self.settings.half_open_probe_ratio,
                ok_count: 0,
                total_count: 0,
            }))
    }

    pub(crate) async fn open_breaker(&self, endpoint: &str, provider: &str, model: &str) -> Result<()> {
        let health = self.read(endpoint, provider, model).await?;
        let now = self.clock.now_ms();
        let attempts = health.breaker_attempts + 1;
        let secs = open_duration_secs(health.tunables.base_open_secs, health.tunables.max_open_secs, attempts);
        let until = now + (secs * 1000.0) as i64;

        self.store
            .hash_set(
                &Self::health_key(endpoint, model),
                vec![
                    (record::field(provider, fields::BREAKER), BreakerState::Open.as_str().to_string()),
                    (record::field(provider, fields::BREAKER_ATTEMPTS), attempts.to_string()),
                    (record::field(provider, fields::BREAKER_UNTIL_MS), until.to_string()),
                ],
            )
            .await?;
        self.store.delete(&Self::half_open_key(endpoint, model, provider)).await?;
        warn!(
            "Breaker for {} on {} / {} opened for {}s (consecutive opens: {})",
            provider, endpoint, model, secs, attempts
        );
        Ok(())
    }

    pub(crate) async fn close_breaker(&self, endpoint: &str, provider: &str, model: &str) -> Result<()> {
        self.store
            .hash_set(
                &Self::health_key(endpoint, model),
                vec![
                    (record::field(provider, fields::BREAKER), BreakerState::Closed.as_str().to_string()),
                    (record::field(provider, fields::BREAKER_ATTEMPTS), "0".to_string()),
                    (record::field(provider, fields::BREAKER_UNTIL_MS), "0".to_string()),
                ],
            )
            .await?;
        self.store.delete(&Self::half_open_key(endpoint, model, provider)).await?;
        info!("Breaker for {} on {} / {} recovered, closed", provider, endpoint, model);
        Ok(())
    }
}
