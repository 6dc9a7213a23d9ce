//! Time-decayed estimators.
//!
//! Every estimator carries the timestamp of its last update. On a new event
//! the stored value is first decayed by `exp(-Δt / τ)` and then blended with
//! (EWMA) or incremented by (counter/rate) the new sample.

pub const TAU_10S_MS: f64 = 10_000.0;
pub const TAU_60S_MS: f64 = 60_000.0;
pub const TAU_300S_MS: f64 = 300_000.0;

/// Decay factor for `elapsed_ms` under time constant `tau_ms`.
///
/// A missing previous timestamp (`last_ms == 0`) or a clock that went
/// backwards yields `1.0`, i.e. no decay.
pub fn decay_factor(now_ms: i64, last_ms: i64, tau_ms: f64) -> f64 {
    if last_ms <= 0 {
        return 1.0;
    }
    let elapsed = (now_ms - last_ms).max(0) as f64;
    (-elapsed / tau_ms).exp()
}

/// `prev·decay + (1 − decay)·sample`
pub fn blend(prev: f64, sample: f64, decay: f64) -> f64 {
    prev * decay + (1.0 - decay) * sample
}

/// Accumulate-and-decay counter: `prev·decay + increment`.
pub fn accumulate(prev: f64, increment: f64, decay: f64) -> f64 {
    prev * decay + increment
}

/// Per-event increment of a call-rate estimator so that its steady state is
/// calls per second.
pub fn rate_increment(tau_ms: f64) -> f64 {
    1000.0 / tau_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_over_one_time_constant() {
        let d = decay_factor(20_000, 10_000, TAU_10S_MS);
        assert!((d - (-1.0f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_no_decay_without_history() {
        assert_eq!(decay_factor(50_000, 0, TAU_60S_MS), 1.0);
        assert_eq!(decay_factor(50_000, 60_000, TAU_60S_MS), 1.0);
    }

    #[test]
    fn test_blend_matches_closed_form() {
        let d = (-1.0f64).exp();
        let v = blend(100.0, 300.0, d);
        assert!((v - (100.0 * d + 300.0 * (1.0 - d))).abs() < 1e-9);
    }

    #[test]
    fn test_rate_converges_to_calls_per_second() {
        // One call every 500ms for a long time -> ~2 calls/sec.
        let mut rate = 0.0;
        let mut last = 0;
        for i in 1..=2_000i64 {
            let now = i * 500;
            rate = accumulate(rate, rate_increment(TAU_10S_MS), decay_factor(now, last, TAU_10S_MS));
            last = now;
        }
        assert!((rate - 2.0).abs() < 0.1, "rate was {}", rate);
    }
}
