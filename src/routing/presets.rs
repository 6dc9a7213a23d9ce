use serde::{Deserialize, Serialize};

/// Routing priority selected by the model id suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Default,
    Fast,
    Quick,
}

impl Priority {
    /// Strict priorities rank deterministically instead of sampling.
    pub fn is_strict(&self) -> bool {
        !matches!(self, Priority::Default)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Default => "default",
            Priority::Fast => "fast",
            Priority::Quick => "quick",
        }
    }
}

/// Score weights for one priority.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutingPreset {
    pub w_succ: f64,
    pub w_p50: f64,
    pub w_tail: f64,
    pub w_tps: f64,
    pub w_load: f64,
    pub noise: f64,
    /// Latency at which the p50 curve reaches one half.
    pub l0: f64,
}

impl RoutingPreset {
    pub const DEFAULT: RoutingPreset = RoutingPreset {
        w_succ: 0.35,
        w_p50: 0.35,
        w_tail: 0.15,
        w_tps: 0.10,
        w_load: 0.05,
        noise: 0.02,
        l0: 800.0,
    };

    pub const FAST: RoutingPreset = RoutingPreset {
        w_succ: 0.30,
        w_p50: 0.50,
        w_tail: 0.15,
        w_tps: 0.03,
        w_load: 0.02,
        noise: 0.005,
        l0: 600.0,
    };

    pub const QUICK: RoutingPreset = RoutingPreset {
        w_succ: 0.25,
        w_p50: 0.45,
        w_tail: 0.20,
        w_tps: 0.08,
        w_load: 0.02,
        noise: 0.015,
        l0: 500.0,
    };

    pub fn validate(&self) -> Result<(), String> {
        let weights = [self.w_succ, self.w_p50, self.w_tail, self.w_tps, self.w_load, self.noise];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("routing weights must be finite and non-negative".to_string());
        }
        if !(self.l0.is_finite() && self.l0 > 0.0) {
            return Err("routing l0 must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresetTable {
    pub default: RoutingPreset,
    pub fast: RoutingPreset,
    pub quick: RoutingPreset,
}

impl Default for PresetTable {
    fn default() -> Self {
        Self {
            default: RoutingPreset::DEFAULT,
            fast: RoutingPreset::FAST,
            quick: RoutingPreset::QUICK,
        }
    }
}

impl PresetTable {
    pub fn get(&self, priority: Priority) -> &RoutingPreset {
        match priority {
            Priority::Default => &self.default,
            Priority::Fast => &self.fast,
            Priority::Quick => &self.quick,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModel {
    pub base: String,
    pub priority: Priority,
}

/// Split `model:suffix`. Only `fast` and `quick` (any case) select a
/// priority; every other suffix routes with the default preset.
pub fn parse_priority(model: &str) -> ParsedModel {
    let mut parts = model.split(':');
    let base = parts.next().unwrap_or_default().to_string();
    let priority = match parts.next().map(str::to_ascii_lowercase).as_deref() {
        Some("fast") => Priority::Fast,
        Some("quick") => Priority::Quick,
        _ => Priority::Default,
    };
    ParsedModel { base, priority }
}

/// Model id without any `:suffix`.
pub fn base_model(model: &str) -> &str {
    model.split(':').next().unwrap_or(model)
}
