use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::info;

use ::config::{Config, Environment, File, FileFormat};

use crate::error::{Error, Result};
use crate::gateway::ExecutionSettings;
use crate::health::{HealthSettings, ProviderTunables};
use crate::pricing::DEFAULT_PRICING_PLAN;
use crate::routing::PresetTable;

pub const ENV_PREFIX: &str = "MODELGATE";
pub const ENV_SEPARATOR: &str = "__";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub health: HealthConfig,
    pub routing: RoutingConfig,
    pub pricing: PricingConfig,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub tunables: ProviderTunables,
    /// Overrides keyed by provider name.
    pub providers: HashMap<String, ProviderTunables>,
    pub half_open_probe_ratio: f64,
    pub half_open_ttl_secs: u64,
    pub half_open_min_probes: u32,
    pub open_min_total_floor: f64,
    pub open_min_total_frac: f64,
    pub default_latency_ms: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        let settings = HealthSettings::default();
        Self {
            tunables: settings.default_tunables,
            providers: settings.provider_tunables,
            half_open_probe_ratio: settings.half_open_probe_ratio,
            half_open_ttl_secs: settings.half_open_ttl_secs,
            half_open_min_probes: settings.half_open_min_probes,
            open_min_total_floor: settings.open_min_total_floor,
            open_min_total_frac: settings.open_min_total_frac,
            default_latency_ms: settings.default_latency_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub max_tries: usize,
    pub seed: Option<u64>,
    pub presets: PresetTable,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_tries: 5,
            seed: None,
            presets: PresetTable::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub default_plan: String,
    /// Directory of `.json`/`.toml` price cards loaded at startup.
    pub cards_dir: Option<PathBuf>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_plan: DEFAULT_PRICING_PLAN.to_string(),
            cards_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub attempt_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl GatewayConfig {
    /// Layer `path` (if it exists) and `MODELGATE__*` variables over the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with(path, Self::environment())
    }

    fn environment() -> Environment {
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
    }

    fn load_with(path: &Path, env: Environment) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from: {:?}", path);
        } else {
            info!("Config file {:?} not found, using defaults", path);
        }

        let config: GatewayConfig = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(env)
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let h = &self.health;
        validate_tunables("default", &h.tunables)?;
        for (provider, tunables) in &h.providers {
            validate_tunables(provider, tunables)?;
        }
        if !(h.half_open_probe_ratio > 0.0 && h.half_open_probe_ratio <= 1.0) {
            return Err(Error::validation("half_open_probe_ratio must be in (0, 1]"));
        }
        if h.half_open_ttl_secs == 0 {
            return Err(Error::validation("half_open_ttl_secs must be positive"));
        }
        if h.open_min_total_floor < 0.0 || h.open_min_total_frac < 0.0 {
            return Err(Error::validation("Breaker volume floor must not be negative"));
        }
        if h.default_latency_ms <= 0.0 {
            return Err(Error::validation("default_latency_ms must be positive"));
        }

        if self.routing.max_tries == 0 {
            return Err(Error::validation("max_tries must be at least 1"));
        }
        let presets = &self.routing.presets;
        for (name, preset) in [("default", &presets.default), ("fast", &presets.fast), ("quick", &presets.quick)] {
            preset
                .validate()
                .map_err(|e| Error::validation(format!("Routing preset {}: {}", name, e)))?;
        }

        if self.pricing.default_plan.trim().is_empty() {
            return Err(Error::validation("default_plan must not be empty"));
        }
        if self.execution.attempt_timeout_ms == Some(0) {
            return Err(Error::validation("attempt_timeout_ms must be positive when set"));
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::validation(format!("Unknown log level {}", self.logging.level)));
        }
        Ok(())
    }

    pub fn to_health_settings(&self) -> HealthSettings {
        let h = &self.health;
        HealthSettings {
            default_tunables: h.tunables,
            provider_tunables: h.providers.clone(),
            half_open_probe_ratio: h.half_open_probe_ratio,
            half_open_ttl_secs: h.half_open_ttl_secs,
            half_open_min_probes: h.half_open_min_probes,
            open_min_total_floor: h.open_min_total_floor,
            open_min_total_frac: h.open_min_total_frac,
            default_latency_ms: h.default_latency_ms,
        }
    }

    pub fn to_execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            max_tries: self.routing.max_tries,
            attempt_timeout_ms: self.execution.attempt_timeout_ms,
            default_plan: self.pricing.default_plan.clone(),
            seed: self.routing.seed,
        }
    }
}

fn validate_tunables(name: &str, t: &ProviderTunables) -> Result<()> {
    if !(t.error_open_threshold > 0.0 && t.error_open_threshold <= 1.0) {
        return Err(Error::validation(format!("{}: error_open_threshold must be in (0, 1]", name)));
    }
    if t.base_open_secs <= 0.0 || t.max_open_secs < t.base_open_secs {
        return Err(Error::validation(format!(
            "{}: open window needs 0 < base_open_secs <= max_open_secs",
            name
        )));
    }
    if t.load_soft_cap <= 0.0 {
        return Err(Error::validation(format!("{}: load_soft_cap must be positive", name)));
    }
    Ok(())
}
