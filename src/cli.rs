use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::app::{AppState, GatewayConfig};
use crate::error::{Error, Result};
use crate::gateway::{AdapterOutput, ExecuteArgs, ProviderAdapter};
use crate::health::ProviderHealth;
use crate::pricing::{
    attach_pricing, build_match_context, candidate_rules, compute_bill_summary, explain_rule_selection, split_usage,
    PriceCard,
};
use crate::platform::GatewayPaths;
use crate::routing::{base_model, RouteHints, RoutingCandidate};

#[derive(Parser)]
#[command(name = "modelgate")]
#[command(about = "Health-aware routing and exact pricing for multi-provider model gateways")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Price a usage object against a price card
    Price {
        /// Price card file (.json or .toml)
        #[arg(long)]
        card: PathBuf,

        /// Usage as inline JSON or a path to a JSON file
        #[arg(long)]
        usage: String,

        /// Extra pricing context as inline JSON or a file
        #[arg(long)]
        options: Option<String>,

        /// Pricing plan (defaults to the configured plan)
        #[arg(long)]
        plan: Option<String>,

        /// Print the rule ranking for every billed meter
        #[arg(long)]
        explain: bool,
    },

    /// Rank candidates against a health snapshot
    Route {
        /// Requested model id, optionally with a :fast or :quick suffix
        #[arg(short, long)]
        model: String,

        /// JSON list of candidates: [{"provider": "...", "weight": 1.0}]
        #[arg(long)]
        candidates: PathBuf,

        /// JSON list of (partial) health records to seed the store with
        #[arg(long)]
        health: Option<PathBuf>,

        #[arg(short, long, default_value = "chat.completions")]
        endpoint: String,

        /// Number of routing runs to tally first choices over
        #[arg(short, long, default_value_t = 1)]
        runs: usize,

        #[arg(short, long)]
        seed: Option<u64>,
    },

    /// Show the effective configuration
    Config {
        /// Print it as TOML
        #[arg(short, long)]
        show: bool,
    },
}

/// Load the configuration named by `--config`, or the per-user one.
///
/// Without a flag the platform directories are created and the per-user
/// cards directory becomes the default card source.
pub fn load_config(cli: &Cli) -> Result<(PathBuf, GatewayConfig)> {
    if let Some(path) = &cli.config {
        return Ok((path.clone(), GatewayConfig::load(path)?));
    }

    let paths = GatewayPaths::new()?;
    paths.ensure_dirs_exist()?;
    let path = paths.config_file();
    let mut config = GatewayConfig::load(&path)?;
    if config.pricing.cards_dir.is_none() {
        config.pricing.cards_dir = Some(paths.cards_dir());
    }
    Ok((path, config))
}

pub async fn run(cli: Cli, config: GatewayConfig) -> Result<()> {
    match cli.command {
        Commands::Price { card, usage, options, plan, explain } => {
            let plan = plan.unwrap_or_else(|| config.pricing.default_plan.clone());
            let out = price(&card, &usage, options.as_deref(), &plan, explain)?;
            print_json(&out)
        }
        Commands::Route { model, candidates, health, endpoint, runs, seed } => {
            let state = AppState::new(config)?;
            let out = route(&state, &model, &candidates, health.as_deref(), &endpoint, runs, seed).await?;
            print_json(&out)
        }
        Commands::Config { show } => {
            config.validate()?;
            if show {
                println!("{}", toml::to_string_pretty(&config)?);
            } else {
                println!("Configuration is valid");
            }
            Ok(())
        }
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Inline JSON when it parses, otherwise a path to a JSON file.
fn read_json_arg(arg: &str) -> Result<Value> {
    match serde_json::from_str(arg) {
        Ok(value) => Ok(value),
        Err(_) => {
            let content = std::fs::read_to_string(arg)?;
            Ok(serde_json::from_str(&content)?)
        }
    }
}

fn read_card(path: &Path) -> Result<PriceCard> {
    let content = std::fs::read_to_string(path)?;
    let card: PriceCard = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)?,
        _ => serde_json::from_str(&content)?,
    };
    card.validate()?;
    Ok(card)
}

pub fn price(card_path: &Path, usage: &str, options: Option<&str>, plan: &str, explain: bool) -> Result<Value> {
    let card = read_card(card_path)?;
    let usage = read_json_arg(usage)?;
    let options = options.map(read_json_arg).transpose()?;

    let summary = compute_bill_summary(&usage, &card, options.as_ref(), plan)?;
    let attached = attach_pricing(&summary)?;
    let mut out = json!({
        "plan": plan,
        "summary": summary,
        "usage": usage_with_pricing(&usage, serde_json::to_value(&attached)?),
    });

    if explain {
        let split = split_usage(&usage, &card);
        let ctx = build_match_context(&split, options.as_ref());
        let rankings: BTreeMap<&str, Value> = split
            .meters
            .keys()
            .map(|meter| {
                let rules = candidate_rules(&card, meter, plan, &ctx);
                serde_json::to_value(explain_rule_selection(&rules, &ctx)).map(|r| (meter.as_str(), r))
            })
            .collect::<std::result::Result<_, _>>()?;
        out["rankings"] = serde_json::to_value(rankings)?;
    }
    Ok(out)
}

fn usage_with_pricing(usage: &Value, pricing: Value) -> Value {
    let mut usage = usage.clone();
    if let Value::Object(map) = &mut usage {
        map.insert("pricing".to_string(), pricing);
    }
    usage
}

#[derive(Debug, Deserialize)]
struct CandidateEntry {
    provider: String,
    #[serde(default)]
    weight: f64,
}

/// Stands in for a provider when only ranking is wanted.
struct DryRunAdapter {
    name: String,
}

#[async_trait]
impl ProviderAdapter for DryRunAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _args: ExecuteArgs) -> Result<AdapterOutput> {
        Err(Error::provider(format!("{} is a dry-run provider", self.name)))
    }
}

/// Overlay a partial record on the defaults for its provider.
fn health_record(state: &AppState, endpoint: &str, model: &str, partial: Value) -> Result<ProviderHealth> {
    let provider = partial
        .get("provider")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::validation("health record without provider"))?;
    let settings = state.monitor().settings();
    let base = ProviderHealth::new(
        endpoint,
        provider,
        model,
        settings.default_latency_ms,
        settings.tunables_for(provider),
    );

    let mut merged = serde_json::to_value(&base)?;
    if let (Value::Object(target), Value::Object(fields)) = (&mut merged, partial) {
        for (k, v) in fields {
            if !matches!(k.as_str(), "endpoint" | "model") {
                target.insert(k, v);
            }
        }
    }
    Ok(serde_json::from_value(merged)?)
}

pub async fn route(
    state: &AppState,
    model: &str,
    candidates_path: &Path,
    health_path: Option<&Path>,
    endpoint: &str,
    runs: usize,
    seed: Option<u64>,
) -> Result<Value> {
    let entries: Vec<CandidateEntry> = serde_json::from_str(&std::fs::read_to_string(candidates_path)?)?;
    if entries.is_empty() {
        return Err(Error::validation("candidate list is empty"));
    }
    let candidates: Vec<RoutingCandidate> = entries
        .into_iter()
        .map(|s| {
            RoutingCandidate::new(Arc::new(DryRunAdapter { name: s.provider }) as Arc<dyn ProviderAdapter>)
                .with_weight(s.weight)
        })
        .collect();

    let base = base_model(model);
    if let Some(path) = health_path {
        let records: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        for partial in records {
            let record = health_record(state, endpoint, base, partial)?;
            state.monitor().restore(&record).await?;
        }
        info!("Seeded health store from {:?}", path);
    }

    let hints = RouteHints::default();
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let ranking = state.gateway().router().route(&candidates, endpoint, model, &hints, &mut rng).await;
    let order: Vec<Value> = ranking
        .iter()
        .map(|c| {
            json!({
                "provider": c.candidate.name(),
                "score": c.score,
                "breaker": c.health.breaker_state,
                "p50_ms": c.health.latency_ewma_10s,
                "tail_ms": c.health.tail_latency_ms(),
                "error_rate_60s": c.health.error_ewma_60s,
                "load": c.health.current_load,
            })
        })
        .collect();

    let mut first_choices: BTreeMap<String, usize> = BTreeMap::new();
    if let Some(first) = ranking.first() {
        *first_choices.entry(first.candidate.name().to_string()).or_default() += 1;
    }
    for _ in 1..runs.max(1) {
        let ranked = state.gateway().router().route(&candidates, endpoint, model, &hints, &mut rng).await;
        if let Some(first) = ranked.first() {
            *first_choices.entry(first.candidate.name().to_string()).or_default() += 1;
        }
    }
    debug!("Routed {} runs for {} on {}", runs.max(1), model, endpoint);

    Ok(json!({
        "model": model,
        "endpoint": endpoint,
        "ranking": order,
        "runs": runs.max(1),
        "first_choices": first_choices,
    }))
}
