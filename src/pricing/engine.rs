use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::pricing::conditions::evaluate_conditions;
use crate::pricing::money::{
    format_usd_from_nanos_exact, nanos_to_cents_ceil, nanos_to_cents_floor, nanos_to_usd, parse_usd_to_nanos,
};
use crate::pricing::types::{AttachedPricing, AttachedPricingLine, PriceCard, PriceRule, PricingLine, PricingResult};

pub const DEFAULT_PRICING_PLAN: &str = "standard";

/// Usage keys that are always treated as billable meters.
pub const KNOWN_METERS: &[&str] = &[
    "input_text_tokens",
    "input_image_tokens",
    "input_audio_tokens",
    "input_video_tokens",
    "output_text_tokens",
    "output_image_tokens",
    "output_audio_tokens",
    "output_video_tokens",
    "output_image",
    "output_video_seconds",
    "cached_write_text_tokens",
    "cached_write_image_tokens",
    "cached_write_audio_tokens",
    "cached_write_video_tokens",
    "cached_read_text_tokens",
    "cached_read_image_tokens",
    "cached_read_video_tokens",
    "cached_read_audio_tokens",
    "embedding_tokens",
    "requests",
];

/// Raw usage partitioned into numeric meters and matching context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitUsage {
    pub meters: BTreeMap<String, f64>,
    pub context: Map<String, Value>,
}

/// Split usage into meters (known meters plus any meter a rule of `card`
/// prices) and a context object. A nested `context` object is lifted one
/// level; meter keys and `context` itself are removed from the context.
pub fn split_usage(usage: &Value, card: &PriceCard) -> SplitUsage {
    let mut split = SplitUsage::default();
    let Value::Object(raw) = usage else {
        return split;
    };

    let allowed: HashSet<&str> = KNOWN_METERS
        .iter()
        .copied()
        .chain(card.rules.iter().map(|r| r.meter.as_str()))
        .collect();

    for (key, value) in raw {
        if !allowed.contains(key.as_str()) {
            continue;
        }
        if let Some(n) = value.as_f64().filter(|n| n.is_finite()) {
            split.meters.insert(key.clone(), n);
        }
    }

    split.context = raw.clone();
    if let Some(Value::Object(nested)) = raw.get("context") {
        for (k, v) in nested {
            split.context.insert(k.clone(), v.clone());
        }
    }
    for key in split.meters.keys() {
        split.context.remove(key);
    }
    split.context.remove("context");

    trace!("Split usage into {} meters and {} context keys", split.meters.len(), split.context.len());
    split
}

/// Ranking metrics of one candidate rule.
#[derive(Debug, Clone, Serialize)]
pub struct RuleScore {
    #[serde(skip)]
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    pub priority: i64,
    pub matched_conditions: usize,
    pub total_conditions: usize,
    pub fully_satisfied_groups: usize,
    pub partially_satisfied_groups: usize,
    pub has_conditions: bool,
}

impl RuleScore {
    fn build(index: usize, rule: &PriceRule, ctx: &Value) -> Self {
        let summary = evaluate_conditions(&rule.conditions, ctx);
        Self {
            index,
            rule_id: rule.id.clone(),
            priority: rule.priority,
            matched_conditions: summary.matched_conditions,
            total_conditions: summary.total_conditions,
            fully_satisfied_groups: summary.fully_satisfied_groups(),
            partially_satisfied_groups: summary.partially_satisfied_groups(),
            has_conditions: summary.total_conditions > 0,
        }
    }

    /// Best rule sorts first.
    fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(other.fully_satisfied_groups.cmp(&self.fully_satisfied_groups))
            .then(other.matched_conditions.cmp(&self.matched_conditions))
            .then(other.total_conditions.cmp(&self.total_conditions))
            .then(self.partially_satisfied_groups.cmp(&other.partially_satisfied_groups))
            .then(other.has_conditions.cmp(&self.has_conditions))
            .then(self.index.cmp(&other.index))
    }
}

/// A rule's metrics plus its 1-based rank among the candidates.
#[derive(Debug, Clone, Serialize)]
pub struct RuleRanking {
    #[serde(flatten)]
    pub score: RuleScore,
    pub selection_rank: usize,
}

fn rank_rules(rules: &[&PriceRule], ctx: &Value) -> Vec<RuleScore> {
    let mut scores: Vec<RuleScore> = rules
        .iter()
        .enumerate()
        .map(|(index, rule)| RuleScore::build(index, rule, ctx))
        .collect();
    scores.sort_by(RuleScore::rank_cmp);
    scores
}

/// Pick the best of `rules` for `ctx`. Callers pass only rules that match.
pub fn select_best_rule<'a>(rules: &[&'a PriceRule], ctx: &Value) -> Option<(&'a PriceRule, RuleScore)> {
    let best = rank_rules(rules, ctx).into_iter().next()?;
    Some((rules[best.index], best))
}

/// Ranking metrics for every rule, in input order.
pub fn explain_rule_selection(rules: &[&PriceRule], ctx: &Value) -> Vec<RuleRanking> {
    let mut rankings: Vec<RuleRanking> = rank_rules(rules, ctx)
        .into_iter()
        .enumerate()
        .map(|(rank, score)| RuleRanking {
            score,
            selection_rank: rank + 1,
        })
        .collect();
    rankings.sort_by_key(|r| r.score.index);
    rankings
}

/// Context used to evaluate rule conditions: request options, then usage
/// context, then meter quantities, later keys overriding earlier ones.
pub fn build_match_context(split: &SplitUsage, options: Option<&Value>) -> Value {
    let mut ctx = Map::new();
    if let Some(Value::Object(opts)) = options {
        ctx.extend(opts.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    ctx.extend(split.context.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (meter, qty) in &split.meters {
        let value = serde_json::Number::from_f64(*qty).map_or(Value::Null, Value::Number);
        ctx.insert(meter.clone(), value);
    }
    Value::Object(ctx)
}

/// Rules of `card` that could price `meter` under `plan` in `ctx`.
pub fn candidate_rules<'a>(card: &'a PriceCard, meter: &str, plan: &str, ctx: &Value) -> Vec<&'a PriceRule> {
    card.rules
        .iter()
        .filter(|r| r.pricing_plan == plan && r.meter == meter)
        .filter(|r| evaluate_conditions(&r.conditions, ctx).is_match())
        .collect()
}

fn price_with_rule(meter: &str, quantity: f64, rule: &PriceRule) -> Result<PricingLine> {
    if rule.unit_size == 0 {
        return Err(Error::pricing(format!("rule for {} has unit_size 0", meter)));
    }
    let billable_units = (quantity / rule.unit_size as f64).ceil() as u64;
    let unit_price_nanos = parse_usd_to_nanos(&rule.price_per_unit)?;
    let line_nanos = billable_units
        .checked_mul(unit_price_nanos)
        .ok_or_else(|| Error::pricing(format!("line cost for {} overflows", meter)))?;

    Ok(PricingLine {
        dimension: meter.to_string(),
        quantity,
        billable_units,
        unit_size: rule.unit_size,
        unit_price_usd: format_usd_from_nanos_exact(unit_price_nanos),
        unit_price_nanos,
        line_cost_usd: format_usd_from_nanos_exact(line_nanos),
        line_nanos,
        bill_mode: "all".to_string(),
        rule_priority: rule.priority,
        rule_id: rule.id.clone(),
    })
}

fn sum_nanos(mut values: impl Iterator<Item = u64>) -> Result<u64> {
    values
        .try_fold(0u64, |acc, n| acc.checked_add(n))
        .ok_or_else(|| Error::pricing("bill total overflows"))
}

/// Price every positive meter in `usage` against `card`.
///
/// Meters without a matching rule are left unbilled. `cost_cents` rounds up.
pub fn compute_bill_summary(
    usage: &Value,
    card: &PriceCard,
    options: Option<&Value>,
    plan: &str,
) -> Result<PricingResult> {
    let split = split_usage(usage, card);
    let ctx = build_match_context(&split, options);

    debug!(
        "Pricing {}/{} under plan {} with {} meters and {} rules",
        card.provider,
        card.model,
        plan,
        split.meters.len(),
        card.rules.len()
    );

    let mut lines = Vec::new();
    for (meter, &quantity) in &split.meters {
        if quantity <= 0.0 {
            continue;
        }

        let candidates = candidate_rules(card, meter, plan, &ctx);
        let Some((rule, score)) = select_best_rule(&candidates, &ctx) else {
            debug!("No price rule for meter {} (quantity {}) under plan {}", meter, quantity, plan);
            continue;
        };
        trace!(
            "Meter {} had {} candidate rules, selected {:?} with priority {} and {}/{} conditions",
            meter,
            candidates.len(),
            rule.id,
            score.priority,
            score.matched_conditions,
            score.total_conditions
        );

        let line = price_with_rule(meter, quantity, rule)?;
        debug!(
            "Priced {} x{} as {} units at {} USD = {} nanos",
            meter, quantity, line.billable_units, line.unit_price_usd, line.line_nanos
        );
        lines.push(line);
    }

    let cost_nanos = sum_nanos(lines.iter().map(|l| l.line_nanos))?;
    debug!("Bill total {} nanos over {} lines", cost_nanos, lines.len());

    Ok(PricingResult {
        cost_nanos,
        cost_usd: nanos_to_usd(cost_nanos),
        cost_usd_str: format_usd_from_nanos_exact(cost_nanos),
        cost_cents: nanos_to_cents_ceil(cost_nanos),
        currency: card.currency.clone(),
        lines,
    })
}

/// Re-derive totals from each line's formatted unit price. `total_cents`
/// rounds down.
pub fn attach_pricing(summary: &PricingResult) -> Result<AttachedPricing> {
    let mut per_line = Vec::with_capacity(summary.lines.len());
    for line in &summary.lines {
        let unit_nanos = parse_usd_to_nanos(&line.unit_price_usd)?;
        let nanos = line
            .billable_units
            .checked_mul(unit_nanos)
            .ok_or_else(|| Error::pricing(format!("line cost for {} overflows", line.dimension)))?;
        per_line.push(nanos);
    }
    let total_nanos = sum_nanos(per_line.into_iter())?;

    Ok(AttachedPricing {
        total_nanos,
        total_usd_str: format_usd_from_nanos_exact(total_nanos),
        total_cents: nanos_to_cents_floor(total_nanos),
        currency: summary.currency.clone(),
        lines: summary
            .lines
            .iter()
            .map(|l| AttachedPricingLine {
                dimension: l.dimension.clone(),
                quantity: l.quantity,
                billable_units: l.billable_units,
                unit_size: l.unit_size,
                unit_price_usd: l.unit_price_usd.clone(),
                line_cost_usd: l.line_cost_usd.clone(),
                line_nanos: l.line_nanos,
            })
            .collect(),
    })
}

/// Copy of `usage` with a `pricing` object attached.
///
/// The plan falls back to `options.pricing_plan`, then `"standard"`.
pub fn compute_bill(usage: &Value, card: &PriceCard, options: Option<&Value>, plan: Option<&str>) -> Result<Value> {
    let plan = plan
        .or_else(|| options.and_then(|o| o.get("pricing_plan")).and_then(Value::as_str))
        .unwrap_or(DEFAULT_PRICING_PLAN);
    let summary = compute_bill_summary(usage, card, options, plan)?;
    let pricing = attach_pricing(&summary)?;

    let mut out = match usage {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    out.insert("pricing".to_string(), serde_json::to_value(pricing)?);
    Ok(Value::Object(out))
}
