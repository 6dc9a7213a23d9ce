use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::pricing::money;

/// Comparison applied by a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Exists,
    NotExists,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    StartsWith,
    Regex,
}

/// One predicate of a price rule's `match` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Dot-delimited lookup into the pricing context.
    pub path: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub or_group: Option<i64>,
}

impl Condition {
    pub fn new(path: impl Into<String>, op: ConditionOp, value: Value) -> Self {
        Self {
            path: path.into(),
            op,
            value,
            or_group: None,
        }
    }

    pub fn in_group(mut self, group: i64) -> Self {
        self.or_group = Some(group);
        self
    }
}

fn default_priority() -> i64 {
    100
}

fn default_plan() -> String {
    "standard".to_string()
}

/// Price of one meter under one plan, optionally restricted by conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "default_plan")]
    pub pricing_plan: String,
    pub meter: String,
    pub unit_size: u64,
    /// Exact decimal USD amount per `unit_size` units.
    pub price_per_unit: String,
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default, rename = "match")]
    pub conditions: Vec<Condition>,
}

impl PriceRule {
    pub fn new(meter: impl Into<String>, unit_size: u64, price_per_unit: impl Into<String>) -> Self {
        Self {
            id: None,
            pricing_plan: default_plan(),
            meter: meter.into(),
            unit_size,
            price_per_unit: price_per_unit.into(),
            priority: default_priority(),
            conditions: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.pricing_plan = plan.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.unit_size == 0 {
            return Err(Error::validation(format!(
                "rule {} for meter {} has unit_size 0",
                self.id.as_deref().unwrap_or("<unnamed>"),
                self.meter
            )));
        }
        if self.meter.is_empty() {
            return Err(Error::validation("price rule has an empty meter"));
        }
        money::parse_usd_to_nanos(&self.price_per_unit)?;
        Ok(())
    }
}

fn default_currency() -> String {
    "USD".to_string()
}

/// All rules that price one (provider, model, endpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceCard {
    pub provider: String,
    pub model: String,
    pub endpoint: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rules: Vec<PriceRule>,
}

impl PriceCard {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            endpoint: endpoint.into(),
            currency: default_currency(),
            effective_from: None,
            effective_to: None,
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: PriceRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Whether the card applies at `at` (`effective_to` is exclusive).
    pub fn is_effective_at(&self, at: DateTime<Utc>) -> bool {
        self.effective_from.map_or(true, |from| from <= at) && self.effective_to.map_or(true, |to| at < to)
    }

    pub fn validate(&self) -> Result<()> {
        if self.provider.is_empty() || self.model.is_empty() || self.endpoint.is_empty() {
            return Err(Error::validation("price card needs provider, model and endpoint"));
        }
        if let (Some(from), Some(to)) = (self.effective_from, self.effective_to) {
            if to <= from {
                return Err(Error::validation(format!(
                    "price card {}/{}/{} ends before it starts",
                    self.provider, self.model, self.endpoint
                )));
            }
        }
        for rule in &self.rules {
            rule.validate()?;
        }
        Ok(())
    }
}

/// One billed meter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingLine {
    pub dimension: String,
    pub quantity: f64,
    pub billable_units: u64,
    pub unit_size: u64,
    pub unit_price_usd: String,
    pub unit_price_nanos: u64,
    pub line_cost_usd: String,
    pub line_nanos: u64,
    pub bill_mode: String,
    pub rule_priority: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
}

/// Bill summary; `cost_cents` rounds up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingResult {
    pub cost_nanos: u64,
    pub cost_usd: f64,
    pub cost_usd_str: String,
    pub cost_cents: u64,
    pub currency: String,
    pub lines: Vec<PricingLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedPricingLine {
    pub dimension: String,
    pub quantity: f64,
    pub billable_units: u64,
    pub unit_size: u64,
    pub unit_price_usd: String,
    pub line_cost_usd: String,
    pub line_nanos: u64,
}

/// The `pricing` object attached onto usage; `total_cents` rounds down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachedPricing {
    pub total_nanos: u64,
    pub total_usd_str: String,
    pub total_cents: u64,
    pub currency: String,
    pub lines: Vec<AttachedPricingLine>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rule_defaults_from_json() {
        let rule: PriceRule = serde_json::from_value(json!({
            "meter": "input_text_tokens",
            "unit_size": 1,
            "price_per_unit": "0.0000025"
        }))
        .unwrap();
        assert_eq!(rule.priority, 100);
        assert_eq!(rule.pricing_plan, "standard");
        assert!(rule.conditions.is_empty());
    }

    #[test]
    fn test_condition_json_shape() {
        let rule: PriceRule = serde_json::from_value(json!({
            "id": "batch",
            "meter": "output_text_tokens",
            "unit_size": 1000,
            "price_per_unit": "0.01",
            "match": [
                { "path": "service_tier", "op": "eq", "value": "batch", "or_group": 2 },
                { "path": "region", "op": "exists" }
            ]
        }))
        .unwrap();
        assert_eq!(rule.conditions.len(), 2);
        assert_eq!(rule.conditions[0].op, ConditionOp::Eq);
        assert_eq!(rule.conditions[0].or_group, Some(2));
        assert_eq!(rule.conditions[1].value, Value::Null);
    }

    #[test]
    fn test_rule_validation() {
        assert!(PriceRule::new("requests", 1, "0.001").validate().is_ok());
        assert!(PriceRule::new("requests", 0, "0.001").validate().is_err());
        assert!(PriceRule::new("requests", 1, "abc").validate().is_err());
        assert!(PriceRule::new("requests", 1, "-1").validate().is_err());
    }

    #[test]
    fn test_effective_window() {
        let mut card = PriceCard::new("openai", "gpt-4o", "chat.completions");
        let jan: DateTime<Utc> = "2025-01-01T00:00:00Z".parse().unwrap();
        let feb: DateTime<Utc> = "2025-02-01T00:00:00Z".parse().unwrap();
        let mid: DateTime<Utc> = "2025-01-15T00:00:00Z".parse().unwrap();
        assert!(card.is_effective_at(mid));

        card.effective_from = Some(jan);
        card.effective_to = Some(feb);
        assert!(card.is_effective_at(jan));
        assert!(card.is_effective_at(mid));
        assert!(!card.is_effective_at(feb));
        assert!(card.validate().is_ok());

        card.effective_to = Some(jan);
        assert!(card.validate().is_err());
    }
}
