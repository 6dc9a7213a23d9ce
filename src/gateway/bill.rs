use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::pricing::{attach_pricing, compute_bill_summary, PriceCard, PricingResult};

/// Charge for one request. Created empty by the adapter and priced once the
/// call completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bill {
    pub cost_cents: u64,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<PricingResult>,
}

impl Bill {
    pub fn new(currency: impl Into<String>) -> Self {
        Self {
            currency: currency.into(),
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, usage: Value) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_upstream_id(mut self, id: impl Into<String>) -> Self {
        self.upstream_id = Some(id.into());
        self
    }

    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }

    /// Price `usage` with `card`. `cost_cents` takes the rounded-up summary
    /// total and `usage.pricing` carries the rounded-down attached view.
    /// Does nothing without usage.
    pub fn price(&mut self, card: &PriceCard, options: Option<&Value>, plan: &str) -> Result<()> {
        let Some(usage) = self.usage.as_mut() else {
            return Ok(());
        };

        let summary = compute_bill_summary(usage, card, options, plan)?;
        let attached = attach_pricing(&summary)?;
        if let Value::Object(map) = usage {
            map.insert("pricing".to_string(), serde_json::to_value(&attached)?);
        }

        self.cost_cents = summary.cost_cents;
        self.currency = summary.currency.clone();
        self.pricing = Some(summary);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::PriceRule;
    use serde_json::json;

    fn card() -> PriceCard {
        PriceCard::new("openai", "gpt-4o", "chat")
            .with_rule(PriceRule::new("input_text_tokens", 1, "0.0000025"))
            .with_rule(PriceRule::new("output_text_tokens", 1, "0.00001"))
    }

    #[test]
    fn test_price_fills_both_views() {
        let mut bill = Bill::new("USD").with_usage(json!({ "input_text_tokens": 1000, "output_text_tokens": 500 }));
        bill.price(&card(), None, "standard").unwrap();

        assert_eq!(bill.cost_cents, 1);
        assert_eq!(bill.pricing.as_ref().unwrap().cost_nanos, 7_500_000);
        let usage = bill.usage.unwrap();
        assert_eq!(usage["pricing"]["total_cents"], json!(0));
        assert_eq!(usage["input_text_tokens"], json!(1000));
    }

    #[test]
    fn test_price_without_usage_is_noop() {
        let mut bill = Bill::new("USD").with_finish_reason("stop");
        bill.price(&card(), None, "standard").unwrap();
        assert_eq!(bill.cost_cents, 0);
        assert!(bill.pricing.is_none());
    }

    #[test]
    fn test_serialized_shape() {
        let bill = Bill::new("USD").with_upstream_id("chatcmpl-1");
        let json = serde_json::to_value(&bill).unwrap();
        assert_eq!(json, json!({ "cost_cents": 0, "currency": "USD", "upstream_id": "chatcmpl-1" }));
    }
}
