use std::sync::Arc;

use serde_json::Value;

use crate::gateway::adapter::ProviderAdapter;
use crate::health::ProviderHealth;
use crate::pricing::PriceCard;

/// A provider able to serve the requested (model, endpoint).
#[derive(Clone)]
pub struct RoutingCandidate {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub provider_id: Option<String>,
    /// Static share of traffic; values <= 0 count as 1.
    pub base_weight: f64,
    pub byok: Option<Value>,
    pub provider_model_slug: Option<String>,
    /// Filled lazily by the orchestrator on first use.
    pub price_card: Option<Arc<PriceCard>>,
}

impl RoutingCandidate {
    pub fn new(adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self {
            adapter,
            provider_id: None,
            base_weight: 1.0,
            byok: None,
            provider_model_slug: None,
            price_card: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.base_weight = weight;
        self
    }

    pub fn with_price_card(mut self, card: Arc<PriceCard>) -> Self {
        self.price_card = Some(card);
        self
    }

    pub fn with_byok(mut self, byok: Value) -> Self {
        self.byok = Some(byok);
        self
    }

    pub fn with_model_slug(mut self, slug: impl Into<String>) -> Self {
        self.provider_model_slug = Some(slug.into());
        self
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    pub(crate) fn effective_weight(&self) -> f64 {
        let weight = if self.base_weight > 0.0 { self.base_weight } else { 1.0 };
        weight.max(1e-4)
    }
}

impl std::fmt::Debug for RoutingCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingCandidate")
            .field("provider", &self.name())
            .field("base_weight", &self.base_weight)
            .field("has_price_card", &self.price_card.is_some())
            .finish()
    }
}

/// A ranked candidate with the score and health snapshot it was ranked by.
#[derive(Debug, Clone)]
pub struct RoutedChoice {
    pub candidate: RoutingCandidate,
    pub score: f64,
    pub health: ProviderHealth,
}

/// Caller restrictions from the request body's `provider` object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteHints {
    pub only: Vec<String>,
    pub ignore: Vec<String>,
}

impl RouteHints {
    /// Read `provider.only` and `provider.ignore`; non-string entries are dropped.
    pub fn from_body(body: &Value) -> Self {
        let list = |field: &str| -> Vec<String> {
            body.get("provider")
                .and_then(|p| p.get(field))
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default()
        };
        Self {
            only: list("only"),
            ignore: list("ignore"),
        }
    }

    /// Apply the hints, keeping the full pool if nothing survives.
    pub fn filter<'a>(&self, candidates: &'a [RoutingCandidate]) -> Vec<&'a RoutingCandidate> {
        let filtered: Vec<&RoutingCandidate> = candidates
            .iter()
            .filter(|c| self.only.is_empty() || self.only.iter().any(|n| n == c.name()))
            .filter(|c| !self.ignore.iter().any(|n| n == c.name()))
            .collect();
        if filtered.is_empty() {
            candidates.iter().collect()
        } else {
            filtered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::adapter::testing::ScriptedAdapter;
    use serde_json::json;

    fn pool() -> Vec<RoutingCandidate> {
        ["openai", "azure", "groq"]
            .iter()
            .map(|n| RoutingCandidate::new(Arc::new(ScriptedAdapter::succeeding(n))))
            .collect()
    }

    fn names(list: &[&RoutingCandidate]) -> Vec<String> {
        list.iter().map(|c| c.name().to_string()).collect()
    }

    #[test]
    fn test_hints_from_body() {
        let hints = RouteHints::from_body(&json!({ "provider": { "only": ["openai", 3], "ignore": ["groq"] } }));
        assert_eq!(hints.only, vec!["openai"]);
        assert_eq!(hints.ignore, vec!["groq"]);
        assert_eq!(RouteHints::from_body(&json!({ "model": "x" })), RouteHints::default());
    }

    #[test]
    fn test_hint_filtering() {
        let pool = pool();
        let only = RouteHints { only: vec!["azure".into(), "groq".into()], ignore: vec![] };
        assert_eq!(names(&only.filter(&pool)), vec!["azure", "groq"]);

        let both = RouteHints { only: vec!["azure".into(), "groq".into()], ignore: vec!["groq".into()] };
        assert_eq!(names(&both.filter(&pool)), vec!["azure"]);

        let empty = RouteHints { only: vec!["mistral".into()], ignore: vec![] };
        assert_eq!(names(&empty.filter(&pool)), vec!["openai", "azure", "groq"]);
    }

    #[test]
    fn test_effective_weight() {
        let adapter: Arc<dyn ProviderAdapter> = Arc::new(ScriptedAdapter::succeeding("a"));
        assert_eq!(RoutingCandidate::new(adapter.clone()).with_weight(0.0).effective_weight(), 1.0);
        assert_eq!(RoutingCandidate::new(adapter.clone()).with_weight(-2.0).effective_weight(), 1.0);
        assert_eq!(RoutingCandidate::new(adapter.clone()).with_weight(3.0).effective_weight(), 3.0);
        assert_eq!(RoutingCandidate::new(adapter).with_weight(1e-9).effective_weight(), 1e-4);
    }
}
