pub mod catalog;
pub mod conditions;
pub mod engine;
pub mod money;
pub mod types;

pub use catalog::{PriceCatalog, StaticPriceCatalog};
pub use conditions::{evaluate_conditions, matches_conditions, ConditionSummary};
pub use engine::{
    attach_pricing, build_match_context, candidate_rules, compute_bill, compute_bill_summary, explain_rule_selection,
    select_best_rule, split_usage, RuleRanking, RuleScore, SplitUsage, DEFAULT_PRICING_PLAN, KNOWN_METERS,
};
pub use types::{AttachedPricing, Condition, ConditionOp, PriceCard, PriceRule, PricingLine, PricingResult};
