use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::trace;

use crate::pricing::types::{Condition, ConditionOp};

/// Result of evaluating one condition.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionEvaluation {
    pub index: usize,
    pub matches: bool,
    pub group: i64,
    pub explicit_group: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub group: i64,
    pub total: usize,
    pub matched: usize,
    pub contains_implicit: bool,
}

impl GroupSummary {
    pub fn is_satisfied(&self) -> bool {
        self.total > 0 && self.matched == self.total
    }

    pub fn is_partial(&self) -> bool {
        self.matched > 0 && self.matched < self.total
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConditionSummary {
    pub total_conditions: usize,
    pub matched_conditions: usize,
    pub has_explicit_groups: bool,
    pub evaluations: Vec<ConditionEvaluation>,
    /// Groups in order of first appearance.
    pub groups: Vec<GroupSummary>,
}

impl ConditionSummary {
    pub fn fully_satisfied_groups(&self) -> usize {
        self.groups.iter().filter(|g| g.is_satisfied()).count()
    }

    pub fn partially_satisfied_groups(&self) -> usize {
        self.groups.iter().filter(|g| g.is_partial()).count()
    }

    /// AND over all conditions without explicit groups, OR-of-ANDs with them.
    pub fn is_match(&self) -> bool {
        if self.total_conditions == 0 {
            return true;
        }
        if !self.has_explicit_groups {
            return self.matched_conditions == self.total_conditions;
        }
        self.groups.iter().any(|g| g.matched == g.total)
    }
}

/// Resolve a dot-delimited path. Numeric segments index into arrays.
pub fn get_by_path<'a>(ctx: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut cur = ctx;
    for part in path.split('.') {
        cur = match cur {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Numeric coercion used by the ordering operators.
///
/// `null` is 0, booleans are 0/1, blank strings are 0; anything else that
/// does not parse yields `None` and the comparison fails.
fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(0.0),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                Some(0.0)
            } else {
                s.parse::<f64>().ok().filter(|n| !n.is_nan())
            }
        }
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Identity-style equality: numbers compare by value, containers never match.
fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Null, Value::Null) => true,
        _ => false,
    }
}

fn compare(actual: Option<&Value>, expected: &Value, cmp: fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(to_number), to_number(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn list_contains(list: &Value, actual: Option<&Value>) -> Option<bool> {
    let items = list.as_array()?;
    Some(actual.map_or(false, |v| items.iter().any(|item| strict_eq(item, v))))
}

fn pattern_source(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn eval_condition(cond: &Condition, ctx: &Value) -> bool {
    let actual = get_by_path(ctx, &cond.path);
    match cond.op {
        ConditionOp::Exists => actual.is_some(),
        ConditionOp::NotExists => actual.is_none(),
        ConditionOp::Eq => actual.map_or(false, |v| strict_eq(v, &cond.value)),
        ConditionOp::Ne => actual.map_or(true, |v| !strict_eq(v, &cond.value)),
        ConditionOp::Lt => compare(actual, &cond.value, |a, b| a < b),
        ConditionOp::Lte => compare(actual, &cond.value, |a, b| a <= b),
        ConditionOp::Gt => compare(actual, &cond.value, |a, b| a > b),
        ConditionOp::Gte => compare(actual, &cond.value, |a, b| a >= b),
        ConditionOp::In => list_contains(&cond.value, actual).unwrap_or(false),
        ConditionOp::NotIn => list_contains(&cond.value, actual).map_or(false, |found| !found),
        ConditionOp::StartsWith => match (actual, &cond.value) {
            (Some(Value::String(s)), Value::String(prefix)) => s.starts_with(prefix.as_str()),
            _ => false,
        },
        ConditionOp::Regex => match Regex::new(&pattern_source(&cond.value)) {
            Ok(re) => matches!(actual, Some(Value::String(s)) if re.is_match(s)),
            Err(e) => {
                trace!("Ignoring invalid pricing regex on {}: {}", cond.path, e);
                false
            }
        },
    }
}

/// Evaluate every condition and group the results.
///
/// When any condition names an `or_group`, ungrouped conditions fall into
/// group 1. Otherwise each condition forms its own group `i + 1`.
pub fn evaluate_conditions(conditions: &[Condition], ctx: &Value) -> ConditionSummary {
    if conditions.is_empty() {
        return ConditionSummary::default();
    }

    let has_explicit_groups = conditions.iter().any(|c| c.or_group.is_some());
    let mut summary = ConditionSummary {
        total_conditions: conditions.len(),
        has_explicit_groups,
        ..Default::default()
    };

    for (index, condition) in conditions.iter().enumerate() {
        let matches = eval_condition(condition, ctx);
        let explicit_group = condition.or_group.is_some();
        let group = match condition.or_group {
            Some(g) => g,
            None if has_explicit_groups => 1,
            None => index as i64 + 1,
        };

        if matches {
            summary.matched_conditions += 1;
        }

        match summary.groups.iter_mut().find(|g| g.group == group) {
            Some(stats) => {
                stats.total += 1;
                stats.matched += usize::from(matches);
                stats.contains_implicit |= !explicit_group;
            }
            None => summary.groups.push(GroupSummary {
                group,
                total: 1,
                matched: usize::from(matches),
                contains_implicit: !explicit_group,
            }),
        }

        summary.evaluations.push(ConditionEvaluation {
            index,
            matches,
            group,
            explicit_group,
        });
    }

    summary
}

pub fn matches_conditions(conditions: &[Condition], ctx: &Value) -> bool {
    evaluate_conditions(conditions, ctx).is_match()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cond(path: &str, op: ConditionOp, value: Value) -> Condition {
        Condition::new(path, op, value)
    }

    #[test]
    fn test_get_by_path() {
        let ctx = json!({ "a": { "b": [10, { "c": "x" }] }, "n": null });
        assert_eq!(get_by_path(&ctx, "a.b.0"), Some(&json!(10)));
        assert_eq!(get_by_path(&ctx, "a.b.1.c"), Some(&json!("x")));
        assert_eq!(get_by_path(&ctx, "n"), Some(&Value::Null));
        assert_eq!(get_by_path(&ctx, "n.deeper"), None);
        assert_eq!(get_by_path(&ctx, "a.missing"), None);
        assert_eq!(get_by_path(&ctx, ""), None);
    }

    #[test]
    fn test_exists_treats_null_as_present() {
        let ctx = json!({ "tier": null });
        assert!(eval_condition(&cond("tier", ConditionOp::Exists, Value::Null), &ctx));
        assert!(!eval_condition(&cond("tier", ConditionOp::NotExists, Value::Null), &ctx));
        assert!(eval_condition(&cond("region", ConditionOp::NotExists, Value::Null), &ctx));
    }

    #[test]
    fn test_equality() {
        let ctx = json!({ "tier": "batch", "n": 5, "f": 5.0 });
        assert!(eval_condition(&cond("tier", ConditionOp::Eq, json!("batch")), &ctx));
        assert!(!eval_condition(&cond("tier", ConditionOp::Eq, json!("flex")), &ctx));
        assert!(eval_condition(&cond("n", ConditionOp::Eq, json!(5.0)), &ctx));
        assert!(eval_condition(&cond("f", ConditionOp::Eq, json!(5)), &ctx));
        assert!(!eval_condition(&cond("n", ConditionOp::Eq, json!("5")), &ctx));
        assert!(!eval_condition(&cond("missing", ConditionOp::Eq, Value::Null), &ctx));
        assert!(eval_condition(&cond("missing", ConditionOp::Ne, json!("x")), &ctx));
        assert!(eval_condition(&cond("tier", ConditionOp::Ne, json!("flex")), &ctx));
    }

    #[test]
    fn test_numeric_comparisons_coerce() {
        let ctx = json!({ "tokens": 200_000, "s": "150", "blank": "", "flag": true, "word": "many" });
        assert!(eval_condition(&cond("tokens", ConditionOp::Gt, json!(128_000)), &ctx));
        assert!(eval_condition(&cond("tokens", ConditionOp::Gte, json!("200000")), &ctx));
        assert!(!eval_condition(&cond("tokens", ConditionOp::Lt, json!(128_000)), &ctx));
        assert!(eval_condition(&cond("s", ConditionOp::Lte, json!(150)), &ctx));
        assert!(eval_condition(&cond("blank", ConditionOp::Lt, json!(1)), &ctx));
        assert!(eval_condition(&cond("flag", ConditionOp::Gte, json!(1)), &ctx));
        assert!(!eval_condition(&cond("word", ConditionOp::Gt, json!(0)), &ctx));
        assert!(!eval_condition(&cond("missing", ConditionOp::Lt, json!(10)), &ctx));
    }

    #[test]
    fn test_membership_and_strings() {
        let ctx = json!({ "region": "eu-west-1", "n": 2 });
        let regions = json!(["eu-west-1", "eu-central-1"]);
        assert!(eval_condition(&cond("region", ConditionOp::In, regions.clone()), &ctx));
        assert!(!eval_condition(&cond("region", ConditionOp::NotIn, regions), &ctx));
        assert!(eval_condition(&cond("n", ConditionOp::In, json!([1, 2.0])), &ctx));
        assert!(!eval_condition(&cond("region", ConditionOp::In, json!("eu-west-1")), &ctx));
        assert!(!eval_condition(&cond("region", ConditionOp::NotIn, json!("us")), &ctx));
        assert!(eval_condition(&cond("missing", ConditionOp::NotIn, json!(["a"])), &ctx));

        assert!(eval_condition(&cond("region", ConditionOp::StartsWith, json!("eu-")), &ctx));
        assert!(!eval_condition(&cond("n", ConditionOp::StartsWith, json!("2")), &ctx));
        assert!(eval_condition(&cond("region", ConditionOp::Regex, json!("^eu-(west|central)-\\d$")), &ctx));
        assert!(!eval_condition(&cond("region", ConditionOp::Regex, json!("([")), &ctx));
        assert!(!eval_condition(&cond("n", ConditionOp::Regex, json!("2")), &ctx));
    }

    #[test]
    fn test_implicit_groups_are_and() {
        let conds = vec![
            cond("tier", ConditionOp::Eq, json!("batch")),
            cond("region", ConditionOp::Exists, Value::Null),
        ];
        let partial = json!({ "tier": "batch" });
        let full = json!({ "tier": "batch", "region": "us" });

        let summary = evaluate_conditions(&conds, &partial);
        assert!(!summary.has_explicit_groups);
        assert_eq!(summary.groups.iter().map(|g| g.group).collect::<Vec<_>>(), vec![1, 2]);
        assert!(!summary.is_match());
        assert!(matches_conditions(&conds, &full));
        assert!(matches_conditions(&[], &partial));
    }

    #[test]
    fn test_explicit_groups_are_or_of_ands() {
        let conds = vec![
            cond("tier", ConditionOp::Eq, json!("batch")).in_group(2),
            cond("hours", ConditionOp::Gte, json!(1)).in_group(2),
            cond("tier", ConditionOp::Eq, json!("flex")).in_group(3),
            cond("region", ConditionOp::Eq, json!("us")),
        ];

        let ctx = json!({ "tier": "batch", "hours": 4 });
        let summary = evaluate_conditions(&conds, &ctx);
        assert!(summary.has_explicit_groups);
        assert_eq!(summary.groups.len(), 3);
        let implicit = summary.groups.iter().find(|g| g.group == 1).unwrap();
        assert!(implicit.contains_implicit);
        assert_eq!(summary.fully_satisfied_groups(), 1);
        assert!(summary.is_match());

        let region_only = json!({ "region": "us", "tier": "other" });
        assert!(matches_conditions(&conds, &region_only));
        assert!(!matches_conditions(&conds, &json!({ "tier": "other" })));
    }
}
