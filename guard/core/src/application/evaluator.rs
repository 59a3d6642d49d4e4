// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Policy evaluator - priority-ordered condition matching
//!
//! Pure and side-effect free: given a policy and a tool call it returns a
//! decision and never fails the call. Pathological conditions (bad regex,
//! type mismatches) degrade to non-matches with a diagnostic.

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::domain::policy::{
    Condition, ConditionOperator, Decision, MatchedRule, Policy,
};
use crate::domain::tool_call::ToolCall;

pub struct PolicyEvaluator;

impl PolicyEvaluator {
    /// Decide the action for one tool call.
    ///
    /// Rules are tried in descending priority (declaration order on ties);
    /// the first rule whose every condition matches wins. With no match the
    /// policy default applies.
    pub fn decide(policy: &Policy, tool_call: &ToolCall) -> Decision {
        let context = Self::build_context(policy, tool_call);

        for rule in policy.rules_by_priority() {
            let matched = rule
                .conditions
                .iter()
                .all(|condition| Self::condition_matches(&context, condition));

            if matched {
                debug!(
                    rule = %rule.name,
                    action = %rule.action,
                    tool = %tool_call.tool_name,
                    "Policy rule matched"
                );
                return Decision {
                    action: rule.action,
                    matched_rule: Some(MatchedRule::from_rule(rule)),
                    reason: format!("Matched rule: {}", rule.name),
                };
            }
        }

        debug!(
            action = %policy.default_action,
            tool = %tool_call.tool_name,
            "No policy rule matched, applying default action"
        );
        Decision {
            action: policy.default_action,
            matched_rule: None,
            reason: "No matching rules found".to_string(),
        }
    }

    /// The read-only evaluation context condition fields resolve against.
    fn build_context(policy: &Policy, tool_call: &ToolCall) -> Value {
        json!({
            "toolCall": tool_call,
            "policy": {
                "name": policy.name,
                "version": policy.version,
                "description": policy.description,
            },
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    /// Resolve a dotted path against the context. Each segment selects a
    /// mapping key or a non-negative decimal sequence index; any missing
    /// segment yields `None`.
    fn extract_field<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
        let mut current = context;
        for segment in path.split('.') {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => {
                    let index: usize = segment.parse().ok()?;
                    items.get(index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    fn condition_matches(context: &Value, condition: &Condition) -> bool {
        let Some(extracted) = Self::extract_field(context, &condition.field) else {
            return false;
        };

        match condition.operator {
            ConditionOperator::Equals => values_equal(extracted, &condition.value),
            ConditionOperator::Contains => {
                both_strings(extracted, &condition.value).is_some_and(|(a, b)| a.contains(b))
            }
            ConditionOperator::StartsWith => {
                both_strings(extracted, &condition.value).is_some_and(|(a, b)| a.starts_with(b))
            }
            ConditionOperator::EndsWith => {
                both_strings(extracted, &condition.value).is_some_and(|(a, b)| a.ends_with(b))
            }
            ConditionOperator::Regex => {
                let (Some(haystack), Some(pattern)) =
                    (extracted.as_str(), condition.value.as_str())
                else {
                    return false;
                };
                match regex::Regex::new(pattern) {
                    Ok(re) => re.is_match(haystack),
                    Err(err) => {
                        warn!(field = %condition.field, %err, "Regex condition failed to compile, treating as non-match");
                        false
                    }
                }
            }
            ConditionOperator::In => condition
                .value
                .as_array()
                .is_some_and(|candidates| candidates.iter().any(|c| values_equal(extracted, c))),
            ConditionOperator::Gt => compare_numeric(extracted, &condition.value, |a, b| a > b),
            ConditionOperator::Lt => compare_numeric(extracted, &condition.value, |a, b| a < b),
            ConditionOperator::Gte => compare_numeric(extracted, &condition.value, |a, b| a >= b),
            ConditionOperator::Lte => compare_numeric(extracted, &condition.value, |a, b| a <= b),
        }
    }
}

/// Deep equality with numeric coercion: `100` and `100.0` compare equal,
/// arrays and mappings compare structurally.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

fn both_strings<'a>(a: &'a Value, b: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((a.as_str()?, b.as_str()?))
}

/// Coerce both sides to f64 (strings are parsed); any coercion failure or
/// NaN makes the comparison false.
fn compare_numeric(a: &Value, b: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (to_number(a), to_number(b)) {
        (Some(a), Some(b)) if !a.is_nan() && !b.is_nan() => cmp(a, b),
        _ => false,
    }
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
