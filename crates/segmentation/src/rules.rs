//! Declarative rule evaluation against a single donor.
//!
//! Evaluation is a pure function of (donor snapshot, rule set, as-of
//! instant). Missing or unresolvable field paths yield null and fail
//! closed: every operator except `is_null`/`is_not_null` evaluates to
//! false rather than erroring.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use donorpulse_core::types::Donor;
use donorpulse_core::{EngineError, EngineResult};

use crate::types::{LogicalOperator, Rule, RuleGroup, RuleOperator, SegmentCriteria};

/// Sentinel for "no donation history" — very stale, but never null, so
/// staleness rules match donors who have never given.
const NO_DONATION_SENTINEL: f64 = 9999.0;

#[derive(Debug, Default)]
pub struct RuleEvaluator;

impl RuleEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a rule group against a donor as of now.
    pub fn evaluate(&self, donor: &Donor, group: &RuleGroup) -> bool {
        self.evaluate_at(donor, group, Utc::now())
    }

    /// Evaluate a rule group against a donor at a fixed instant.
    /// Reconciliation threads one `as_of` through a whole cycle so every
    /// donor is judged against the same clock.
    pub fn evaluate_at(&self, donor: &Donor, group: &RuleGroup, as_of: DateTime<Utc>) -> bool {
        // Empty groups are "no constraint" under either operator. An
        // empty disjunction would otherwise qualify nobody.
        if group.rules.is_empty() {
            return true;
        }

        let doc = serde_json::to_value(donor).unwrap_or(Value::Null);
        match group.logical_operator {
            LogicalOperator::And => group
                .rules
                .iter()
                .all(|r| self.evaluate_rule(donor, &doc, r, as_of)),
            LogicalOperator::Or => group
                .rules
                .iter()
                .any(|r| self.evaluate_rule(donor, &doc, r, as_of)),
        }
    }

    /// Overall qualification for a criteria pair:
    /// `include AND NOT exclude`, absent groups imposing no constraint.
    pub fn qualifies(
        &self,
        donor: &Donor,
        criteria: &SegmentCriteria,
        as_of: DateTime<Utc>,
    ) -> bool {
        let included = criteria
            .include
            .as_ref()
            .map(|g| self.evaluate_at(donor, g, as_of))
            .unwrap_or(true);
        if !included {
            return false;
        }
        let excluded = criteria
            .exclude
            .as_ref()
            .map(|g| self.evaluate_at(donor, g, as_of))
            .unwrap_or(false);
        !excluded
    }

    fn evaluate_rule(&self, donor: &Donor, doc: &Value, rule: &Rule, as_of: DateTime<Utc>) -> bool {
        let actual = resolve_field(donor, doc, &rule.field, as_of);

        match rule.operator {
            RuleOperator::IsNull => return actual.is_null(),
            RuleOperator::IsNotNull => return !actual.is_null(),
            _ => {
                if actual.is_null() {
                    debug!(field = %rule.field, "field unresolvable, rule fails closed");
                    return false;
                }
            }
        }

        compare(&actual, rule.operator, &rule.value)
    }
}

/// Resolve a rule field: computed fields first, then dotted-path lookup
/// with bracket indexing into the serialized donor document.
fn resolve_field(donor: &Donor, doc: &Value, field: &str, as_of: DateTime<Utc>) -> Value {
    match field {
        "total_donated" => Value::from(donor.total_donated()),
        "donation_count" => Value::from(donor.donation_count() as u64),
        "days_since_last_donation" => {
            let days = donor
                .last_donation_date()
                .map(|d| (as_of - d).num_days().max(0) as f64)
                .unwrap_or(NO_DONATION_SENTINEL);
            Value::from(days)
        }
        path => lookup_path(doc, path),
    }
}

/// Traverse `a.b.c` paths with `name[idx]` array access. Unresolvable
/// steps return null.
fn lookup_path(doc: &Value, path: &str) -> Value {
    let mut current = doc;
    for segment in path.split('.') {
        let (name, index) = match segment.find('[') {
            Some(open) => {
                let close = match segment.rfind(']') {
                    Some(c) if c > open => c,
                    _ => return Value::Null,
                };
                let idx: usize = match segment[open + 1..close].parse() {
                    Ok(i) => i,
                    Err(_) => return Value::Null,
                };
                (&segment[..open], Some(idx))
            }
            None => (segment, None),
        };

        if !name.is_empty() {
            current = match current.get(name) {
                Some(v) => v,
                None => return Value::Null,
            };
        }
        if let Some(idx) = index {
            current = match current.get(idx) {
                Some(v) => v,
                None => return Value::Null,
            };
        }
    }
    current.clone()
}

fn compare(actual: &Value, operator: RuleOperator, expected: &Value) -> bool {
    match operator {
        RuleOperator::Equals => values_equal(actual, expected),
        RuleOperator::NotEquals => !values_equal(actual, expected),
        RuleOperator::GreaterThan => {
            numeric_cmp(actual, expected).is_some_and(|o| o == std::cmp::Ordering::Greater)
        }
        RuleOperator::LessThan => {
            numeric_cmp(actual, expected).is_some_and(|o| o == std::cmp::Ordering::Less)
        }
        RuleOperator::GreaterEqual => {
            numeric_cmp(actual, expected).is_some_and(|o| o != std::cmp::Ordering::Less)
        }
        RuleOperator::LessEqual => {
            numeric_cmp(actual, expected).is_some_and(|o| o != std::cmp::Ordering::Greater)
        }
        RuleOperator::Contains => {
            stringify(actual).to_lowercase().contains(&stringify(expected).to_lowercase())
        }
        RuleOperator::NotContains => {
            !stringify(actual).to_lowercase().contains(&stringify(expected).to_lowercase())
        }
        RuleOperator::In => expected
            .as_array()
            .is_some_and(|list| list.iter().any(|v| values_equal(actual, v))),
        RuleOperator::NotIn => expected
            .as_array()
            .is_some_and(|list| !list.iter().any(|v| values_equal(actual, v))),
        RuleOperator::Between => match expected.as_array() {
            Some(bounds) if bounds.len() == 2 => {
                match (actual.as_f64(), bounds[0].as_f64(), bounds[1].as_f64()) {
                    (Some(v), Some(lo), Some(hi)) => v >= lo && v <= hi,
                    _ => false,
                }
            }
            _ => false,
        },
        // Handled before compare() is reached.
        RuleOperator::IsNull | RuleOperator::IsNotNull => false,
    }
}

/// Equality that treats 1200 and 1200.0 as the same value.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let a_num = a.as_f64()?;
    let b_num = b.as_f64()?;
    a_num.partial_cmp(&b_num)
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Validate rule operand shapes at segment-definition time so malformed
/// rules surface synchronously instead of silently failing closed.
pub fn validate_rule_group(group: &RuleGroup) -> EngineResult<()> {
    for rule in &group.rules {
        if rule.field.trim().is_empty() {
            return Err(EngineError::Validation("rule field must not be empty".to_string()));
        }
        match rule.operator {
            RuleOperator::Between => {
                let ok = rule
                    .value
                    .as_array()
                    .map(|a| a.len() == 2 && a.iter().all(|v| v.is_number()))
                    .unwrap_or(false);
                if !ok {
                    return Err(EngineError::Validation(format!(
                        "between operator on '{}' requires a 2-element numeric array",
                        rule.field
                    )));
                }
            }
            RuleOperator::In | RuleOperator::NotIn => {
                if !rule.value.is_array() {
                    return Err(EngineError::Validation(format!(
                        "in/not_in operator on '{}' requires an array value",
                        rule.field
                    )));
                }
            }
            _ => {}
        }
    }
    Ok(())
}
