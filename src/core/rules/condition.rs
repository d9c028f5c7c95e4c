//! Condition trees for permission rules
//!
//! A condition is either a simple leaf (`{ field, operator, value }`) or a
//! compound node (`{ logic: "AND" | "OR", conditions: [...] }`) nesting
//! further conditions. Trees are evaluated against a flat entity record.
//!
//! Evaluation is total for malformed input: a leaf without field or operator,
//! an unknown operator or an ill-shaped `in`/`between` value simply does not
//! match. Only unparseable dates on temporal fields produce an [`EvalError`].

use super::temporal;
use crate::core::error::EvalError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Flat key-value view of an entity (lead, contact, task, appointment)
pub type Record = serde_json::Map<String, Value>;

/// Nesting limit used when no explicit limit is configured
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Comparison operator of a simple condition
///
/// Serialized as its wire name (`">"`, `"contains"`, ...). Names that are not
/// recognised deserialize to [`Operator::Unknown`] and never match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Operator {
    GreaterThan,
    LessThan,
    Equals,
    NotEquals,
    Contains,
    StartsWith,
    EndsWith,
    In,
    Between,
    IsEmpty,
    IsNotEmpty,
    Unknown(String),
}

impl Operator {
    pub fn as_str(&self) -> &str {
        match self {
            Operator::GreaterThan => ">",
            Operator::LessThan => "<",
            Operator::Equals => "=",
            Operator::NotEquals => "!=",
            Operator::Contains => "contains",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::In => "in",
            Operator::Between => "between",
            Operator::IsEmpty => "is_empty",
            Operator::IsNotEmpty => "is_not_empty",
            Operator::Unknown(name) => name,
        }
    }
}

impl From<String> for Operator {
    fn from(name: String) -> Self {
        match name.as_str() {
            ">" => Operator::GreaterThan,
            "<" => Operator::LessThan,
            "=" => Operator::Equals,
            "!=" => Operator::NotEquals,
            "contains" => Operator::Contains,
            "starts_with" => Operator::StartsWith,
            "ends_with" => Operator::EndsWith,
            "in" => Operator::In,
            "between" => Operator::Between,
            "is_empty" => Operator::IsEmpty,
            "is_not_empty" => Operator::IsNotEmpty,
            _ => Operator::Unknown(name),
        }
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        match op {
            Operator::Unknown(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

/// Boolean connective of a compound condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Logic {
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

/// Leaf condition comparing one entity field against a rule value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimpleCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<Operator>,
    #[serde(default)]
    pub value: Value,
}

/// AND/OR node over child conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundCondition {
    pub logic: Logic,
    pub conditions: Vec<Condition>,
}

/// A condition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Compound(CompoundCondition),
    Simple(SimpleCondition),
}

impl Condition {
    /// Create a simple leaf condition
    pub fn simple(field: impl Into<String>, operator: &str, value: Value) -> Self {
        Condition::Simple(SimpleCondition {
            field: Some(field.into()),
            operator: Some(Operator::from(operator.to_string())),
            value,
        })
    }

    /// Conjunction of the given conditions
    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::Compound(CompoundCondition {
            logic: Logic::And,
            conditions,
        })
    }

    /// Disjunction of the given conditions
    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Compound(CompoundCondition {
            logic: Logic::Or,
            conditions,
        })
    }

    /// Nesting depth of the tree (a lone leaf has depth 1)
    pub fn depth(&self) -> usize {
        match self {
            Condition::Simple(_) => 1,
            Condition::Compound(node) => {
                1 + node.conditions.iter().map(Condition::depth).max().unwrap_or(0)
            }
        }
    }

    /// Every leaf of the tree, depth first
    pub fn leaves(&self) -> Vec<&SimpleCondition> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Condition::Simple(leaf) => out.push(leaf),
                Condition::Compound(compound) => stack.extend(compound.conditions.iter().rev()),
            }
        }
        out
    }

    /// Evaluate against an entity using the current wall clock
    pub fn evaluate(&self, entity: &Record) -> Result<bool, EvalError> {
        ConditionEvaluator::new(Utc::now()).evaluate(self, entity)
    }

    /// Evaluate, treating any evaluation error as a non-match
    pub fn matches(&self, entity: &Record) -> bool {
        self.evaluate(entity).unwrap_or(false)
    }
}

/// Evaluates condition trees at a fixed instant
///
/// Relative thresholds (`"24 hours ago"`) are resolved against `now`, so a
/// single evaluator gives every rule of one access check the same clock.
#[derive(Debug, Clone, Copy)]
pub struct ConditionEvaluator {
    now: DateTime<Utc>,
    max_depth: usize,
}

impl ConditionEvaluator {
    pub fn new(now: DateTime<Utc>) -> Self {
        ConditionEvaluator {
            now,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Trees nested deeper than `max_depth` evaluate to false
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn evaluate(&self, condition: &Condition, entity: &Record) -> Result<bool, EvalError> {
        self.evaluate_node(condition, entity, 1)
    }

    fn evaluate_node(
        &self,
        condition: &Condition,
        entity: &Record,
        depth: usize,
    ) -> Result<bool, EvalError> {
        if depth > self.max_depth {
            warn!(max_depth = self.max_depth, "condition tree exceeds depth limit");
            return Ok(false);
        }

        match condition {
            Condition::Simple(leaf) => self.evaluate_simple(leaf, entity),
            Condition::Compound(node) => match node.logic {
                Logic::And => {
                    for child in &node.conditions {
                        if !self.evaluate_node(child, entity, depth + 1)? {
                            return Ok(false);
                        }
                    }
                    Ok(true)
                }
                Logic::Or => {
                    for child in &node.conditions {
                        if self.evaluate_node(child, entity, depth + 1)? {
                            return Ok(true);
                        }
                    }
                    Ok(false)
                }
            },
        }
    }

    fn evaluate_simple(&self, leaf: &SimpleCondition, entity: &Record) -> Result<bool, EvalError> {
        let (field, operator) = match (leaf.field.as_deref(), leaf.operator.as_ref()) {
            (Some(field), Some(operator)) => (field, operator),
            _ => return Ok(false),
        };

        let actual = entity.get(field).unwrap_or(&Value::Null);
        let expected = &leaf.value;

        let matched = match operator {
            Operator::GreaterThan | Operator::LessThan => {
                let ordering = if temporal::is_temporal_field(field) {
                    self.compare_temporal(field, actual, expected)?
                } else {
                    compare_values(actual, expected)
                };
                match (operator, ordering) {
                    (Operator::GreaterThan, Some(ord)) => ord == Ordering::Greater,
                    (Operator::LessThan, Some(ord)) => ord == Ordering::Less,
                    _ => false,
                }
            }
            Operator::Equals => strict_eq(actual, expected),
            Operator::NotEquals => !strict_eq(actual, expected),
            Operator::Contains => text_match(actual, expected, |a, e| a.contains(e)),
            Operator::StartsWith => text_match(actual, expected, |a, e| a.starts_with(e)),
            Operator::EndsWith => text_match(actual, expected, |a, e| a.ends_with(e)),
            Operator::In => match expected {
                Value::Array(items) => items.iter().any(|item| strict_eq(actual, item)),
                _ => false,
            },
            Operator::Between => match expected.as_array().map(Vec::as_slice) {
                Some([low, high]) => {
                    matches!(
                        compare_values(actual, low),
                        Some(Ordering::Greater | Ordering::Equal)
                    ) && matches!(
                        compare_values(actual, high),
                        Some(Ordering::Less | Ordering::Equal)
                    )
                }
                _ => false,
            },
            Operator::IsEmpty => is_empty(actual),
            Operator::IsNotEmpty => !is_empty(actual),
            Operator::Unknown(name) => {
                debug!(operator = %name, field, "unknown condition operator");
                false
            }
        };

        Ok(matched)
    }

    /// Compare a temporal entity field against a time threshold
    ///
    /// A null or missing entity value never compares; an unparseable one is
    /// an error.
    fn compare_temporal(
        &self,
        field: &str,
        actual: &Value,
        expected: &Value,
    ) -> Result<Option<Ordering>, EvalError> {
        if actual.is_null() {
            return Ok(None);
        }

        let instant =
            temporal::instant_from_value(actual).ok_or_else(|| EvalError::InvalidDate {
                field: field.to_string(),
                value: actual.to_string(),
            })?;

        let threshold = temporal::threshold_from_value(expected, self.now).ok_or_else(|| {
            EvalError::InvalidThreshold {
                field: field.to_string(),
                value: expected.to_string(),
            }
        })?;

        Ok(Some(instant.cmp(&threshold)))
    }
}

/// Strict equality: no coercion between types, numbers compared by value
fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Ordering used by `>`, `<` and `between`
///
/// Numbers compare numerically, strings lexicographically, booleans with
/// `false < true`. A number against a string compares numerically when the
/// string parses as a number. Anything else (null, arrays, objects, mixed
/// kinds) is incomparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::String(y)) => x.as_f64()?.partial_cmp(&y.trim().parse::<f64>().ok()?),
        (Value::String(x), Value::Number(y)) => {
            x.trim().parse::<f64>().ok()?.partial_cmp(&y.as_f64()?)
        }
        _ => None,
    }
}

/// Largest magnitude at which every integer is exactly representable in f64
const MAX_EXACT_F64: f64 = 9_007_199_254_740_992.0;

/// Lower-cased text form of a scalar. Integral floats print without `.0`.
// Null and containers have no text form, so text operators on them are
// false rather than matching against "null".
fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_lowercase()),
        Value::Number(n) => Some(match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < MAX_EXACT_F64 => {
                (f as i64).to_string()
            }
            _ => n.to_string(),
        }),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn text_match(actual: &Value, expected: &Value, test: impl Fn(&str, &str) -> bool) -> bool {
    match (as_text(actual), as_text(expected)) {
        (Some(a), Some(e)) => test(&a, &e),
        _ => false,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
