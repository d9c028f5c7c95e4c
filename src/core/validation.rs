//! Validation for rule definitions
//!
//! Runs before a rule reaches the store. Field-level limits come from the
//! `validator` derives on [`RuleConfig`] and [`RuleUpdate`]; the checks here
//! cover what those cannot express:
//! - the subject type must name a known entity kind
//! - the condition tree must not exceed the configured depth
//! - every leaf needs a field and a recognised operator
//! - `in` takes an array, `between` an array of exactly two bounds
//!
//! Evaluation itself stays total for malformed trees; these checks only
//! keep such trees out of newly written rules.

use crate::core::error::{Result, RuleError};
use crate::core::rules::{Condition, EntityKind, Operator, RuleConfig, RuleUpdate};
use serde_json::Value;
use validator::Validate;

/// Validate a rule about to be created
///
/// # Errors
///
/// - `Validation` when a field violates its length limits
/// - `UnknownEntityType` for an unrecognised subject type
/// - `ConditionTooDeep` when the tree nests deeper than `max_depth`
/// - `InvalidRule` for a malformed condition leaf
pub fn validate_rule_config(config: &RuleConfig, max_depth: usize) -> Result<()> {
    config.validate()?;
    validate_subject_type(&config.subject_type)?;
    validate_conditions(&config.conditions, max_depth)
}

/// Validate the fields present in a partial update
pub fn validate_rule_update(update: &RuleUpdate, max_depth: usize) -> Result<()> {
    update.validate()?;
    if let Some(subject_type) = &update.subject_type {
        validate_subject_type(subject_type)?;
    }
    if let Some(conditions) = &update.conditions {
        validate_conditions(conditions, max_depth)?;
    }
    Ok(())
}

fn validate_subject_type(subject_type: &str) -> Result<()> {
    subject_type
        .parse::<EntityKind>()
        .map(|_| ())
        .map_err(|_| RuleError::UnknownEntityType(subject_type.to_string()))
}

/// Check the shape of a condition tree
pub fn validate_conditions(conditions: &Condition, max_depth: usize) -> Result<()> {
    let depth = conditions.depth();
    if depth > max_depth {
        return Err(RuleError::ConditionTooDeep {
            depth,
            max: max_depth,
        });
    }

    for leaf in conditions.leaves() {
        let field = match leaf.field.as_deref() {
            Some(field) if !field.is_empty() => field,
            _ => {
                return Err(RuleError::InvalidRule(
                    "condition is missing a field".to_string(),
                ))
            }
        };

        let operator = leaf.operator.as_ref().ok_or_else(|| {
            RuleError::InvalidRule(format!("condition on '{}' is missing an operator", field))
        })?;

        match operator {
            Operator::Unknown(name) => {
                return Err(RuleError::InvalidRule(format!(
                    "condition on '{}' uses unknown operator '{}'",
                    field, name
                )))
            }
            Operator::In if !leaf.value.is_array() => {
                return Err(RuleError::InvalidRule(format!(
                    "'in' condition on '{}' needs an array value",
                    field
                )))
            }
            Operator::Between if !is_range(&leaf.value) => {
                return Err(RuleError::InvalidRule(format!(
                    "'between' condition on '{}' needs a [low, high] value",
                    field
                )))
            }
            _ => {}
        }
    }

    Ok(())
}

fn is_range(value: &Value) -> bool {
    matches!(value.as_array(), Some(bounds) if bounds.len() == 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rules::{Permissions, SimpleCondition, TargetType, DEFAULT_MAX_DEPTH};
    use serde_json::json;

    fn config(conditions: Condition) -> RuleConfig {
        RuleConfig::new(
            "coach access",
            EntityKind::Lead,
            conditions,
            TargetType::Role,
            "health_coach",
            Permissions::all(),
        )
    }

    fn nested(depth: usize) -> Condition {
        let mut condition = Condition::simple("status", "=", json!("new"));
        for _ in 1..depth {
            condition = Condition::all(vec![condition]);
        }
        condition
    }

    #[test]
    fn test_valid_rule() {
        let rule = config(Condition::any(vec![
            Condition::simple("status", "in", json!(["new", "nurture"])),
            Condition::simple("score", "between", json!([10, 90])),
            Condition::simple("notes", "is_empty", Value::Null),
        ]));
        assert!(validate_rule_config(&rule, DEFAULT_MAX_DEPTH).is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut rule = config(Condition::all(vec![]));
        rule.name.clear();
        assert!(matches!(
            validate_rule_config(&rule, DEFAULT_MAX_DEPTH),
            Err(RuleError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_subject_type() {
        let mut rule = config(Condition::all(vec![]));
        rule.subject_type = "invoice".to_string();
        assert!(matches!(
            validate_rule_config(&rule, DEFAULT_MAX_DEPTH),
            Err(RuleError::UnknownEntityType(t)) if t == "invoice"
        ));
    }

    #[test]
    fn test_depth_limit() {
        assert!(validate_rule_config(&config(nested(4)), 4).is_ok());
        assert!(matches!(
            validate_rule_config(&config(nested(5)), 4),
            Err(RuleError::ConditionTooDeep { depth: 5, max: 4 })
        ));
    }

    #[test]
    fn test_malformed_leaves() {
        let cases = vec![
            Condition::Simple(SimpleCondition {
                field: None,
                operator: Some(Operator::Equals),
                value: json!(1),
            }),
            Condition::Simple(SimpleCondition {
                field: Some("status".into()),
                operator: None,
                value: json!(1),
            }),
            Condition::simple("status", "like", json!("n%")),
            Condition::simple("status", "in", json!("new")),
            Condition::simple("score", "between", json!([1, 2, 3])),
            Condition::all(vec![Condition::simple("score", "between", json!(5))]),
        ];

        for conditions in cases {
            assert!(
                matches!(
                    validate_rule_config(&config(conditions.clone()), DEFAULT_MAX_DEPTH),
                    Err(RuleError::InvalidRule(_))
                ),
                "accepted {:?}",
                conditions
            );
        }
    }

    #[test]
    fn test_update_checks_present_fields_only() {
        assert!(validate_rule_update(&RuleUpdate::default(), DEFAULT_MAX_DEPTH).is_ok());

        let update = RuleUpdate {
            subject_type: Some("invoice".into()),
            ..Default::default()
        };
        assert!(validate_rule_update(&update, DEFAULT_MAX_DEPTH).is_err());

        let update = RuleUpdate {
            conditions: Some(nested(3)),
            ..Default::default()
        };
        assert!(validate_rule_update(&update, 2).is_err());
        assert!(validate_rule_update(&update, 3).is_ok());
    }
}
