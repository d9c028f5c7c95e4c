//! End-to-end access checks through the public API

use carepath_rules::{
    AccessResult, AuditAction, AuditQuery, Condition, EntityKind, MemoryStore, PermissionKind,
    Permissions, Record, RuleConfig, RuleEngine, TargetType, UserRecord,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;

fn lead_entered(hours_ago: i64) -> Record {
    let entered = Utc::now() - Duration::hours(hours_ago);
    match json!({ "id": 42, "status": "new", "poolEnteredAt": entered.to_rfc3339() }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn hc_24h_rule() -> RuleConfig {
    RuleConfig::new(
        "HC 24h access",
        EntityKind::Lead,
        Condition::simple("poolEnteredAt", "<", json!("24 hours ago")),
        TargetType::Role,
        "health_coach",
        Permissions::only(PermissionKind::Read),
    )
}

fn setup(hours_in_pool: i64) -> (Arc<MemoryStore>, RuleEngine) {
    let store = Arc::new(MemoryStore::new());
    store.put_user(UserRecord::new(7, "health_coach"));
    store.put_user(UserRecord::new(9, "sales_rep"));
    store.put_entity(EntityKind::Lead, 42, lead_entered(hours_in_pool));

    let engine = RuleEngine::new(store.clone());
    engine.create_rule(&hc_24h_rule(), 1).unwrap();
    (store, engine)
}

#[test]
fn test_health_coach_sees_lead_after_24_hours() {
    let (store, engine) = setup(30);

    let access = engine.evaluate_user_access("lead", 42, 7).unwrap();
    assert_eq!(
        access,
        AccessResult {
            can_read: true,
            can_write: false,
            can_assign: false,
            can_delete: false,
            applied_rules: vec!["HC 24h access".to_string()],
        }
    );

    let evaluations = store.recorded_evaluations();
    assert_eq!(evaluations.len(), 1);
    assert_eq!(evaluations[0].entity_type, "lead");
    assert_eq!(evaluations[0].entity_id, 42);
    assert_eq!(evaluations[0].user_id, 7);
    assert!(evaluations[0].matches);

    let granted = engine
        .audit_log(&AuditQuery::new().entity("lead", 42).action(AuditAction::AccessGranted))
        .unwrap();
    assert_eq!(granted.len(), 1);
    assert_eq!(granted[0].details["ruleName"], json!("HC 24h access"));
    assert_eq!(granted[0].details["permissions"]["read"], json!(true));
}

#[test]
fn test_health_coach_blocked_before_24_hours() {
    let (store, engine) = setup(10);

    let access = engine.evaluate_user_access("lead", 42, 7).unwrap();
    assert!(!access.can_read);
    assert!(access.applied_rules.is_empty());
    assert!(store.recorded_evaluations().is_empty());
}

#[test]
fn test_other_roles_never_gain_access() {
    let (_store, engine) = setup(30);
    assert_eq!(engine.evaluate_user_access("lead", 42, 9).unwrap(), AccessResult::denied());
}

#[test]
fn test_unknown_user_and_entity() {
    let (_store, engine) = setup(30);
    assert_eq!(engine.evaluate_user_access("lead", 42, 404).unwrap(), AccessResult::denied());
    assert_eq!(engine.evaluate_user_access("lead", 404, 7).unwrap(), AccessResult::denied());
    assert_eq!(
        engine.evaluate_user_access("appointment", 42, 7).unwrap(),
        AccessResult::denied()
    );
}

#[test]
fn test_access_result_wire_shape() {
    let (_store, engine) = setup(30);
    let access = engine.evaluate_user_access("lead", 42, 7).unwrap();

    assert_eq!(
        serde_json::to_value(&access).unwrap(),
        json!({
            "canRead": true,
            "canWrite": false,
            "canAssign": false,
            "canDelete": false,
            "appliedRules": ["HC 24h access"],
        })
    );
}

#[test]
fn test_rules_defined_as_json() {
    let store = Arc::new(MemoryStore::new());
    store.put_user(UserRecord::new(3, "scheduler"));
    let mut appointment = Record::new();
    appointment.insert("status".into(), json!("Scheduled"));
    appointment.insert("location".into(), json!("Clinic North"));
    store.put_entity(EntityKind::Appointment, 5, appointment);

    let config: RuleConfig = serde_json::from_value(json!({
        "name": "Schedulers manage clinic appointments",
        "subjectType": "appointment",
        "conditions": {
            "logic": "AND",
            "conditions": [
                { "field": "status", "operator": "in", "value": ["Scheduled", "Confirmed"] },
                { "field": "location", "operator": "contains", "value": "clinic" }
            ]
        },
        "targetType": "role",
        "targetId": "scheduler",
        "permissions": { "read": true, "write": true, "assign": true }
    }))
    .unwrap();

    let engine = RuleEngine::new(store);
    engine.create_rule(&config, 1).unwrap();

    let access = engine.evaluate_user_access("appointment", 5, 3).unwrap();
    assert!(access.can_read && access.can_write && access.can_assign);
    assert!(!access.can_delete);
}
