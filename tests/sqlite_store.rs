//! Rule engine over an on-disk SQLite CRM database

use carepath_rules::{
    AuditAction, AuditQuery, Condition, EngineConfig, EntityKind, PermissionKind, Permissions,
    RuleConfig, RuleEngine, RuleStore, SqliteStore, TargetType,
};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn crm_database(dir: &TempDir) -> SqliteStore {
    let store = SqliteStore::open(dir.path().join("crm.db")).unwrap();
    store.migrate().unwrap();

    let stale = (Utc::now() - Duration::hours(30)).to_rfc3339();
    let fresh = (Utc::now() - Duration::hours(2)).to_rfc3339();
    store
        .with_connection(|conn| {
            conn.execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, role TEXT NOT NULL, name TEXT);
                 CREATE TABLE leads (id INTEGER PRIMARY KEY, status TEXT, poolEnteredAt TEXT);
                 INSERT INTO users VALUES (7, 'health_coach', 'Robin');
                 INSERT INTO users VALUES (8, 'admin', 'Sam');",
            )?;
            conn.execute(
                "INSERT INTO leads VALUES (42, 'new', ?1), (43, 'new', ?2)",
                [&stale, &fresh],
            )?;
            Ok(())
        })
        .unwrap();
    store
}

fn hc_rule() -> RuleConfig {
    RuleConfig::new(
        "HC 24h access",
        EntityKind::Lead,
        Condition::simple("poolEnteredAt", "<", json!("24 hours ago")),
        TargetType::Role,
        "health_coach",
        Permissions::only(PermissionKind::Read),
    )
}

#[test]
fn test_end_to_end_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(crm_database(&dir));
    let engine = RuleEngine::new(store.clone());

    let rule = engine.create_rule(&hc_rule(), 8).unwrap();

    assert!(engine.evaluate_user_access("lead", 42, 7).unwrap().can_read);
    assert!(!engine.evaluate_user_access("lead", 43, 7).unwrap().can_read);
    assert!(!engine.evaluate_user_access("lead", 42, 8).unwrap().can_read);

    // recompute overwrites the evaluation row
    engine.evaluate_user_access("lead", 42, 7).unwrap();
    let history = engine.evaluation_history("lead", 42).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].rule_id, rule.id);
    assert!(history[0].permissions.read);

    let granted = engine
        .audit_log(&AuditQuery::new().action(AuditAction::AccessGranted))
        .unwrap();
    assert_eq!(granted.len(), 2);
    assert!(granted.iter().all(|e| e.entity_id == 42 && e.user_id == Some(7)));

    let created = engine
        .audit_log(&AuditQuery::new().action(AuditAction::RuleCreated))
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].user_id, Some(8));
}

#[test]
fn test_rules_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Arc::new(crm_database(&dir));
        let engine = RuleEngine::new(store);
        engine.create_rule(&hc_rule().with_priority(3), 8).unwrap();
        engine
            .create_rule(&hc_rule().with_description("disabled copy").inactive(), 8)
            .unwrap();
    }

    let store = SqliteStore::open(dir.path().join("crm.db")).unwrap();
    store.migrate().unwrap();

    let all = store.all_rules().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].priority, 3);
    assert_eq!(all[1].description.as_deref(), Some("disabled copy"));
    assert_eq!(store.active_rules_for("lead").unwrap().len(), 1);
    assert_eq!(all[0].conditions, hc_rule().conditions);
}

#[test]
fn test_audit_query_filters_and_limit() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(crm_database(&dir));
    let engine = RuleEngine::new(store);
    engine.create_rule(&hc_rule(), 8).unwrap();

    for _ in 0..5 {
        engine.evaluate_user_access("lead", 42, 7).unwrap();
    }

    let limited = engine
        .audit_log(&AuditQuery::new().entity("lead", 42).limit(3))
        .unwrap();
    assert_eq!(limited.len(), 3);
    assert!(limited[0].id > limited[1].id);

    assert!(engine
        .audit_log(&AuditQuery::new().user(8).action(AuditAction::AccessGranted))
        .unwrap()
        .is_empty());
}

#[test]
fn test_background_audit_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(crm_database(&dir));
    let config = EngineConfig::from_toml_str("[audit]\nmode = \"background\"").unwrap();
    let engine = RuleEngine::with_config(store.clone(), config);
    engine.create_rule(&hc_rule(), 8).unwrap();

    for _ in 0..10 {
        assert!(engine.evaluate_user_access("lead", 42, 7).unwrap().can_read);
    }
    engine.flush_audit().unwrap();

    let granted = store
        .audit_entries(&AuditQuery::new().action(AuditAction::AccessGranted))
        .unwrap();
    assert_eq!(granted.len(), 10);
    assert_eq!(engine.audit_writer().unwrap().stats().dead_lettered, 0);
}
