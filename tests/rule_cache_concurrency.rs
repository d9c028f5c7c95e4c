//! Rule cache behaviour under concurrent readers and writers

use carepath_rules::{
    Condition, EntityKind, MemoryStore, PermissionKind, Permissions, Record, RuleConfig,
    RuleEngine, TargetType, UserRecord,
};
use serde_json::json;
use std::sync::Arc;
use std::thread;

fn rule(name: &str, perms: Permissions) -> RuleConfig {
    RuleConfig::new(
        name,
        EntityKind::Lead,
        Condition::simple("status", "=", json!("new")),
        TargetType::Role,
        "health_coach",
        perms,
    )
}

fn engine() -> Arc<RuleEngine> {
    let store = Arc::new(MemoryStore::new());
    store.put_user(UserRecord::new(7, "health_coach"));
    let mut lead = Record::new();
    lead.insert("status".into(), json!("new"));
    store.put_entity(EntityKind::Lead, 42, lead);
    Arc::new(RuleEngine::new(store))
}

#[test]
fn test_concurrent_access_checks() {
    let engine = engine();
    engine
        .create_rule(&rule("read", Permissions::only(PermissionKind::Read)), 1)
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..200 {
                    let access = engine.evaluate_user_access("lead", 42, 7).unwrap();
                    assert!(access.can_read);
                    assert_eq!(access.applied_rules, vec!["read"]);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = engine.cache().stats();
    assert_eq!(stats.hits + stats.misses, 8 * 200);
    assert!(stats.hits > stats.misses);
}

#[test]
fn test_readers_never_see_partial_rule_lists() {
    let engine = engine();
    engine
        .create_rule(&rule("base", Permissions::only(PermissionKind::Read)), 1)
        .unwrap();

    let writer = {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            for i in 0..50 {
                let created = engine
                    .create_rule(&rule(&format!("extra-{}", i), Permissions::only(PermissionKind::Write)), 1)
                    .unwrap();
                engine.delete_rule(created.id).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..500 {
                    let rules = engine.get_rules_for_entity("lead").unwrap();
                    // either the base rule alone or base plus one extra
                    assert!(rules.len() == 1 || rules.len() == 2, "saw {} rules", rules.len());
                    assert!(rules.iter().any(|r| r.name == "base"));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let rules = engine.get_rules_for_entity("lead").unwrap();
    assert_eq!(rules.len(), 1);
    assert_eq!(rules[0].name, "base");
}

#[test]
fn test_clear_cache_forces_reload() {
    let engine = engine();
    engine.get_rules_for_entity("lead").unwrap();
    assert_eq!(engine.cache().len(), 1);

    engine.clear_cache();
    assert!(engine.cache().is_empty());

    engine.get_rules_for_entity("contact").unwrap();
    assert_eq!(engine.cache().len(), 1);
}
