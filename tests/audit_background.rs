//! Background audit writer: retries, dead letters and flushing

use carepath_rules::{
    AuditAction, AuditLogEntry, AuditQuery, AuditRecord, AuditWriter, Condition, EngineConfig,
    EntityKind, MemoryStore, PermissionKind, PermissionRule, Permissions, Record, RetryPolicy,
    RuleConfig, RuleEngine, RuleError, RuleEvaluation, RuleStore, RuleUpdate, TargetType,
    UserRecord,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store whose audit inserts fail a fixed number of times first
struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        FlakyStore {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(failures),
        }
    }
}

impl RuleStore for FlakyStore {
    fn find_user(&self, user_id: i64) -> carepath_rules::Result<Option<UserRecord>> {
        self.inner.find_user(user_id)
    }

    fn find_entity(&self, kind: EntityKind, id: i64) -> carepath_rules::Result<Option<Record>> {
        self.inner.find_entity(kind, id)
    }

    fn active_rules_for(&self, subject_type: &str) -> carepath_rules::Result<Vec<PermissionRule>> {
        self.inner.active_rules_for(subject_type)
    }

    fn all_rules(&self) -> carepath_rules::Result<Vec<PermissionRule>> {
        self.inner.all_rules()
    }

    fn get_rule(&self, rule_id: i64) -> carepath_rules::Result<Option<PermissionRule>> {
        self.inner.get_rule(rule_id)
    }

    fn insert_rule(
        &self,
        config: &RuleConfig,
        created_by: i64,
        now: DateTime<Utc>,
    ) -> carepath_rules::Result<PermissionRule> {
        self.inner.insert_rule(config, created_by, now)
    }

    fn update_rule(
        &self,
        rule_id: i64,
        update: &RuleUpdate,
        now: DateTime<Utc>,
    ) -> carepath_rules::Result<Option<PermissionRule>> {
        self.inner.update_rule(rule_id, update, now)
    }

    fn delete_rule(&self, rule_id: i64) -> carepath_rules::Result<bool> {
        self.inner.delete_rule(rule_id)
    }

    fn upsert_evaluation(&self, evaluation: &RuleEvaluation) -> carepath_rules::Result<()> {
        self.inner.upsert_evaluation(evaluation)
    }

    fn insert_audit(&self, entry: &AuditLogEntry) -> carepath_rules::Result<()> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RuleError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "audit table locked",
            )));
        }
        self.inner.insert_audit(entry)
    }

    fn evaluations_for(
        &self,
        entity_type: &str,
        entity_id: i64,
    ) -> carepath_rules::Result<Vec<RuleEvaluation>> {
        self.inner.evaluations_for(entity_type, entity_id)
    }

    fn audit_entries(&self, query: &AuditQuery) -> carepath_rules::Result<Vec<AuditLogEntry>> {
        self.inner.audit_entries(query)
    }
}

fn record(rule_id: i64) -> AuditRecord {
    AuditRecord {
        evaluation: None,
        entry: AuditLogEntry::new(
            rule_id,
            "lead",
            42,
            Some(7),
            AuditAction::AccessGranted,
            json!({ "ruleName": format!("rule-{}", rule_id) }),
            Utc::now(),
        ),
    }
}

fn fast_retries(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff: Duration::from_millis(1),
    }
}

#[test]
fn test_transient_failures_are_retried() {
    let store = Arc::new(FlakyStore::new(2));
    let writer = AuditWriter::start(store.clone(), fast_retries(3));

    writer.submit(record(1)).unwrap();
    writer.flush().unwrap();

    let stats = writer.stats();
    assert_eq!(stats.written, 1);
    assert_eq!(stats.failed_attempts, 2);
    assert_eq!(stats.dead_lettered, 0);
    assert_eq!(store.inner.recorded_audit().len(), 1);
}

#[test]
fn test_exhausted_records_are_dead_lettered() {
    let store = Arc::new(FlakyStore::new(10));
    let writer = AuditWriter::start(store.clone(), fast_retries(2));

    writer.submit(record(1)).unwrap();
    writer.submit(record(2)).unwrap();
    assert!(matches!(writer.flush(), Err(RuleError::AuditDeadLettered(2))));
    // reported once
    writer.flush().unwrap();

    // three attempts per record, all six fail
    let stats = writer.stats();
    assert_eq!(stats.dead_lettered, 2);
    assert_eq!(stats.written, 0);

    let dead = writer.take_dead_letters();
    assert_eq!(dead.len(), 2);
    assert_eq!(dead[0].entry.rule_id, 1);
    assert!(writer.take_dead_letters().is_empty());

    // replay once the store recovers
    store.failures_left.store(0, Ordering::SeqCst);
    for record in dead {
        writer.submit(record).unwrap();
    }
    writer.flush().unwrap();
    assert_eq!(store.inner.recorded_audit().len(), 2);
}

#[test]
fn test_drop_drains_queue() {
    let store = Arc::new(MemoryStore::new());
    {
        let writer = AuditWriter::start(store.clone(), RetryPolicy::default());
        for i in 0..50 {
            writer.submit(record(i)).unwrap();
        }
    }
    assert_eq!(store.recorded_audit().len(), 50);
}

#[test]
fn test_shutdown_retries_dead_letters() {
    // worker gives up on both records, the store recovers before shutdown
    let store = Arc::new(FlakyStore::new(2));
    let mut writer = AuditWriter::start(store.clone(), fast_retries(0));

    writer.submit(record(1)).unwrap();
    writer.submit(record(2)).unwrap();
    assert!(writer.flush().is_err());
    assert!(store.inner.recorded_audit().is_empty());

    writer.shutdown();
    assert_eq!(store.inner.recorded_audit().len(), 2);
    assert_eq!(writer.stats().written, 2);
    assert!(writer.take_dead_letters().is_empty());
}

#[test]
fn test_shutdown_without_spill_keeps_dead_letters() {
    let store = Arc::new(FlakyStore::new(u32::MAX));
    let mut writer = AuditWriter::start(store.clone(), fast_retries(0));

    writer.submit(record(1)).unwrap();
    writer.shutdown();

    let dead = writer.take_dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].entry.rule_id, 1);
}

#[test]
fn test_dropped_engine_spills_unwritten_records() {
    let dir = tempfile::tempdir().unwrap();
    let spill = dir.path().join("audit-spill.jsonl");

    let store = Arc::new(FlakyStore::new(u32::MAX));
    store.inner.put_user(UserRecord::new(7, "health_coach"));
    let mut lead = Record::new();
    lead.insert("status".into(), json!("new"));
    store.inner.put_entity(EntityKind::Lead, 42, lead);

    let mut config = EngineConfig::from_toml_str(
        "[audit]\nmode = \"background\"\nmax_retries = 0\nretry_backoff_ms = 1",
    )
    .unwrap();
    config.audit.spill_path = Some(spill.clone());

    {
        let engine = RuleEngine::with_config(store.clone(), config);
        assert_eq!(
            engine.audit_writer().unwrap().spill_path(),
            Some(spill.as_path())
        );
        engine
            .create_rule(
                &RuleConfig::new(
                    "new leads",
                    EntityKind::Lead,
                    Condition::simple("status", "=", json!("new")),
                    TargetType::Role,
                    "health_coach",
                    Permissions::only(PermissionKind::Read),
                ),
                1,
            )
            .unwrap();

        assert!(engine.evaluate_user_access("lead", 42, 7).unwrap().can_read);
        assert!(matches!(
            engine.flush_audit(),
            Err(RuleError::AuditDeadLettered(2))
        ));
    }

    assert!(store.inner.recorded_audit().is_empty());
    let spilled = AuditWriter::read_spill(&spill).unwrap();
    let actions: Vec<AuditAction> = spilled.iter().map(|r| r.entry.action).collect();
    assert_eq!(actions, vec![AuditAction::RuleCreated, AuditAction::AccessGranted]);

    let granted = &spilled[1];
    assert_eq!(granted.entry.entity_id, 42);
    assert_eq!(granted.entry.user_id, Some(7));
    assert!(granted.evaluation.as_ref().unwrap().permissions.read);

    // replay into a healthy store
    let recovered = MemoryStore::new();
    for record in &spilled {
        record.write_to(&recovered).unwrap();
    }
    assert_eq!(recovered.recorded_audit().len(), 2);
    assert_eq!(recovered.recorded_evaluations().len(), 1);
}
