//! In-memory store

use super::{sort_by_priority, RuleStore};
use crate::core::audit::{AuditLogEntry, AuditQuery, EvaluationKey, RuleEvaluation};
use crate::core::error::Result;
use crate::core::rules::{EntityKind, PermissionRule, Record, RuleConfig, RuleUpdate, UserRecord};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct State {
    users: HashMap<i64, UserRecord>,
    entities: HashMap<(EntityKind, i64), Record>,
    rules: BTreeMap<i64, PermissionRule>,
    next_rule_id: i64,
    evaluations: BTreeMap<EvaluationKey, RuleEvaluation>,
    audit: Vec<AuditLogEntry>,
}

/// Thread-safe store holding everything in maps
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_user(&self, user: UserRecord) {
        self.state.write().users.insert(user.id, user);
    }

    pub fn remove_user(&self, user_id: i64) -> Option<UserRecord> {
        self.state.write().users.remove(&user_id)
    }

    pub fn put_entity(&self, kind: EntityKind, entity_id: i64, record: Record) {
        self.state.write().entities.insert((kind, entity_id), record);
    }

    pub fn remove_entity(&self, kind: EntityKind, entity_id: i64) -> Option<Record> {
        self.state.write().entities.remove(&(kind, entity_id))
    }

    /// Every evaluation row, ordered by key
    pub fn recorded_evaluations(&self) -> Vec<RuleEvaluation> {
        self.state.read().evaluations.values().cloned().collect()
    }

    /// Every audit entry in insertion order
    pub fn recorded_audit(&self) -> Vec<AuditLogEntry> {
        self.state.read().audit.clone()
    }
}

impl RuleStore for MemoryStore {
    fn find_user(&self, user_id: i64) -> Result<Option<UserRecord>> {
        Ok(self.state.read().users.get(&user_id).cloned())
    }

    fn find_entity(&self, kind: EntityKind, entity_id: i64) -> Result<Option<Record>> {
        Ok(self.state.read().entities.get(&(kind, entity_id)).cloned())
    }

    fn active_rules_for(&self, subject_type: &str) -> Result<Vec<PermissionRule>> {
        let mut rules: Vec<PermissionRule> = self
            .state
            .read()
            .rules
            .values()
            .filter(|rule| rule.is_active && rule.subject_type == subject_type)
            .cloned()
            .collect();
        sort_by_priority(&mut rules);
        Ok(rules)
    }

    fn all_rules(&self) -> Result<Vec<PermissionRule>> {
        let mut rules: Vec<PermissionRule> = self.state.read().rules.values().cloned().collect();
        sort_by_priority(&mut rules);
        Ok(rules)
    }

    fn get_rule(&self, rule_id: i64) -> Result<Option<PermissionRule>> {
        Ok(self.state.read().rules.get(&rule_id).cloned())
    }

    fn insert_rule(
        &self,
        config: &RuleConfig,
        created_by: i64,
        now: DateTime<Utc>,
    ) -> Result<PermissionRule> {
        let mut state = self.state.write();
        state.next_rule_id += 1;
        let rule = PermissionRule::from_config(state.next_rule_id, config, created_by, now);
        state.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }

    fn update_rule(
        &self,
        rule_id: i64,
        update: &RuleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<PermissionRule>> {
        let mut state = self.state.write();
        Ok(state.rules.get_mut(&rule_id).map(|rule| {
            rule.apply(update, now);
            rule.clone()
        }))
    }

    fn delete_rule(&self, rule_id: i64) -> Result<bool> {
        Ok(self.state.write().rules.remove(&rule_id).is_some())
    }

    fn upsert_evaluation(&self, evaluation: &RuleEvaluation) -> Result<()> {
        self.state
            .write()
            .evaluations
            .insert(evaluation.key(), evaluation.clone());
        Ok(())
    }

    fn insert_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        let mut state = self.state.write();
        let mut entry = entry.clone();
        entry.id = Some(state.audit.len() as i64 + 1);
        state.audit.push(entry);
        Ok(())
    }

    fn evaluations_for(&self, entity_type: &str, entity_id: i64) -> Result<Vec<RuleEvaluation>> {
        let mut rows: Vec<RuleEvaluation> = self
            .state
            .read()
            .evaluations
            .values()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.evaluated_at.cmp(&a.evaluated_at));
        Ok(rows)
    }

    fn audit_entries(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>> {
        let state = self.state.read();
        let matching = state.audit.iter().rev().filter(|entry| query.matches(entry));
        Ok(match query.limit {
            Some(limit) => matching.take(limit).cloned().collect(),
            None => matching.cloned().collect(),
        })
    }
}
