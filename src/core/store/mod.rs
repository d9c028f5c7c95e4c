//! Persistence collaborator
//!
//! The engine never owns CRM data. It reads users and entity records, keeps
//! rules, and writes evaluation rows and audit entries through [`RuleStore`].
//! Two backends ship with the crate:
//! - [`MemoryStore`] for embedding and tests
//! - [`SqliteStore`] over a CRM SQLite database

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::core::audit::{AuditLogEntry, AuditQuery, RuleEvaluation};
use crate::core::error::Result;
use crate::core::rules::{EntityKind, PermissionRule, Record, RuleConfig, RuleUpdate, UserRecord};
use chrono::{DateTime, Utc};

/// Storage operations the rule engine depends on
pub trait RuleStore: Send + Sync {
    /// Fetch a user by id
    fn find_user(&self, user_id: i64) -> Result<Option<UserRecord>>;

    /// Fetch an entity record by kind and id
    fn find_entity(&self, kind: EntityKind, entity_id: i64) -> Result<Option<Record>>;

    /// Active rules for a subject type, highest priority first
    fn active_rules_for(&self, subject_type: &str) -> Result<Vec<PermissionRule>>;

    /// Every rule, active or not, highest priority first
    fn all_rules(&self) -> Result<Vec<PermissionRule>>;

    fn get_rule(&self, rule_id: i64) -> Result<Option<PermissionRule>>;

    /// Insert a rule and return it with its assigned id
    fn insert_rule(
        &self,
        config: &RuleConfig,
        created_by: i64,
        now: DateTime<Utc>,
    ) -> Result<PermissionRule>;

    /// Apply a partial update; `None` if the rule does not exist
    fn update_rule(
        &self,
        rule_id: i64,
        update: &RuleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<PermissionRule>>;

    /// Remove a rule; `false` if it did not exist
    fn delete_rule(&self, rule_id: i64) -> Result<bool>;

    /// Insert or overwrite the evaluation row for its (rule, entity, user) key
    fn upsert_evaluation(&self, evaluation: &RuleEvaluation) -> Result<()>;

    /// Append an audit entry
    fn insert_audit(&self, entry: &AuditLogEntry) -> Result<()>;

    /// Evaluation rows for one entity, most recent first
    fn evaluations_for(&self, entity_type: &str, entity_id: i64) -> Result<Vec<RuleEvaluation>>;

    /// Audit entries matching the query, newest first
    fn audit_entries(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>>;
}

/// Ordering shared by both backends: priority descending, then id ascending
pub(crate) fn sort_by_priority(rules: &mut [PermissionRule]) {
    rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
}
