//! Audit trail for rule decisions
//!
//! Every granted access produces two writes:
//! - an upsert of the [`RuleEvaluation`] row for (rule, entity, user)
//! - an append of an `access_granted` [`AuditLogEntry`]
//!
//! Rule management (create, update, delete) appends entries as well. Writes
//! go straight to the store by default, or through the background
//! [`AuditWriter`] when configured.

mod writer;

pub use writer::{AuditWriter, RetryPolicy, WriterStats};

use crate::core::error::Result;
use crate::core::rules::Permissions;
use crate::core::store::RuleStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Kind of audited event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    AccessGranted,
    RuleCreated,
    RuleUpdated,
    RuleDeleted,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::AccessGranted => "access_granted",
            AuditAction::RuleCreated => "rule_created",
            AuditAction::RuleUpdated => "rule_updated",
            AuditAction::RuleDeleted => "rule_deleted",
        }
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "access_granted" => Ok(AuditAction::AccessGranted),
            "rule_created" => Ok(AuditAction::RuleCreated),
            "rule_updated" => Ok(AuditAction::RuleUpdated),
            "rule_deleted" => Ok(AuditAction::RuleDeleted),
            other => Err(format!("unknown audit action '{}'", other)),
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subject type used on entries about rules themselves
pub const RULE_ENTITY_TYPE: &str = "permission_rule";

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// Assigned by the store; `None` until persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub rule_id: i64,
    pub entity_type: String,
    pub entity_id: i64,
    /// Acting or evaluated user, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    pub action: AuditAction,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        rule_id: i64,
        entity_type: impl Into<String>,
        entity_id: i64,
        user_id: Option<i64>,
        action: AuditAction,
        details: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        AuditLogEntry {
            id: None,
            rule_id,
            entity_type: entity_type.into(),
            entity_id,
            user_id,
            action,
            details,
            timestamp,
        }
    }
}

/// Identity of an evaluation row
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EvaluationKey {
    pub rule_id: i64,
    pub entity_type: String,
    pub entity_id: i64,
    pub user_id: i64,
}

/// Latest outcome of one rule for one (entity, user) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEvaluation {
    pub rule_id: i64,
    pub entity_type: String,
    pub entity_id: i64,
    pub user_id: i64,
    pub matches: bool,
    pub permissions: Permissions,
    pub evaluated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RuleEvaluation {
    pub fn key(&self) -> EvaluationKey {
        EvaluationKey {
            rule_id: self.rule_id,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id,
            user_id: self.user_id,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Filter for audit log queries; results are newest first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditQuery {
    pub rule_id: Option<i64>,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub user_id: Option<i64>,
    pub action: Option<AuditAction>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(mut self, rule_id: i64) -> Self {
        self.rule_id = Some(rule_id);
        self
    }

    pub fn entity(mut self, entity_type: impl Into<String>, entity_id: i64) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id);
        self
    }

    pub fn user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check an entry against every set filter (limit excluded)
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.rule_id.map_or(true, |id| entry.rule_id == id)
            && self
                .entity_type
                .as_deref()
                .map_or(true, |t| entry.entity_type == t)
            && self.entity_id.map_or(true, |id| entry.entity_id == id)
            && self.user_id.map_or(true, |id| entry.user_id == Some(id))
            && self.action.map_or(true, |a| entry.action == a)
    }
}

/// One unit of audit work: an optional evaluation upsert plus a log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<RuleEvaluation>,
    pub entry: AuditLogEntry,
}

impl AuditRecord {
    /// Persist the record; the upsert goes first so a retry stays idempotent
    /// for the evaluation row
    pub fn write_to(&self, store: &dyn RuleStore) -> Result<()> {
        if let Some(evaluation) = &self.evaluation {
            store.upsert_evaluation(evaluation)?;
        }
        store.insert_audit(&self.entry)
    }
}

/// Where the engine sends audit records
pub(crate) enum AuditSink {
    /// Written before the access check returns; failures propagate
    Inline(Arc<dyn RuleStore>),
    /// Queued for the writer thread
    Background(AuditWriter),
}

impl AuditSink {
    pub(crate) fn record(&self, record: AuditRecord) -> Result<()> {
        match self {
            AuditSink::Inline(store) => record.write_to(store.as_ref()),
            AuditSink::Background(writer) => writer.submit(record),
        }
    }

    pub(crate) fn writer(&self) -> Option<&AuditWriter> {
        match self {
            AuditSink::Inline(_) => None,
            AuditSink::Background(writer) => Some(writer),
        }
    }
}
