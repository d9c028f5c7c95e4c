//! Permission rule records
//!
//! A rule binds a condition tree over one subject type (lead, contact, task,
//! appointment) to a target (a user, a role or a team) and the grants the
//! target receives when the condition holds. There is no deny: grants from
//! every matching rule are unioned.

use super::condition::Condition;
use super::subject::{EntityKind, PermissionKind, UserRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use validator::Validate;

/// Who a rule's grants apply to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    User,
    Role,
    Team,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::User => "user",
            TargetType::Role => "role",
            TargetType::Team => "team",
        }
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(TargetType::User),
            "role" => Ok(TargetType::Role),
            "team" => Ok(TargetType::Team),
            other => Err(format!("unknown target type '{}'", other)),
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four independent grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub assign: bool,
    #[serde(default)]
    pub delete: bool,
}

impl Permissions {
    /// Grant exactly one permission
    pub fn only(kind: PermissionKind) -> Self {
        let mut permissions = Permissions::default();
        match kind {
            PermissionKind::Read => permissions.read = true,
            PermissionKind::Write => permissions.write = true,
            PermissionKind::Assign => permissions.assign = true,
            PermissionKind::Delete => permissions.delete = true,
        }
        permissions
    }

    pub fn all() -> Self {
        Permissions {
            read: true,
            write: true,
            assign: true,
            delete: true,
        }
    }

    pub fn grants(&self, kind: PermissionKind) -> bool {
        match kind {
            PermissionKind::Read => self.read,
            PermissionKind::Write => self.write,
            PermissionKind::Assign => self.assign,
            PermissionKind::Delete => self.delete,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.read || self.write || self.assign || self.delete)
    }

    /// Union of two grant sets
    pub fn union(self, other: Permissions) -> Self {
        Permissions {
            read: self.read || other.read,
            write: self.write || other.write,
            assign: self.assign || other.assign,
            delete: self.delete || other.delete,
        }
    }
}

/// A stored permission rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRule {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub subject_type: String,
    pub conditions: Condition,
    pub target_type: TargetType,
    pub target_id: String,
    pub permissions: Permissions,
    pub priority: i32,
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PermissionRule {
    /// Build the stored form of a new rule
    pub fn from_config(id: i64, config: &RuleConfig, created_by: i64, now: DateTime<Utc>) -> Self {
        PermissionRule {
            id,
            name: config.name.clone(),
            description: config.description.clone(),
            subject_type: config.subject_type.clone(),
            conditions: config.conditions.clone(),
            target_type: config.target_type,
            target_id: config.target_id.clone(),
            permissions: config.permissions,
            priority: config.priority,
            is_active: config.is_active,
            created_by: Some(created_by),
            created_at: now,
            updated_at: now,
        }
    }

    /// Check whether this rule's target covers the user
    ///
    /// Team targets are not resolved and never match.
    pub fn targets(&self, user: &UserRecord) -> bool {
        match self.target_type {
            TargetType::User => self.target_id == user.id.to_string(),
            TargetType::Role => self.target_id == user.role,
            TargetType::Team => false,
        }
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, update: &RuleUpdate, now: DateTime<Utc>) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(description) = &update.description {
            self.description = Some(description.clone());
        }
        if let Some(subject_type) = &update.subject_type {
            self.subject_type = subject_type.clone();
        }
        if let Some(conditions) = &update.conditions {
            self.conditions = conditions.clone();
        }
        if let Some(target_type) = update.target_type {
            self.target_type = target_type;
        }
        if let Some(target_id) = &update.target_id {
            self.target_id = target_id.clone();
        }
        if let Some(permissions) = update.permissions {
            self.permissions = permissions;
        }
        if let Some(priority) = update.priority {
            self.priority = priority;
        }
        if let Some(is_active) = update.is_active {
            self.is_active = is_active;
        }
        self.updated_at = now;
    }
}

fn default_active() -> bool {
    true
}

/// Input for creating a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    #[serde(default)]
    #[validate(length(max = 2000))]
    pub description: Option<String>,

    #[validate(length(min = 1))]
    pub subject_type: String,

    pub conditions: Condition,

    pub target_type: TargetType,

    #[validate(length(min = 1, max = 255))]
    pub target_id: String,

    #[serde(default)]
    pub permissions: Permissions,

    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_active")]
    pub is_active: bool,
}

impl RuleConfig {
    pub fn new(
        name: impl Into<String>,
        subject: EntityKind,
        conditions: Condition,
        target_type: TargetType,
        target_id: impl Into<String>,
        permissions: Permissions,
    ) -> Self {
        RuleConfig {
            name: name.into(),
            description: None,
            subject_type: subject.as_str().to_string(),
            conditions,
            target_type,
            target_id: target_id.into(),
            permissions,
            priority: 0,
            is_active: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Partial update of a rule; `None` fields are left unchanged
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RuleUpdate {
    #[serde(default)]
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,

    #[serde(default)]
    #[validate(length(max = 2000))]
    pub description: Option<String>,

    #[serde(default)]
    #[validate(length(min = 1))]
    pub subject_type: Option<String>,

    #[serde(default)]
    pub conditions: Option<Condition>,

    #[serde(default)]
    pub target_type: Option<TargetType>,

    #[serde(default)]
    #[validate(length(min = 1, max = 255))]
    pub target_id: Option<String>,

    #[serde(default)]
    pub permissions: Option<Permissions>,

    #[serde(default)]
    pub priority: Option<i32>,

    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Outcome of an access check
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessResult {
    pub can_read: bool,
    pub can_write: bool,
    pub can_assign: bool,
    pub can_delete: bool,
    pub applied_rules: Vec<String>,
}

impl AccessResult {
    /// No grants, no rules applied
    pub fn denied() -> Self {
        AccessResult::default()
    }

    /// Fold one matching rule into the result
    pub fn grant(&mut self, rule_name: &str, permissions: Permissions) {
        let merged = self.permissions().union(permissions);
        self.can_read = merged.read;
        self.can_write = merged.write;
        self.can_assign = merged.assign;
        self.can_delete = merged.delete;
        self.applied_rules.push(rule_name.to_string());
    }

    pub fn allows(&self, kind: PermissionKind) -> bool {
        match kind {
            PermissionKind::Read => self.can_read,
            PermissionKind::Write => self.can_write,
            PermissionKind::Assign => self.can_assign,
            PermissionKind::Delete => self.can_delete,
        }
    }

    pub fn permissions(&self) -> Permissions {
        Permissions {
            read: self.can_read,
            write: self.can_write,
            assign: self.can_assign,
            delete: self.can_delete,
        }
    }
}
