//! Access evaluation and rule management

use super::cache::RuleCache;
use super::condition::{Condition, ConditionEvaluator, Record};
use super::rule::{AccessResult, PermissionRule, RuleConfig, RuleUpdate};
use super::subject::{EntityKind, PermissionKind, UserRecord};
use crate::core::audit::{
    AuditAction, AuditLogEntry, AuditQuery, AuditRecord, AuditSink, AuditWriter, RuleEvaluation,
    RULE_ENTITY_TYPE,
};
use crate::core::config::{AuditMode, EngineConfig};
use crate::core::error::{Result, RuleError};
use crate::core::store::RuleStore;
use crate::core::validation::{validate_rule_config, validate_rule_update};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of evaluating a condition tree against a supplied record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Simulation {
    pub matches: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How one stored rule would treat a supplied record and user
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedRule {
    pub rule_id: i64,
    pub rule_name: String,
    pub targets_user: bool,
    pub matches: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Row-level permission engine
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    cache: RuleCache,
    audit: AuditSink,
    config: EngineConfig,
}

impl RuleEngine {
    /// Engine with default configuration (inline audit, 5 minute rule TTL)
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    pub fn with_config(store: Arc<dyn RuleStore>, config: EngineConfig) -> Self {
        let cache = RuleCache::new(config.rule_ttl(), config.cache.ttl_mode);
        let audit = match config.audit.mode {
            AuditMode::Inline => AuditSink::Inline(Arc::clone(&store)),
            AuditMode::Background => {
                let writer =
                    AuditWriter::start(Arc::clone(&store), config.audit.retry_policy());
                AuditSink::Background(match &config.audit.spill_path {
                    Some(path) => writer.with_spill_path(path),
                    None => writer,
                })
            }
        };

        RuleEngine {
            store,
            cache,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &RuleCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn RuleStore> {
        &self.store
    }

    /// The background writer, when audit mode is `background`
    pub fn audit_writer(&self) -> Option<&AuditWriter> {
        self.audit.writer()
    }

    /// Wait for queued audit records; a no-op in inline mode.
    ///
    /// Fails with [`RuleError::AuditDeadLettered`] when background records
    /// exhausted their retries since the last flush.
    pub fn flush_audit(&self) -> Result<()> {
        match self.audit.writer() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    /// Compute the permissions a user holds on one entity
    ///
    /// Unknown users, unknown entity types and missing entities all yield a
    /// result with every permission false. Each matching rule is recorded as
    /// an evaluation row plus an `access_granted` audit entry.
    pub fn evaluate_user_access(
        &self,
        entity_type: &str,
        entity_id: i64,
        user_id: i64,
    ) -> Result<AccessResult> {
        self.evaluate_user_access_at(entity_type, entity_id, user_id, Utc::now())
    }

    /// [`RuleEngine::evaluate_user_access`] against an explicit clock
    pub fn evaluate_user_access_at(
        &self,
        entity_type: &str,
        entity_id: i64,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<AccessResult> {
        let Some(user) = self.store.find_user(user_id)? else {
            debug!(user_id, "access check for unknown user");
            return Ok(AccessResult::denied());
        };

        let Ok(kind) = entity_type.parse::<EntityKind>() else {
            debug!(entity_type, "access check for unknown entity type");
            return Ok(AccessResult::denied());
        };

        let rules = self.get_rules_for_entity(kind.as_str())?;

        let Some(entity) = self.store.find_entity(kind, entity_id)? else {
            debug!(entity_type, entity_id, "access check for missing entity");
            return Ok(AccessResult::denied());
        };

        let evaluator = self.evaluator(now);
        let mut result = AccessResult::denied();

        for rule in rules.iter() {
            if !rule.targets(&user) {
                debug!(rule = %rule.name, user_id, "rule does not target user");
                continue;
            }

            match evaluator.evaluate(&rule.conditions, &entity) {
                Ok(true) => {
                    result.grant(&rule.name, rule.permissions);
                    self.record_grant(rule, kind, entity_id, &user, now)?;
                }
                Ok(false) => debug!(rule = %rule.name, entity_id, "rule conditions not met"),
                Err(e) => warn!(
                    rule = %rule.name,
                    rule_id = rule.id,
                    entity_id,
                    error = %e,
                    "rule evaluation failed, treating as non-matching"
                ),
            }
        }

        Ok(result)
    }

    /// Whether the user holds one specific permission on the entity
    pub fn check_permission(
        &self,
        entity_type: &str,
        entity_id: i64,
        user_id: i64,
        permission: PermissionKind,
    ) -> Result<bool> {
        Ok(self
            .evaluate_user_access(entity_type, entity_id, user_id)?
            .allows(permission))
    }

    /// Active rules for a subject type, highest priority first
    ///
    /// Served from the cache while fresh, otherwise reloaded from the store.
    pub fn get_rules_for_entity(&self, subject_type: &str) -> Result<Arc<[PermissionRule]>> {
        if let Some(rules) = self.cache.get(subject_type) {
            return Ok(rules);
        }

        let generation = self.cache.generation();
        let rules = self.store.active_rules_for(subject_type)?;
        Ok(self.cache.insert(subject_type, rules, generation))
    }

    /// Every stored rule, active or not
    pub fn get_all_rules(&self) -> Result<Vec<PermissionRule>> {
        self.store.all_rules()
    }

    pub fn get_rule(&self, rule_id: i64) -> Result<PermissionRule> {
        self.store
            .get_rule(rule_id)?
            .ok_or(RuleError::RuleNotFound(rule_id))
    }

    /// Validate and store a new rule
    pub fn create_rule(&self, config: &RuleConfig, created_by: i64) -> Result<PermissionRule> {
        validate_rule_config(config, self.config.evaluation.max_condition_depth)?;

        let now = Utc::now();
        let rule = self.store.insert_rule(config, created_by, now)?;
        self.cache.clear();

        info!(rule_id = rule.id, name = %rule.name, subject_type = %rule.subject_type, "rule created");
        if rule.permissions.is_empty() {
            warn!(rule_id = rule.id, name = %rule.name, "rule grants no permissions");
        }
        self.record_management(&rule, AuditAction::RuleCreated, Some(created_by), now)?;
        Ok(rule)
    }

    /// Apply a partial update to an existing rule
    pub fn update_rule(&self, rule_id: i64, update: &RuleUpdate) -> Result<PermissionRule> {
        validate_rule_update(update, self.config.evaluation.max_condition_depth)?;

        let now = Utc::now();
        let rule = self
            .store
            .update_rule(rule_id, update, now)?
            .ok_or(RuleError::RuleNotFound(rule_id))?;
        self.cache.clear();

        info!(rule_id, name = %rule.name, "rule updated");
        self.record_management(&rule, AuditAction::RuleUpdated, None, now)?;
        Ok(rule)
    }

    pub fn delete_rule(&self, rule_id: i64) -> Result<()> {
        let rule = self.get_rule(rule_id)?;
        if !self.store.delete_rule(rule_id)? {
            return Err(RuleError::RuleNotFound(rule_id));
        }
        self.cache.clear();

        info!(rule_id, name = %rule.name, "rule deleted");
        self.record_management(&rule, AuditAction::RuleDeleted, None, Utc::now())
    }

    /// Drop every cached rule list
    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("rule cache cleared");
    }

    /// Evaluate a condition tree against a supplied record
    ///
    /// Nothing is read from or written to the store.
    pub fn simulate(&self, conditions: &Condition, entity: &Record) -> Simulation {
        match self.evaluator(Utc::now()).evaluate(conditions, entity) {
            Ok(matches) => Simulation {
                matches,
                error: None,
            },
            Err(e) => Simulation {
                matches: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Run the active rules of a subject type against a supplied record and
    /// user, reporting every rule; no audit is written
    pub fn simulate_rules(
        &self,
        entity_type: &str,
        entity: &Record,
        user: &UserRecord,
    ) -> Result<(AccessResult, Vec<SimulatedRule>)> {
        let kind: EntityKind = entity_type
            .parse()
            .map_err(|_| RuleError::UnknownEntityType(entity_type.to_string()))?;
        let rules = self.get_rules_for_entity(kind.as_str())?;
        let evaluator = self.evaluator(Utc::now());

        let mut result = AccessResult::denied();
        let mut report = Vec::with_capacity(rules.len());

        for rule in rules.iter() {
            let targets_user = rule.targets(user);
            let outcome = evaluator.evaluate(&rule.conditions, entity);
            let matches = matches!(outcome, Ok(true));

            if targets_user && matches {
                result.grant(&rule.name, rule.permissions);
            }

            report.push(SimulatedRule {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                targets_user,
                matches,
                error: outcome.err().map(|e| e.to_string()),
            });
        }

        Ok((result, report))
    }

    /// Evaluation rows recorded for one entity, most recent first
    pub fn evaluation_history(
        &self,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<Vec<RuleEvaluation>> {
        self.store.evaluations_for(entity_type, entity_id)
    }

    pub fn audit_log(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>> {
        self.store.audit_entries(query)
    }

    fn evaluator(&self, now: DateTime<Utc>) -> ConditionEvaluator {
        ConditionEvaluator::new(now).with_max_depth(self.config.evaluation.max_condition_depth)
    }

    fn record_grant(
        &self,
        rule: &PermissionRule,
        kind: EntityKind,
        entity_id: i64,
        user: &UserRecord,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let expires_at = now
            .checked_add_signed(self.config.record_ttl())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.audit.record(AuditRecord {
            evaluation: Some(RuleEvaluation {
                rule_id: rule.id,
                entity_type: kind.as_str().to_string(),
                entity_id,
                user_id: user.id,
                matches: true,
                permissions: rule.permissions,
                evaluated_at: now,
                expires_at,
            }),
            entry: AuditLogEntry::new(
                rule.id,
                kind.as_str(),
                entity_id,
                Some(user.id),
                AuditAction::AccessGranted,
                json!({
                    "ruleName": rule.name,
                    "permissions": rule.permissions,
                }),
                now,
            ),
        })
    }

    fn record_management(
        &self,
        rule: &PermissionRule,
        action: AuditAction,
        user_id: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.audit.record(AuditRecord {
            evaluation: None,
            entry: AuditLogEntry::new(
                rule.id,
                RULE_ENTITY_TYPE,
                rule.id,
                user_id,
                action,
                json!({
                    "ruleName": rule.name,
                    "subjectType": rule.subject_type,
                }),
                now,
            ),
        })
    }
}
