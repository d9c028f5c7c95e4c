//! Tokio facade over [`RuleEngine`]
//!
//! The engine is synchronous and may block on its store; every call here is
//! moved onto the blocking pool.

use crate::core::audit::{AuditLogEntry, AuditQuery};
use crate::core::error::{Result, RuleError};
use crate::core::rules::{AccessResult, PermissionKind, PermissionRule, RuleConfig, RuleEngine, RuleUpdate};
use std::sync::Arc;
use std::time::Duration;

/// Async handle sharing one [`RuleEngine`]
#[derive(Clone)]
pub struct AsyncRuleEngine {
    inner: Arc<RuleEngine>,
}

impl AsyncRuleEngine {
    pub fn new(engine: Arc<RuleEngine>) -> Self {
        AsyncRuleEngine { inner: engine }
    }

    /// The wrapped synchronous engine
    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.inner
    }

    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RuleEngine) -> Result<T> + Send + 'static,
    {
        let engine = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| RuleError::Task(e.to_string()))?
    }

    pub async fn evaluate_user_access(
        &self,
        entity_type: &str,
        entity_id: i64,
        user_id: i64,
    ) -> Result<AccessResult> {
        let entity_type = entity_type.to_string();
        self.run(move |engine| engine.evaluate_user_access(&entity_type, entity_id, user_id))
            .await
    }

    /// Access check bounded by `timeout`
    ///
    /// On expiry the caller gets [`RuleError::Timeout`]; the blocking check
    /// itself runs to completion in the background, including its audit
    /// writes.
    pub async fn evaluate_user_access_with_timeout(
        &self,
        entity_type: &str,
        entity_id: i64,
        user_id: i64,
        timeout: Duration,
    ) -> Result<AccessResult> {
        tokio::time::timeout(
            timeout,
            self.evaluate_user_access(entity_type, entity_id, user_id),
        )
        .await
        .map_err(|_| RuleError::Timeout(timeout))?
    }

    pub async fn check_permission(
        &self,
        entity_type: &str,
        entity_id: i64,
        user_id: i64,
        permission: PermissionKind,
    ) -> Result<bool> {
        let entity_type = entity_type.to_string();
        self.run(move |engine| engine.check_permission(&entity_type, entity_id, user_id, permission))
            .await
    }

    pub async fn create_rule(&self, config: RuleConfig, created_by: i64) -> Result<PermissionRule> {
        self.run(move |engine| engine.create_rule(&config, created_by))
            .await
    }

    pub async fn update_rule(&self, rule_id: i64, update: RuleUpdate) -> Result<PermissionRule> {
        self.run(move |engine| engine.update_rule(rule_id, &update)).await
    }

    pub async fn delete_rule(&self, rule_id: i64) -> Result<()> {
        self.run(move |engine| engine.delete_rule(rule_id)).await
    }

    pub async fn get_all_rules(&self) -> Result<Vec<PermissionRule>> {
        self.run(|engine| engine.get_all_rules()).await
    }

    pub async fn audit_log(&self, query: AuditQuery) -> Result<Vec<AuditLogEntry>> {
        self.run(move |engine| engine.audit_log(&query)).await
    }
}
