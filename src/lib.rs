//! # carepath-rules - Row-Level Permission Rules for Healthcare CRM Records
//!
//! `carepath-rules` decides what a user may do with a single CRM record
//! (lead, contact, task, appointment). Permissions are data, not code:
//!
//! - **Condition trees** of AND/OR nodes over comparison, text, set, range
//!   and emptiness operators, including rolling time windows such as
//!   `poolEnteredAt < "24 hours ago"`
//! - **Additive grants**: read, write, assign and delete from every matching
//!   rule are unioned; there is no deny
//! - **Rule cache** per subject type with a short TTL, invalidated on every
//!   rule change
//! - **Audit trail**: an evaluation row and an `access_granted` entry for every
//!   rule that grants access
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use carepath_rules::{
//!     Condition, EntityKind, Permissions, Result, RuleConfig, RuleEngine, SqliteStore,
//!     TargetType,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let store = SqliteStore::open("crm.db")?;
//! store.migrate()?;
//! let engine = RuleEngine::new(Arc::new(store));
//!
//! // Health coaches may read leads that have sat in the pool for a day
//! engine.create_rule(
//!     &RuleConfig::new(
//!         "HC 24h access",
//!         EntityKind::Lead,
//!         Condition::simple("poolEnteredAt", "<", json!("24 hours ago")),
//!         TargetType::Role,
//!         "health_coach",
//!         Permissions { read: true, ..Default::default() },
//!     ),
//!     1,
//! )?;
//!
//! let access = engine.evaluate_user_access("lead", 42, 7)?;
//! if access.can_read {
//!     println!("granted by {:?}", access.applied_rules);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use carepath_rules::{EngineConfig, MemoryStore, Result, RuleEngine};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! let config = EngineConfig::from_toml_str(
//!     r#"
//!     [cache]
//!     ttl_mode = "per_subject"
//!
//!     [audit]
//!     mode = "background"
//!     "#,
//! )?;
//! let engine = RuleEngine::with_config(Arc::new(MemoryStore::new()), config);
//! engine.flush_audit()?;
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    audit::{
        AuditAction, AuditLogEntry, AuditQuery, AuditRecord, AuditWriter, RetryPolicy,
        RuleEvaluation, WriterStats,
    },
    config::{AuditConfig, AuditMode, CacheConfig, EngineConfig, EvaluationConfig},
    error::{EvalError, Result, RuleError},
    rules::{
        AccessResult, CacheStats, CompoundCondition, Condition, ConditionEvaluator, EntityKind,
        Logic, Operator, PermissionKind, PermissionRule, Permissions, Record, RuleCache,
        RuleConfig, RuleEngine, RuleUpdate, SimpleCondition, SimulatedRule, Simulation,
        TargetType, TtlMode, UserRecord,
    },
    store::{MemoryStore, RuleStore, SqliteStore},
    validation::{validate_conditions, validate_rule_config, validate_rule_update},
};

#[cfg(feature = "async")]
pub use crate::core::async_engine::AsyncRuleEngine;
