//! Row-level permission rules
//!
//! Rules are data: each one carries a condition tree over an entity record
//! and the grants its target receives when the tree matches. The
//! [`RuleEngine`] loads the active rules of a subject type (through a short
//! TTL [`RuleCache`]), evaluates them against the entity and unions the
//! grants of every match.

mod cache;
mod condition;
mod engine;
mod rule;
mod subject;
pub mod temporal;

pub use cache::{CacheStats, RuleCache, TtlMode};
pub use condition::{
    CompoundCondition, Condition, ConditionEvaluator, Logic, Operator, Record, SimpleCondition,
    DEFAULT_MAX_DEPTH,
};
pub use engine::{RuleEngine, Simulation, SimulatedRule};
pub use rule::{AccessResult, PermissionRule, Permissions, RuleConfig, RuleUpdate, TargetType};
pub use subject::{EntityKind, PermissionKind, UserRecord};
