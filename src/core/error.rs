use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Permission rule not found: {0}")]
    RuleNotFound(i64),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Rule validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Condition tree too deep: depth {depth} exceeds maximum {max}")]
    ConditionTooDeep { depth: usize, max: usize },

    #[error("Unknown entity type: {0} (expected lead, contact, task or appointment)")]
    UnknownEntityType(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Audit writer is shut down")]
    AuditWriterClosed,

    #[error("{0} audit record(s) dead-lettered since the last flush")]
    AuditDeadLettered(u64),

    #[error("Access check timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, RuleError>;

/// Failure while evaluating a single condition leaf.
///
/// Never surfaces from an access check: the offending rule is treated as
/// non-matching.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Field '{field}' holds an unparseable date: {value}")]
    InvalidDate { field: String, value: String },

    #[error("Rule value for '{field}' is not a date or relative time: {value}")]
    InvalidThreshold { field: String, value: String },
}
