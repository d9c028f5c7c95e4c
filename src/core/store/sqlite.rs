//! SQLite store
//!
//! Engine-owned tables (`permission_rules`, `rule_evaluations`,
//! `rule_audit_log`) are created by [`SqliteStore::migrate`]. CRM tables
//! (`users`, `leads`, `contacts`, `tasks`, `appointments`) belong to the host
//! application; entity rows are read generically, every column becoming a
//! key of the record.

use super::{sort_by_priority, RuleStore};
use crate::core::audit::{AuditAction, AuditLogEntry, AuditQuery, RuleEvaluation};
use crate::core::error::Result;
use crate::core::rules::{
    EntityKind, PermissionRule, Permissions, Record, RuleConfig, RuleUpdate, TargetType,
    UserRecord,
};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS permission_rules (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    name          TEXT    NOT NULL,
    description   TEXT,
    subject_type  TEXT    NOT NULL,
    conditions    TEXT    NOT NULL,
    target_type   TEXT    NOT NULL,
    target_id     TEXT    NOT NULL,
    can_read      INTEGER NOT NULL DEFAULT 0,
    can_write     INTEGER NOT NULL DEFAULT 0,
    can_assign    INTEGER NOT NULL DEFAULT 0,
    can_delete    INTEGER NOT NULL DEFAULT 0,
    priority      INTEGER NOT NULL DEFAULT 0,
    is_active     INTEGER NOT NULL DEFAULT 1,
    created_by    INTEGER,
    created_at    TEXT    NOT NULL,
    updated_at    TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_permission_rules_subject
    ON permission_rules (subject_type, is_active, priority DESC);

CREATE TABLE IF NOT EXISTS rule_evaluations (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id       INTEGER NOT NULL,
    entity_type   TEXT    NOT NULL,
    entity_id     INTEGER NOT NULL,
    user_id       INTEGER NOT NULL,
    matches       INTEGER NOT NULL,
    permissions   TEXT    NOT NULL,
    evaluated_at  TEXT    NOT NULL,
    expires_at    TEXT    NOT NULL,
    UNIQUE (rule_id, entity_type, entity_id, user_id)
);

CREATE TABLE IF NOT EXISTS rule_audit_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id       INTEGER NOT NULL,
    entity_type   TEXT    NOT NULL,
    entity_id     INTEGER NOT NULL,
    user_id       INTEGER,
    action        TEXT    NOT NULL,
    details       TEXT    NOT NULL,
    created_at    TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rule_audit_log_entity
    ON rule_audit_log (entity_type, entity_id);
";

const RULE_COLUMNS: &str = "id, name, description, subject_type, conditions, target_type, \
     target_id, can_read, can_write, can_assign, can_delete, priority, is_active, created_by, \
     created_at, updated_at";

/// Store over a SQLite connection
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    /// Create the engine-owned tables if missing
    pub fn migrate(&self) -> Result<()> {
        self.conn.lock().execute_batch(SCHEMA)?;
        debug!("rule engine schema ready");
        Ok(())
    }

    /// Run a closure against the underlying connection
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        Ok(f(&self.conn.lock())?)
    }
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn conversion_error(
    idx: usize,
    ty: Type,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, err.into())
}

fn parse_timestamp(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, Type::Text, e))
}

fn parse_json<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion_error(idx, Type::Text, e))
}

fn rule_from_row(row: &Row) -> rusqlite::Result<PermissionRule> {
    let target_type: String = row.get(5)?;
    let target_type = target_type
        .parse::<TargetType>()
        .map_err(|e| conversion_error(5, Type::Text, e))?;

    Ok(PermissionRule {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        subject_type: row.get(3)?,
        conditions: parse_json(row, 4)?,
        target_type,
        target_id: row.get(6)?,
        permissions: Permissions {
            read: row.get(7)?,
            write: row.get(8)?,
            assign: row.get(9)?,
            delete: row.get(10)?,
        },
        priority: row.get(11)?,
        is_active: row.get(12)?,
        created_by: row.get(13)?,
        created_at: parse_timestamp(row, 14)?,
        updated_at: parse_timestamp(row, 15)?,
    })
}

fn evaluation_from_row(row: &Row) -> rusqlite::Result<RuleEvaluation> {
    Ok(RuleEvaluation {
        rule_id: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        user_id: row.get(3)?,
        matches: row.get(4)?,
        permissions: parse_json(row, 5)?,
        evaluated_at: parse_timestamp(row, 6)?,
        expires_at: parse_timestamp(row, 7)?,
    })
}

fn audit_from_row(row: &Row) -> rusqlite::Result<AuditLogEntry> {
    let action: String = row.get(5)?;
    let action = action
        .parse::<AuditAction>()
        .map_err(|e| conversion_error(5, Type::Text, e))?;

    Ok(AuditLogEntry {
        id: Some(row.get(0)?),
        rule_id: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        user_id: row.get(4)?,
        action,
        details: parse_json(row, 6)?,
        timestamp: parse_timestamp(row, 7)?,
    })
}

/// Map one SQLite cell onto a JSON value; blobs have no JSON form
fn json_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn write_rule(conn: &Connection, rule: &PermissionRule) -> Result<()> {
    conn.execute(
        "UPDATE permission_rules SET
            name = ?2, description = ?3, subject_type = ?4, conditions = ?5,
            target_type = ?6, target_id = ?7, can_read = ?8, can_write = ?9,
            can_assign = ?10, can_delete = ?11, priority = ?12, is_active = ?13,
            updated_at = ?14
         WHERE id = ?1",
        params![
            rule.id,
            rule.name,
            rule.description,
            rule.subject_type,
            serde_json::to_string(&rule.conditions)?,
            rule.target_type.as_str(),
            rule.target_id,
            rule.permissions.read,
            rule.permissions.write,
            rule.permissions.assign,
            rule.permissions.delete,
            rule.priority,
            rule.is_active,
            timestamp(&rule.updated_at),
        ],
    )?;
    Ok(())
}

impl RuleStore for SqliteStore {
    fn find_user(&self, user_id: i64) -> Result<Option<UserRecord>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                "SELECT id, role FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(UserRecord {
                        id: row.get(0)?,
                        role: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    fn find_entity(&self, kind: EntityKind, entity_id: i64) -> Result<Option<Record>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT * FROM {} WHERE id = ?1", kind.table_name());
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let record = stmt
            .query_row(params![entity_id], |row| {
                let mut record = Record::new();
                for (idx, column) in columns.iter().enumerate() {
                    record.insert(column.clone(), json_from_sql(row.get_ref(idx)?));
                }
                Ok(record)
            })
            .optional()?;
        Ok(record)
    }

    fn active_rules_for(&self, subject_type: &str) -> Result<Vec<PermissionRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM permission_rules
             WHERE subject_type = ?1 AND is_active = 1
             ORDER BY priority DESC, id ASC",
            RULE_COLUMNS
        ))?;
        let rules = stmt
            .query_map(params![subject_type], rule_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rules)
    }

    fn all_rules(&self) -> Result<Vec<PermissionRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {} FROM permission_rules", RULE_COLUMNS))?;
        let mut rules = stmt
            .query_map([], rule_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        sort_by_priority(&mut rules);
        Ok(rules)
    }

    fn get_rule(&self, rule_id: i64) -> Result<Option<PermissionRule>> {
        let conn = self.conn.lock();
        let rule = conn
            .query_row(
                &format!("SELECT {} FROM permission_rules WHERE id = ?1", RULE_COLUMNS),
                params![rule_id],
                rule_from_row,
            )
            .optional()?;
        Ok(rule)
    }

    fn insert_rule(
        &self,
        config: &RuleConfig,
        created_by: i64,
        now: DateTime<Utc>,
    ) -> Result<PermissionRule> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO permission_rules (
                name, description, subject_type, conditions, target_type, target_id,
                can_read, can_write, can_assign, can_delete, priority, is_active,
                created_by, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
            params![
                config.name,
                config.description,
                config.subject_type,
                serde_json::to_string(&config.conditions)?,
                config.target_type.as_str(),
                config.target_id,
                config.permissions.read,
                config.permissions.write,
                config.permissions.assign,
                config.permissions.delete,
                config.priority,
                config.is_active,
                created_by,
                timestamp(&now),
            ],
        )?;

        Ok(PermissionRule::from_config(
            conn.last_insert_rowid(),
            config,
            created_by,
            now,
        ))
    }

    fn update_rule(
        &self,
        rule_id: i64,
        update: &RuleUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<PermissionRule>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!("SELECT {} FROM permission_rules WHERE id = ?1", RULE_COLUMNS),
                params![rule_id],
                rule_from_row,
            )
            .optional()?;

        let Some(mut rule) = existing else {
            return Ok(None);
        };

        rule.apply(update, now);
        write_rule(&tx, &rule)?;
        tx.commit()?;
        Ok(Some(rule))
    }

    fn delete_rule(&self, rule_id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM permission_rules WHERE id = ?1", params![rule_id])?;
        Ok(removed > 0)
    }

    fn upsert_evaluation(&self, evaluation: &RuleEvaluation) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rule_evaluations (
                rule_id, entity_type, entity_id, user_id, matches, permissions,
                evaluated_at, expires_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (rule_id, entity_type, entity_id, user_id) DO UPDATE SET
                matches = excluded.matches,
                permissions = excluded.permissions,
                evaluated_at = excluded.evaluated_at,
                expires_at = excluded.expires_at",
            params![
                evaluation.rule_id,
                evaluation.entity_type,
                evaluation.entity_id,
                evaluation.user_id,
                evaluation.matches,
                serde_json::to_string(&evaluation.permissions)?,
                timestamp(&evaluation.evaluated_at),
                timestamp(&evaluation.expires_at),
            ],
        )?;
        Ok(())
    }

    fn insert_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rule_audit_log (
                rule_id, entity_type, entity_id, user_id, action, details, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.rule_id,
                entry.entity_type,
                entry.entity_id,
                entry.user_id,
                entry.action.as_str(),
                serde_json::to_string(&entry.details)?,
                timestamp(&entry.timestamp),
            ],
        )?;
        Ok(())
    }

    fn evaluations_for(&self, entity_type: &str, entity_id: i64) -> Result<Vec<RuleEvaluation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT rule_id, entity_type, entity_id, user_id, matches, permissions,
                    evaluated_at, expires_at
             FROM rule_evaluations
             WHERE entity_type = ?1 AND entity_id = ?2
             ORDER BY evaluated_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![entity_type, entity_id], evaluation_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn audit_entries(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>> {
        let mut sql = String::from(
            "SELECT id, rule_id, entity_type, entity_id, user_id, action, details, created_at
             FROM rule_audit_log WHERE 1 = 1",
        );
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(rule_id) = query.rule_id {
            args.push(SqlValue::Integer(rule_id));
            sql.push_str(&format!(" AND rule_id = ?{}", args.len()));
        }
        if let Some(entity_type) = &query.entity_type {
            args.push(SqlValue::Text(entity_type.clone()));
            sql.push_str(&format!(" AND entity_type = ?{}", args.len()));
        }
        if let Some(entity_id) = query.entity_id {
            args.push(SqlValue::Integer(entity_id));
            sql.push_str(&format!(" AND entity_id = ?{}", args.len()));
        }
        if let Some(user_id) = query.user_id {
            args.push(SqlValue::Integer(user_id));
            sql.push_str(&format!(" AND user_id = ?{}", args.len()));
        }
        if let Some(action) = query.action {
            args.push(SqlValue::Text(action.as_str().to_string()));
            sql.push_str(&format!(" AND action = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY id DESC");
        if let Some(limit) = query.limit {
            args.push(SqlValue::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", args.len()));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(args.iter()), audit_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }
}
