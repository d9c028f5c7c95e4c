//! Entities and actors a rule can speak about

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// CRM record kinds that permission rules can target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Lead,
    Contact,
    Task,
    Appointment,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Lead,
        EntityKind::Contact,
        EntityKind::Task,
        EntityKind::Appointment,
    ];

    /// Subject type string stored on rules
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Lead => "lead",
            EntityKind::Contact => "contact",
            EntityKind::Task => "task",
            EntityKind::Appointment => "appointment",
        }
    }

    /// Table holding records of this kind in the CRM database
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Lead => "leads",
            EntityKind::Contact => "contacts",
            EntityKind::Task => "tasks",
            EntityKind::Appointment => "appointments",
        }
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown entity type '{}'", s))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The slice of a CRM user the engine needs for target matching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub role: String,
}

impl UserRecord {
    pub fn new(id: i64, role: impl Into<String>) -> Self {
        UserRecord {
            id,
            role: role.into(),
        }
    }
}

/// One of the four grants a rule can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionKind {
    Read,
    Write,
    Assign,
    Delete,
}

impl FromStr for PermissionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(PermissionKind::Read),
            "write" => Ok(PermissionKind::Write),
            "assign" => Ok(PermissionKind::Assign),
            "delete" => Ok(PermissionKind::Delete),
            other => Err(format!("unknown permission '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_parse() {
        assert_eq!("lead".parse::<EntityKind>(), Ok(EntityKind::Lead));
        assert_eq!("appointment".parse::<EntityKind>(), Ok(EntityKind::Appointment));
        assert!("Lead".parse::<EntityKind>().is_err());
        assert!("invoice".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_entity_kind_tables() {
        for kind in EntityKind::ALL {
            assert!(kind.table_name().starts_with(kind.as_str()));
        }
    }

    #[test]
    fn test_permission_kind_parse() {
        assert_eq!("WRITE".parse::<PermissionKind>(), Ok(PermissionKind::Write));
        assert!("own".parse::<PermissionKind>().is_err());
    }
}
