use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AttendanceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AttendanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            other => Err(AttendanceError::InvalidRole(other.to_string())),
        }
    }
}

/// A participant as asserted at login; unique per username within a role
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub username: String,
    pub role: Role,
}

impl Identity {
    /// Validates raw login fields into an identity
    pub fn parse(username: &str, role: &str) -> Result<Self, AttendanceError> {
        let role = role.parse::<Role>()?;
        let username = username.trim();
        if username.is_empty() {
            return Err(AttendanceError::EmptyUsername);
        }

        Ok(Self {
            username: username.to_string(),
            role,
        })
    }

    pub fn student(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            role: Role::Student,
        }
    }

    pub fn teacher(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            role: Role::Teacher,
        }
    }

    pub fn is_student(&self) -> bool {
        self.role == Role::Student
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.role, self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_identity() {
        let identity = Identity::parse("alice", "student").unwrap();
        assert_eq!(identity, Identity::student("alice"));

        let identity = Identity::parse(" mr_smith ", "teacher").unwrap();
        assert_eq!(identity, Identity::teacher("mr_smith"));
    }

    #[test]
    fn test_parse_rejects_unknown_role() {
        let err = Identity::parse("alice", "admin").unwrap_err();
        assert!(matches!(err, AttendanceError::InvalidRole(role) if role == "admin"));

        // Roles are case sensitive on the wire
        assert!(Identity::parse("alice", "Student").is_err());
    }

    #[test]
    fn test_parse_rejects_blank_username() {
        assert!(matches!(
            Identity::parse("   ", "student"),
            Err(AttendanceError::EmptyUsername)
        ));
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&Role::Teacher).unwrap(), "\"teacher\"");
        let role: Role = serde_json::from_str("\"student\"").unwrap();
        assert_eq!(role, Role::Student);
    }

    #[test]
    fn test_display() {
        assert_eq!(Identity::student("bob").to_string(), "student:bob");
    }
}
