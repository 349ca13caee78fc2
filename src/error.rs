use std::path::PathBuf;

use thiserror::Error;

/// Error types for the attendance server
#[derive(Debug, Error)]
pub enum AttendanceError {
    /// Protocol errors: the offending connection is dropped
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Username must not be empty")]
    EmptyUsername,

    #[error("Action {0} requires a prior login")]
    NotAuthenticated(String),

    /// Rejected but the connection stays open
    #[error("Connection for {session} may not act on behalf of {requested}")]
    IdentityMismatch { session: String, requested: String },

    /// Registry errors
    #[error("{0} is already connected")]
    DuplicateIdentity(String),

    #[error("Peer {0} unreachable")]
    PeerUnreachable(String),

    /// Persistent store errors
    #[error("Store I/O failed for {path}: {source}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize store contents: {0}")]
    StoreSerialize(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Failed to parse configuration {key}: {value}")]
    ConfigurationParseFailed { key: String, value: String },

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using AttendanceError
pub type Result<T> = std::result::Result<T, AttendanceError>;

impl AttendanceError {
    /// Helper to create Internal errors with context
    pub fn internal(msg: impl Into<String>) -> Self {
        AttendanceError::Internal(msg.into())
    }

    /// Helper to create InvalidMessage errors
    pub fn protocol(msg: impl Into<String>) -> Self {
        AttendanceError::InvalidMessage(msg.into())
    }

    pub fn store_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AttendanceError::StoreIo {
            path: path.into(),
            source,
        }
    }

    /// Whether the session that hit this error must be closed.
    ///
    /// Malformed traffic and failed logins close the connection; requests that
    /// are well-formed but not permitted are only logged.
    pub fn is_fatal_to_connection(&self) -> bool {
        !matches!(self, AttendanceError::IdentityMismatch { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AttendanceError::InvalidRole("admin".to_string());
        assert_eq!(err.to_string(), "Invalid role: admin");

        let err = AttendanceError::FrameTooLarge { limit: 16 };
        assert_eq!(err.to_string(), "Frame exceeds 16 bytes");
    }

    #[test]
    fn test_error_helpers() {
        let err = AttendanceError::internal("Something went wrong");
        assert!(matches!(err, AttendanceError::Internal(_)));

        let err = AttendanceError::protocol("missing action");
        assert!(matches!(err, AttendanceError::InvalidMessage(_)));
    }

    #[test]
    fn test_connection_fatality() {
        assert!(AttendanceError::EmptyUsername.is_fatal_to_connection());
        assert!(AttendanceError::DuplicateIdentity("alice".into()).is_fatal_to_connection());
        assert!(!AttendanceError::IdentityMismatch {
            session: "alice".into(),
            requested: "bob".into(),
        }
        .is_fatal_to_connection());
    }
}
