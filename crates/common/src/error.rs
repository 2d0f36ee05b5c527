// Error types for tunneld

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single field-level validation problem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: String,
    pub issue: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, issue: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            issue: issue.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {summary}")]
    Validation {
        summary: String,
        issues: Vec<FieldIssue>,
    },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("host key verification failed for {host}: {reason}")]
    HostKey { host: String, reason: String },

    #[error("circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Convenience for validation failures built from collected issues
    pub fn validation(summary: impl Into<String>, issues: Vec<FieldIssue>) -> Self {
        Error::Validation {
            summary: summary.into(),
            issues,
        }
    }

    /// Machine-readable code carried on the wire next to the human message
    pub fn code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::Conflict(_) => "CONFLICT",
            Error::Validation { .. } => "VALIDATION_ERROR",
            Error::Authentication(_) => "AUTH_FAILED",
            Error::HostKey { .. } => "HOST_KEY_VERIFICATION_FAILED",
            Error::CircuitOpen(_) => "CIRCUIT_OPEN",
            Error::Connection(_) => "CONNECTION_FAILED",
            Error::Protocol(_) => "PROTOCOL_ERROR",
            Error::Resource(_) => "RESOURCE_ERROR",
            Error::Timeout(_) => "TIMEOUT",
            Error::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Error::Io(_) => "INTERNAL_ERROR",
            Error::Serialization(_) => "INTERNAL_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::NotFound("tunnel".into()).code(), "NOT_FOUND");
        assert_eq!(Error::Conflict("dup".into()).code(), "CONFLICT");
        assert_eq!(
            Error::CircuitOpen("open for 2s".into()).code(),
            "CIRCUIT_OPEN"
        );
        assert_eq!(
            Error::validation("bad spec", vec![]).code(),
            "VALIDATION_ERROR"
        );
    }

    #[test]
    fn validation_carries_field_issues() {
        let err = Error::validation(
            "bad spec",
            vec![FieldIssue::new("remotePort", "must be between 1 and 65535")],
        );
        match err {
            Error::Validation { issues, .. } => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].field, "remotePort");
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn host_key_error_names_the_host() {
        let err = Error::HostKey {
            host: "bastion:22".into(),
            reason: "key mismatch".into(),
        };
        assert!(err.to_string().contains("bastion:22"));
        assert_eq!(err.code(), "HOST_KEY_VERIFICATION_FAILED");
    }
}
