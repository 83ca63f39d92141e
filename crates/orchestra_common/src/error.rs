//! Error types for the Orchestra kernel.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of error codes carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "KERNEL_UNKNOWN")]
    Unknown,
    #[serde(rename = "KERNEL_VALIDATION")]
    Validation,
    #[serde(rename = "KERNEL_UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "KERNEL_NOT_FOUND")]
    NotFound,
    #[serde(rename = "KERNEL_CONFLICT")]
    Conflict,
    #[serde(rename = "KERNEL_INTERNAL")]
    Internal,
    #[serde(rename = "KERNEL_SERVICE_UNAVAILABLE")]
    ServiceUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "KERNEL_UNKNOWN",
            Self::Validation => "KERNEL_VALIDATION",
            Self::Unauthorized => "KERNEL_UNAUTHORIZED",
            Self::NotFound => "KERNEL_NOT_FOUND",
            Self::Conflict => "KERNEL_CONFLICT",
            Self::Internal => "KERNEL_INTERNAL",
            Self::ServiceUnavailable => "KERNEL_SERVICE_UNAVAILABLE",
        }
    }

    /// HTTP status the daemon answers with for this code.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Unauthorized => 401,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::ServiceUnavailable => 503,
            Self::Unknown | Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("{0}")]
    Unknown(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    Internal {
        message: String,
        details: Option<String>,
    },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    pub fn code(&self) -> ErrorCode {
        match self {
            KernelError::Unknown(_) => ErrorCode::Unknown,
            KernelError::Validation(_) => ErrorCode::Validation,
            KernelError::Unauthorized(_) => ErrorCode::Unauthorized,
            KernelError::NotFound(_) => ErrorCode::NotFound,
            KernelError::Conflict(_) => ErrorCode::Conflict,
            KernelError::Internal { .. } => ErrorCode::Internal,
            KernelError::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        KernelError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        KernelError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        KernelError::Conflict(message.into())
    }

    /// Wrap an unexpected failure, keeping the underlying message as details.
    pub fn internal(message: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        KernelError::Internal {
            message: message.into(),
            details: Some(cause.to_string()),
        }
    }

    pub fn details(&self) -> Option<&str> {
        match self {
            KernelError::Internal { details, .. } => details.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(e: serde_json::Error) -> Self {
        KernelError::internal("JSON serialization failed", e)
    }
}

impl From<std::io::Error> for KernelError {
    fn from(e: std::io::Error) -> Self {
        KernelError::internal("I/O operation failed", e)
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for KernelError {
    fn from(e: rusqlite::Error) -> Self {
        KernelError::internal("Database operation failed", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_serialize_with_kernel_prefix() {
        let json = serde_json::to_string(&ErrorCode::NotFound).unwrap();
        assert_eq!(json, "\"KERNEL_NOT_FOUND\"");
        assert_eq!(ErrorCode::ServiceUnavailable.as_str(), "KERNEL_SERVICE_UNAVAILABLE");
    }

    #[test]
    fn test_internal_keeps_cause_as_details() {
        let err = KernelError::internal("Failed to register service", "disk I/O error");
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(err.details(), Some("disk I/O error"));
        assert_eq!(err.to_string(), "Failed to register service");
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(KernelError::conflict("dup").code().http_status(), 409);
        assert_eq!(KernelError::validation("bad").code().http_status(), 400);
        assert_eq!(KernelError::not_found("gone").code().http_status(), 404);
    }
}
