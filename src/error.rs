// ABOUTME: Custom error types, stable error codes and fault classification for the migrator
// ABOUTME: Maps any raised fault to a severity and an error code used for recovery matching

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio_postgres::error::SqlState;

use crate::models::{JobStatus, Phase};

#[derive(Debug, Error)]
pub enum MigratorError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Permission error: {0}")]
    Permission(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Concurrency limit reached: organization {organization} already has {limit} active jobs")]
    ConcurrencyLimit { organization: String, limit: usize },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Project {project_ref} did not become healthy after {attempts} checks")]
    ProjectNotReady { project_ref: String, attempts: u32 },

    #[error("Integrity check failed: {0}")]
    IntegrityCheck(String),

    #[error("Phase {phase} rolled back to checkpoint {checkpoint_id}")]
    RolledBack { phase: Phase, checkpoint_id: String },

    #[error("Optional component unavailable: {0}")]
    OptionalComponent(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl MigratorError {
    /// Error code carried by the variant itself, when it has one.
    pub fn structured_code(&self) -> Option<ErrorCode> {
        match self {
            MigratorError::Connection(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("timeout") || lower.contains("timed out") {
                    Some(ErrorCode::ConnectionTimeout)
                } else if lower.contains("refused") {
                    Some(ErrorCode::ConnectionRefused)
                } else {
                    Some(ErrorCode::NetworkError)
                }
            }
            MigratorError::Permission(_) => Some(ErrorCode::PermissionDenied),
            MigratorError::Validation(_)
            | MigratorError::ConcurrencyLimit { .. }
            | MigratorError::JobNotFound(_)
            | MigratorError::AlertNotFound(_)
            | MigratorError::InvalidTransition { .. } => Some(ErrorCode::UnknownError),
            MigratorError::ProjectNotReady { .. } => Some(ErrorCode::RequestTimeout),
            MigratorError::IntegrityCheck(_) => Some(ErrorCode::DataCorruption),
            MigratorError::OptionalComponent(_) => Some(ErrorCode::OptionalComponentError),
            MigratorError::Api(e) => Some(e.error_code()),
            MigratorError::Migration(_) | MigratorError::RolledBack { .. } => None,
        }
    }
}

/// Error half of every collaborator call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// HTTP status when the request reached the server.
    pub status: Option<u16>,
    pub message: String,
}

impl ApiError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    /// Derive the error code from the response status, falling back to the message.
    pub fn error_code(&self) -> ErrorCode {
        match self.status {
            Some(401) => ErrorCode::AuthFailed,
            Some(403) => ErrorCode::PermissionDenied,
            Some(404) => ErrorCode::ResourceNotFound,
            Some(408) => ErrorCode::RequestTimeout,
            Some(409) => {
                if self.message.to_lowercase().contains("exist") {
                    ErrorCode::ResourceExists
                } else {
                    ErrorCode::ResourceConflict
                }
            }
            Some(423) => ErrorCode::ResourceLocked,
            Some(501) => ErrorCode::FeatureNotSupported,
            Some(502) | Some(503) => ErrorCode::NetworkError,
            Some(504) => ErrorCode::ConnectionTimeout,
            Some(s) if s >= 500 => ErrorCode::SystemError,
            _ => classify_message(&self.message).0,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "API request failed with status {}: {}", status, self.message),
            None => write!(f, "API request failed: {}", self.message),
        }
    }
}

impl std::error::Error for ApiError {}

/// Tagged result returned by every collaborator operation.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Closed set of codes that recovery strategies match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConnectionTimeout,
    ConnectionRefused,
    NetworkError,
    ResourceConflict,
    ResourceLocked,
    ResourceExists,
    PermissionDenied,
    InsufficientPrivileges,
    AuthFailed,
    DataCorruption,
    ConstraintViolation,
    ForeignKeyError,
    CriticalError,
    SystemError,
    UnexpectedError,
    OptionalComponentError,
    FeatureNotSupported,
    ResourceNotFound,
    RequestTimeout,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ResourceConflict => "RESOURCE_CONFLICT",
            ErrorCode::ResourceLocked => "RESOURCE_LOCKED",
            ErrorCode::ResourceExists => "RESOURCE_EXISTS",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::InsufficientPrivileges => "INSUFFICIENT_PRIVILEGES",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::DataCorruption => "DATA_CORRUPTION",
            ErrorCode::ConstraintViolation => "CONSTRAINT_VIOLATION",
            ErrorCode::ForeignKeyError => "FOREIGN_KEY_ERROR",
            ErrorCode::CriticalError => "CRITICAL_ERROR",
            ErrorCode::SystemError => "SYSTEM_ERROR",
            ErrorCode::UnexpectedError => "UNEXPECTED_ERROR",
            ErrorCode::OptionalComponentError => "OPTIONAL_COMPONENT_ERROR",
            ErrorCode::FeatureNotSupported => "FEATURE_NOT_SUPPORTED",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorCode::CriticalError => Severity::Critical,
            ErrorCode::PermissionDenied
            | ErrorCode::InsufficientPrivileges
            | ErrorCode::AuthFailed => Severity::Medium,
            ErrorCode::OptionalComponentError | ErrorCode::FeatureNotSupported => Severity::Low,
            _ => Severity::High,
        }
    }

    /// Whether a built-in strategy can resolve this code without an operator.
    pub fn is_auto_recoverable(&self) -> bool {
        !matches!(
            self,
            ErrorCode::PermissionDenied
                | ErrorCode::InsufficientPrivileges
                | ErrorCode::AuthFailed
                | ErrorCode::ResourceNotFound
                | ErrorCode::RequestTimeout
                | ErrorCode::UnknownError
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultClassification {
    pub code: ErrorCode,
    pub severity: Severity,
    pub auto_recoverable: bool,
}

impl FaultClassification {
    fn from_code(code: ErrorCode, severity: Severity) -> Self {
        Self {
            code,
            severity,
            auto_recoverable: code.is_auto_recoverable(),
        }
    }
}

/// Classify a fault raised by a phase executor.
///
/// Typed errors anywhere in the chain win. Only opaque errors fall back to
/// keyword matching on the rendered message, which is a heuristic.
pub fn classify(err: &anyhow::Error) -> FaultClassification {
    let message = format!("{:#}", err);
    for cause in err.chain() {
        if let Some(code) = structured_code(cause) {
            return FaultClassification::from_code(code, structured_severity(code, &message));
        }
    }

    let (code, severity) = classify_message(&message);
    FaultClassification::from_code(code, severity)
}

/// A typed fault is critical only when its code or message says so.
fn structured_severity(code: ErrorCode, message: &str) -> Severity {
    let lower = message.to_lowercase();
    if lower.contains("critical") || lower.contains("fatal") {
        Severity::Critical
    } else {
        code.default_severity()
    }
}

fn structured_code(cause: &(dyn std::error::Error + 'static)) -> Option<ErrorCode> {
    if let Some(e) = cause.downcast_ref::<MigratorError>() {
        return e.structured_code();
    }
    if let Some(e) = cause.downcast_ref::<ApiError>() {
        return Some(e.error_code());
    }
    if let Some(e) = cause.downcast_ref::<tokio_postgres::Error>() {
        return e.code().and_then(sql_state_code);
    }
    if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
        if e.is_timeout() {
            return Some(ErrorCode::ConnectionTimeout);
        }
        if e.is_connect() {
            return Some(ErrorCode::ConnectionRefused);
        }
    }
    None
}

fn sql_state_code(state: &SqlState) -> Option<ErrorCode> {
    let code = if *state == SqlState::INSUFFICIENT_PRIVILEGE {
        ErrorCode::InsufficientPrivileges
    } else if *state == SqlState::INVALID_PASSWORD {
        ErrorCode::AuthFailed
    } else if *state == SqlState::FOREIGN_KEY_VIOLATION {
        ErrorCode::ForeignKeyError
    } else if *state == SqlState::UNIQUE_VIOLATION
        || *state == SqlState::CHECK_VIOLATION
        || *state == SqlState::NOT_NULL_VIOLATION
    {
        ErrorCode::ConstraintViolation
    } else if *state == SqlState::DUPLICATE_TABLE || *state == SqlState::DUPLICATE_OBJECT {
        ErrorCode::ResourceExists
    } else if *state == SqlState::LOCK_NOT_AVAILABLE {
        ErrorCode::ResourceLocked
    } else if *state == SqlState::DATA_CORRUPTED {
        ErrorCode::DataCorruption
    } else if *state == SqlState::UNDEFINED_TABLE {
        ErrorCode::ResourceNotFound
    } else {
        return None;
    };
    Some(code)
}

/// Keyword classification of a human-readable message.
pub fn classify_message(message: &str) -> (ErrorCode, Severity) {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    let code = if has(&["request timeout", "request timed out"]) {
        ErrorCode::RequestTimeout
    } else if has(&["timeout", "timed out"]) {
        ErrorCode::ConnectionTimeout
    } else if has(&["connection refused", "econnrefused"]) {
        ErrorCode::ConnectionRefused
    } else if has(&["network", "connection reset", "econnreset", "dns"]) {
        ErrorCode::NetworkError
    } else if has(&["insufficient privilege"]) {
        ErrorCode::InsufficientPrivileges
    } else if has(&["permission denied", "forbidden"]) {
        ErrorCode::PermissionDenied
    } else if has(&["unauthorized", "authentication", "auth failed", "invalid token"]) {
        ErrorCode::AuthFailed
    } else if has(&["already exists"]) {
        ErrorCode::ResourceExists
    } else if has(&["locked"]) {
        ErrorCode::ResourceLocked
    } else if has(&["conflict"]) {
        ErrorCode::ResourceConflict
    } else if has(&["foreign key"]) {
        ErrorCode::ForeignKeyError
    } else if has(&["constraint", "violates"]) {
        ErrorCode::ConstraintViolation
    } else if has(&["corrupt"]) {
        ErrorCode::DataCorruption
    } else if has(&["not supported", "unsupported"]) {
        ErrorCode::FeatureNotSupported
    } else if has(&["optional"]) {
        ErrorCode::OptionalComponentError
    } else if has(&["not found", "does not exist"]) {
        ErrorCode::ResourceNotFound
    } else if has(&["critical", "fatal"]) {
        ErrorCode::CriticalError
    } else if has(&["out of memory", "disk full", "system"]) {
        ErrorCode::SystemError
    } else if has(&["unexpected"]) {
        ErrorCode::UnexpectedError
    } else {
        ErrorCode::UnknownError
    };

    let severity = if has(&["critical", "fatal"]) {
        Severity::Critical
    } else if has(&["connection", "timeout", "timed out"]) {
        Severity::High
    } else if has(&["permission", "auth", "forbidden"]) {
        Severity::Medium
    } else {
        Severity::High
    };

    (code, severity)
}
