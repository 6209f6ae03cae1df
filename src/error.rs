//! Error taxonomy for the pipeline.
//!
//! Discovery errors are recovered where they happen, analysis and validation
//! errors end a single file's attempt, and store errors abort a batch.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors surfaced by a remote file source.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("permission denied: {0}")]
    Permission(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Rate limiting, timeouts and server-side hiccups. Safe to retry.
    #[error("transient remote error: {0}")]
    Transient(String),

    #[error("remote source error: {0}")]
    Other(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// Errors from a vision backend call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AnalysisError {
    /// Backend unreachable, timed out or overloaded. Retryable.
    #[error("vision backend unavailable: {0}")]
    Unavailable(String),

    /// Quota, auth or request errors. Not retried within the same run.
    #[error("vision backend rejected the request: {0}")]
    Rejected(String),

    #[error("malformed vision response: {0}")]
    MalformedResponse(String),
}

impl AnalysisError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AnalysisError::Unavailable(_))
    }
}

/// A single field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationIssue {
    #[error("{field}={value} is outside 1..=5")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("{field}={value:?} is not an allowed value")]
    UnknownEnum { field: &'static str, value: String },

    #[error("{field} is missing or empty")]
    MissingField { field: &'static str },
}

impl ValidationIssue {
    pub fn field(&self) -> &'static str {
        match self {
            ValidationIssue::OutOfRange { field, .. }
            | ValidationIssue::UnknownEnum { field, .. }
            | ValidationIssue::MissingField { field } => field,
        }
    }
}

/// Rejection of an analysis result, listing every offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation failed: {}", join_issues(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    pub fn fields(&self) -> Vec<&'static str> {
        self.issues.iter().map(ValidationIssue::field).collect()
    }
}

fn join_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures of the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("store connection lost: {0}")]
    ConnectionLost(String),

    #[error("store query failed: {0}")]
    Query(#[source] rusqlite::Error),

    /// A row held a value the schema should have prevented.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, ref message) = error {
            let detail = message.clone().unwrap_or_else(|| failure.to_string());
            match failure.code {
                ErrorCode::ConstraintViolation => return StoreError::ConstraintViolation(detail),
                ErrorCode::CannotOpen
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::NotADatabase => return StoreError::ConnectionLost(detail),
                _ => {}
            }
        }
        StoreError::Query(error)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Corrupt(error.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures of the user-edit path.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("no file with id {0}")]
    NotFound(i64),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
