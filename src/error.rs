use thiserror::Error;

/// Unified error type for registry, approval, dispatch and management operations.
///
/// Conditions that the dispatcher reports as a degraded result (an unapproved body, a record
/// whose body is missing) are not errors; they surface through
/// [`ReportStatus`](crate::dispatcher::ReportStatus). Per-node failures are
/// [`NodeFault`](crate::evaluator::NodeFault)s captured inside the report.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Input validation failed: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Script not found: {id}")]
    ScriptNotFound { id: String },

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("Authorization failed: {message}")]
    AuthorizationFailed { message: String },

    // Persistence errors (metadata snapshot, approval table, script bodies)
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Create an input validation error
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn script_not_found(id: impl Into<String>) -> Self {
        Self::ScriptNotFound { id: id.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::AuthorizationFailed {
            message: message.into(),
        }
    }

    /// Create a storage error without an underlying io error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a storage error wrapping an io error
    pub fn storage_io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Convert to HTTP status code
    pub fn status_code(&self) -> u16 {
        match self {
            AppError::InvalidInput { .. } => 400,
            AppError::AuthorizationFailed { .. } => 403,
            AppError::ScriptNotFound { .. } => 404,
            AppError::NotFound { .. } => 404,
            AppError::Storage { .. } => 500,
            AppError::Config { .. } => 500,
            AppError::Internal { .. } => 500,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Storage { .. })
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::storage(format!("serialization failed: {}", err))
    }
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::config(err.to_string())
    }
}
