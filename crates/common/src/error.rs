//! Error types for qmanager

use thiserror::Error;

/// Result type alias using qmanager Error
pub type Result<T> = std::result::Result<T, Error>;

/// qmanager error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Access denied: {resource} requires role {required}")]
    AccessDenied { resource: String, required: String },

    #[error("Resource not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("External command failed: {message} ({command})")]
    Process { command: String, message: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Route already registered: {0}")]
    DuplicateRoute(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Path escapes the configured root: {0}")]
    PathEscape(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Single-message validation failure
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::Validation(vec![message.into()])
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Returns true for a UNIQUE / FOREIGN KEY rejection raised by SQLite.
    ///
    /// Both raw driver errors and already-mapped [`Error::Constraint`] values count.
    pub fn is_constraint(&self) -> bool {
        match self {
            Error::Constraint(_) => true,
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }

    /// Whether the error is caused by user input or missing resources and can be
    /// shown as-is, as opposed to an internal fault that gets a generic message.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::AccessDenied { .. }
                | Error::NotFound { .. }
                | Error::Process { .. }
                | Error::Constraint(_)
                | Error::PathEscape(_)
        )
    }
}
