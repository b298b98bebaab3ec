//! Error types for membership resolution.
//!
//! A group that does not exist is not an error: lookups report it as `Ok(None)`.
//! Everything in this module is a genuine failure that callers must see.

use thiserror::Error;

/// Main error type for membership operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid resolver, cache or connection configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The directory connection failed or rejected an operation
    #[error("Directory fault during {operation}: {message}")]
    DirectoryFault {
        /// Directory operation that failed (e.g. `search`, `bind`)
        operation: String,
        /// Error message reported by the directory layer
        message: String,
    },

    /// Directory operation timed out
    #[error("Directory operation timed out: {0}")]
    Timeout(String),

    /// Directory answered with data that could not be interpreted
    #[error("Malformed directory response: {0}")]
    MalformedResponse(String),

    /// Caller supplied an invalid argument
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Cache layer failure
    #[error("Cache error: {0}")]
    CacheError(String),
}

/// Specialized result type for membership operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a [`Error::DirectoryFault`].
    #[must_use]
    pub fn directory(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DirectoryFault {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns the error code for this error type.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::DirectoryFault { .. } => "DIRECTORY_FAULT",
            Self::Timeout(_) => "TIMEOUT",
            Self::MalformedResponse(_) => "MALFORMED_RESPONSE",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::CacheError(_) => "CACHE_ERROR",
        }
    }

    /// Returns true if the error originates from the directory connection.
    #[must_use]
    pub const fn is_directory_fault(&self) -> bool {
        matches!(
            self,
            Self::DirectoryFault { .. } | Self::Timeout(_) | Self::MalformedResponse(_)
        )
    }

    /// Returns true if this error should be logged at error level rather than as a warning.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        matches!(
            self,
            Self::ConfigError(_) | Self::CacheError(_) | Self::DirectoryFault { .. }
        )
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::ConfigError(format!("invalid directory URL: {err}"))
    }
}
