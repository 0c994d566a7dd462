//! Azure client errors

use thiserror::Error;

/// Errors that can occur when interacting with the Azure Resource Manager API
#[derive(Debug, Error)]
pub enum AzureError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Azure API returned an error
    #[error("Azure API error: {status} {code}: {message}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Azure error code
        code: String,
        /// Azure error message
        message: String,
    },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Token acquisition failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Long-running operation ended in a non-successful state
    #[error("Operation failed: {0}")]
    Operation(String),

    /// Credentials file could not be read or parsed
    #[error("Invalid credentials: {0}")]
    Credentials(String),

    /// Error with a description of the operation that caused it
    #[error("{context}: {source}")]
    Context {
        /// What was being done
        context: String,
        /// Underlying error
        #[source]
        source: Box<AzureError>,
    },
}

impl AzureError {
    /// Wraps the error with a description of the failed operation.
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        AzureError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns true if the error, or the error it wraps, is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            AzureError::NotFound(_) => true,
            AzureError::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}
