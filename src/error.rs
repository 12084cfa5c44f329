//! Process-level error type for fdroid-swh.
//!
//! Component errors (validation, archival client, tracker) live next to the
//! component that raises them; this type covers startup, storage, index and
//! status-view failures.

use thiserror::Error;

/// Common error type for the fdroid-swh services
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Template rendering errors
    #[error("Template error: {0}")]
    Template(#[from] askama::Error),

    /// Index acquisition or parsing errors
    #[error("Index error: {0}")]
    Index(String),

    /// A service loop stopped outside of shutdown
    #[error("Service error: {0}")]
    Service(String),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an index error
    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    /// Get the appropriate HTTP status code for this error
    pub fn http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::Config(format!("Invalid URL: {}", e))
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        tracing::error!(err = %self, "request failed");
        let message = match &self {
            Self::Database(_) => "Database error".to_string(),
            Self::Template(_) => "Template error".to_string(),
            _ => self.to_string(),
        };
        (self.http_status(), message).into_response()
    }
}
