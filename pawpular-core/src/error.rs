//! Error types for the pawpular core library.
//!
//! Covers configuration loading, outbound HTTP, git lookups and local I/O.

use std::path::PathBuf;

/// Top-level error type for pawpular-core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Invalid override '{raw}': {reason}")]
    InvalidOverride { raw: String, reason: String },

    #[error("HTTP request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("HTTP {status} from {url}: {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("Git error: {0}")]
    Git(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn request(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Request {
            url: url.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_display() {
        let err = CoreError::HttpStatus {
            url: "http://localhost:5000/api".into(),
            status: 404,
            body: "missing".into(),
        };
        assert_eq!(
            err.to_string(),
            "HTTP 404 from http://localhost:5000/api: missing"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Io(_)));
    }
}
