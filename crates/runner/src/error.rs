//! Error types for the runner

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Session error: {0}")]
    Session(String),

    #[error("Failed to load {url}: {reason}")]
    Navigation { url: String, reason: String },

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Invalid tests in story {story}: {reason}")]
    Compilation { story: String, reason: String },

    #[error("Page script error: {0}")]
    Script(String),

    #[error("WebDriver error: {error}: {message}")]
    WebDriver { error: String, message: String },

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("A run is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Common(#[from] creevey_common::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
}

impl RunnerError {
    /// Whether the browser session can no longer be trusted after this error
    pub fn is_session_fatal(&self) -> bool {
        match self {
            RunnerError::Session(_) | RunnerError::Timeout(_) | RunnerError::Http(_) => true,
            RunnerError::WebDriver { error, .. } => {
                matches!(error.as_str(), "invalid session id" | "no such window" | "session not created")
            }
            _ => false,
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_fatal_classification() {
        assert!(RunnerError::Session("gone".into()).is_session_fatal());
        assert!(RunnerError::Timeout("capture".into()).is_session_fatal());
        assert!(RunnerError::WebDriver {
            error: "invalid session id".into(),
            message: String::new(),
        }
        .is_session_fatal());
        assert!(!RunnerError::WebDriver {
            error: "no such element".into(),
            message: String::new(),
        }
        .is_session_fatal());
        assert!(!RunnerError::Capture("empty".into()).is_session_fatal());
    }
}
