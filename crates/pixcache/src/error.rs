use std::sync::Arc;

/// Errors surfaced by the cache, the HTTP layer and the fetch facade.
///
/// The type is `Clone` so one outcome can be handed to several observers; heavy
/// sources are kept behind `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server returned status code {status}")]
    HttpStatus { status: u16, body: Option<String> },

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Filesystem error: {source}")]
    Filesystem {
        #[from]
        source: Arc<std::io::Error>,
    },

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FetchError {
    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return FetchError::InvalidUrl(err.to_string());
        }
        if err.is_decode() {
            return FetchError::Deserialization(err.to_string());
        }
        FetchError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Filesystem {
            source: Arc::new(err),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        FetchError::Deserialization(err.to_string())
    }
}

impl From<url::ParseError> for FetchError {
    fn from(err: url::ParseError) -> Self {
        FetchError::InvalidUrl(err.to_string())
    }
}

impl From<tokio::task::JoinError> for FetchError {
    fn from(err: tokio::task::JoinError) -> Self {
        FetchError::Internal(format!("blocking task failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
