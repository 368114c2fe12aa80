use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("place {0} not found")]
    NotFound(String),
    #[error("place {0} unknown to details provider")]
    PlaceUnavailable(String),
    #[error("listing not found")]
    ListingNotFound,
    #[error("{provider}: {message}")]
    Provider { provider: String, message: String },
    #[error("{provider} blocked: {message}")]
    Blocked { provider: String, message: String },
    #[error("{0}")]
    Processing(String),
    #[error("failed to parse {0}")]
    Parse(String),
    #[error("{0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Keychain(#[from] keyring::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// How a failed processing attempt should be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Provider reacted to our traffic pattern; park until an operator looks.
    Blocked,
    /// Retrying cannot help (authoritative not-found, no listing).
    Terminal,
    /// Worth another attempt after backoff.
    Transient,
}

impl AppError {
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn blocked(provider: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Blocked {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AppError::Blocked { .. } => FailureKind::Blocked,
            AppError::PlaceUnavailable(_) | AppError::ListingNotFound => FailureKind::Terminal,
            // Untagged errors from collaborators still honour the "blocked" keyword.
            other if other.to_string().to_lowercase().contains("blocked") => FailureKind::Blocked,
            _ => FailureKind::Transient,
        }
    }
}
