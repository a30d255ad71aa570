use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the shared key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("store rejected write for key '{0}'")]
    Rejected(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failure modes of a single renewal attempt.
///
/// Cloneable so concurrent waiters on one in-flight refresh receive the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RefreshError {
    #[error("refresh attempts exhausted ({attempts}/{max})")]
    AttemptsExhausted { attempts: u32, max: u32 },
    #[error("no stored credentials for this provider")]
    MissingRecord,
    #[error("stored credentials could not be read: {0}")]
    UnreadableRecord(String),
    #[error("stored credentials carry no refresh token")]
    MissingRefreshToken,
    #[error("renewal endpoint returned {status}")]
    Rejected { status: u16 },
    #[error("renewal request timed out")]
    Timeout,
    #[error("renewal request failed: {0}")]
    Transport(String),
    #[error("credential store unavailable: {0}")]
    Store(String),
    #[error("refresh was cancelled before completing")]
    Cancelled,
}

impl RefreshError {
    /// Whether retrying cannot help until the record is replaced by a new login.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RefreshError::AttemptsExhausted { .. }
                | RefreshError::MissingRecord
                | RefreshError::UnreadableRecord(_)
                | RefreshError::MissingRefreshToken
        )
    }

    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RefreshError::Timeout
        } else {
            RefreshError::Transport(err.to_string())
        }
    }
}

/// Errors surfaced by authentication and credential management routines.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Refresh(#[from] RefreshError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("session endpoint error {status}: {body}")]
    SessionEndpoint { status: StatusCode, body: String },
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),
}
