//! Backend error types.

use cloudgate_transfer::TransferError;

/// Errors returned by a [`BackendProtocol`](crate::BackendProtocol) call.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("credential expired")]
    CredentialExpired,

    #[error("rejected by backend: {message}")]
    Rejected { message: String, retryable: bool },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("challenge proof rejected: {0}")]
    ProofRejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("invalid profile: {0}")]
    Profile(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
}

impl BackendError {
    /// Shorthand for a rejection the caller may retry.
    pub fn retryable(message: impl Into<String>) -> Self {
        BackendError::Rejected {
            message: message.into(),
            retryable: true,
        }
    }

    /// Shorthand for a rejection that will not succeed on retry.
    pub fn fatal(message: impl Into<String>) -> Self {
        BackendError::Rejected {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Transport(_) | BackendError::Io(_) => true,
            BackendError::Rejected { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether the request failed because of its credential.
    ///
    /// The caller should refresh the credential and retry.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            BackendError::Unauthorized(_) | BackendError::CredentialExpired
        )
    }
}
