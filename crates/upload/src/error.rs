//! Upload error types.

use std::fmt;

use cloudgate_backend::BackendError;
use cloudgate_transfer::{Fingerprint, PlanError, TransferError};

/// Why a session stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's cancellation token fired.
    Requested,
    /// The session ran past its configured time limit.
    Timeout,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => f.write_str("cancellation requested"),
            CancelReason::Timeout => f.write_str("session timed out"),
        }
    }
}

/// The single terminal error of an upload session.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("invalid upload request: {0}")]
    InvalidRequest(String),

    #[error("planning failed: {0}")]
    Planning(#[from] PlanError),

    #[error("source read failed: {0}")]
    TransferIo(#[from] TransferError),

    #[error("credential unavailable: {0}")]
    Credential(#[source] BackendError),

    #[error("could not open chunked upload: {0}")]
    Init(#[source] BackendError),

    #[error("chunk {number} failed after {attempts} attempt(s): {source}")]
    ChunkUpload {
        number: u32,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("chunk {number} could not be read after {attempts} attempt(s): {source}")]
    ChunkRead {
        number: u32,
        attempts: u32,
        #[source]
        source: TransferError,
    },

    #[error(
        "chunk {number} checksum mismatch after {attempts} attempt(s): sent {expected}, backend stored {actual}"
    )]
    ChecksumMismatch {
        number: u32,
        attempts: u32,
        expected: Fingerprint,
        actual: Fingerprint,
    },

    #[error("chunk {number} was never confirmed by a backend checksum after {attempts} attempt(s)")]
    ChecksumUnconfirmed { number: u32, attempts: u32 },

    #[error("backend still assembling after {polls} polls")]
    BackendBusy { polls: u32 },

    #[error("finalize failed: {0}")]
    Finalize(#[source] BackendError),

    #[error("upload canceled: {0}")]
    Canceled(CancelReason),

    #[error("chunk worker stopped unexpectedly: {0}")]
    Worker(String),
}

impl UploadError {
    /// The chunk a chunk-level failure refers to.
    pub fn chunk_number(&self) -> Option<u32> {
        match self {
            UploadError::ChunkUpload { number, .. }
            | UploadError::ChunkRead { number, .. }
            | UploadError::ChecksumMismatch { number, .. }
            | UploadError::ChecksumUnconfirmed { number, .. } => Some(*number),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, UploadError::Canceled(_))
    }
}
