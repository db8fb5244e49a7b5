//! Request, event and outcome types for upload sessions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cloudgate_backend::{RemoteObjectRef, RemotePath};
use cloudgate_transfer::{ChunkResult, SourceStream};
use serde::Serialize;

/// Per-request overrides of the uploader's policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOverrides {
    pub concurrency: Option<usize>,
    pub chunk_size: Option<u64>,
}

/// One upload: a source, where it goes, and optional overrides.
#[derive(Clone)]
pub struct UploadRequest {
    pub source: Arc<dyn SourceStream>,
    /// Size the caller expects; a mismatch with the bytes read is logged.
    pub declared_size: Option<u64>,
    pub destination: RemotePath,
    pub overrides: RequestOverrides,
}

impl UploadRequest {
    pub fn new(source: Arc<dyn SourceStream>, destination: RemotePath) -> Self {
        Self {
            declared_size: source.size_hint(),
            source,
            destination,
            overrides: RequestOverrides::default(),
        }
    }

    pub fn with_declared_size(mut self, size: u64) -> Self {
        self.declared_size = Some(size);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.overrides.concurrency = Some(concurrency);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.overrides.chunk_size = Some(chunk_size);
        self
    }
}

impl fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadRequest")
            .field("declared_size", &self.declared_size)
            .field("destination", &self.destination)
            .field("overrides", &self.overrides)
            .finish_non_exhaustive()
    }
}

/// How the fast-path probe ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastPathResult {
    /// The backend has no fast path, or the source was empty.
    NotAttempted,
    /// Probed (possibly through challenges) without a match.
    NoMatch,
    /// The backend linked the destination to content it already held.
    Matched(RemoteObjectRef),
}

impl FastPathResult {
    pub fn is_matched(&self) -> bool {
        matches!(self, FastPathResult::Matched(_))
    }
}

/// Lifecycle of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Probing,
    Planning,
    Transferring,
    Finalizing,
    Completed,
    Failed,
    Canceled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Canceled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Init => "init",
            SessionState::Probing => "probing",
            SessionState::Planning => "planning",
            SessionState::Transferring => "transferring",
            SessionState::Finalizing => "finalizing",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Observable milestones of a session, delivered on an optional channel.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    StateChanged {
        session_id: String,
        state: SessionState,
    },
    ChunkStarted {
        number: u32,
        attempt: u32,
    },
    ChunkSucceeded {
        number: u32,
        bytes: u64,
        resumed: bool,
    },
    ChunkRetrying {
        number: u32,
        attempt: u32,
        error: String,
        delay: Duration,
    },
    Progress {
        percent: f64,
        bytes_per_second: f64,
        eta: Option<Duration>,
    },
}

/// Everything known about a finished session.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub object: RemoteObjectRef,
    pub session_id: String,
    pub fast_path: FastPathResult,
    /// Final per-chunk records, ordered by chunk number. Empty when no
    /// chunked upload took place.
    pub chunks: Vec<ChunkResult>,
    /// Bytes sent in chunk bodies.
    pub uploaded_bytes: u64,
    /// Bytes the backend already held from an earlier attempt.
    pub resumed_bytes: u64,
    pub credential_refreshes: u32,
    pub elapsed: Duration,
}
