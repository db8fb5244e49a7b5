use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::source::ByteRange;

/// One planned chunk of the source.
///
/// `number` is 1-based and is the only key a backend uses to reassemble
/// the object, so it never changes after planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub number: u32,
    pub offset: u64,
    pub size: u64,
}

impl ChunkSpec {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// The byte range covered by this chunk.
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.offset, self.size)
    }
}

/// Lifecycle of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

/// Per-chunk bookkeeping kept by the upload session.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
    pub spec: ChunkSpec,
    pub state: ChunkState,
    /// Number of upload attempts started for this chunk.
    pub attempt: u32,
    /// Digest of the bytes last read for this chunk.
    pub checksum: Option<Fingerprint>,
    /// Backend identifier for the stored part (etag or part id).
    pub remote_ack: Option<String>,
    pub last_error: Option<String>,
    /// True when the backend already held this part and no bytes were sent.
    pub resumed: bool,
}

impl ChunkResult {
    /// A freshly planned chunk.
    pub fn pending(spec: ChunkSpec) -> Self {
        Self {
            spec,
            state: ChunkState::Pending,
            attempt: 0,
            checksum: None,
            remote_ack: None,
            last_error: None,
            resumed: false,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        self.state == ChunkState::Succeeded
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ChunkState::Succeeded | ChunkState::Failed)
    }
}
