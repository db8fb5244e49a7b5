//! Chunked transfer building blocks: planning, fingerprints, sources and
//! progress tracking.
//!
//! Nothing here talks to a backend. The upload engine composes these pieces
//! with a `BackendProtocol` implementation.

mod fingerprint;
mod planner;
mod progress;
mod source;
mod types;
mod validation;

pub use fingerprint::{
    ContentDigests, DigestAlgorithm, Fingerprint, Fingerprinter, Hasher, PreparedSource,
    checksum_bytes,
};
pub use planner::{
    ChunkConstraints, DEFAULT_MAX_CHUNK_COUNT, DEFAULT_MIN_CHUNK_SIZE, PlanError, plan,
};
pub use progress::{
    MonotonicProgress, NoopProgress, ProgressBasis, ProgressSink, SpeedCalculator,
};
pub use source::{
    BoxReader, ByteRange, FileSource, ReaderSource, SourceFuture, SourceStream, SpooledSource,
    read_range_exact,
};
pub use types::{ChunkResult, ChunkSpec, ChunkState};
pub use validation::{MAX_OBJECT_NAME_LEN, validate_object_name};

/// Read buffer used for hashing and spooling: 64 KiB.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Default length of the partial (leading bytes) fingerprint: 128 KiB.
pub const DEFAULT_PARTIAL_LEN: u64 = 128 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("source does not support range reads")]
    RangeUnsupported,

    #[error("range {range} exceeds source size {size}")]
    RangeOutOfBounds { range: ByteRange, size: u64 },

    #[error("source already consumed")]
    SourceConsumed,

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}
