//! Byte sources the upload engine reads from.
//!
//! A source is either range-readable (local files, spooled temp copies) or
//! strictly sequential (stdin, a request body). Sequential sources are
//! spooled once by [`Fingerprinter::whole_stream`](crate::Fingerprinter::whole_stream)
//! so chunk workers can read arbitrary ranges concurrently.

use std::fmt;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

use crate::TransferError;
use crate::fingerprint::{DigestAlgorithm, Fingerprint};

/// Boxed async reader handed out by sources.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed future returned by [`SourceStream`] methods.
pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransferError>> + Send + 'a>>;

/// A contiguous byte range: `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset (saturating).
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    /// Returns `true` if the range lies entirely within `size` bytes.
    pub fn fits_within(&self, size: u64) -> bool {
        self.offset.checked_add(self.length).is_some_and(|end| end <= size)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{})", self.offset, self.end())
    }
}

/// A byte source of known or unknown length.
pub trait SourceStream: Send + Sync {
    /// Total length if known up front.
    fn size_hint(&self) -> Option<u64>;

    /// Whether [`open_range`](Self::open_range) is supported.
    fn supports_range_read(&self) -> bool;

    /// Opens the source for a single front-to-back read.
    fn open_sequential(&self) -> SourceFuture<'_, BoxReader>;

    /// Opens a reader over exactly `range`.
    fn open_range(&self, range: ByteRange) -> SourceFuture<'_, BoxReader> {
        let _ = range;
        Box::pin(async { Err(TransferError::RangeUnsupported) })
    }

    /// A whole-content digest the caller already knows, if any.
    fn known_fingerprint(&self, algorithm: DigestAlgorithm) -> Option<Fingerprint> {
        let _ = algorithm;
        None
    }
}

/// Reads exactly `range.length` bytes at `range.offset`.
pub async fn read_range_exact(
    source: &dyn SourceStream,
    range: ByteRange,
) -> Result<Vec<u8>, TransferError> {
    if range.length == 0 {
        return Ok(Vec::new());
    }
    let reader = source.open_range(range).await?;
    let mut buf = Vec::with_capacity(range.length as usize);
    let n = reader.take(range.length).read_to_end(&mut buf).await?;
    if (n as u64) < range.length {
        return Err(TransferError::ShortRead {
            expected: range.length,
            actual: n as u64,
        });
    }
    Ok(buf)
}

async fn open_file_range(path: &Path, size: u64, range: ByteRange) -> Result<BoxReader, TransferError> {
    if !range.fits_within(size) {
        return Err(TransferError::RangeOutOfBounds { range, size });
    }
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.offset)).await?;
    Ok(Box::new(file.take(range.length)))
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// A local file; supports concurrent range reads.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    /// Opens `path` and records its current length.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let path = path.into();
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl SourceStream for FileSource {
    fn size_hint(&self) -> Option<u64> {
        Some(self.size)
    }

    fn supports_range_read(&self) -> bool {
        true
    }

    fn open_sequential(&self) -> SourceFuture<'_, BoxReader> {
        Box::pin(async move {
            let file = tokio::fs::File::open(&self.path).await?;
            Ok(Box::new(file) as BoxReader)
        })
    }

    fn open_range(&self, range: ByteRange) -> SourceFuture<'_, BoxReader> {
        Box::pin(open_file_range(&self.path, self.size, range))
    }
}

// ---------------------------------------------------------------------------
// ReaderSource
// ---------------------------------------------------------------------------

/// A one-shot, non-seekable reader (stdin, a request body, a pipe).
pub struct ReaderSource {
    reader: Mutex<Option<BoxReader>>,
    size_hint: Option<u64>,
    fingerprint: Option<Fingerprint>,
}

impl ReaderSource {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, size_hint: Option<u64>) -> Self {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
            size_hint,
            fingerprint: None,
        }
    }

    /// Attaches a digest the caller already computed for this content.
    pub fn with_fingerprint(mut self, fingerprint: Fingerprint) -> Self {
        self.fingerprint = Some(fingerprint);
        self
    }
}

impl SourceStream for ReaderSource {
    fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    fn supports_range_read(&self) -> bool {
        false
    }

    fn open_sequential(&self) -> SourceFuture<'_, BoxReader> {
        let taken = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Box::pin(async move { taken.ok_or(TransferError::SourceConsumed) })
    }

    fn known_fingerprint(&self, algorithm: DigestAlgorithm) -> Option<Fingerprint> {
        self.fingerprint
            .as_ref()
            .filter(|fp| fp.algorithm == algorithm)
            .cloned()
    }
}

// ---------------------------------------------------------------------------
// SpooledSource
// ---------------------------------------------------------------------------

/// A local temporary copy of a sequential source.
///
/// The file is removed when this value is dropped.
#[derive(Debug)]
pub struct SpooledSource {
    path: TempPath,
    size: u64,
}

impl SpooledSource {
    pub(crate) fn new(path: TempPath, size: u64) -> Self {
        Self { path, size }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Deletes the temporary copy now, reporting any error.
    pub fn close(self) -> std::io::Result<()> {
        self.path.close()
    }
}

impl SourceStream for SpooledSource {
    fn size_hint(&self) -> Option<u64> {
        Some(self.size)
    }

    fn supports_range_read(&self) -> bool {
        true
    }

    fn open_sequential(&self) -> SourceFuture<'_, BoxReader> {
        Box::pin(async move {
            let file = tokio::fs::File::open(&*self.path).await?;
            Ok(Box::new(file) as BoxReader)
        })
    }

    fn open_range(&self, range: ByteRange) -> SourceFuture<'_, BoxReader> {
        Box::pin(open_file_range(&self.path, self.size, range))
    }
}
