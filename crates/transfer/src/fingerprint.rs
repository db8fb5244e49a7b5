use std::fmt;
use std::path::Path;
use std::sync::Arc;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::source::{ByteRange, SourceStream, SpooledSource};
use crate::{READ_BUFFER_SIZE, TransferError};

/// Hash algorithm a backend expects for dedup and integrity checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Md5,
    #[default]
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    /// Digest length in hex characters.
    pub fn hex_len(self) -> usize {
        match self {
            DigestAlgorithm::Md5 => 32,
            DigestAlgorithm::Sha1 => 40,
            DigestAlgorithm::Sha256 => 64,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DigestAlgorithm::Md5 => "md5",
            DigestAlgorithm::Sha1 => "sha1",
            DigestAlgorithm::Sha256 => "sha256",
        };
        f.write_str(name)
    }
}

/// A digest tagged with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub algorithm: DigestAlgorithm,
    /// Lowercase hex.
    pub hex: String,
}

impl Fingerprint {
    /// Parses a hex digest, normalising to lowercase.
    pub fn from_hex(algorithm: DigestAlgorithm, hex: &str) -> Result<Self, TransferError> {
        if hex.len() != algorithm.hex_len() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(TransferError::InvalidFingerprint(format!(
                "expected {} hex chars for {algorithm}, got {hex:?}",
                algorithm.hex_len()
            )));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_ascii_lowercase(),
        })
    }

    pub fn as_hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Incremental hasher over any supported algorithm.
#[derive(Clone)]
pub enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            DigestAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            DigestAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => Digest::update(h, data),
            Hasher::Sha1(h) => Digest::update(h, data),
            Hasher::Sha256(h) => Digest::update(h, data),
        }
    }

    pub fn finalize(self) -> Fingerprint {
        let (algorithm, hex) = match self {
            Hasher::Md5(h) => (DigestAlgorithm::Md5, hex::encode(h.finalize())),
            Hasher::Sha1(h) => (DigestAlgorithm::Sha1, hex::encode(h.finalize())),
            Hasher::Sha256(h) => (DigestAlgorithm::Sha256, hex::encode(h.finalize())),
        };
        Fingerprint { algorithm, hex }
    }
}

/// Digests `data` in one call.
pub fn checksum_bytes(algorithm: DigestAlgorithm, data: &[u8]) -> Fingerprint {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Size plus leading-bytes and whole-content digests of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigests {
    pub size: u64,
    /// Digest of the first `min(partial_len, size)` bytes.
    pub partial: Fingerprint,
    pub full: Fingerprint,
}

/// A range-readable source plus its digests.
pub struct PreparedSource {
    pub source: Arc<dyn SourceStream>,
    pub digests: ContentDigests,
    /// Set when the input had to be copied to local temporary storage.
    pub spooled: bool,
}

impl fmt::Debug for PreparedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedSource")
            .field("digests", &self.digests)
            .field("spooled", &self.spooled)
            .finish_non_exhaustive()
    }
}

/// Computes whole-stream and byte-range digests with bounded buffers.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    algorithm: DigestAlgorithm,
    partial_len: u64,
}

impl Fingerprinter {
    pub fn new(algorithm: DigestAlgorithm, partial_len: u64) -> Self {
        Self {
            algorithm,
            partial_len,
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn partial_len(&self) -> u64 {
        self.partial_len
    }

    /// Digests exactly `range.length` bytes at `range.offset`.
    pub async fn digest_range(
        &self,
        source: &dyn SourceStream,
        range: ByteRange,
    ) -> Result<Fingerprint, TransferError> {
        let mut hasher = Hasher::new(self.algorithm);
        if range.length == 0 {
            return Ok(hasher.finalize());
        }
        let mut reader = source.open_range(range).await?.take(range.length);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut read: u64 = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            read += n as u64;
        }
        if read < range.length {
            return Err(TransferError::ShortRead {
                expected: range.length,
                actual: read,
            });
        }
        Ok(hasher.finalize())
    }

    /// Digests the whole source and guarantees a range-readable result.
    ///
    /// Range-capable sources are read in place. Sequential sources are
    /// copied once to a temporary file (in `spool_dir`, or the system temp
    /// directory) while hashing, and the copy is returned as the source for
    /// every later read.
    pub async fn whole_stream(
        &self,
        source: Arc<dyn SourceStream>,
        spool_dir: Option<&Path>,
    ) -> Result<PreparedSource, TransferError> {
        if source.supports_range_read() {
            let digests = self.digest_in_place(source.as_ref()).await?;
            debug!(bytes = digests.size, full = %digests.full, "source fingerprinted in place");
            return Ok(PreparedSource {
                source,
                digests,
                spooled: false,
            });
        }

        let named = match spool_dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
            None => tempfile::NamedTempFile::new()?,
        };
        let (file, path) = named.into_parts();
        let mut writer = tokio::fs::File::from_std(file);

        let reader = source.open_sequential().await?;
        let (size, partial, full) = self.hash_stream(reader, Some(&mut writer)).await?;
        writer.flush().await?;
        drop(writer);

        if let Some(hint) = source.size_hint()
            && hint != size
        {
            debug!(declared = hint, actual = size, "sequential source length differs from hint");
        }
        if let Some(known) = source.known_fingerprint(self.algorithm)
            && known != full
        {
            debug!(known = %known, computed = %full, "caller-supplied fingerprint ignored");
        }

        debug!(bytes = size, path = %path.display(), full = %full, "source spooled to temporary file");
        Ok(PreparedSource {
            source: Arc::new(SpooledSource::new(path, size)),
            digests: ContentDigests {
                size,
                partial,
                full,
            },
            spooled: true,
        })
    }

    async fn digest_in_place(&self, source: &dyn SourceStream) -> Result<ContentDigests, TransferError> {
        // A caller-supplied digest saves a full read; only the head is hashed.
        if let (Some(size), Some(full)) = (source.size_hint(), source.known_fingerprint(self.algorithm)) {
            let head = ByteRange::new(0, self.partial_len.min(size));
            let partial = self.digest_range(source, head).await?;
            return Ok(ContentDigests {
                size,
                partial,
                full,
            });
        }

        let reader = source.open_sequential().await?;
        let (size, partial, full) = self
            .hash_stream::<_, tokio::fs::File>(reader, None)
            .await?;
        if let Some(expected) = source.size_hint()
            && expected != size
        {
            return Err(TransferError::ShortRead {
                expected,
                actual: size,
            });
        }
        Ok(ContentDigests {
            size,
            partial,
            full,
        })
    }

    async fn hash_stream<R, W>(
        &self,
        mut reader: R,
        mut writer: Option<&mut W>,
    ) -> Result<(u64, Fingerprint, Fingerprint), TransferError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut full = Hasher::new(self.algorithm);
        let mut partial = Hasher::new(self.algorithm);
        let mut partial_remaining = self.partial_len;
        let mut size: u64 = 0;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let data = &buf[..n];
            full.update(data);
            if partial_remaining > 0 {
                let take = partial_remaining.min(n as u64) as usize;
                partial.update(&data[..take]);
                partial_remaining -= take as u64;
            }
            if let Some(w) = writer.as_deref_mut() {
                w.write_all(data).await?;
            }
            size += n as u64;
        }

        Ok((size, partial.finalize(), full.finalize()))
    }
}
