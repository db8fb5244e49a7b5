//! Static description of a backend's upload rules.

use std::path::Path;

use cloudgate_transfer::{ChunkConstraints, DEFAULT_PARTIAL_LEN, DigestAlgorithm, ProgressBasis};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// How the engine confirms that a stored chunk matches the bytes it sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckChecksum {
    /// Every acknowledgement carries the digest of the stored bytes. An
    /// acknowledgement without one is treated as unconfirmed and retried.
    #[default]
    Required,
    /// The backend digests what it received, compares it with the checksum
    /// sent alongside the chunk and rejects the upload on a difference.
    /// Acknowledgements may then omit the checksum.
    ServerVerified,
}

/// What the upload engine needs to know about a backend before talking to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendProfile {
    pub name: String,
    /// Algorithm for fast-path digests and chunk checksums.
    pub digest: DigestAlgorithm,
    /// Length of the leading-bytes digest sent with fast-path probes.
    pub partial_len: u64,
    /// Whether the backend answers fast-path probes at all.
    pub fast_path: bool,
    pub constraints: ChunkConstraints,
    /// Chunks must arrive strictly in order (forces one worker).
    pub ordered_chunks: bool,
    /// Upper bound on concurrent chunk uploads.
    pub max_concurrency: Option<usize>,
    pub progress_basis: ProgressBasis,
    pub ack_checksum: AckChecksum,
}

impl Default for BackendProfile {
    fn default() -> Self {
        Self {
            name: "default".into(),
            digest: DigestAlgorithm::default(),
            partial_len: DEFAULT_PARTIAL_LEN,
            fast_path: true,
            constraints: ChunkConstraints::default(),
            ordered_chunks: false,
            max_concurrency: None,
            progress_basis: ProgressBasis::Bytes,
            ack_checksum: AckChecksum::Required,
        }
    }
}

impl BackendProfile {
    /// Parses a profile from TOML, filling unspecified fields with defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, BackendError> {
        let profile: Self =
            toml::from_str(s).map_err(|e| BackendError::Profile(e.to_string()))?;
        profile.validate()?;
        Ok(profile)
    }

    /// Reads a profile from a TOML file.
    pub fn load(path: &Path) -> Result<Self, BackendError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Rejects profiles no upload could satisfy.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.constraints.max_chunk_count == 0 {
            return Err(BackendError::Profile(
                "constraints.max_chunk_count must be at least 1".into(),
            ));
        }
        if self.max_concurrency == Some(0) {
            return Err(BackendError::Profile(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.constraints.step_table.windows(2).any(|w| w[0] >= w[1]) {
            return Err(BackendError::Profile(
                "constraints.step_table must be strictly ascending".into(),
            ));
        }
        Ok(())
    }

    /// Concurrency after applying the profile's ordering and cap.
    pub fn effective_concurrency(&self, requested: usize) -> usize {
        if self.ordered_chunks {
            return 1;
        }
        let capped = match self.max_concurrency {
            Some(cap) => requested.min(cap),
            None => requested,
        };
        capped.max(1)
    }
}
