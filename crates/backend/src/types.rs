//! Wire-neutral request and response types shared by every backend.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cloudgate_transfer::{ByteRange, ChunkSpec, Fingerprint, validate_object_name};
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Destination of an upload: a container plus an object name inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemotePath {
    pub container: String,
    pub name: String,
}

impl RemotePath {
    /// Builds a validated destination.
    pub fn new(container: impl Into<String>, name: impl Into<String>) -> Result<Self, BackendError> {
        let path = Self {
            container: container.into(),
            name: name.into(),
        };
        path.validate()?;
        Ok(path)
    }

    /// Parses `container/name/with/segments`.
    pub fn parse(s: &str) -> Result<Self, BackendError> {
        match s.split_once('/') {
            Some((container, name)) => Self::new(container, name),
            None => Err(BackendError::InvalidDestination(format!(
                "expected container/name, got {s:?}"
            ))),
        }
    }

    /// Checks the container is a single plain segment and the name is a
    /// safe relative object name.
    pub fn validate(&self) -> Result<(), BackendError> {
        let c = &self.container;
        if c.is_empty()
            || c == "."
            || c == ".."
            || c.contains(['/', '\\', '\0'])
        {
            return Err(BackendError::InvalidDestination(format!(
                "invalid container name {c:?}"
            )));
        }
        validate_object_name(&self.name)
            .map_err(|e| BackendError::InvalidDestination(e.to_string()))
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.name)
    }
}

/// A stored object as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObjectRef {
    /// Backend-assigned identifier.
    pub id: String,
    pub path: RemotePath,
    pub size: u64,
    pub fingerprint: Fingerprint,
}

/// A short-lived upload credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_key: String,
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
}

impl Credential {
    /// Time left before expiry at `now`, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether the credential outlives a request that needs `needed` more time.
    pub fn covers(&self, now: DateTime<Utc>, needed: Duration) -> bool {
        self.remaining(now) > needed
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key", &self.access_key)
            .field("secret", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Fast path
// ---------------------------------------------------------------------------

/// Asks whether the backend already holds identical content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastPathQuery {
    pub destination: RemotePath,
    pub size: u64,
    /// Digest of the leading bytes.
    pub partial: Fingerprint,
    pub full: Fingerprint,
    /// Answer to the previous challenge, if one was issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<ChallengeProof>,
}

/// A byte range the backend wants hashed before confirming a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub token: String,
    pub range: ByteRange,
}

/// The client's answer to a [`Challenge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeProof {
    pub token: String,
    pub range: ByteRange,
    pub digest: Fingerprint,
}

/// Backend response to a [`FastPathQuery`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FastPathAnswer {
    Matched(RemoteObjectRef),
    NoMatch,
    Challenge(Challenge),
}

// ---------------------------------------------------------------------------
// Chunked upload
// ---------------------------------------------------------------------------

/// Opens a chunked upload for a planned object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    pub destination: RemotePath,
    pub size: u64,
    pub full: Fingerprint,
    pub chunks: Vec<ChunkSpec>,
}

/// A part the backend already holds for this upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePart {
    pub number: u32,
    pub size: u64,
    pub checksum: Fingerprint,
    pub etag: String,
}

/// Backend handle for an open chunked upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTicket {
    pub upload_id: String,
    /// Parts staged by an earlier attempt at the same upload.
    #[serde(default)]
    pub existing_parts: Vec<RemotePart>,
}

/// One chunk's payload, borrowed from the caller.
#[derive(Clone, Copy)]
pub struct ChunkUpload<'a> {
    pub upload_id: &'a str,
    pub spec: ChunkSpec,
    pub checksum: &'a Fingerprint,
    pub data: &'a [u8],
}

impl fmt::Debug for ChunkUpload<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkUpload")
            .field("upload_id", &self.upload_id)
            .field("spec", &self.spec)
            .field("checksum", &self.checksum)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Backend acknowledgement for a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAck {
    pub number: u32,
    pub etag: String,
    /// Digest the backend computed over the received bytes.
    ///
    /// May be `None` only for backends whose profile declares
    /// [`AckChecksum::ServerVerified`](crate::AckChecksum::ServerVerified).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Fingerprint>,
}

/// A chunk acknowledgement keyed by chunk number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRef {
    pub number: u32,
    pub etag: String,
    pub checksum: Fingerprint,
}

/// Commits an upload. `parts` is ordered by chunk number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub upload_id: String,
    pub destination: RemotePath,
    pub size: u64,
    pub full: Fingerprint,
    pub parts: Vec<PartRef>,
}

/// Backend response to a [`FinalizeRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeStatus {
    Done(RemoteObjectRef),
    /// Assembly continues server-side; poll again.
    Assembling { retry_after: Option<Duration> },
}
