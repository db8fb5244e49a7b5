//! Content-addressed reference backend on the local filesystem.
//!
//! Layout under the root directory:
//!
//! ```text
//! objects/<alg>-<hex>              content blobs, one per distinct digest
//! links/<container>/<name>         JSON `RemoteObjectRef` per destination
//! staging/<upload_id>/manifest.json
//! staging/<upload_id>/<n>.part     staged chunks
//! ```
//!
//! Upload ids are derived from the destination and content digest, so
//! re-initialising the same upload finds the parts an earlier attempt
//! staged. Every call checks the credential's key, secret, expiry and
//! request signature the way a remote service would.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cloudgate_transfer::{
    ByteRange, ChunkSpec, FileSource, Fingerprint, Fingerprinter, Hasher, checksum_bytes,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::BackendError;
use crate::profile::{AckChecksum, BackendProfile};
use crate::protocol::{BackendFuture, BackendProtocol};
use crate::signing::{HmacSha256Signer, RequestSigner, SignableRequest, constant_time_eq};
use crate::types::{
    Challenge, ChunkAck, ChunkUpload, Credential, FastPathAnswer, FastPathQuery, FinalizeRequest,
    FinalizeStatus, InitRequest, RemoteObjectRef, RemotePart, RemotePath, UploadTicket,
};

const OBJECTS_DIR: &str = "objects";
const LINKS_DIR: &str = "links";
const STAGING_DIR: &str = "staging";
const MANIFEST_FILE: &str = "manifest.json";

/// How long an issued challenge stays answerable.
const CHALLENGE_TTL: chrono::Duration = chrono::Duration::seconds(120);

/// Tunables for [`LocalDirBackend`].
#[derive(Debug, Clone)]
pub struct LocalDirOptions {
    pub profile: BackendProfile,
    /// Lifetime of issued credentials.
    pub credential_ttl: Duration,
    /// Ask for a byte-range proof before confirming a fast-path match.
    pub challenge: bool,
    /// Length of challenged ranges.
    pub challenge_len: u64,
    /// Number of "still assembling" answers before a finalize completes.
    pub assembling_polls: u32,
}

impl Default for LocalDirOptions {
    fn default() -> Self {
        Self {
            profile: BackendProfile {
                name: "local-dir".into(),
                ..BackendProfile::default()
            },
            credential_ttl: Duration::from_secs(15 * 60),
            challenge: true,
            challenge_len: 8,
            assembling_polls: 0,
        }
    }
}

#[derive(Default)]
struct LocalState {
    issued: HashMap<String, Credential>,
    challenges: HashMap<String, PendingChallenge>,
    finalize_polls: HashMap<String, u32>,
}

struct PendingChallenge {
    object_id: String,
    range: ByteRange,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StagingManifest {
    destination: RemotePath,
    size: u64,
    full: Fingerprint,
    chunks: Vec<ChunkSpec>,
}

/// A [`BackendProtocol`] backed by a local directory.
pub struct LocalDirBackend {
    root: PathBuf,
    options: LocalDirOptions,
    signer: Box<dyn RequestSigner>,
    state: Mutex<LocalState>,
}

impl LocalDirBackend {
    /// Opens (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, BackendError> {
        Self::with_options(root, LocalDirOptions::default()).await
    }

    pub async fn with_options(
        root: impl Into<PathBuf>,
        options: LocalDirOptions,
    ) -> Result<Self, BackendError> {
        options.profile.validate()?;
        let root = root.into();
        for dir in [OBJECTS_DIR, LINKS_DIR, STAGING_DIR] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        debug!(root = %root.display(), profile = %options.profile.name, "local store opened");
        Ok(Self {
            root,
            options,
            signer: Box::new(HmacSha256Signer),
            state: Mutex::new(LocalState::default()),
        })
    }

    /// Replaces the request signing scheme.
    pub fn with_signer(mut self, signer: Box<dyn RequestSigner>) -> Self {
        self.signer = signer;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The object currently linked at `path`, if any.
    pub async fn lookup(&self, path: &RemotePath) -> Result<Option<RemoteObjectRef>, BackendError> {
        path.validate()?;
        match tokio::fs::read(self.link_path(path)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn object_id(fingerprint: &Fingerprint) -> String {
        format!("{}-{}", fingerprint.algorithm, fingerprint.hex)
    }

    fn object_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(Self::object_id(fingerprint))
    }

    fn link_path(&self, path: &RemotePath) -> PathBuf {
        self.root
            .join(LINKS_DIR)
            .join(&path.container)
            .join(&path.name)
    }

    fn staging_path(&self, upload_id: &str) -> Result<PathBuf, BackendError> {
        if upload_id.is_empty() || !upload_id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BackendError::NotFound(format!("upload {upload_id:?}")));
        }
        Ok(self.root.join(STAGING_DIR).join(upload_id))
    }

    fn fingerprinter(&self) -> Fingerprinter {
        Fingerprinter::new(self.options.profile.digest, self.options.profile.partial_len)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks the presented credential against the issued one and returns
    /// the server-side copy.
    fn authorize(&self, credential: &Credential, now: DateTime<Utc>) -> Result<Credential, BackendError> {
        let state = self.lock();
        let issued = state
            .issued
            .get(&credential.access_key)
            .ok_or_else(|| BackendError::Unauthorized("unknown access key".into()))?;
        if !constant_time_eq(issued.secret.as_bytes(), credential.secret.as_bytes()) {
            return Err(BackendError::Unauthorized("secret mismatch".into()));
        }
        if issued.is_expired(now) {
            return Err(BackendError::CredentialExpired);
        }
        Ok(issued.clone())
    }

    /// Signs the request as a client would and verifies it as the server.
    fn check_request(
        &self,
        credential: &Credential,
        method: &str,
        path: &str,
        payload: &[u8],
    ) -> Result<(), BackendError> {
        let now = Utc::now();
        let request = SignableRequest::new(method, path, payload, now);
        let signature = self.signer.sign(credential, &request)?;
        let issued = self.authorize(credential, now)?;
        self.signer.verify(&issued, &request, &signature)
    }

    async fn write_link(
        &self,
        destination: &RemotePath,
        size: u64,
        fingerprint: &Fingerprint,
    ) -> Result<RemoteObjectRef, BackendError> {
        let object = RemoteObjectRef {
            id: Self::object_id(fingerprint),
            path: destination.clone(),
            size,
            fingerprint: fingerprint.clone(),
        };
        let link = self.link_path(destination);
        if let Some(parent) = link.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&link, serde_json::to_vec_pretty(&object)?).await?;
        Ok(object)
    }

    fn issue_challenge(&self, object_id: String, size: u64) -> Challenge {
        let length = self.options.challenge_len.clamp(1, size);
        let (offset, token) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(0..=size - length), random_hex(&mut rng, 16))
        };
        let range = ByteRange::new(offset, length);
        let mut state = self.lock();
        let now = Utc::now();
        state.challenges.retain(|_, c| c.expires_at > now);
        state.challenges.insert(
            token.clone(),
            PendingChallenge {
                object_id,
                range,
                expires_at: now + CHALLENGE_TTL,
            },
        );
        Challenge { token, range }
    }

    async fn probe(
        &self,
        credential: &Credential,
        query: &FastPathQuery,
    ) -> Result<FastPathAnswer, BackendError> {
        self.check_request(credential, "POST", "/fast-path", &serde_json::to_vec(query)?)?;
        query.destination.validate()?;
        if !self.options.profile.fast_path {
            return Ok(FastPathAnswer::NoMatch);
        }

        let path = self.object_path(&query.full);
        let source = match FileSource::open(&path).await {
            Ok(source) if source.size() == query.size => source,
            Ok(_) => return Ok(FastPathAnswer::NoMatch),
            Err(cloudgate_transfer::TransferError::Io(e))
                if e.kind() == std::io::ErrorKind::NotFound =>
            {
                return Ok(FastPathAnswer::NoMatch);
            }
            Err(e) => return Err(e.into()),
        };

        let fingerprinter = Fingerprinter::new(query.partial.algorithm, self.options.profile.partial_len);
        let head = ByteRange::new(0, fingerprinter.partial_len().min(query.size));
        if fingerprinter.digest_range(&source, head).await? != query.partial {
            debug!(object = %path.display(), "partial digest differs from stored object");
            return Ok(FastPathAnswer::NoMatch);
        }

        let object_id = Self::object_id(&query.full);
        if self.options.challenge && query.size > 0 {
            let Some(proof) = &query.proof else {
                let challenge = self.issue_challenge(object_id, query.size);
                debug!(range = %challenge.range, "fast-path challenge issued");
                return Ok(FastPathAnswer::Challenge(challenge));
            };

            let pending = self
                .lock()
                .challenges
                .remove(&proof.token)
                .ok_or_else(|| BackendError::ProofRejected("unknown challenge".into()))?;
            if pending.expires_at <= Utc::now() {
                return Err(BackendError::ProofRejected("challenge expired".into()));
            }
            if pending.object_id != object_id || pending.range != proof.range {
                return Err(BackendError::ProofRejected(
                    "proof does not answer the issued challenge".into(),
                ));
            }
            let expected = Fingerprinter::new(proof.digest.algorithm, 0)
                .digest_range(&source, pending.range)
                .await?;
            if expected != proof.digest {
                return Err(BackendError::ProofRejected("range digest mismatch".into()));
            }
        }

        let object = self
            .write_link(&query.destination, query.size, &query.full)
            .await?;
        info!(destination = %object.path, id = %object.id, "fast-path match");
        Ok(FastPathAnswer::Matched(object))
    }

    async fn init(
        &self,
        credential: &Credential,
        request: &InitRequest,
    ) -> Result<UploadTicket, BackendError> {
        self.check_request(credential, "POST", "/uploads", &serde_json::to_vec(request)?)?;
        request.destination.validate()?;

        let upload_id = upload_id_for(request);
        let dir = self.staging_path(&upload_id)?;
        let manifest = StagingManifest {
            destination: request.destination.clone(),
            size: request.size,
            full: request.full.clone(),
            chunks: request.chunks.clone(),
        };

        let existing = match read_manifest(&dir).await? {
            Some(previous) if previous == manifest => self.staged_parts(&dir, &manifest).await?,
            Some(_) => {
                debug!(upload_id = %upload_id, "stale staging area replaced");
                tokio::fs::remove_dir_all(&dir).await?;
                Vec::new()
            }
            None => Vec::new(),
        };
        if existing.is_empty() {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)
                .await?;
        }

        debug!(upload_id = %upload_id, chunks = manifest.chunks.len(), staged = existing.len(), "upload opened");
        Ok(UploadTicket {
            upload_id,
            existing_parts: existing,
        })
    }

    async fn staged_parts(
        &self,
        dir: &Path,
        manifest: &StagingManifest,
    ) -> Result<Vec<RemotePart>, BackendError> {
        let fingerprinter = self.fingerprinter();
        let mut parts = Vec::new();
        for spec in &manifest.chunks {
            let path = part_path(dir, spec.number);
            let Ok(source) = FileSource::open(&path).await else {
                continue;
            };
            if source.size() != spec.size {
                continue;
            }
            let checksum = fingerprinter
                .digest_range(&source, ByteRange::new(0, spec.size))
                .await?;
            parts.push(RemotePart {
                number: spec.number,
                size: spec.size,
                etag: etag_for(&checksum),
                checksum,
            });
        }
        Ok(parts)
    }

    async fn store_chunk(
        &self,
        credential: &Credential,
        chunk: ChunkUpload<'_>,
    ) -> Result<ChunkAck, BackendError> {
        let number = chunk.spec.number;
        let request_path = format!("/uploads/{}/{number}", chunk.upload_id);
        self.check_request(credential, "PUT", &request_path, chunk.data)?;

        let dir = self.staging_path(chunk.upload_id)?;
        let manifest = read_manifest(&dir)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("upload {}", chunk.upload_id)))?;
        let planned = manifest
            .chunks
            .iter()
            .find(|c| c.number == number)
            .ok_or_else(|| BackendError::fatal(format!("chunk {number} is not part of the upload")))?;
        if *planned != chunk.spec || chunk.data.len() as u64 != planned.size {
            return Err(BackendError::fatal(format!(
                "chunk {number} does not match the planned range"
            )));
        }

        let checksum = checksum_bytes(chunk.checksum.algorithm, chunk.data);
        if checksum != *chunk.checksum {
            return Err(BackendError::retryable(format!(
                "chunk {number} bytes do not match the sent checksum"
            )));
        }
        let path = part_path(&dir, number);
        let tmp = path.with_extension("part.tmp");
        tokio::fs::write(&tmp, chunk.data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(upload_id = %chunk.upload_id, chunk = number, bytes = chunk.data.len(), "chunk staged");
        let etag = etag_for(&checksum);
        Ok(ChunkAck {
            number,
            etag,
            checksum: match self.options.profile.ack_checksum {
                AckChecksum::Required => Some(checksum),
                AckChecksum::ServerVerified => None,
            },
        })
    }

    async fn complete(
        &self,
        credential: &Credential,
        request: &FinalizeRequest,
    ) -> Result<FinalizeStatus, BackendError> {
        let request_path = format!("/uploads/{}/complete", request.upload_id);
        self.check_request(credential, "POST", &request_path, &serde_json::to_vec(request)?)?;

        let dir = self.staging_path(&request.upload_id)?;
        let manifest = read_manifest(&dir)
            .await?
            .ok_or_else(|| BackendError::NotFound(format!("upload {}", request.upload_id)))?;

        {
            let mut state = self.lock();
            let polls = state
                .finalize_polls
                .entry(request.upload_id.clone())
                .or_insert(0);
            if *polls < self.options.assembling_polls {
                *polls += 1;
                return Ok(FinalizeStatus::Assembling {
                    retry_after: Some(Duration::from_millis(20)),
                });
            }
        }

        if request.parts.len() != manifest.chunks.len() {
            return Err(BackendError::fatal(format!(
                "expected {} parts, got {}",
                manifest.chunks.len(),
                request.parts.len()
            )));
        }

        let named = tempfile::NamedTempFile::new_in(self.root.join(OBJECTS_DIR))?;
        let (file, tmp_path) = named.into_parts();
        let mut out = tokio::fs::File::from_std(file);
        let mut full = Hasher::new(request.full.algorithm);

        for (part, spec) in request.parts.iter().zip(&manifest.chunks) {
            if part.number != spec.number {
                return Err(BackendError::fatal(format!(
                    "part {} listed where part {} belongs",
                    part.number, spec.number
                )));
            }
            let data = tokio::fs::read(part_path(&dir, spec.number))
                .await
                .map_err(|_| BackendError::fatal(format!("part {} was never uploaded", spec.number)))?;
            let staged = checksum_bytes(part.checksum.algorithm, &data);
            if data.len() as u64 != spec.size || staged != part.checksum {
                return Err(BackendError::fatal(format!(
                    "part {} does not match its acknowledgement",
                    spec.number
                )));
            }
            full.update(&data);
            out.write_all(&data).await?;
        }
        out.flush().await?;
        drop(out);

        let full = full.finalize();
        if full != request.full || full != manifest.full {
            return Err(BackendError::fatal(format!(
                "assembled content digest {full} does not match {}",
                request.full
            )));
        }

        tmp_path
            .persist(self.object_path(&full))
            .map_err(|e| BackendError::Io(e.error))?;
        let object = self
            .write_link(&request.destination, manifest.size, &full)
            .await?;
        tokio::fs::remove_dir_all(&dir).await?;
        self.lock().finalize_polls.remove(&request.upload_id);

        info!(destination = %object.path, id = %object.id, bytes = object.size, "object assembled");
        Ok(FinalizeStatus::Done(object))
    }

    async fn empty(
        &self,
        credential: &Credential,
        destination: &RemotePath,
        digest: &Fingerprint,
    ) -> Result<RemoteObjectRef, BackendError> {
        let request_path = format!("/objects/{destination}");
        self.check_request(credential, "PUT", &request_path, b"")?;
        destination.validate()?;
        if *digest != checksum_bytes(digest.algorithm, b"") {
            return Err(BackendError::fatal("digest is not the digest of empty content"));
        }
        let path = self.object_path(digest);
        if tokio::fs::metadata(&path).await.is_err() {
            tokio::fs::write(&path, b"").await?;
        }
        self.write_link(destination, 0, digest).await
    }

    async fn abort(&self, credential: &Credential, upload_id: &str) -> Result<(), BackendError> {
        self.check_request(credential, "DELETE", &format!("/uploads/{upload_id}"), b"")?;
        let dir = self.staging_path(upload_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.lock().finalize_polls.remove(upload_id);
        debug!(upload_id, "upload aborted");
        Ok(())
    }
}

impl BackendProtocol for LocalDirBackend {
    fn profile(&self) -> &BackendProfile {
        &self.options.profile
    }

    fn get_credential(&self) -> BackendFuture<'_, Credential> {
        Box::pin(async move {
            let now = Utc::now();
            let ttl = chrono::Duration::from_std(self.options.credential_ttl)
                .map_err(|e| BackendError::Profile(e.to_string()))?;
            let credential = {
                let mut rng = rand::thread_rng();
                Credential {
                    access_key: format!("LD{}", random_hex(&mut rng, 8).to_ascii_uppercase()),
                    secret: random_hex(&mut rng, 32),
                    session_token: Some(random_hex(&mut rng, 16)),
                    issued_at: now,
                    expires_at: now + ttl,
                    scope: self.options.profile.name.clone(),
                }
            };
            let mut state = self.lock();
            state.issued.retain(|_, c| !c.is_expired(now));
            state
                .issued
                .insert(credential.access_key.clone(), credential.clone());
            debug!(access_key = %credential.access_key, expires_at = %credential.expires_at, "credential issued");
            Ok(credential)
        })
    }

    fn probe_fast_path<'a>(
        &'a self,
        credential: &'a Credential,
        query: &'a FastPathQuery,
    ) -> BackendFuture<'a, FastPathAnswer> {
        Box::pin(self.probe(credential, query))
    }

    fn init_chunked_upload<'a>(
        &'a self,
        credential: &'a Credential,
        request: &'a InitRequest,
    ) -> BackendFuture<'a, UploadTicket> {
        Box::pin(self.init(credential, request))
    }

    fn upload_chunk<'a>(
        &'a self,
        credential: &'a Credential,
        chunk: ChunkUpload<'a>,
    ) -> BackendFuture<'a, ChunkAck> {
        Box::pin(self.store_chunk(credential, chunk))
    }

    fn finalize<'a>(
        &'a self,
        credential: &'a Credential,
        request: &'a FinalizeRequest,
    ) -> BackendFuture<'a, FinalizeStatus> {
        Box::pin(self.complete(credential, request))
    }

    fn create_empty<'a>(
        &'a self,
        credential: &'a Credential,
        destination: &'a RemotePath,
        digest: &'a Fingerprint,
    ) -> BackendFuture<'a, RemoteObjectRef> {
        Box::pin(self.empty(credential, destination, digest))
    }

    fn abort_upload<'a>(
        &'a self,
        credential: &'a Credential,
        upload_id: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(self.abort(credential, upload_id))
    }
}

fn random_hex(rng: &mut impl Rng, len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rng.fill(bytes.as_mut_slice());
    hex::encode(bytes)
}

fn upload_id_for(request: &InitRequest) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.destination.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(request.size.to_le_bytes());
    hasher.update(request.full.to_string().as_bytes());
    hasher.update((request.chunks.len() as u64).to_le_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

fn etag_for(checksum: &Fingerprint) -> String {
    format!("\"{}\"", checksum.hex)
}

fn part_path(dir: &Path, number: u32) -> PathBuf {
    dir.join(format!("{number}.part"))
}

async fn read_manifest(dir: &Path) -> Result<Option<StagingManifest>, BackendError> {
    match tokio::fs::read(dir.join(MANIFEST_FILE)).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
