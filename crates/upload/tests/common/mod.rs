//! Shared fixtures: an in-memory source and a scripted backend that records
//! every call.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use cloudgate_backend::{
    BackendError, BackendFuture, BackendProfile, BackendProtocol, ChunkAck, ChunkUpload,
    Credential, FastPathAnswer, FastPathQuery, FinalizeRequest, FinalizeStatus, InitRequest,
    RemoteObjectRef, RemotePart, RemotePath, UploadTicket,
};
use cloudgate_transfer::{
    BoxReader, ByteRange, ChunkConstraints, Fingerprint, ProgressSink, SourceFuture,
    SourceStream, TransferError, checksum_bytes,
};
use cloudgate_upload::{RetryPolicy, UploadPolicy};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

/// Deterministic, non-repeating-looking test content.
pub fn pattern(len: u64) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

pub fn destination() -> RemotePath {
    RemotePath::parse("media/videos/clip.bin").unwrap()
}

/// A policy with millisecond backoff so retry tests stay fast.
pub fn fast_policy() -> UploadPolicy {
    UploadPolicy {
        retry: RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_factor: 2.0,
            jitter: 0.0,
        },
        finalize_poll_ms: 1,
        ..UploadPolicy::default()
    }
}

/// A profile with a 100 KiB floor and 10,000-part limit.
pub fn profile() -> BackendProfile {
    BackendProfile {
        name: "scripted".into(),
        constraints: ChunkConstraints {
            min_chunk_size: 100 * KIB,
            max_chunk_count: 10_000,
            ..ChunkConstraints::default()
        },
        ..BackendProfile::default()
    }
}

pub fn recording_sink() -> (Arc<dyn ProgressSink>, Arc<Mutex<Vec<f64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    let sink: Arc<dyn ProgressSink> = Arc::new(move |p: f64| s.lock().unwrap().push(p));
    (sink, seen)
}

pub fn assert_monotonic_to_100(values: &[f64]) {
    assert!(!values.is_empty(), "no progress reported");
    assert!(
        values.windows(2).all(|w| w[0] <= w[1]),
        "progress decreased: {values:?}"
    );
    assert_eq!(*values.last().unwrap(), 100.0);
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// A range-readable source over bytes in memory.
pub struct MemorySource {
    data: Arc<Vec<u8>>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }
}

impl SourceStream for MemorySource {
    fn size_hint(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn supports_range_read(&self) -> bool {
        true
    }

    fn open_sequential(&self) -> SourceFuture<'_, BoxReader> {
        let data = self.data.to_vec();
        Box::pin(async move { Ok(Box::new(Cursor::new(data)) as BoxReader) })
    }

    fn open_range(&self, range: ByteRange) -> SourceFuture<'_, BoxReader> {
        let size = self.data.len() as u64;
        let slice = range
            .fits_within(size)
            .then(|| self.data[range.offset as usize..range.end() as usize].to_vec());
        Box::pin(async move {
            match slice {
                Some(bytes) => Ok(Box::new(Cursor::new(bytes)) as BoxReader),
                None => Err(TransferError::RangeOutOfBounds { range, size }),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// ScriptedBackend
// ---------------------------------------------------------------------------

/// A failure injected into one chunk upload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Transport error; retryable.
    Retryable,
    /// Rejection that retrying cannot fix.
    Fatal,
    /// Credential rejected.
    Auth,
    /// Acknowledges with a checksum that does not match the bytes.
    WrongChecksum,
    /// Acknowledges without reporting any checksum.
    NoChecksum,
}

/// One scripted fast-path response.
#[derive(Debug, Clone)]
pub enum ProbeStep {
    Answer(FastPathAnswer),
    Reject(String),
}

#[derive(Default)]
struct Script {
    probes: VecDeque<ProbeStep>,
    chunk_faults: HashMap<u32, VecDeque<Fault>>,
    existing_parts: Vec<RemotePart>,
    assembling: u32,
    credential_failures: u32,
    /// Credentials issued before the token endpoint starts refusing.
    credential_limit: Option<u32>,
}

/// Everything the engine sent to the backend.
#[derive(Default, Debug)]
pub struct CallLog {
    pub probes: Vec<FastPathQuery>,
    pub inits: Vec<InitRequest>,
    /// `(chunk number, access key used)` per upload call, in call order.
    pub uploads: Vec<(u32, String)>,
    pub finalizes: Vec<FinalizeRequest>,
    pub aborts: Vec<String>,
    pub empties: Vec<RemotePath>,
}

impl CallLog {
    pub fn uploads_of(&self, number: u32) -> usize {
        self.uploads.iter().filter(|(n, _)| *n == number).count()
    }

    pub fn uploaded_numbers(&self) -> Vec<u32> {
        self.uploads.iter().map(|(n, _)| *n).collect()
    }
}

type UploadHook = Box<dyn Fn(u32) + Send + Sync>;

/// A backend driven by a script of answers and faults.
pub struct ScriptedBackend {
    profile: BackendProfile,
    credential_ttl: chrono::Duration,
    upload_delay: Duration,
    finalize_delay: Duration,
    on_upload: Option<UploadHook>,
    script: Mutex<Script>,
    log: Mutex<CallLog>,
    credential_calls: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

pub const UPLOAD_ID: &str = "upload-1";

impl ScriptedBackend {
    pub fn new(profile: BackendProfile) -> Self {
        Self {
            profile,
            credential_ttl: chrono::Duration::minutes(15),
            upload_delay: Duration::ZERO,
            finalize_delay: Duration::ZERO,
            on_upload: None,
            script: Mutex::new(Script::default()),
            log: Mutex::new(CallLog::default()),
            credential_calls: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_probes(self, steps: impl IntoIterator<Item = ProbeStep>) -> Self {
        self.script.lock().unwrap().probes = steps.into_iter().collect();
        self
    }

    pub fn with_faults(self, number: u32, faults: impl IntoIterator<Item = Fault>) -> Self {
        self.script
            .lock()
            .unwrap()
            .chunk_faults
            .insert(number, faults.into_iter().collect());
        self
    }

    pub fn with_existing_parts(self, parts: Vec<RemotePart>) -> Self {
        self.script.lock().unwrap().existing_parts = parts;
        self
    }

    pub fn with_assembling(self, polls: u32) -> Self {
        self.script.lock().unwrap().assembling = polls;
        self
    }

    pub fn with_credential_failures(self, failures: u32) -> Self {
        self.script.lock().unwrap().credential_failures = failures;
        self
    }

    /// Issues `granted` credentials, then refuses every later request.
    pub fn with_credential_limit(self, granted: u32) -> Self {
        self.script.lock().unwrap().credential_limit = Some(granted);
        self
    }

    pub fn with_credential_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.credential_ttl = ttl;
        self
    }

    pub fn with_upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = delay;
        self
    }

    /// Sleeps this long inside every finalize call.
    pub fn with_finalize_delay(mut self, delay: Duration) -> Self {
        self.finalize_delay = delay;
        self
    }

    /// Runs `hook` with the chunk number inside every upload call.
    pub fn on_upload(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_upload = Some(Box::new(hook));
        self
    }

    pub fn log(&self) -> std::sync::MutexGuard<'_, CallLog> {
        self.log.lock().unwrap()
    }

    pub fn credential_calls(&self) -> u32 {
        self.credential_calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn object(&self, path: &RemotePath, size: u64, fingerprint: &Fingerprint) -> RemoteObjectRef {
        RemoteObjectRef {
            id: format!("obj-{}", &fingerprint.hex[..8]),
            path: path.clone(),
            size,
            fingerprint: fingerprint.clone(),
        }
    }
}

impl BackendProtocol for ScriptedBackend {
    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    fn get_credential(&self) -> BackendFuture<'_, Credential> {
        Box::pin(async move {
            let n = self.credential_calls.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut script = self.script.lock().unwrap();
                if script.credential_failures > 0 {
                    script.credential_failures -= 1;
                    return Err(BackendError::Unauthorized("token endpoint refused".into()));
                }
                if script.credential_limit.is_some_and(|limit| n > limit) {
                    return Err(BackendError::Unauthorized("credential quota used up".into()));
                }
            }
            let now = Utc::now();
            Ok(Credential {
                access_key: format!("key-{n}"),
                secret: format!("secret-{n}"),
                session_token: None,
                issued_at: now,
                expires_at: now + self.credential_ttl,
                scope: "media".into(),
            })
        })
    }

    fn probe_fast_path<'a>(
        &'a self,
        _credential: &'a Credential,
        query: &'a FastPathQuery,
    ) -> BackendFuture<'a, FastPathAnswer> {
        Box::pin(async move {
            self.log().probes.push(query.clone());
            let step = self.script.lock().unwrap().probes.pop_front();
            match step {
                Some(ProbeStep::Answer(answer)) => Ok(answer),
                Some(ProbeStep::Reject(message)) => Err(BackendError::fatal(message)),
                None => Ok(FastPathAnswer::NoMatch),
            }
        })
    }

    fn init_chunked_upload<'a>(
        &'a self,
        _credential: &'a Credential,
        request: &'a InitRequest,
    ) -> BackendFuture<'a, UploadTicket> {
        Box::pin(async move {
            self.log().inits.push(request.clone());
            Ok(UploadTicket {
                upload_id: UPLOAD_ID.into(),
                existing_parts: self.script.lock().unwrap().existing_parts.clone(),
            })
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        credential: &'a Credential,
        chunk: ChunkUpload<'a>,
    ) -> BackendFuture<'a, ChunkAck> {
        Box::pin(async move {
            let number = chunk.spec.number;
            self.log()
                .uploads
                .push((number, credential.access_key.clone()));
            if let Some(hook) = &self.on_upload {
                hook(number);
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.upload_delay.is_zero() {
                tokio::time::sleep(self.upload_delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            assert_eq!(chunk.upload_id, UPLOAD_ID);
            assert_eq!(chunk.data.len() as u64, chunk.spec.size);
            let stored = checksum_bytes(self.profile.digest, chunk.data);
            assert_eq!(&stored, chunk.checksum, "chunk {number} checksum sent wrong");

            let fault = self
                .script
                .lock()
                .unwrap()
                .chunk_faults
                .get_mut(&number)
                .and_then(VecDeque::pop_front);
            match fault {
                Some(Fault::Retryable) => Err(BackendError::Transport("connection reset".into())),
                Some(Fault::Fatal) => Err(BackendError::fatal("part rejected")),
                Some(Fault::Auth) => Err(BackendError::Unauthorized("token expired".into())),
                Some(Fault::WrongChecksum) => Ok(ChunkAck {
                    number,
                    etag: format!("etag-{number}"),
                    checksum: Some(checksum_bytes(self.profile.digest, b"corrupted")),
                }),
                Some(Fault::NoChecksum) => Ok(ChunkAck {
                    number,
                    etag: format!("etag-{number}"),
                    checksum: None,
                }),
                None => Ok(ChunkAck {
                    number,
                    etag: format!("etag-{number}"),
                    checksum: Some(stored),
                }),
            }
        })
    }

    fn finalize<'a>(
        &'a self,
        _credential: &'a Credential,
        request: &'a FinalizeRequest,
    ) -> BackendFuture<'a, FinalizeStatus> {
        Box::pin(async move {
            self.log().finalizes.push(request.clone());
            if !self.finalize_delay.is_zero() {
                tokio::time::sleep(self.finalize_delay).await;
            }
            {
                let mut script = self.script.lock().unwrap();
                if script.assembling > 0 {
                    script.assembling -= 1;
                    return Ok(FinalizeStatus::Assembling { retry_after: None });
                }
            }
            Ok(FinalizeStatus::Done(self.object(
                &request.destination,
                request.size,
                &request.full,
            )))
        })
    }

    fn create_empty<'a>(
        &'a self,
        _credential: &'a Credential,
        destination: &'a RemotePath,
        digest: &'a Fingerprint,
    ) -> BackendFuture<'a, RemoteObjectRef> {
        Box::pin(async move {
            self.log().empties.push(destination.clone());
            Ok(self.object(destination, 0, digest))
        })
    }

    fn abort_upload<'a>(
        &'a self,
        _credential: &'a Credential,
        upload_id: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.log().aborts.push(upload_id.to_string());
            Ok(())
        })
    }
}
