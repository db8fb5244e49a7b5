//! Bounded-concurrency chunk uploads.
//!
//! Workers pull chunks from a shared [`ChunkLedger`] in chunk-number order.
//! The ledger is the only shared record of chunk state: dequeuing a chunk
//! and marking it in flight happen under one lock, after a cancellation
//! check, so no chunk starts once the session is cancelled.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cloudgate_backend::{
    AckChecksum, BackendError, BackendProtocol, ChunkUpload, Credential, PartRef,
};
use cloudgate_transfer::{
    ChunkResult, ChunkSpec, ChunkState, DigestAlgorithm, Fingerprint, MonotonicProgress,
    SourceStream, SpeedCalculator, TransferError, checksum_bytes, read_range_exact,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::credentials::CredentialBroker;
use crate::error::{CancelReason, UploadError};
use crate::retry::{Backoff, sleep_or_cancel};
use crate::types::UploadEvent;

// ---------------------------------------------------------------------------
// ChunkLedger
// ---------------------------------------------------------------------------

/// Per-chunk results plus the queue of chunks still to start.
pub struct ChunkLedger {
    inner: Mutex<LedgerInner>,
}

struct LedgerInner {
    results: Vec<ChunkResult>,
    queue: VecDeque<u32>,
}

impl LedgerInner {
    fn slot(&mut self, number: u32) -> Option<&mut ChunkResult> {
        let index = usize::try_from(number.checked_sub(1)?).ok()?;
        self.results.get_mut(index)
    }
}

impl ChunkLedger {
    /// Starts every chunk of `plan` as pending.
    pub fn new(plan: &[ChunkSpec]) -> Self {
        Self {
            inner: Mutex::new(LedgerInner {
                results: plan.iter().copied().map(ChunkResult::pending).collect(),
                queue: plan.iter().map(|spec| spec.number).collect(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a part the backend already holds; it is never uploaded.
    pub fn mark_resumed(&self, number: u32, checksum: Fingerprint, etag: String) -> bool {
        let mut inner = self.lock();
        let Some(result) = inner.slot(number) else {
            return false;
        };
        if result.state != ChunkState::Pending {
            return false;
        }
        result.state = ChunkState::Succeeded;
        result.checksum = Some(checksum);
        result.remote_ack = Some(etag);
        result.resumed = true;
        inner.queue.retain(|n| *n != number);
        true
    }

    /// Takes the next pending chunk and marks it in flight, unless
    /// `cancel` has fired.
    pub fn next_pending(&self, cancel: &CancellationToken) -> Option<ChunkSpec> {
        let mut inner = self.lock();
        if cancel.is_cancelled() {
            return None;
        }
        let number = inner.queue.pop_front()?;
        let result = inner.slot(number)?;
        result.state = ChunkState::InFlight;
        Some(result.spec)
    }

    /// Counts a new attempt and returns its 1-based number.
    pub fn begin_attempt(&self, number: u32) -> u32 {
        let mut inner = self.lock();
        match inner.slot(number) {
            Some(result) => {
                result.attempt += 1;
                result.attempt
            }
            None => 0,
        }
    }

    pub fn record_success(&self, number: u32, checksum: Fingerprint, etag: String) {
        if let Some(result) = self.lock().slot(number) {
            result.state = ChunkState::Succeeded;
            result.checksum = Some(checksum);
            result.remote_ack = Some(etag);
        }
    }

    /// Notes a failed attempt that will be retried.
    pub fn record_error(&self, number: u32, checksum: Option<Fingerprint>, error: String) {
        if let Some(result) = self.lock().slot(number) {
            if checksum.is_some() {
                result.checksum = checksum;
            }
            result.last_error = Some(error);
        }
    }

    /// Marks a chunk failed for good.
    pub fn record_failure(&self, number: u32, checksum: Option<Fingerprint>, error: String) {
        if let Some(result) = self.lock().slot(number) {
            result.state = ChunkState::Failed;
            if checksum.is_some() {
                result.checksum = checksum;
            }
            result.last_error = Some(error);
        }
    }

    pub fn snapshot(&self) -> Vec<ChunkResult> {
        self.lock().results.clone()
    }

    /// Chunks not yet started.
    pub fn pending_count(&self) -> usize {
        self.lock().queue.len()
    }

    /// Acknowledgements ordered by chunk number, or `None` while any chunk
    /// has not succeeded.
    pub fn parts(&self) -> Option<Vec<PartRef>> {
        let inner = self.lock();
        inner
            .results
            .iter()
            .map(|r| match (&r.state, &r.checksum, &r.remote_ack) {
                (ChunkState::Succeeded, Some(checksum), Some(etag)) => Some(PartRef {
                    number: r.spec.number,
                    etag: etag.clone(),
                    checksum: checksum.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ChunkTransferPool
// ---------------------------------------------------------------------------

/// Retry and sizing knobs for a pool.
///
/// Each worker reads its whole chunk into memory before sending it, so a
/// pool holds up to `concurrency` times the chunk size in buffers.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Concurrent workers.
    pub concurrency: usize,
    /// Attempts per chunk, including the first.
    pub attempts: u32,
    pub backoff: Backoff,
    /// Assumed request duration until throughput has been measured.
    pub expected_chunk: Duration,
}

/// Uploads the chunks of one session with a fixed number of workers.
pub struct ChunkTransferPool {
    shared: Shared,
}

struct Shared {
    backend: Arc<dyn BackendProtocol>,
    broker: Arc<CredentialBroker>,
    source: Arc<dyn SourceStream>,
    upload_id: String,
    algorithm: DigestAlgorithm,
    ack: AckChecksum,
    settings: PoolSettings,
    total_bytes: u64,
    progress: Option<Arc<MonotonicProgress>>,
    speed: SpeedCalculator,
    events: Option<mpsc::Sender<UploadEvent>>,
}

impl ChunkTransferPool {
    pub fn new(
        backend: Arc<dyn BackendProtocol>,
        broker: Arc<CredentialBroker>,
        source: Arc<dyn SourceStream>,
        upload_id: impl Into<String>,
        algorithm: DigestAlgorithm,
        total_bytes: u64,
        settings: PoolSettings,
    ) -> Self {
        Self {
            shared: Shared {
                backend,
                broker,
                source,
                upload_id: upload_id.into(),
                algorithm,
                ack: AckChecksum::Required,
                settings,
                total_bytes,
                progress: None,
                speed: SpeedCalculator::default(),
                events: None,
            },
        }
    }

    /// Reports each finished chunk to `progress`.
    pub fn with_progress(mut self, progress: Arc<MonotonicProgress>) -> Self {
        self.shared.progress = Some(progress);
        self
    }

    /// How acknowledgements confirm stored bytes; defaults to
    /// [`AckChecksum::Required`].
    pub fn with_ack_checksum(mut self, ack: AckChecksum) -> Self {
        self.shared.ack = ack;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<UploadEvent>) -> Self {
        self.shared.events = Some(events);
        self
    }

    /// Uploads every pending chunk in `ledger`.
    ///
    /// Returns the first terminal chunk error, after stopping the other
    /// workers, or `Canceled` if `cancel` fired before every chunk finished.
    pub async fn run(self, ledger: Arc<ChunkLedger>, cancel: &CancellationToken) -> Result<(), UploadError> {
        let pending = ledger.pending_count();
        if pending == 0 {
            return Ok(());
        }
        let shared = Arc::new(self.shared);
        let workers = shared.settings.concurrency.clamp(1, pending);
        debug!(
            upload_id = %shared.upload_id,
            workers,
            chunks = pending,
            "starting chunk workers"
        );

        // Marks the start of the throughput window.
        shared.speed.add_sample(0);

        let stop = cancel.child_token();
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let shared = Arc::clone(&shared);
            let ledger = Arc::clone(&ledger);
            let stop = stop.clone();
            set.spawn(async move { worker_loop(worker, shared, ledger, stop).await });
        }

        let mut first_error: Option<UploadError> = None;
        while let Some(joined) = set.join_next().await {
            let result = joined
                .map_err(|e| UploadError::Worker(e.to_string()))
                .and_then(|r| r);
            if let Err(e) = result
                && first_error.is_none()
            {
                if !e.is_canceled() {
                    warn!(upload_id = %shared.upload_id, error = %e, "stopping remaining chunk workers");
                }
                stop.cancel();
                first_error = Some(e);
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(UploadError::Canceled(CancelReason::Requested));
        }
        if ledger.parts().is_none() {
            return Err(UploadError::Worker(
                "chunk workers exited with unfinished chunks".into(),
            ));
        }
        Ok(())
    }
}

async fn worker_loop(
    worker: usize,
    shared: Arc<Shared>,
    ledger: Arc<ChunkLedger>,
    stop: CancellationToken,
) -> Result<(), UploadError> {
    while let Some(spec) = ledger.next_pending(&stop) {
        shared.upload_with_retry(&ledger, spec, &stop).await?;
    }
    debug!(worker, "chunk worker finished");
    Ok(())
}

/// Why a single attempt failed.
enum AttemptFailure {
    Read(TransferError),
    Backend(BackendError),
    Mismatch {
        expected: Fingerprint,
        actual: Fingerprint,
    },
    /// Acknowledged without the checksum the profile requires.
    Unconfirmed,
    Canceled,
}

/// A failed attempt plus the checksum of the bytes it read, if any.
struct Failed {
    checksum: Option<Fingerprint>,
    reason: AttemptFailure,
}

impl Shared {
    async fn upload_with_retry(
        &self,
        ledger: &ChunkLedger,
        spec: ChunkSpec,
        stop: &CancellationToken,
    ) -> Result<(), UploadError> {
        let number = spec.number;
        loop {
            let attempt = ledger.begin_attempt(number);
            self.emit(UploadEvent::ChunkStarted { number, attempt });

            let credential = match self.broker.current_for(self.expected_duration(spec.size)).await {
                Ok(credential) => credential,
                Err(e) => return Err(Self::abandon(ledger, number, e)),
            };
            let Failed { checksum, reason } = match self.attempt(&credential, spec, stop).await {
                Ok((checksum, etag)) => {
                    self.complete(ledger, spec, checksum, etag);
                    return Ok(());
                }
                Err(failed) => failed,
            };
            if matches!(reason, AttemptFailure::Canceled) {
                return Err(UploadError::Canceled(CancelReason::Requested));
            }

            let message = reason.message();
            let exhausted = attempt >= self.settings.attempts;
            let fatal = matches!(&reason, AttemptFailure::Backend(e) if !e.is_retryable() && !e.is_auth());
            if exhausted || fatal {
                warn!(chunk = number, attempt, error = %message, "chunk failed");
                ledger.record_failure(number, checksum, message);
                return Err(reason.into_error(number, attempt));
            }
            ledger.record_error(number, checksum, message.clone());

            let delay = match &reason {
                AttemptFailure::Backend(e) if e.is_auth() => {
                    if let Err(e) = self.broker.force_refresh(&credential).await {
                        return Err(Self::abandon(ledger, number, e));
                    }
                    Duration::ZERO
                }
                _ => self.settings.backoff.delay_for_attempt(attempt),
            };
            warn!(
                chunk = number,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "retrying chunk"
            );
            self.emit(UploadEvent::ChunkRetrying {
                number,
                attempt,
                error: message,
                delay,
            });
            if !delay.is_zero() && !sleep_or_cancel(delay, stop).await {
                return Err(UploadError::Canceled(CancelReason::Requested));
            }
        }
    }

    /// One read-hash-upload-verify pass.
    async fn attempt(
        &self,
        credential: &Credential,
        spec: ChunkSpec,
        stop: &CancellationToken,
    ) -> Result<(Fingerprint, String), Failed> {
        let data = read_range_exact(self.source.as_ref(), spec.range())
            .await
            .map_err(|e| Failed {
                checksum: None,
                reason: AttemptFailure::Read(e),
            })?;
        let checksum = checksum_bytes(self.algorithm, &data);

        let chunk = ChunkUpload {
            upload_id: &self.upload_id,
            spec,
            checksum: &checksum,
            data: &data,
        };
        let sent = tokio::select! {
            _ = stop.cancelled() => Err(AttemptFailure::Canceled),
            sent = self.backend.upload_chunk(credential, chunk) => sent.map_err(AttemptFailure::Backend),
        };

        let verified = sent.and_then(|ack| {
            if ack.number != spec.number {
                return Err(AttemptFailure::Backend(BackendError::retryable(format!(
                    "acknowledgement for chunk {} received for chunk {}",
                    ack.number, spec.number
                ))));
            }
            match (ack.checksum, self.ack) {
                (Some(actual), _) if actual != checksum => Err(AttemptFailure::Mismatch {
                    expected: checksum.clone(),
                    actual,
                }),
                (Some(_), _) | (None, AckChecksum::ServerVerified) => Ok(ack.etag),
                (None, AckChecksum::Required) => Err(AttemptFailure::Unconfirmed),
            }
        });
        match verified {
            Ok(etag) => Ok((checksum, etag)),
            Err(reason) => Err(Failed {
                checksum: Some(checksum),
                reason,
            }),
        }
    }

    /// Marks a chunk failed when the session cannot go on without it.
    fn abandon(ledger: &ChunkLedger, number: u32, error: UploadError) -> UploadError {
        warn!(chunk = number, error = %error, "chunk abandoned");
        ledger.record_failure(number, None, error.to_string());
        error
    }

    fn complete(&self, ledger: &ChunkLedger, spec: ChunkSpec, checksum: Fingerprint, etag: String) {
        debug!(chunk = spec.number, bytes = spec.size, etag = %etag, "chunk uploaded");
        ledger.record_success(spec.number, checksum, etag);
        self.speed.add_sample(spec.size);

        let percent = match &self.progress {
            Some(progress) => progress.record_chunk(spec.size),
            None => 0.0,
        };
        self.emit(UploadEvent::ChunkSucceeded {
            number: spec.number,
            bytes: spec.size,
            resumed: false,
        });

        if self.events.is_some() {
            let done = self
                .progress
                .as_ref()
                .map_or(0, |p| p.completed_bytes());
            self.emit(UploadEvent::Progress {
                percent,
                bytes_per_second: self.speed.bytes_per_second(),
                eta: self.speed.eta(self.total_bytes.saturating_sub(done)),
            });
        }
    }

    /// Expected duration of a `size`-byte request from measured throughput.
    fn expected_duration(&self, size: u64) -> Duration {
        let speed = self.speed.bytes_per_second();
        if speed <= 0.0 {
            return self.settings.expected_chunk;
        }
        Duration::try_from_secs_f64(size as f64 / speed).unwrap_or(self.settings.expected_chunk)
    }

    fn emit(&self, event: UploadEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }
}

impl AttemptFailure {
    fn message(&self) -> String {
        match self {
            AttemptFailure::Read(e) => e.to_string(),
            AttemptFailure::Backend(e) => e.to_string(),
            AttemptFailure::Mismatch { expected, actual } => {
                format!("checksum mismatch: sent {expected}, backend stored {actual}")
            }
            AttemptFailure::Unconfirmed => "acknowledgement carries no checksum".into(),
            AttemptFailure::Canceled => "canceled".into(),
        }
    }

    fn into_error(self, number: u32, attempts: u32) -> UploadError {
        match self {
            AttemptFailure::Read(source) => UploadError::ChunkRead {
                number,
                attempts,
                source,
            },
            AttemptFailure::Backend(source) => UploadError::ChunkUpload {
                number,
                attempts,
                source,
            },
            AttemptFailure::Mismatch { expected, actual } => UploadError::ChecksumMismatch {
                number,
                attempts,
                expected,
                actual,
            },
            AttemptFailure::Unconfirmed => UploadError::ChecksumUnconfirmed { number, attempts },
            AttemptFailure::Canceled => UploadError::Canceled(CancelReason::Requested),
        }
    }
}
