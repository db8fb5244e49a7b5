//! The upload session state machine.
//!
//! ```text
//! Init -> Probing -> Planning -> Transferring -> Finalizing -> Completed
//!            |           |
//!            |           +-> Completed   (zero-length object)
//!            +-> Completed               (fast-path match)
//! ```
//!
//! `Failed` and `Canceled` are reachable from every non-terminal state.

use std::sync::Arc;
use std::time::Duration;

use cloudgate_backend::{
    BackendProtocol, FinalizeRequest, FinalizeStatus, InitRequest, RemoteObjectRef,
    UploadTicket,
};
use cloudgate_transfer::{
    ChunkSpec, Fingerprint, Fingerprinter, MonotonicProgress, PreparedSource, ProgressSink,
    SourceStream, plan,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UploadPolicy;
use crate::credentials::CredentialBroker;
use crate::error::{CancelReason, UploadError};
use crate::pool::{ChunkLedger, ChunkTransferPool, PoolSettings};
use crate::probe::FastPathProbe;
use crate::retry::{Backoff, sleep_or_cancel};
use crate::types::{FastPathResult, SessionState, UploadEvent, UploadOutcome, UploadRequest};

/// Chunk-driven progress stops here; 100 is reported once the object exists.
const TRANSFER_PROGRESS_CEILING: f64 = 99.0;

/// Upper bound on the best-effort abort call after a failure.
const ABORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Drives one [`UploadRequest`] to a terminal state.
///
/// A session is single-use: [`run`](Self::run) consumes it.
pub struct UploadSession {
    id: String,
    backend: Arc<dyn BackendProtocol>,
    broker: Arc<CredentialBroker>,
    policy: UploadPolicy,
    request: UploadRequest,
    events: Option<mpsc::Sender<UploadEvent>>,
    state: SessionState,
}

/// State gathered while the session runs.
#[derive(Default)]
struct RunState {
    prepared: Option<PreparedSource>,
    fast_path: Option<FastPathResult>,
    upload_id: Option<String>,
    ledger: Option<Arc<ChunkLedger>>,
}

impl UploadSession {
    pub fn new(
        backend: Arc<dyn BackendProtocol>,
        broker: Arc<CredentialBroker>,
        policy: UploadPolicy,
        request: UploadRequest,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            backend,
            broker,
            policy,
            request,
            events: None,
            state: SessionState::Init,
        }
    }

    /// Sends [`UploadEvent`]s to `events` while the session runs.
    ///
    /// Events are dropped rather than awaited when the channel is full.
    pub fn with_events(mut self, events: mpsc::Sender<UploadEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the session to completion.
    ///
    /// `sink` receives non-decreasing percentages ending at 100 on success.
    /// Cancelling `cancel` stops new chunk work and yields
    /// [`UploadError::Canceled`].
    pub async fn run(
        mut self,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        let started = Instant::now();
        let fetches_before = self.broker.fetch_count();
        let session_cancel = cancel.child_token();
        let mut ctx = RunState::default();

        info!(
            session = %self.id,
            destination = %self.request.destination,
            "upload session started"
        );

        // On timeout the drive future is dropped wherever it is waiting.
        // That aborts chunk workers and removes a partial spool file.
        let result = {
            let limit = self.policy.session_timeout();
            let drive = self.drive(&sink, &session_cancel, &mut ctx);
            match limit {
                None => drive.await,
                Some(limit) => match tokio::time::timeout(limit, drive).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(limit_secs = limit.as_secs(), "session timeout reached, stopping");
                        session_cancel.cancel();
                        Err(UploadError::Canceled(CancelReason::Timeout))
                    }
                },
            }
        };

        match result {
            Ok(object) => {
                self.transition(SessionState::Completed);
                let chunks = ctx
                    .ledger
                    .as_ref()
                    .map(|ledger| ledger.snapshot())
                    .unwrap_or_default();
                let (resumed, uploaded): (Vec<_>, Vec<_>) = chunks
                    .iter()
                    .filter(|c| c.is_succeeded())
                    .partition(|c| c.resumed);
                let outcome = UploadOutcome {
                    session_id: self.id.clone(),
                    fast_path: ctx.fast_path.take().unwrap_or(FastPathResult::NotAttempted),
                    uploaded_bytes: uploaded.iter().map(|c| c.spec.size).sum(),
                    resumed_bytes: resumed.iter().map(|c| c.spec.size).sum(),
                    credential_refreshes: self
                        .broker
                        .fetch_count()
                        .saturating_sub(fetches_before),
                    elapsed: started.elapsed(),
                    chunks,
                    object,
                };
                info!(
                    session = %self.id,
                    object = %outcome.object.id,
                    bytes = outcome.object.size,
                    uploaded = outcome.uploaded_bytes,
                    spooled = ctx.prepared.as_ref().is_some_and(|p| p.spooled),
                    elapsed_ms = outcome.elapsed.as_millis() as u64,
                    "upload completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                if let Some(upload_id) = ctx.upload_id.take() {
                    self.abort(&upload_id).await;
                }
                if e.is_canceled() {
                    self.transition(SessionState::Canceled);
                    info!(session = %self.id, reason = %e, "upload canceled");
                } else {
                    self.transition(SessionState::Failed);
                    warn!(session = %self.id, error = %e, "upload failed");
                }
                Err(e)
            }
        }
        // `ctx` drops here, removing any spooled copy of the source.
    }

    async fn drive(
        &mut self,
        sink: &Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
        ctx: &mut RunState,
    ) -> Result<RemoteObjectRef, UploadError> {
        self.validate()?;
        let profile = self.backend.profile().clone();
        let fingerprinter = Fingerprinter::new(profile.digest, profile.partial_len);

        // Probing
        self.checkpoint(cancel)?;
        self.transition(SessionState::Probing);
        let prepared = fingerprinter
            .whole_stream(
                Arc::clone(&self.request.source),
                self.policy.spool_dir.as_deref(),
            )
            .await?;
        let source = Arc::clone(&prepared.source);
        let digests = prepared.digests.clone();
        ctx.prepared = Some(prepared);

        if let Some(declared) = self.request.declared_size
            && declared != digests.size
        {
            warn!(
                declared,
                actual = digests.size,
                "declared size differs from source, using bytes read"
            );
            self.request.declared_size = Some(digests.size);
        }

        self.checkpoint(cancel)?;
        let probe = FastPathProbe::new(
            self.backend.as_ref(),
            &self.broker,
            fingerprinter,
            self.policy.max_challenges,
        );
        let fast_path = probe
            .run(source.as_ref(), &digests, &self.request.destination, cancel)
            .await?;
        ctx.fast_path = Some(fast_path.clone());
        if let FastPathResult::Matched(object) = fast_path {
            sink.update(100.0);
            return Ok(object);
        }

        // Planning
        self.checkpoint(cancel)?;
        self.transition(SessionState::Planning);
        if digests.size == 0 {
            let object = self.create_empty(&digests.full).await?;
            sink.update(100.0);
            return Ok(object);
        }

        let chunk_size = self.request.overrides.chunk_size.or(self.policy.chunk_size);
        let constraints = profile.constraints.clone().with_preferred_chunk_size(chunk_size);
        let chunks = plan(digests.size, &constraints)?;
        debug!(
            chunks = chunks.len(),
            chunk_size = chunks.first().map_or(0, |c| c.size),
            bytes = digests.size,
            "chunk plan ready"
        );

        let init = InitRequest {
            destination: self.request.destination.clone(),
            size: digests.size,
            full: digests.full.clone(),
            chunks: chunks.clone(),
        };
        let ticket = self.init_upload(&init).await?;
        ctx.upload_id = Some(ticket.upload_id.clone());

        let total_chunks = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
        let progress = Arc::new(
            MonotonicProgress::new(
                Arc::clone(sink),
                profile.progress_basis,
                digests.size,
                total_chunks,
            )
            .with_ceiling(TRANSFER_PROGRESS_CEILING),
        );
        let ledger = Arc::new(ChunkLedger::new(&chunks));
        ctx.ledger = Some(Arc::clone(&ledger));
        self.resume(&ticket, &chunks, &fingerprinter, source.as_ref(), &ledger, &progress)
            .await;

        // Transferring
        self.checkpoint(cancel)?;
        self.transition(SessionState::Transferring);
        let concurrency = profile.effective_concurrency(
            self.request
                .overrides
                .concurrency
                .unwrap_or(self.policy.concurrency),
        );
        let settings = PoolSettings {
            concurrency,
            attempts: self.policy.chunk_attempts,
            backoff: Backoff::from(&self.policy.retry),
            expected_chunk: self.policy.expected_chunk_duration(),
        };
        let mut pool = ChunkTransferPool::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.broker),
            Arc::clone(&source),
            ticket.upload_id.clone(),
            profile.digest,
            digests.size,
            settings,
        )
        .with_progress(Arc::clone(&progress))
        .with_ack_checksum(profile.ack_checksum);
        if let Some(events) = &self.events {
            pool = pool.with_events(events.clone());
        }
        pool.run(Arc::clone(&ledger), cancel).await?;

        // Finalizing
        self.checkpoint(cancel)?;
        self.transition(SessionState::Finalizing);
        let parts = ledger.parts().ok_or_else(|| {
            UploadError::Worker("finalize reached with unfinished chunks".into())
        })?;
        let request = FinalizeRequest {
            upload_id: ticket.upload_id.clone(),
            destination: self.request.destination.clone(),
            size: digests.size,
            full: digests.full.clone(),
            parts,
        };
        let object = self.finalize(&request, cancel).await?;
        // The upload id is spent once the object exists.
        ctx.upload_id = None;
        progress.complete();
        Ok(object)
    }

    fn validate(&self) -> Result<(), UploadError> {
        self.request
            .destination
            .validate()
            .map_err(|e| UploadError::InvalidRequest(e.to_string()))?;
        self.policy
            .validate()
            .map_err(|e| UploadError::InvalidRequest(e.to_string()))?;
        self.backend
            .profile()
            .validate()
            .map_err(|e| UploadError::InvalidRequest(e.to_string()))?;
        let overrides = &self.request.overrides;
        if overrides.concurrency == Some(0) {
            return Err(UploadError::InvalidRequest(
                "concurrency override must be at least 1".into(),
            ));
        }
        if overrides.chunk_size == Some(0) {
            return Err(UploadError::InvalidRequest(
                "chunk size override must be positive".into(),
            ));
        }
        Ok(())
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<(), UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Canceled(CancelReason::Requested));
        }
        Ok(())
    }

    /// Moves to `next` unless a terminal state was already reached.
    fn transition(&mut self, next: SessionState) {
        if self.state.is_terminal() {
            debug!(from = %self.state, to = %next, "ignoring transition after terminal state");
            return;
        }
        info!(session = %self.id, from = %self.state, to = %next, "session state");
        self.state = next;
        if let Some(events) = &self.events {
            let _ = events.try_send(UploadEvent::StateChanged {
                session_id: self.id.clone(),
                state: next,
            });
        }
    }

    async fn create_empty(
        &self,
        digest: &Fingerprint,
    ) -> Result<RemoteObjectRef, UploadError> {
        let destination = &self.request.destination;
        let credential = self.broker.current().await?;
        match self.backend.create_empty(&credential, destination, digest).await {
            Ok(object) => Ok(object),
            Err(e) if e.is_auth() => {
                let credential = self.broker.force_refresh(&credential).await?;
                self.backend
                    .create_empty(&credential, destination, digest)
                    .await
                    .map_err(UploadError::Finalize)
            }
            Err(e) => Err(UploadError::Finalize(e)),
        }
    }

    async fn init_upload(&self, init: &InitRequest) -> Result<UploadTicket, UploadError> {
        let credential = self.broker.current().await?;
        let ticket = match self.backend.init_chunked_upload(&credential, init).await {
            Ok(ticket) => ticket,
            Err(e) if e.is_auth() => {
                let credential = self.broker.force_refresh(&credential).await?;
                self.backend
                    .init_chunked_upload(&credential, init)
                    .await
                    .map_err(UploadError::Init)?
            }
            Err(e) => return Err(UploadError::Init(e)),
        };
        debug!(
            upload_id = %ticket.upload_id,
            staged = ticket.existing_parts.len(),
            "chunked upload opened"
        );
        Ok(ticket)
    }

    /// Marks parts the backend already holds as done, after checking each
    /// against the local bytes.
    async fn resume(
        &self,
        ticket: &UploadTicket,
        chunks: &[ChunkSpec],
        fingerprinter: &Fingerprinter,
        source: &dyn SourceStream,
        ledger: &ChunkLedger,
        progress: &MonotonicProgress,
    ) {
        for part in &ticket.existing_parts {
            let Some(spec) = chunks.iter().find(|c| c.number == part.number) else {
                debug!(chunk = part.number, "staged part is not in the plan");
                continue;
            };
            if spec.size != part.size || part.checksum.algorithm != fingerprinter.algorithm() {
                debug!(chunk = part.number, "staged part does not fit the plan, re-uploading");
                continue;
            }
            let local = match fingerprinter.digest_range(source, spec.range()).await {
                Ok(local) => local,
                Err(e) => {
                    warn!(chunk = part.number, error = %e, "could not verify staged part");
                    continue;
                }
            };
            if local != part.checksum {
                debug!(chunk = part.number, "staged part differs from source, re-uploading");
                continue;
            }
            if ledger.mark_resumed(spec.number, local, part.etag.clone()) {
                progress.record_chunk(spec.size);
                debug!(chunk = spec.number, bytes = spec.size, "resumed staged part");
                if let Some(events) = &self.events {
                    let _ = events.try_send(UploadEvent::ChunkSucceeded {
                        number: spec.number,
                        bytes: spec.size,
                        resumed: true,
                    });
                }
            }
        }
    }

    /// Commits the upload, polling while the backend is still assembling.
    async fn finalize(
        &self,
        request: &FinalizeRequest,
        cancel: &CancellationToken,
    ) -> Result<RemoteObjectRef, UploadError> {
        let retry = &self.policy.retry;
        let polling = Backoff::new(
            self.policy.finalize_poll_interval(),
            retry.max_delay(),
            retry.backoff_factor,
            retry.jitter,
        );
        let retries = Backoff::from(retry);
        let mut polls: u32 = 0;
        let mut failures: u32 = 0;
        let mut auth_retried = false;

        loop {
            self.checkpoint(cancel)?;
            let credential = self.broker.current().await?;
            let delay = match self.backend.finalize(&credential, request).await {
                Ok(FinalizeStatus::Done(object)) => return Ok(object),
                Ok(FinalizeStatus::Assembling { retry_after }) => {
                    polls += 1;
                    if polls > self.policy.finalize_polls {
                        return Err(UploadError::BackendBusy { polls });
                    }
                    let delay = retry_after.unwrap_or_else(|| polling.delay_for_attempt(polls));
                    debug!(polls, delay_ms = delay.as_millis() as u64, "backend still assembling");
                    delay
                }
                Err(e) if e.is_auth() && !auth_retried => {
                    auth_retried = true;
                    self.broker.force_refresh(&credential).await?;
                    continue;
                }
                Err(e) if e.is_retryable() && failures + 1 < self.policy.chunk_attempts => {
                    failures += 1;
                    let delay = retries.delay_for_attempt(failures);
                    warn!(attempt = failures, error = %e, "finalize failed, retrying");
                    delay
                }
                Err(e) => return Err(UploadError::Finalize(e)),
            };
            if !sleep_or_cancel(delay, cancel).await {
                return Err(UploadError::Canceled(CancelReason::Requested));
            }
        }
    }

    async fn abort(&self, upload_id: &str) {
        let attempt = async {
            let credential = self.broker.current().await?;
            self.backend
                .abort_upload(&credential, upload_id)
                .await
                .map_err(UploadError::Finalize)
        };
        match tokio::time::timeout(ABORT_TIMEOUT, attempt).await {
            Ok(Ok(())) => debug!(upload_id, "server-side upload aborted"),
            Ok(Err(e)) => warn!(upload_id, error = %e, "could not abort upload"),
            Err(_) => warn!(upload_id, "abort timed out"),
        }
    }
}
