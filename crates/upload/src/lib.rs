//! Chunked upload engine.
//!
//! Probes the backend for an identical object, plans chunks, uploads them
//! with bounded concurrency and per-chunk retry while refreshing short-lived
//! credentials, then finalizes the remote object.

pub mod config;
pub mod credentials;
mod error;
pub mod pool;
pub mod probe;
pub mod retry;
pub mod session;
pub mod types;

use std::sync::Arc;

use cloudgate_backend::{BackendProtocol, RemoteObjectRef};
use cloudgate_transfer::ProgressSink;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use config::{ConfigError, RetryPolicy, UploadPolicy};
pub use credentials::CredentialBroker;
pub use error::{CancelReason, UploadError};
pub use pool::{ChunkLedger, ChunkTransferPool, PoolSettings};
pub use probe::FastPathProbe;
pub use retry::Backoff;
pub use session::UploadSession;
pub use types::{
    FastPathResult, RequestOverrides, SessionState, UploadEvent, UploadOutcome, UploadRequest,
};

/// Runs upload sessions against one backend.
///
/// Sessions created by the same uploader share its credential broker, so
/// concurrent uploads to one account refresh credentials once.
#[derive(Clone)]
pub struct Uploader {
    backend: Arc<dyn BackendProtocol>,
    broker: Arc<CredentialBroker>,
    policy: UploadPolicy,
}

impl Uploader {
    pub fn new(backend: Arc<dyn BackendProtocol>, policy: UploadPolicy) -> Self {
        let broker = Arc::new(CredentialBroker::from_policy(Arc::clone(&backend), &policy));
        Self {
            backend,
            broker,
            policy,
        }
    }

    /// Uses an existing broker, e.g. one shared with other uploaders for
    /// the same account.
    pub fn with_broker(
        backend: Arc<dyn BackendProtocol>,
        broker: Arc<CredentialBroker>,
        policy: UploadPolicy,
    ) -> Self {
        Self {
            backend,
            broker,
            policy,
        }
    }

    pub fn broker(&self) -> &Arc<CredentialBroker> {
        &self.broker
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Creates a session for `request` without starting it.
    pub fn session(&self, request: UploadRequest) -> UploadSession {
        UploadSession::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.broker),
            self.policy.clone(),
            request,
        )
    }

    /// Uploads `request` and returns the stored object.
    pub async fn upload(
        &self,
        request: UploadRequest,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<RemoteObjectRef, UploadError> {
        let outcome = self.session(request).run(sink, cancel).await?;
        Ok(outcome.object)
    }

    /// Uploads `request`, streaming [`UploadEvent`]s, and returns the full
    /// outcome.
    pub async fn upload_with_events(
        &self,
        request: UploadRequest,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
        events: mpsc::Sender<UploadEvent>,
    ) -> Result<UploadOutcome, UploadError> {
        self.session(request)
            .with_events(events)
            .run(sink, cancel)
            .await
    }
}

/// Uploads `request` to `backend` with the default [`UploadPolicy`].
pub async fn upload(
    backend: Arc<dyn BackendProtocol>,
    request: UploadRequest,
    sink: Arc<dyn ProgressSink>,
    cancel: &CancellationToken,
) -> Result<RemoteObjectRef, UploadError> {
    Uploader::new(backend, UploadPolicy::default())
        .upload(request, sink, cancel)
        .await
}
