//! Short-lived credential cache with single-flight refresh.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use cloudgate_backend::{BackendError, BackendProtocol, Credential};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::UploadPolicy;
use crate::error::UploadError;

struct Cached {
    credential: Arc<Credential>,
    /// Lifetime was already shorter than one request when issued, so
    /// proactive refresh cannot help; reuse until the backend rejects it.
    short_lived: bool,
}

/// Hands out upload credentials and refreshes them ahead of expiry.
///
/// The read-check-refresh sequence runs under one async mutex, so callers
/// racing on a stale credential wait for a single backend call and share
/// its result. A broker can be shared by sessions targeting the same
/// backend account.
pub struct CredentialBroker {
    backend: Arc<dyn BackendProtocol>,
    refresh_margin: Duration,
    expected_duration: Duration,
    current: Mutex<Option<Cached>>,
    fetches: AtomicU32,
}

impl CredentialBroker {
    pub fn new(
        backend: Arc<dyn BackendProtocol>,
        refresh_margin: Duration,
        expected_duration: Duration,
    ) -> Self {
        Self {
            backend,
            refresh_margin,
            expected_duration,
            current: Mutex::new(None),
            fetches: AtomicU32::new(0),
        }
    }

    pub fn from_policy(backend: Arc<dyn BackendProtocol>, policy: &UploadPolicy) -> Self {
        Self::new(
            backend,
            policy.refresh_margin(),
            policy.expected_chunk_duration(),
        )
    }

    /// A credential good for a request of the default expected duration.
    pub async fn current(&self) -> Result<Arc<Credential>, UploadError> {
        self.current_for(self.expected_duration).await
    }

    /// A credential that outlives a request expected to take `expected`.
    pub async fn current_for(&self, expected: Duration) -> Result<Arc<Credential>, UploadError> {
        let needed = self.refresh_margin.saturating_add(expected);
        let mut slot = self.current.lock().await;
        let now = Utc::now();

        if let Some(cached) = slot.as_ref() {
            let usable = if cached.short_lived {
                !cached.credential.is_expired(now)
            } else {
                cached.credential.covers(now, needed)
            };
            if usable {
                return Ok(Arc::clone(&cached.credential));
            }
            debug!(
                remaining_secs = cached.credential.remaining(now).as_secs(),
                needed_secs = needed.as_secs(),
                "credential near expiry, refreshing"
            );
        }

        let fresh = self.fetch(needed).await?;
        let credential = Arc::clone(&fresh.credential);
        *slot = Some(fresh);
        Ok(credential)
    }

    /// Replaces `stale` after the backend rejected it.
    ///
    /// If another caller already replaced it, the newer credential is
    /// returned without contacting the backend.
    pub async fn force_refresh(&self, stale: &Arc<Credential>) -> Result<Arc<Credential>, UploadError> {
        let mut slot = self.current.lock().await;
        if let Some(cached) = slot.as_ref()
            && !Arc::ptr_eq(&cached.credential, stale)
        {
            debug!("credential already refreshed by another caller");
            return Ok(Arc::clone(&cached.credential));
        }

        let fresh = self
            .fetch(self.refresh_margin.saturating_add(self.expected_duration))
            .await?;
        let credential = Arc::clone(&fresh.credential);
        *slot = Some(fresh);
        Ok(credential)
    }

    /// Credentials fetched from the backend so far.
    pub fn fetch_count(&self) -> u32 {
        self.fetches.load(Ordering::Relaxed)
    }

    async fn fetch(&self, needed: Duration) -> Result<Cached, UploadError> {
        let n = self.fetches.fetch_add(1, Ordering::Relaxed) + 1;
        let credential = self
            .backend
            .get_credential()
            .await
            .map_err(UploadError::Credential)?;

        let now = Utc::now();
        if credential.is_expired(now) {
            return Err(UploadError::Credential(BackendError::CredentialExpired));
        }
        let short_lived = !credential.covers(now, needed);
        if short_lived {
            warn!(
                ttl_secs = credential.remaining(now).as_secs(),
                needed_secs = needed.as_secs(),
                "credential lifetime shorter than one request; relying on reactive refresh"
            );
        }
        debug!(fetch = n, expires_at = %credential.expires_at, "credential issued");
        Ok(Cached {
            credential: Arc::new(credential),
            short_lived,
        })
    }
}
