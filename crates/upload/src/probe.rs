//! Fast-path duplicate detection.

use cloudgate_backend::{
    BackendProtocol, ChallengeProof, FastPathAnswer, FastPathQuery, RemotePath,
};
use cloudgate_transfer::{ContentDigests, Fingerprinter, SourceStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::CredentialBroker;
use crate::error::{CancelReason, UploadError};
use crate::types::FastPathResult;

/// Asks the backend whether it already holds the content, answering any
/// byte-range challenges from the local source.
pub struct FastPathProbe<'a> {
    backend: &'a dyn BackendProtocol,
    broker: &'a CredentialBroker,
    fingerprinter: Fingerprinter,
    max_challenges: u32,
}

impl<'a> FastPathProbe<'a> {
    pub fn new(
        backend: &'a dyn BackendProtocol,
        broker: &'a CredentialBroker,
        fingerprinter: Fingerprinter,
        max_challenges: u32,
    ) -> Self {
        Self {
            backend,
            broker,
            fingerprinter,
            max_challenges,
        }
    }

    /// Runs the probe to a [`FastPathResult`].
    ///
    /// Backend rejections, including a rejected proof, abandon the fast
    /// path rather than fail the upload. Failing to read a challenged range
    /// from the source is terminal.
    pub async fn run(
        &self,
        source: &dyn SourceStream,
        digests: &ContentDigests,
        destination: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<FastPathResult, UploadError> {
        if !self.backend.profile().fast_path {
            debug!("backend has no fast path");
            return Ok(FastPathResult::NotAttempted);
        }
        if digests.size == 0 {
            return Ok(FastPathResult::NotAttempted);
        }

        let mut query = FastPathQuery {
            destination: destination.clone(),
            size: digests.size,
            partial: digests.partial.clone(),
            full: digests.full.clone(),
            proof: None,
        };
        let mut challenges: u32 = 0;
        let mut auth_retried = false;

        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Canceled(CancelReason::Requested));
            }
            let credential = self.broker.current().await?;

            let answer = match self.backend.probe_fast_path(&credential, &query).await {
                Ok(answer) => answer,
                Err(e) if e.is_auth() && !auth_retried => {
                    debug!(error = %e, "fast-path probe unauthorized, refreshing credential");
                    auth_retried = true;
                    self.broker.force_refresh(&credential).await?;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, challenges, "fast-path probe rejected, uploading in full");
                    return Ok(FastPathResult::NoMatch);
                }
            };

            match answer {
                FastPathAnswer::Matched(object) => {
                    info!(object = %object.id, challenges, "fast path matched existing content");
                    return Ok(FastPathResult::Matched(object));
                }
                FastPathAnswer::NoMatch => {
                    debug!(challenges, "fast path found no match");
                    return Ok(FastPathResult::NoMatch);
                }
                FastPathAnswer::Challenge(challenge) => {
                    challenges += 1;
                    if challenges > self.max_challenges {
                        info!(
                            limit = self.max_challenges,
                            "fast-path challenge limit reached, uploading in full"
                        );
                        return Ok(FastPathResult::NoMatch);
                    }
                    if !challenge.range.fits_within(digests.size) {
                        warn!(
                            range = %challenge.range,
                            size = digests.size,
                            "fast-path challenge outside the source, uploading in full"
                        );
                        return Ok(FastPathResult::NoMatch);
                    }

                    debug!(range = %challenge.range, round = challenges, "answering fast-path challenge");
                    let digest = self
                        .fingerprinter
                        .digest_range(source, challenge.range)
                        .await?;
                    query.proof = Some(ChallengeProof {
                        token: challenge.token,
                        range: challenge.range,
                        digest,
                    });
                }
            }
        }
    }
}
