//! The backend capability trait.
//!
//! Orchestration is written once against [`BackendProtocol`]; each storage
//! backend supplies its own probe, chunk, and commit calls and signs its
//! requests however it needs to. Keeping the trait object-safe lets the
//! upload engine hold an `Arc<dyn BackendProtocol>` and lets tests swap in
//! scripted implementations.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cloudgate_transfer::Fingerprint;

use crate::error::BackendError;
use crate::profile::BackendProfile;
use crate::types::{
    ChunkAck, ChunkUpload, Credential, FastPathAnswer, FastPathQuery, FinalizeRequest,
    FinalizeStatus, InitRequest, RemoteObjectRef, RemotePath, UploadTicket,
};

/// Boxed future returned by [`BackendProtocol`] methods.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Operations a storage backend exposes to the upload engine.
pub trait BackendProtocol: Send + Sync {
    /// Static upload rules for this backend.
    fn profile(&self) -> &BackendProfile;

    /// Obtains a fresh short-lived upload credential.
    fn get_credential(&self) -> BackendFuture<'_, Credential>;

    /// Asks whether identical content is already stored.
    fn probe_fast_path<'a>(
        &'a self,
        credential: &'a Credential,
        query: &'a FastPathQuery,
    ) -> BackendFuture<'a, FastPathAnswer>;

    /// Opens a chunked upload and reports any parts already staged for it.
    fn init_chunked_upload<'a>(
        &'a self,
        credential: &'a Credential,
        request: &'a InitRequest,
    ) -> BackendFuture<'a, UploadTicket>;

    /// Uploads one signed chunk.
    ///
    /// The acknowledgement reports the digest of the stored bytes. A backend
    /// that omits it must declare
    /// [`AckChecksum::ServerVerified`](crate::AckChecksum::ServerVerified) and fail
    /// the call whenever the stored bytes do not match `chunk.checksum`.
    fn upload_chunk<'a>(
        &'a self,
        credential: &'a Credential,
        chunk: ChunkUpload<'a>,
    ) -> BackendFuture<'a, ChunkAck>;

    /// Commits the upload from acknowledgements ordered by chunk number.
    fn finalize<'a>(
        &'a self,
        credential: &'a Credential,
        request: &'a FinalizeRequest,
    ) -> BackendFuture<'a, FinalizeStatus>;

    /// Creates a zero-length object without a chunked upload.
    fn create_empty<'a>(
        &'a self,
        credential: &'a Credential,
        destination: &'a RemotePath,
        digest: &'a Fingerprint,
    ) -> BackendFuture<'a, RemoteObjectRef>;

    /// Discards server-side state for an unfinished upload.
    fn abort_upload<'a>(
        &'a self,
        credential: &'a Credential,
        upload_id: &'a str,
    ) -> BackendFuture<'a, ()> {
        let _ = (credential, upload_id);
        Box::pin(async { Ok(()) })
    }
}

impl<T: BackendProtocol + ?Sized> BackendProtocol for Arc<T> {
    fn profile(&self) -> &BackendProfile {
        (**self).profile()
    }

    fn get_credential(&self) -> BackendFuture<'_, Credential> {
        (**self).get_credential()
    }

    fn probe_fast_path<'a>(
        &'a self,
        credential: &'a Credential,
        query: &'a FastPathQuery,
    ) -> BackendFuture<'a, FastPathAnswer> {
        (**self).probe_fast_path(credential, query)
    }

    fn init_chunked_upload<'a>(
        &'a self,
        credential: &'a Credential,
        request: &'a InitRequest,
    ) -> BackendFuture<'a, UploadTicket> {
        (**self).init_chunked_upload(credential, request)
    }

    fn upload_chunk<'a>(
        &'a self,
        credential: &'a Credential,
        chunk: ChunkUpload<'a>,
    ) -> BackendFuture<'a, ChunkAck> {
        (**self).upload_chunk(credential, chunk)
    }

    fn finalize<'a>(
        &'a self,
        credential: &'a Credential,
        request: &'a FinalizeRequest,
    ) -> BackendFuture<'a, FinalizeStatus> {
        (**self).finalize(credential, request)
    }

    fn create_empty<'a>(
        &'a self,
        credential: &'a Credential,
        destination: &'a RemotePath,
        digest: &'a Fingerprint,
    ) -> BackendFuture<'a, RemoteObjectRef> {
        (**self).create_empty(credential, destination, digest)
    }

    fn abort_upload<'a>(
        &'a self,
        credential: &'a Credential,
        upload_id: &'a str,
    ) -> BackendFuture<'a, ()> {
        (**self).abort_upload(credential, upload_id)
    }
}
