//! Backend capability contract for chunked uploads.
//!
//! A storage backend is described by a [`BackendProfile`] (digest algorithm,
//! chunk limits, ordering and fast-path flags) and driven through the
//! [`BackendProtocol`] trait. Request signing is pluggable via
//! [`RequestSigner`]. [`LocalDirBackend`] is a content-addressed store on the
//! local filesystem that implements the whole contract.

pub mod error;
pub mod local;
pub mod profile;
pub mod protocol;
pub mod signing;
pub mod types;

pub use error::BackendError;
pub use local::{LocalDirBackend, LocalDirOptions};
pub use profile::{AckChecksum, BackendProfile};
pub use protocol::{BackendFuture, BackendProtocol};
pub use signing::{HmacSha256Signer, RequestSigner, SigV4Signer, SignableRequest, Signature};
pub use types::{
    Challenge, ChallengeProof, ChunkAck, ChunkUpload, Credential, FastPathAnswer, FastPathQuery,
    FinalizeRequest, FinalizeStatus, InitRequest, PartRef, RemoteObjectRef, RemotePart,
    RemotePath, UploadTicket,
};
