// Session transport: the RPC seam between the engine and the cloud session store.
//
// The engine only talks to the store through `SessionTransport`. Production
// uses the reqwest-backed `HttpSessionTransport`; tests inject recording mocks.

pub mod http;

use std::future::Future;
use std::pin::Pin;

use tether_common::protocol::api::{
    CreateSessionRequest, ForkSessionRequest, ForkSessionResponse, ShareSessionResponse,
    UpdateSessionRequest, UploadBlobResponse,
};
use tether_common::types::{BlobKind, RemoteSession, Visibility};
use thiserror::Error;

pub use http::HttpSessionTransport;

/// Boxed future returned by every transport call.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Credential rejected (expired, revoked, or missing).
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Connection failures and timeouts.
    #[error("network error: {0}")]
    Network(String),
    #[error("session store returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl TransportError {
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// RPC surface of the cloud session store.
///
/// Implementations must not borrow the `&str` arguments inside the returned
/// future; copy what is needed before boxing.
pub trait SessionTransport: Send + Sync {
    fn create(&self, request: CreateSessionRequest) -> TransportFuture<'_, RemoteSession>;

    fn get(&self, session_id: &str, include_blob_urls: bool) -> TransportFuture<'_, RemoteSession>;

    fn update(
        &self,
        session_id: &str,
        request: UpdateSessionRequest,
    ) -> TransportFuture<'_, RemoteSession>;

    fn share(&self, session_id: &str, visibility: Visibility)
        -> TransportFuture<'_, ShareSessionResponse>;

    fn fork(&self, request: ForkSessionRequest) -> TransportFuture<'_, ForkSessionResponse>;

    fn upload_blob(
        &self,
        session_id: &str,
        kind: BlobKind,
        content: Vec<u8>,
    ) -> TransportFuture<'_, UploadBlobResponse>;

    /// Download a blob through a signed URL returned by `get`.
    fn fetch_blob(&self, url: &str) -> TransportFuture<'_, Vec<u8>>;

    fn token_valid(&self) -> TransportFuture<'_, bool>;
}
