//! Error types shared by the server and the client.
//!
//! [`RelayError`] is what a request handler returns; the server actor turns it
//! into the `error` string of the [`Response`](crate::protocol::Response).
//! [`ClientError`] adds the transport failures only a client can observe.

use thiserror::Error;

use crate::codec::CodecError;

/// Errors produced while processing a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("invalid password digest or salt")]
    InvalidPassword,

    #[error("peer exists: {0}")]
    PeerExists(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("wrong password")]
    WrongPassword,

    #[error("peer not login: {0}")]
    PeerNotLogin(String),

    #[error("peer already online: {0}")]
    PeerAlreadyOnline(String),

    #[error("invalid service name: {0:?}")]
    InvalidServiceName(String),

    #[error("service exists: {0}")]
    ServiceExists(String),

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("service not owner: {0}")]
    ServiceNotOwner(String),

    #[error("service is owner: {0}")]
    ServiceIsOwner(String),

    #[error("service not joined: {0}")]
    ServiceNotJoined(String),

    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Errors returned by [`SignalClient`](crate::client::SignalClient).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to signal server")]
    NotConnected,

    #[error("already connected to signal server")]
    AlreadyConnected,

    #[error("request timeout")]
    RequestTimeout,

    #[error("connection closed by other side")]
    ConnectionClosed,

    /// The server answered with a non-empty `error` field.
    #[error("{0}")]
    Remote(String),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Whether this is a server-side rejection matching `expected`.
    pub fn is_remote(&self, expected: &RelayError) -> bool {
        matches!(self, ClientError::Remote(msg) if *msg == expected.to_string())
    }
}

/// Result type for request handlers.
pub type RelayResult<T> = Result<T, RelayError>;
