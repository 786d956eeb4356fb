use std::path::PathBuf;

use crate::object_id::ObjectId;
use crate::protocol::{ProtocolError, RemoteErrorKind};

/// Errors talking to the object store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The socket could not be reached.
    #[error("cannot connect to {}: {source}", address.display())]
    Connect {
        address: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Connecting took longer than the configured limit.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer broke framing or sent an unreadable body.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The store understood the request and refused it.
    #[error("store refused request: {kind}: {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    /// The store answered with a reply that does not match the request.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(&'static str),

    /// Mapped contents do not match the digest recorded at seal time.
    #[error("digest mismatch for {id}: expected {expected:08x}, computed {computed:08x}")]
    DigestMismatch {
        id: ObjectId,
        expected: u32,
        computed: u32,
    },
}

impl StoreError {
    /// Unwrap the typed cause out of a wire helper's `anyhow` error.
    pub fn from_wire(err: anyhow::Error) -> Self {
        let err = match err.downcast::<ProtocolError>() {
            Ok(protocol) => return StoreError::Protocol(protocol),
            Err(err) => err,
        };
        match err.downcast::<std::io::Error>() {
            Ok(io) => StoreError::Io(io),
            Err(other) => StoreError::Protocol(ProtocolError::Codec(other.to_string())),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
