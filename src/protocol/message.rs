//! Request and reply bodies carried inside frames.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::object_id::ObjectId;
use crate::protocol::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectState {
    /// Reserved by a writer, contents not yet readable.
    Created,
    /// Immutable and readable.
    Sealed,
}

/// One entry of the store listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub data_size: u64,
    pub state: ObjectState,
    pub digest: Option<u32>,
    /// Seconds since the Unix epoch.
    pub created_at: u64,
}

/// Where a client maps an object's bytes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub id: ObjectId,
    pub path: PathBuf,
    pub size: u64,
    /// CRC32 of the contents, present once sealed.
    pub digest: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Connect {
        client_name: String,
        manager_socket: String,
        release_delay: u64,
    },
    List,
    Contains { id: ObjectId },
    /// Blocks on objects that exist but are unsealed; `None` waits forever.
    Get {
        ids: Vec<ObjectId>,
        timeout_ms: Option<u64>,
    },
    Create { id: ObjectId, size: u64 },
    Seal { id: ObjectId },
    Abort { id: ObjectId },
    Delete { id: ObjectId },
    Disconnect,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Connect { .. } => "Connect",
            Request::List => "List",
            Request::Contains { .. } => "Contains",
            Request::Get { .. } => "Get",
            Request::Create { .. } => "Create",
            Request::Seal { .. } => "Seal",
            Request::Abort { .. } => "Abort",
            Request::Delete { .. } => "Delete",
            Request::Disconnect => "Disconnect",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    NotFound,
    AlreadyExists,
    NotSealed,
    OutOfMemory,
    Invalid,
    Internal,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteErrorKind::NotFound => "not found",
            RemoteErrorKind::AlreadyExists => "already exists",
            RemoteErrorKind::NotSealed => "not sealed",
            RemoteErrorKind::OutOfMemory => "out of memory",
            RemoteErrorKind::Invalid => "invalid request",
            RemoteErrorKind::Internal => "internal error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Connected { capacity: u64, used: u64 },
    Listing { objects: Vec<ObjectInfo> },
    Contains { present: bool },
    Buffers { objects: Vec<Option<ObjectLocation>> },
    Created { location: ObjectLocation },
    Sealed { digest: u32 },
    Done,
    Error { kind: RemoteErrorKind, message: String },
}

impl Reply {
    pub fn name(&self) -> &'static str {
        match self {
            Reply::Connected { .. } => "Connected",
            Reply::Listing { .. } => "Listing",
            Reply::Contains { .. } => "Contains",
            Reply::Buffers { .. } => "Buffers",
            Reply::Created { .. } => "Created",
            Reply::Sealed { .. } => "Sealed",
            Reply::Done => "Done",
            Reply::Error { .. } => "Error",
        }
    }

    pub fn error(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Reply::Error { kind, message: message.into() }
    }
}

pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(body).map_err(|e| ProtocolError::Codec(e.to_string()))
}

pub fn decode_body<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, ProtocolError> {
    bincode::deserialize(payload).map_err(|e| ProtocolError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_request_survives_the_codec() {
        let req = Request::Get {
            ids: vec![ObjectId::from_bytes(b"00000000000000000042".to_vec())],
            timeout_ms: Some(250),
        };
        let bytes = encode_body(&req).unwrap();
        assert_eq!(decode_body::<Request>(&bytes).unwrap(), req);
    }

    #[test]
    fn garbage_body_is_a_codec_error() {
        let err = decode_body::<Reply>(&[0xff, 0xff, 0xff, 0xff, 0x01]).unwrap_err();
        assert!(matches!(err, ProtocolError::Codec(_)));
    }
}
