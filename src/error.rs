use crate::object_id::ObjectId;
use crate::store::StoreError;

/// Failures of a single fetch-and-decode invocation. Every kind is terminal.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The caller's token does not fit the canonical width.
    #[error("invalid object id {token:?}: {len} bytes exceeds canonical width {width}")]
    InvalidIdentifier {
        token: String,
        len: usize,
        width: usize,
    },

    /// No store answered at the address, or the handshake failed.
    #[error("store unavailable at {address}: {source}")]
    StoreUnavailable {
        address: String,
        #[source]
        source: StoreError,
    },

    /// The store is up but does not list the object.
    #[error("unknown object id: {}", .0.escaped())]
    ObjectNotFound(ObjectId),

    /// The buffer is not a readable stream holding at least one batch.
    #[error("cannot decode record batch: {0}")]
    DecodeError(String),

    /// The store failed a request after the connection was established.
    #[error("store request failed: {0}")]
    Store(#[from] StoreError),
}

impl FetchError {
    /// Process exit status reported for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            FetchError::InvalidIdentifier { .. } => 2,
            FetchError::StoreUnavailable { .. } => 3,
            FetchError::ObjectNotFound(_) => 4,
            FetchError::DecodeError(_) => 5,
            FetchError::Store(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_id::IdentifierConfig;

    #[test]
    fn not_found_message_carries_raw_bytes() {
        let id = IdentifierConfig::default().normalize("42").unwrap();
        let msg = FetchError::ObjectNotFound(id).to_string();
        assert_eq!(msg, "unknown object id: b\"00000000000000000042\"");
    }

    #[test]
    fn exit_codes_are_distinct_and_nonzero() {
        let id = IdentifierConfig::default().normalize("1").unwrap();
        let errors = [
            FetchError::InvalidIdentifier { token: "x".into(), len: 21, width: 20 },
            FetchError::StoreUnavailable {
                address: "/nope".into(),
                source: StoreError::Timeout(10),
            },
            FetchError::ObjectNotFound(id),
            FetchError::DecodeError("empty".into()),
            FetchError::Store(StoreError::UnexpectedReply("Done")),
        ];
        let mut codes: Vec<u8> = errors.iter().map(FetchError::exit_code).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }
}
