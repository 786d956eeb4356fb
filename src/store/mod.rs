pub mod buffer;
pub mod client;
pub mod error;

pub use buffer::ObjectBuffer;
pub use client::StoreClient;
pub use error::{StoreError, StoreResult};

use async_trait::async_trait;

use crate::object_id::ObjectId;
use crate::protocol::ObjectInfo;

/// The slice of the store API the fetch path depends on.
#[async_trait]
pub trait ObjectStore: Send {
    /// Every object the store currently holds, sealed or not.
    async fn list(&mut self) -> StoreResult<Vec<ObjectInfo>>;

    /// Buffers for `ids`, in order. May block on objects still being written.
    async fn get_buffers(
        &mut self,
        ids: &[ObjectId],
        timeout_ms: Option<u64>,
    ) -> StoreResult<Vec<Option<ObjectBuffer>>>;
}
