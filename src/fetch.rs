//! Fetch one object from the store and decode it as a record batch.
//!
//! The steps run strictly in order on one connection: normalize the token,
//! connect, list, get, decode. The first failure ends the invocation.

use arrow::record_batch::RecordBatch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::decode::decode_single_batch;
use crate::error::FetchError;
use crate::object_id::ObjectId;
use crate::store::{ObjectStore, StoreClient};

/// List, check, get, decode. The buffer is only requested for listed ids.
pub async fn fetch_batch<S: ObjectStore + ?Sized>(
    store: &mut S,
    id: &ObjectId,
    timeout_ms: Option<u64>,
) -> Result<RecordBatch, FetchError> {
    let listing = store.list().await?;
    debug!("Store lists {} objects", listing.len());

    if !listing.iter().any(|info| &info.id == id) {
        return Err(FetchError::ObjectNotFound(id.clone()));
    }

    let mut buffers = store.get_buffers(std::slice::from_ref(id), timeout_ms).await?;
    let buffer = match buffers.pop().flatten() {
        Some(buffer) => buffer,
        None => {
            // Deleted after the listing, or still unsealed when the wait expired.
            warn!("Object {} listed but not retrievable", id);
            return Err(FetchError::ObjectNotFound(id.clone()));
        }
    };
    debug!("Retrieved {} bytes for {}", buffer.len(), buffer.id());

    decode_single_batch(buffer.into_arrow_buffer())
}

/// Run one complete fetch against the store at `address`.
pub async fn fetch(config: &Config, address: &str, token: &str) -> Result<(ObjectId, RecordBatch), FetchError> {
    let id = config.identifier.normalize(token)?;
    info!("Fetching {} from {}", id.escaped(), address);

    let mut client = StoreClient::connect(address, &config.client)
        .await
        .map_err(|source| FetchError::StoreUnavailable {
            address: address.to_string(),
            source,
        })?;

    let result = fetch_batch(&mut client, &id, config.client.get_timeout_ms).await;

    if let Err(e) = client.disconnect().await {
        warn!("Disconnect from {} failed: {}", address, e);
    }

    let batch = result?;
    info!("Decoded {} rows x {} columns", batch.num_rows(), batch.num_columns());
    Ok((id, batch))
}
