use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use memmap2::MmapMut;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::object_id::ObjectId;
use crate::protocol::frame::{read_reply, write_request};
use crate::protocol::handshake::{read_handshake, write_handshake};
use crate::protocol::{ObjectInfo, ObjectLocation, Reply, Request};
use crate::store::{ObjectBuffer, ObjectStore, StoreError, StoreResult};

/// Connection to a store daemon over its Unix socket.
///
/// One request is in flight at a time; every call writes a request frame and
/// waits for the matching reply.
pub struct StoreClient {
    stream: UnixStream,
    address: PathBuf,
}

impl StoreClient {
    pub async fn connect(address: impl AsRef<Path>, config: &ClientConfig) -> StoreResult<Self> {
        let address = address.as_ref().to_path_buf();
        let attempt = Self::establish(address.clone(), config);

        match config.connect_timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), attempt)
                .await
                .map_err(|_| StoreError::Timeout(ms))?,
            None => attempt.await,
        }
    }

    async fn establish(address: PathBuf, config: &ClientConfig) -> StoreResult<Self> {
        let mut stream = UnixStream::connect(&address)
            .await
            .map_err(|source| StoreError::Connect {
                address: address.clone(),
                source,
            })?;

        write_handshake(&mut stream).await.map_err(StoreError::from_wire)?;
        read_handshake(&mut stream).await.map_err(StoreError::from_wire)?;

        let mut client = Self { stream, address };

        let reply = client
            .call(Request::Connect {
                client_name: config.client_name.clone(),
                manager_socket: config.manager_socket.clone(),
                release_delay: config.release_delay,
            })
            .await?;
        match reply {
            Reply::Connected { capacity, used } => {
                info!("Connected to store at {:?} ({} of {} bytes used)", client.address, used, capacity);
                Ok(client)
            }
            other => Err(StoreError::UnexpectedReply(other.name())),
        }
    }

    async fn call(&mut self, request: Request) -> StoreResult<Reply> {
        debug!("-> {}", request.name());
        write_request(&mut self.stream, &request)
            .await
            .map_err(StoreError::from_wire)?;
        let reply = read_reply(&mut self.stream).await.map_err(StoreError::from_wire)?;
        debug!("<- {}", reply.name());

        match reply {
            Reply::Error { kind, message } => Err(StoreError::Remote { kind, message }),
            reply => Ok(reply),
        }
    }

    pub async fn list(&mut self) -> StoreResult<Vec<ObjectInfo>> {
        match self.call(Request::List).await? {
            Reply::Listing { objects } => Ok(objects),
            other => Err(StoreError::UnexpectedReply(other.name())),
        }
    }

    pub async fn contains(&mut self, id: &ObjectId) -> StoreResult<bool> {
        match self.call(Request::Contains { id: id.clone() }).await? {
            Reply::Contains { present } => Ok(present),
            other => Err(StoreError::UnexpectedReply(other.name())),
        }
    }

    /// Map each requested object; `None` for ids the store does not hold.
    pub async fn get_buffers(
        &mut self,
        ids: &[ObjectId],
        timeout_ms: Option<u64>,
    ) -> StoreResult<Vec<Option<ObjectBuffer>>> {
        let reply = self
            .call(Request::Get {
                ids: ids.to_vec(),
                timeout_ms,
            })
            .await?;
        let locations = match reply {
            Reply::Buffers { objects } => objects,
            other => return Err(StoreError::UnexpectedReply(other.name())),
        };
        if locations.len() != ids.len() {
            return Err(StoreError::UnexpectedReply("Buffers"));
        }

        locations
            .iter()
            .map(|loc| loc.as_ref().map(ObjectBuffer::map).transpose())
            .collect()
    }

    /// Reserve `size` bytes under `id`. The object stays invisible to
    /// readers until sealed.
    pub async fn create(&mut self, id: &ObjectId, size: u64) -> StoreResult<ObjectLocation> {
        match self.call(Request::Create { id: id.clone(), size }).await? {
            Reply::Created { location } => Ok(location),
            other => Err(StoreError::UnexpectedReply(other.name())),
        }
    }

    /// Make a created object immutable and readable. Returns its digest.
    pub async fn seal(&mut self, id: &ObjectId) -> StoreResult<u32> {
        match self.call(Request::Seal { id: id.clone() }).await? {
            Reply::Sealed { digest } => Ok(digest),
            other => Err(StoreError::UnexpectedReply(other.name())),
        }
    }

    pub async fn abort(&mut self, id: &ObjectId) -> StoreResult<()> {
        match self.call(Request::Abort { id: id.clone() }).await? {
            Reply::Done => Ok(()),
            other => Err(StoreError::UnexpectedReply(other.name())),
        }
    }

    /// Create an object of `data.len()` bytes, fill it, and seal it.
    ///
    /// A failed write aborts the reservation so the id can be reused.
    pub async fn create_and_write(&mut self, id: &ObjectId, data: &[u8]) -> StoreResult<u32> {
        let location = self.create(id, data.len() as u64).await?;

        if let Err(e) = write_object(&location, data) {
            warn!("Writing object {} failed, aborting: {}", id, e);
            if let Err(abort) = self.abort(id).await {
                warn!("Abort of {} failed: {}", id, abort);
            }
            return Err(e);
        }

        let digest = self.seal(id).await?;
        info!("Sealed object {} ({} bytes, digest {:08x})", id, data.len(), digest);
        Ok(digest)
    }

    pub async fn delete(&mut self, id: &ObjectId) -> StoreResult<()> {
        match self.call(Request::Delete { id: id.clone() }).await? {
            Reply::Done => Ok(()),
            other => Err(StoreError::UnexpectedReply(other.name())),
        }
    }

    pub async fn disconnect(mut self) -> StoreResult<()> {
        match self.call(Request::Disconnect).await? {
            Reply::Done => Ok(()),
            other => Err(StoreError::UnexpectedReply(other.name())),
        }
    }
}

/// Copy `data` into a created object's file through a writable mapping.
pub fn write_object(location: &ObjectLocation, data: &[u8]) -> StoreResult<()> {
    if data.is_empty() {
        return Ok(());
    }
    let path = &location.path;
    let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    // SAFETY: the store hands a freshly created file to exactly one writer
    // until it is sealed.
    let mut mmap = unsafe { MmapMut::map_mut(&file)? };
    if mmap.len() < data.len() {
        return Err(StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("object file {} is smaller than {} bytes", path.display(), data.len()),
        )));
    }
    mmap[..data.len()].copy_from_slice(data);
    mmap.flush()?;
    Ok(())
}

#[async_trait]
impl ObjectStore for StoreClient {
    async fn list(&mut self) -> StoreResult<Vec<ObjectInfo>> {
        StoreClient::list(self).await
    }

    async fn get_buffers(
        &mut self,
        ids: &[ObjectId],
        timeout_ms: Option<u64>,
    ) -> StoreResult<Vec<Option<ObjectBuffer>>> {
        StoreClient::get_buffers(self, ids, timeout_ms).await
    }
}
