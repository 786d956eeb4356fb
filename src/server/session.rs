use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::protocol::frame::{read_request, write_reply};
use crate::protocol::handshake::{read_handshake, write_handshake};
use crate::object_id::ObjectId;
use crate::protocol::{ObjectLocation, Reply, Request};
use crate::server::table::{StoreState, TableError};

/// One client connection to the store.
pub struct Session {
    stream: UnixStream,
    state: Arc<StoreState>,
    id: u64,
    client_name: Option<String>,
}

impl Session {
    pub fn new(stream: UnixStream, state: Arc<StoreState>, id: u64) -> Self {
        Self {
            stream,
            state,
            id,
            client_name: None,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let _client = read_handshake(&mut self.stream).await?;
        write_handshake(&mut self.stream).await?;
        debug!("Session {}: handshake completed", self.id);

        let result = self.serve().await;

        let orphans = self.state.table.lock().await.abort_owned_by(self.id);
        if orphans > 0 {
            warn!("Session {}: aborted {} unsealed objects", self.id, orphans);
            self.state.changed.notify_waiters();
        }
        result
    }

    async fn serve(&mut self) -> anyhow::Result<()> {
        loop {
            let request = match read_request(&mut self.stream).await {
                Ok(r) => r,
                Err(e) => {
                    if is_eof(&e) {
                        debug!("Session {}: peer closed", self.id);
                        return Ok(());
                    }
                    return Err(e);
                }
            };

            let done = matches!(request, Request::Disconnect);
            let reply = match self.handle(request).await? {
                Some(reply) => reply,
                None => {
                    debug!("Session {}: peer closed while waiting", self.id);
                    return Ok(());
                }
            };
            write_reply(&mut self.stream, &reply).await?;

            if done {
                info!("Session {}: {} disconnected", self.id, self.name());
                return Ok(());
            }
        }
    }

    fn name(&self) -> &str {
        self.client_name.as_deref().unwrap_or("anonymous")
    }

    /// `None` when the peer went away before the reply was ready.
    async fn handle(&mut self, request: Request) -> anyhow::Result<Option<Reply>> {
        debug!("Session {}: {}", self.id, request.name());

        let reply = match request {
            Request::Connect { client_name, manager_socket, release_delay } => {
                info!(
                    "Session {}: client '{}' connected (manager_socket={:?}, release_delay={})",
                    self.id, client_name, manager_socket, release_delay
                );
                self.client_name = Some(client_name);
                let table = self.state.table.lock().await;
                Reply::Connected {
                    capacity: table.capacity(),
                    used: table.used(),
                }
            }

            Request::List => Reply::Listing {
                objects: self.state.table.lock().await.list(),
            },

            Request::Contains { id } => Reply::Contains {
                present: self.state.table.lock().await.contains_sealed(&id),
            },

            Request::Get { ids, timeout_ms } => match self.wait_for(&ids, timeout_ms).await? {
                Some(objects) => Reply::Buffers { objects },
                None => return Ok(None),
            },

            Request::Create { id, size } => {
                match self.state.table.lock().await.create(&id, size, self.id) {
                    Ok(location) => Reply::Created { location },
                    Err(e) => e.into(),
                }
            }

            Request::Seal { id } => match self.state.seal(&id).await {
                Ok(digest) => Reply::Sealed { digest },
                Err(e) => e.into(),
            },

            Request::Abort { id } => {
                let aborted = self.state.table.lock().await.abort(&id);
                self.changed(aborted)
            }

            Request::Delete { id } => {
                let deleted = self.state.table.lock().await.delete(&id);
                self.changed(deleted)
            }

            Request::Disconnect => Reply::Done,
        };
        Ok(Some(reply))
    }

    /// Wait for `ids` while watching the socket. Clients send nothing while
    /// a get is pending, so any read completing means the peer is gone or
    /// broke the protocol.
    async fn wait_for(
        &mut self,
        ids: &[ObjectId],
        timeout_ms: Option<u64>,
    ) -> anyhow::Result<Option<Vec<Option<ObjectLocation>>>> {
        let mut byte = [0u8; 1];
        tokio::select! {
            objects = self.state.get(ids, timeout_ms) => Ok(Some(objects)),
            read = self.stream.read(&mut byte) => match read? {
                0 => Ok(None),
                _ => anyhow::bail!("session {}: request sent while a get was pending", self.id),
            },
        }
    }

    fn changed(&self, result: Result<(), TableError>) -> Reply {
        match result {
            Ok(()) => {
                self.state.changed.notify_waiters();
                Reply::Done
            }
            Err(e) => e.into(),
        }
    }
}

fn is_eof(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(|e| e.kind() == std::io::ErrorKind::UnexpectedEof)
        .unwrap_or(false)
}
