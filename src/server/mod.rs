pub mod session;
pub mod table;

use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::UnixListener;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::utils::crc::crc32;
use session::Session;
use table::{ObjectTable, StoreState};

/// Store daemon listening on a Unix socket.
pub struct StoreServer {
    listener: UnixListener,
    socket_path: PathBuf,
    state: Arc<StoreState>,
    next_session: AtomicU64,
}

impl StoreServer {
    pub fn bind(socket_path: impl AsRef<Path>, config: &ServerConfig) -> anyhow::Result<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        if socket_path.exists() {
            if std::os::unix::net::UnixStream::connect(&socket_path).is_ok() {
                anyhow::bail!("a store is already serving {:?}", socket_path);
            }
            std::fs::remove_file(&socket_path)
                .with_context(|| format!("removing stale socket {:?}", socket_path))?;
        }

        let objects_dir = objects_dir_for(&config.objects_dir, &socket_path)?;
        let table = ObjectTable::open(&objects_dir, config.capacity_bytes)
            .with_context(|| format!("preparing objects directory {:?}", objects_dir))?;

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("binding {:?}", socket_path))?;

        info!(
            "Store listening on {:?} (objects in {:?}, capacity {} bytes)",
            socket_path,
            table.dir(),
            table.capacity()
        );

        Ok(Self {
            listener,
            socket_path,
            state: Arc::new(StoreState::new(table)),
            next_session: AtomicU64::new(1),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => {
                    let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                    info!("New connection, session {}", id);

                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = Session::new(socket, state, id).run().await {
                            error!("Session {} error: {}", id, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// Per-socket subdirectory of `base`, so daemons sharing a base directory
/// never clear each other's objects.
fn objects_dir_for(base: &Path, socket_path: &Path) -> anyhow::Result<PathBuf> {
    let absolute = if socket_path.is_absolute() {
        socket_path.to_path_buf()
    } else {
        std::env::current_dir()?.join(socket_path)
    };
    let name = socket_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "store".to_string());
    Ok(base.join(format!("{}-{:08x}", name, crc32(absolute.as_os_str().as_bytes()))))
}

impl Drop for StoreServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_id::IdentifierConfig;
    use crate::store::StoreClient;

    fn server_config(dir: &Path) -> ServerConfig {
        ServerConfig {
            objects_dir: dir.join("objects"),
            capacity_bytes: 1 << 20,
        }
    }

    #[test]
    fn sockets_get_distinct_object_dirs() {
        let base = Path::new("/dev/shm/plasmacat");
        let a = objects_dir_for(base, Path::new("/tmp/a/store.sock")).unwrap();
        let b = objects_dir_for(base, Path::new("/tmp/b/store.sock")).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(base));
        assert_eq!(a, objects_dir_for(base, Path::new("/tmp/a/store.sock")).unwrap());
    }

    #[tokio::test]
    async fn second_daemon_keeps_first_daemons_objects() {
        let dir = tempfile::tempdir().unwrap();
        let config = server_config(dir.path());
        let first = dir.path().join("first.sock");
        tokio::spawn(StoreServer::bind(&first, &config).unwrap().run());

        let client_config = crate::config::ClientConfig::default();
        let id = IdentifierConfig::default().normalize("42").unwrap();
        let mut client = StoreClient::connect(&first, &client_config).await.unwrap();
        client.create_and_write(&id, b"payload").await.unwrap();

        let _second = StoreServer::bind(dir.path().join("second.sock"), &config).unwrap();

        let buffers = client.get_buffers(std::slice::from_ref(&id), None).await.unwrap();
        assert_eq!(buffers[0].as_deref(), Some(&b"payload"[..]));
    }

    #[tokio::test]
    async fn live_socket_is_not_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let config = server_config(dir.path());
        let socket = dir.path().join("store.sock");
        let _running = StoreServer::bind(&socket, &config).unwrap();

        assert!(StoreServer::bind(&socket, &config).is_err());
        assert!(socket.exists());
    }
}
