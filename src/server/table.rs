//! Object registry of the store daemon.
//!
//! Each object is one file `<hex id>.obj` inside the objects directory. A
//! writer reserves the file with `create`, fills it through its own mapping
//! and calls `seal`; from then on the object is immutable and readers map the
//! same file. Readers asking for an object that is still being written wait
//! on `StoreState::changed` until the writer seals or gives up.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memmap2::MmapOptions;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::object_id::{ObjectId, MAX_ID_WIDTH};
use crate::protocol::{ObjectInfo, ObjectLocation, ObjectState, RemoteErrorKind, Reply};
use crate::utils::crc::crc32;

const OBJECT_SUFFIX: &str = "obj";

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TableError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl TableError {
    fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    fn io(context: &str, err: std::io::Error) -> Self {
        Self::new(RemoteErrorKind::Internal, format!("{}: {}", context, err))
    }
}

impl From<TableError> for Reply {
    fn from(err: TableError) -> Self {
        Reply::error(err.kind, err.message)
    }
}

pub type TableResult<T> = Result<T, TableError>;

#[derive(Debug)]
struct Entry {
    size: u64,
    state: ObjectState,
    digest: Option<u32>,
    path: PathBuf,
    created_at: u64,
    owner: u64,
}

#[derive(Debug)]
pub struct ObjectTable {
    dir: PathBuf,
    capacity: u64,
    used: u64,
    objects: BTreeMap<ObjectId, Entry>,
}

impl ObjectTable {
    /// Prepare `dir`, discarding object files left by a previous run.
    pub fn open(dir: impl Into<PathBuf>, capacity: u64) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut stale = 0;
        for entry in std::fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(OBJECT_SUFFIX) {
                std::fs::remove_file(&path)?;
                stale += 1;
            }
        }
        if stale > 0 {
            info!("Removed {} stale object files from {:?}", stale, dir);
        }

        Ok(Self {
            dir,
            capacity,
            used: 0,
            objects: BTreeMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.dir.join(format!("{}.{}", id.to_hex(), OBJECT_SUFFIX))
    }

    pub fn create(&mut self, id: &ObjectId, size: u64, owner: u64) -> TableResult<ObjectLocation> {
        if id.is_empty() || id.len() > MAX_ID_WIDTH {
            return Err(TableError::new(
                RemoteErrorKind::Invalid,
                format!("object id must be 1..={} bytes, got {}", MAX_ID_WIDTH, id.len()),
            ));
        }
        if self.objects.contains_key(id) {
            return Err(TableError::new(RemoteErrorKind::AlreadyExists, format!("object {} exists", id)));
        }
        let free = self.capacity - self.used;
        if size > free {
            return Err(TableError::new(
                RemoteErrorKind::OutOfMemory,
                format!("object {} needs {} bytes, {} free", id, size, free),
            ));
        }

        let path = self.object_path(id);
        let file = std::fs::File::create(&path).map_err(|e| TableError::io("creating object file", e))?;
        file.set_len(size).map_err(|e| TableError::io("sizing object file", e))?;

        self.used += size;
        self.objects.insert(
            id.clone(),
            Entry {
                size,
                state: ObjectState::Created,
                digest: None,
                path: path.clone(),
                created_at: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
                owner,
            },
        );
        debug!("Created object {} ({} bytes) for session {}", id, size, owner);

        Ok(ObjectLocation {
            id: id.clone(),
            path,
            size,
            digest: None,
        })
    }

    /// Where an unsealed object's contents live, for digesting before
    /// `finish_seal`.
    pub fn begin_seal(&self, id: &ObjectId) -> TableResult<(PathBuf, u64)> {
        match self.objects.get(id) {
            None => Err(TableError::new(RemoteErrorKind::NotFound, format!("object {} not found", id))),
            Some(e) if e.state == ObjectState::Sealed => {
                Err(TableError::new(RemoteErrorKind::Invalid, format!("object {} already sealed", id)))
            }
            Some(e) => Ok((e.path.clone(), e.size)),
        }
    }

    /// Mark an object sealed with a digest computed by `file_digest`.
    ///
    /// Fails if the object was aborted, deleted or sealed in the meantime.
    pub fn finish_seal(&mut self, id: &ObjectId, digest: u32) -> TableResult<()> {
        let entry = self
            .objects
            .get_mut(id)
            .ok_or_else(|| TableError::new(RemoteErrorKind::NotFound, format!("object {} was aborted", id)))?;
        if entry.state == ObjectState::Sealed {
            return Err(TableError::new(RemoteErrorKind::Invalid, format!("object {} already sealed", id)));
        }
        entry.state = ObjectState::Sealed;
        entry.digest = Some(digest);
        debug!("Sealed object {} digest={:08x}", id, digest);
        Ok(())
    }

    /// Drop an object that was created but never sealed.
    pub fn abort(&mut self, id: &ObjectId) -> TableResult<()> {
        match self.objects.get(id).map(|e| e.state) {
            None => Err(TableError::new(RemoteErrorKind::NotFound, format!("object {} not found", id))),
            Some(ObjectState::Sealed) => Err(TableError::new(
                RemoteErrorKind::Invalid,
                format!("object {} is sealed, delete it instead", id),
            )),
            Some(ObjectState::Created) => {
                self.remove(id);
                Ok(())
            }
        }
    }

    pub fn delete(&mut self, id: &ObjectId) -> TableResult<()> {
        match self.objects.get(id).map(|e| e.state) {
            None => Err(TableError::new(RemoteErrorKind::NotFound, format!("object {} not found", id))),
            Some(ObjectState::Created) => Err(TableError::new(
                RemoteErrorKind::NotSealed,
                format!("object {} is still being written", id),
            )),
            Some(ObjectState::Sealed) => {
                self.remove(id);
                Ok(())
            }
        }
    }

    fn remove(&mut self, id: &ObjectId) {
        if let Some(entry) = self.objects.remove(id) {
            self.used -= entry.size;
            if let Err(e) = std::fs::remove_file(&entry.path) {
                warn!("Failed to remove {:?}: {}", entry.path, e);
            }
        }
    }

    /// Abort everything `owner` created and left unsealed. Returns the count.
    pub fn abort_owned_by(&mut self, owner: u64) -> usize {
        let orphans: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, e)| e.owner == owner && e.state == ObjectState::Created)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &orphans {
            self.remove(id);
        }
        orphans.len()
    }

    pub fn list(&self) -> Vec<ObjectInfo> {
        self.objects
            .iter()
            .map(|(id, e)| ObjectInfo {
                id: id.clone(),
                data_size: e.size,
                state: e.state,
                digest: e.digest,
                created_at: e.created_at,
            })
            .collect()
    }

    pub fn state(&self, id: &ObjectId) -> Option<ObjectState> {
        self.objects.get(id).map(|e| e.state)
    }

    pub fn contains_sealed(&self, id: &ObjectId) -> bool {
        self.state(id) == Some(ObjectState::Sealed)
    }

    /// Location of a sealed object.
    pub fn location(&self, id: &ObjectId) -> Option<ObjectLocation> {
        self.objects
            .get(id)
            .filter(|e| e.state == ObjectState::Sealed)
            .map(|e| ObjectLocation {
                id: id.clone(),
                path: e.path.clone(),
                size: e.size,
                digest: e.digest,
            })
    }
}

/// CRC32 of the first `size` bytes of an object file, read through a mapping.
pub fn file_digest(path: &Path, size: u64) -> TableResult<u32> {
    if size == 0 {
        return Ok(crc32(&[]));
    }
    let file = File::open(path).map_err(|e| TableError::io("opening object file", e))?;
    let len = file
        .metadata()
        .map_err(|e| TableError::io("reading object metadata", e))?
        .len();
    if len < size {
        return Err(TableError::new(
            RemoteErrorKind::Internal,
            format!("object file {} was truncated to {} of {} bytes", path.display(), len, size),
        ));
    }
    // SAFETY: read-only mapping; the writer has finished by the time it seals.
    let mmap = unsafe { MmapOptions::new().len(size as usize).map(&file) }
        .map_err(|e| TableError::io("mapping object file", e))?;
    Ok(crc32(&mmap))
}

/// Table plus the wakeup readers wait on.
pub struct StoreState {
    pub table: Mutex<ObjectTable>,
    /// Fired whenever an object is sealed, aborted or deleted.
    pub changed: Notify,
}

impl StoreState {
    pub fn new(table: ObjectTable) -> Self {
        Self {
            table: Mutex::new(table),
            changed: Notify::new(),
        }
    }

    /// Seal `id`. The digest is computed on a blocking thread with the table
    /// unlocked, so other sessions keep running meanwhile.
    pub async fn seal(&self, id: &ObjectId) -> TableResult<u32> {
        let (path, size) = self.table.lock().await.begin_seal(id)?;

        let digest = tokio::task::spawn_blocking(move || file_digest(&path, size))
            .await
            .map_err(|e| TableError::new(RemoteErrorKind::Internal, format!("digest task failed: {}", e)))??;

        self.table.lock().await.finish_seal(id, digest)?;
        self.changed.notify_waiters();
        Ok(digest)
    }

    /// Resolve `ids`, waiting while any of them exists unsealed.
    ///
    /// Ids that are absent, or still unsealed when the timeout expires, come
    /// back as `None`.
    pub async fn get(&self, ids: &[ObjectId], timeout_ms: Option<u64>) -> Vec<Option<ObjectLocation>> {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let table = self.table.lock().await;
                let pending = ids
                    .iter()
                    .any(|id| table.state(id) == Some(ObjectState::Created));
                if !pending {
                    return ids.iter().map(|id| table.location(id)).collect();
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        debug!("Get timed out waiting for unsealed objects");
                        let table = self.table.lock().await;
                        return ids.iter().map(|id| table.location(id)).collect();
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(token: &str) -> ObjectId {
        crate::object_id::IdentifierConfig::default().normalize(token).unwrap()
    }

    fn seal(table: &mut ObjectTable, id: &ObjectId) -> TableResult<u32> {
        let (path, size) = table.begin_seal(id)?;
        let digest = file_digest(&path, size)?;
        table.finish_seal(id, digest)?;
        Ok(digest)
    }

    fn table(capacity: u64) -> (tempfile::TempDir, ObjectTable) {
        let dir = tempfile::tempdir().unwrap();
        let table = ObjectTable::open(dir.path().join("objects"), capacity).unwrap();
        (dir, table)
    }

    #[test]
    fn create_seal_and_locate() {
        let (_dir, mut table) = table(1024);
        let loc = table.create(&id("1"), 5, 7).unwrap();
        std::fs::write(&loc.path, b"hello").unwrap();

        assert!(table.location(&id("1")).is_none());
        let digest = seal(&mut table, &id("1")).unwrap();
        assert_eq!(digest, crc32(b"hello"));

        let sealed = table.location(&id("1")).unwrap();
        assert_eq!(sealed.digest, Some(digest));
        assert_eq!(table.used(), 5);
    }

    #[test]
    fn duplicate_create_is_refused() {
        let (_dir, mut table) = table(1024);
        table.create(&id("1"), 1, 1).unwrap();
        let err = table.create(&id("1"), 1, 1).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::AlreadyExists);
    }

    #[test]
    fn capacity_is_enforced_and_freed() {
        let (_dir, mut table) = table(10);
        table.create(&id("1"), 8, 1).unwrap();
        let err = table.create(&id("2"), 3, 1).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::OutOfMemory);

        table.abort(&id("1")).unwrap();
        assert_eq!(table.used(), 0);
        table.create(&id("2"), 3, 1).unwrap();
    }

    #[test]
    fn delete_requires_sealed_and_removes_file() {
        let (_dir, mut table) = table(100);
        let loc = table.create(&id("1"), 2, 1).unwrap();
        assert_eq!(table.delete(&id("1")).unwrap_err().kind, RemoteErrorKind::NotSealed);

        seal(&mut table, &id("1")).unwrap();
        table.delete(&id("1")).unwrap();
        assert!(!loc.path.exists());
        assert_eq!(table.delete(&id("1")).unwrap_err().kind, RemoteErrorKind::NotFound);
    }

    #[test]
    fn session_orphans_are_aborted() {
        let (_dir, mut table) = table(100);
        table.create(&id("1"), 1, 1).unwrap();
        table.create(&id("2"), 1, 2).unwrap();
        table.create(&id("3"), 1, 1).unwrap();
        seal(&mut table, &id("3")).unwrap();

        assert_eq!(table.abort_owned_by(1), 1);
        let ids: Vec<ObjectId> = table.list().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![id("2"), id("3")]);
    }

    #[test]
    fn open_clears_stale_objects() {
        let dir = tempfile::tempdir().unwrap();
        let objects = dir.path().join("objects");
        std::fs::create_dir_all(&objects).unwrap();
        std::fs::write(objects.join("abcd.obj"), b"old").unwrap();
        std::fs::write(objects.join("keep.txt"), b"other").unwrap();

        ObjectTable::open(&objects, 10).unwrap();
        assert!(!objects.join("abcd.obj").exists());
        assert!(objects.join("keep.txt").exists());
    }

    #[tokio::test]
    async fn get_waits_for_seal() {
        let (_dir, mut t) = table(100);
        let loc = t.create(&id("1"), 3, 1).unwrap();
        std::fs::write(&loc.path, b"abc").unwrap();
        let state = Arc::new(StoreState::new(t));

        let reader = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.get(&[id("1")], None).await })
        };
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());

        state.seal(&id("1")).await.unwrap();

        let got = reader.await.unwrap();
        assert_eq!(got[0].as_ref().map(|l| l.size), Some(3));
    }

    #[tokio::test]
    async fn get_times_out_on_unsealed() {
        let (_dir, mut t) = table(100);
        t.create(&id("1"), 3, 1).unwrap();
        let state = StoreState::new(t);

        let got = state.get(&[id("1"), id("2")], Some(20)).await;
        assert_eq!(got, vec![None, None]);
    }

    #[test]
    fn table_errors_become_error_replies() {
        let (_dir, mut table) = table(100);
        let reply: Reply = table.abort(&id("9")).unwrap_err().into();
        assert!(matches!(reply, Reply::Error { kind: RemoteErrorKind::NotFound, .. }));
    }

    #[test]
    fn abort_during_digest_fails_the_seal() {
        let (_dir, mut table) = table(100);
        table.create(&id("1"), 2, 1).unwrap();
        let (path, size) = table.begin_seal(&id("1")).unwrap();
        table.abort(&id("1")).unwrap();

        assert!(file_digest(&path, size).is_err());
        let err = table.finish_seal(&id("1"), 0).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::NotFound);
    }

    #[test]
    fn truncated_object_file_cannot_be_sealed() {
        let (_dir, mut table) = table(100);
        let loc = table.create(&id("1"), 8, 1).unwrap();
        std::fs::OpenOptions::new().write(true).open(&loc.path).unwrap().set_len(3).unwrap();

        let err = seal(&mut table, &id("1")).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Internal);
        assert_eq!(table.state(&id("1")), Some(ObjectState::Created));
    }

    #[tokio::test]
    async fn state_seal_records_digest_and_unlocks() {
        let (_dir, mut t) = table(1 << 20);
        let loc = t.create(&id("1"), 1 << 16, 1).unwrap();
        std::fs::write(&loc.path, vec![7u8; 1 << 16]).unwrap();
        let state = Arc::new(StoreState::new(t));

        let sealing = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.seal(&id("1")).await })
        };
        assert_eq!(state.table.lock().await.list().len(), 1);

        let digest = sealing.await.unwrap().unwrap();
        assert_eq!(digest, crc32(&vec![7u8; 1 << 16]));
        assert!(state.table.lock().await.contains_sealed(&id("1")));
    }
}
