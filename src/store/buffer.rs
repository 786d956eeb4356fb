use std::fs::File;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

use arrow::buffer::Buffer;
use memmap2::Mmap;

use crate::object_id::ObjectId;
use crate::protocol::ObjectLocation;
use crate::store::{StoreError, StoreResult};
use crate::utils::crc::crc32;

enum Backing {
    Mapped(Mmap),
    Heap(Vec<u8>),
}

/// Read-only view of one sealed object.
///
/// Objects served by the store are memory-mapped straight out of the store's
/// shared-memory directory; the bytes are never copied into the client.
pub struct ObjectBuffer {
    id: ObjectId,
    backing: Backing,
}

impl ObjectBuffer {
    /// Map the object described by `location` and check its seal digest.
    pub fn map(location: &ObjectLocation) -> StoreResult<Self> {
        if location.size == 0 {
            return Ok(Self::from_vec(location.id.clone(), Vec::new()));
        }

        let file = File::open(&location.path)?;
        let len = file.metadata()?.len();
        if len < location.size {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "object file {} holds {} bytes, store reported {}",
                    location.path.display(),
                    len,
                    location.size
                ),
            )));
        }
        // SAFETY: sealed objects are immutable; the store only removes the
        // file on delete, which leaves existing mappings intact.
        let mmap = unsafe { memmap2::MmapOptions::new().len(location.size as usize).map(&file)? };

        let buffer = Self {
            id: location.id.clone(),
            backing: Backing::Mapped(mmap),
        };

        if let Some(expected) = location.digest {
            let computed = crc32(&buffer);
            if computed != expected {
                return Err(StoreError::DigestMismatch {
                    id: buffer.id,
                    expected,
                    computed,
                });
            }
        }

        Ok(buffer)
    }

    /// Buffer over bytes already in memory.
    pub fn from_vec(id: ObjectId, data: Vec<u8>) -> Self {
        Self {
            id,
            backing: Backing::Heap(data),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    /// Hand the bytes to arrow without copying. The returned buffer keeps
    /// the mapping alive.
    pub fn into_arrow_buffer(self) -> Buffer {
        match self.backing {
            Backing::Heap(data) => Buffer::from_vec(data),
            Backing::Mapped(_) => {
                let len = self.len();
                let ptr = NonNull::from(&self[..]).cast::<u8>();
                // SAFETY: `ptr` points at `len` bytes of the mapping owned by
                // `self`, which moves into the buffer's owner and is never
                // mutated; moving an `Mmap` does not move the mapped pages.
                unsafe { Buffer::from_custom_allocation(ptr, len, Arc::new(self)) }
            }
        }
    }
}

impl Deref for ObjectBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped(mmap) => &mmap[..],
            Backing::Heap(data) => &data[..],
        }
    }
}

impl std::fmt::Debug for ObjectBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBuffer")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
