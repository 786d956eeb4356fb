//! Protocol constants for the store socket

/// Handshake magic bytes: "PLSM"
pub const STORE_MAGIC: [u8; 4] = *b"PLSM";

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Frame types
pub const FRAME_REQUEST: u8 = 0x01;
pub const FRAME_REPLY: u8 = 0x02;
pub const FRAME_ERROR: u8 = 0x7F;

/// Largest payload either side will allocate for. Object data never travels
/// over the socket, only metadata, so this is generous.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Capability bits (bitmask)
pub const CAP_MMAP_OBJECTS: u32 = 0x0000_0001;
pub const CAP_SEAL_DIGEST: u32 = 0x0000_0002;
