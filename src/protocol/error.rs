use std::fmt;

#[derive(Debug)]
pub enum ProtocolError {
    InvalidMagic,
    UnsupportedVersion(u16),
    FrameTooLarge(usize),
    ChecksumMismatch { expected: u32, computed: u32 },
    UnexpectedFrameType(u8),
    Truncated,
    Codec(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidMagic =>
                write!(f, "invalid protocol magic"),
            ProtocolError::UnsupportedVersion(v) =>
                write!(f, "unsupported protocol version {}", v),
            ProtocolError::FrameTooLarge(size) =>
                write!(f, "frame too large: {}", size),
            ProtocolError::ChecksumMismatch { expected, computed } =>
                write!(f, "checksum mismatch: expected={:x}, computed={:x}", expected, computed),
            ProtocolError::UnexpectedFrameType(t) =>
                write!(f, "unexpected frame type {}", t),
            ProtocolError::Truncated =>
                write!(f, "truncated frame"),
            ProtocolError::Codec(msg) =>
                write!(f, "payload codec error: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}
