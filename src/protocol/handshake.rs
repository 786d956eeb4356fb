use crate::protocol::{STORE_MAGIC, PROTOCOL_VERSION, CAP_MMAP_OBJECTS, CAP_SEAL_DIGEST};
use crate::protocol::error::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u16,
    pub flags: u16,
    pub capabilities: u32,
}

impl Handshake {
    pub const WIRE_SIZE: usize = 4 + 2 + 2 + 4;

    /// Handshake this build sends.
    pub fn local() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0,
            capabilities: CAP_MMAP_OBJECTS | CAP_SEAL_DIGEST,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        trace!("Decoding handshake from {} bytes: {:?}", buf.len(), buf);

        if buf.len() < Self::WIRE_SIZE {
            error!("Handshake too short: {} bytes, expected {}", buf.len(), Self::WIRE_SIZE);
            return Err(ProtocolError::Truncated);
        }

        if buf[0..4] != STORE_MAGIC {
            error!("Invalid magic bytes: {:?}, expected {:?}", &buf[0..4], STORE_MAGIC);
            return Err(ProtocolError::InvalidMagic);
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != PROTOCOL_VERSION {
            error!("Unsupported version: {}, expected {}", version, PROTOCOL_VERSION);
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = u16::from_be_bytes([buf[6], buf[7]]);
        let capabilities = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);

        let handshake = Self {
            version,
            flags,
            capabilities,
        };

        debug!("Decoded handshake: version={}, flags={}, capabilities={:#x}",
               handshake.version, handshake.flags, handshake.capabilities);

        Ok(handshake)
    }

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..4].copy_from_slice(&STORE_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_be_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_be_bytes());
        buf[8..12].copy_from_slice(&self.capabilities.to_be_bytes());
        buf
    }
}

pub async fn read_handshake<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<Handshake> {
    let mut buf = [0u8; Handshake::WIRE_SIZE];
    stream.read_exact(&mut buf).await?;

    let handshake = Handshake::decode(&buf)?;
    debug!("Handshake read successfully");

    Ok(handshake)
}

pub async fn write_handshake<W: AsyncWrite + Unpin>(stream: &mut W) -> anyhow::Result<()> {
    let encoded = Handshake::local().encode();
    stream.write_all(&encoded).await?;
    stream.flush().await?;

    debug!("Handshake written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reads_what_encode_wrote() {
        let local = Handshake::local();
        assert_eq!(Handshake::decode(&local.encode()).unwrap(), local);
    }

    #[test]
    fn rejects_foreign_magic() {
        let mut buf = Handshake::local().encode();
        buf[0..4].copy_from_slice(b"SYMV");
        assert!(matches!(Handshake::decode(&buf), Err(ProtocolError::InvalidMagic)));
    }

    #[test]
    fn rejects_other_versions() {
        let mut buf = Handshake::local().encode();
        buf[4..6].copy_from_slice(&7u16.to_be_bytes());
        assert!(matches!(
            Handshake::decode(&buf),
            Err(ProtocolError::UnsupportedVersion(7))
        ));
    }

    #[test]
    fn rejects_short_buffers() {
        let buf = Handshake::local().encode();
        assert!(matches!(Handshake::decode(&buf[..8]), Err(ProtocolError::Truncated)));
    }

    #[tokio::test]
    async fn exchange_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_handshake(&mut a).await.unwrap();
        let got = read_handshake(&mut b).await.unwrap();
        assert_eq!(got.capabilities & CAP_MMAP_OBJECTS, CAP_MMAP_OBJECTS);
    }
}
