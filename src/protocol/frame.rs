use crate::protocol::error::ProtocolError;
use crate::protocol::{
    decode_body, encode_body, Reply, Request, FRAME_ERROR, FRAME_REPLY, FRAME_REQUEST,
    MAX_FRAME_SIZE,
};
use crate::utils::crc::crc32;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, trace};

/// Fixed-size frame header (12 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: u8,
    pub flags: u8,
    pub header_len: u16,
    pub payload_len: u32,
    pub checksum: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 12;

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < Self::SIZE {
            error!("Frame header too short: {} bytes", buf.len());
            return Err(ProtocolError::Truncated);
        }

        let header = Self {
            frame_type: buf[0],
            flags: buf[1],
            header_len: u16::from_be_bytes([buf[2], buf[3]]),
            payload_len: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            checksum: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        };

        if header.payload_len as usize > MAX_FRAME_SIZE {
            error!("Frame payload too large: {} bytes", header.payload_len);
            return Err(ProtocolError::FrameTooLarge(header.payload_len as usize));
        }

        Ok(header)
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.frame_type;
        buf[1] = self.flags;
        buf[2..4].copy_from_slice(&self.header_len.to_be_bytes());
        buf[4..8].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }
}

/// A checked frame: type byte plus verified payload.
#[derive(Debug)]
pub struct RawFrame {
    pub frame_type: u8,
    pub payload: Vec<u8>,
}

pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<RawFrame> {
    let mut header_buf = [0u8; FrameHeader::SIZE];
    stream.read_exact(&mut header_buf).await?;
    let header = FrameHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    if header.payload_len > 0 {
        stream.read_exact(&mut payload).await?;
    }

    let computed = crc32(&payload);
    if computed != header.checksum {
        error!("Checksum mismatch: expected={:x}, computed={:x}", header.checksum, computed);
        return Err(ProtocolError::ChecksumMismatch {
            expected: header.checksum,
            computed,
        }
        .into());
    }

    trace!("Read frame type={:#x} payload={} bytes", header.frame_type, payload.len());
    Ok(RawFrame {
        frame_type: header.frame_type,
        payload,
    })
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    frame_type: u8,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()).into());
    }

    let header = FrameHeader {
        frame_type,
        flags: 0,
        header_len: FrameHeader::SIZE as u16,
        payload_len: payload.len() as u32,
        checksum: crc32(payload),
    };

    stream.write_all(&header.encode()).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    stream.flush().await?;

    trace!("Wrote frame type={:#x} payload={} bytes", frame_type, payload.len());
    Ok(())
}

pub async fn write_request<W: AsyncWrite + Unpin>(stream: &mut W, request: &Request) -> anyhow::Result<()> {
    write_frame(stream, FRAME_REQUEST, &encode_body(request)?).await
}

pub async fn read_request<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<Request> {
    let frame = read_frame(stream).await?;
    if frame.frame_type != FRAME_REQUEST {
        return Err(ProtocolError::UnexpectedFrameType(frame.frame_type).into());
    }
    Ok(decode_body(&frame.payload)?)
}

pub async fn write_reply<W: AsyncWrite + Unpin>(stream: &mut W, reply: &Reply) -> anyhow::Result<()> {
    let frame_type = match reply {
        Reply::Error { .. } => FRAME_ERROR,
        _ => FRAME_REPLY,
    };
    write_frame(stream, frame_type, &encode_body(reply)?).await
}

pub async fn read_reply<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<Reply> {
    let frame = read_frame(stream).await?;
    match frame.frame_type {
        FRAME_REPLY | FRAME_ERROR => Ok(decode_body(&frame.payload)?),
        other => Err(ProtocolError::UnexpectedFrameType(other).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RemoteErrorKind;

    #[test]
    fn header_layout_is_big_endian() {
        let header = FrameHeader {
            frame_type: FRAME_REPLY,
            flags: 0,
            header_len: 12,
            payload_len: 0x0102_0304,
            checksum: 0xAABB_CCDD,
        };
        let buf = header.encode();
        assert_eq!(&buf[4..8], &[1, 2, 3, 4]);
        assert_eq!(&buf[8..12], &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn oversized_payload_is_rejected_before_allocation() {
        let header = FrameHeader {
            frame_type: FRAME_REQUEST,
            flags: 0,
            header_len: 12,
            payload_len: (MAX_FRAME_SIZE + 1) as u32,
            checksum: 0,
        };
        assert!(matches!(
            FrameHeader::decode(&header.encode()),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn error_replies_use_the_error_frame_type() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let reply = Reply::error(RemoteErrorKind::NotFound, "gone");
        write_reply(&mut a, &reply).await.unwrap();
        let raw = read_frame(&mut b).await.unwrap();
        assert_eq!(raw.frame_type, FRAME_ERROR);
        assert_eq!(decode_body::<Reply>(&raw.payload).unwrap(), reply);
    }

    #[tokio::test]
    async fn corrupted_payload_fails_the_checksum() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let payload = encode_body(&Request::List).unwrap();
        let mut header = FrameHeader {
            frame_type: FRAME_REQUEST,
            flags: 0,
            header_len: 12,
            payload_len: payload.len() as u32,
            checksum: crc32(&payload),
        };
        header.checksum ^= 1;
        a.write_all(&header.encode()).await.unwrap();
        a.write_all(&payload).await.unwrap();

        let err = read_request(&mut b).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn request_frame_is_not_a_reply() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_request(&mut a, &Request::List).await.unwrap();
        let err = read_reply(&mut b).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::UnexpectedFrameType(FRAME_REQUEST))
        ));
    }
}
