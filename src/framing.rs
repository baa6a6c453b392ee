//! Length-prefixed TCP framing and bounds-checked UDP datagram framing.
//!
//! Wire layout for TCP: `[len][data]`, where `len` is 1, 2, or 4 bytes
//! wide. UDP has no length prefix on the wire (a datagram already has a
//! boundary); `UdpFraming` only enforces the same min/max bounds.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::ByteOrder;
use crate::errors::{NetworkError, Result};

/// Width of the length prefix, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenFieldWidth {
    One,
    Two,
    Four,
}

impl LenFieldWidth {
    fn bytes(self) -> usize {
        match self {
            LenFieldWidth::One => 1,
            LenFieldWidth::Two => 2,
            LenFieldWidth::Four => 4,
        }
    }

    fn max_representable(self) -> usize {
        match self {
            LenFieldWidth::One => u8::MAX as usize,
            LenFieldWidth::Two => u16::MAX as usize,
            LenFieldWidth::Four => u32::MAX as usize,
        }
    }
}

/// Length-prefixed TCP message framer. Bounds and prefix width are
/// fixed at construction; there is deliberately no setter that could be
/// called mid-read/write, unlike the source this was modeled on.
#[derive(Debug, Clone)]
pub struct TcpFraming {
    len_width: LenFieldWidth,
    min_len: usize,
    max_len: usize,
    byte_order: ByteOrder,
}

impl Default for TcpFraming {
    fn default() -> Self {
        Self::new(LenFieldWidth::Two, 1, 4096, ByteOrder::BigEndian)
    }
}

impl TcpFraming {
    pub fn new(len_width: LenFieldWidth, min_len: usize, max_len: usize, byte_order: ByteOrder) -> Self {
        let cap = len_width.max_representable();
        Self {
            len_width,
            min_len: min_len.min(cap),
            max_len: max_len.min(cap),
            byte_order,
        }
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len > self.max_len || len < self.min_len {
            return Err(NetworkError::FrameBounds {
                len,
                min: self.min_len,
                max: self.max_len,
            });
        }
        Ok(())
    }

    fn encode_len(&self, len: usize, out: &mut [u8]) {
        match (self.len_width, self.byte_order) {
            (LenFieldWidth::One, _) => out[0] = len as u8,
            (LenFieldWidth::Two, ByteOrder::LittleEndian) => out.copy_from_slice(&(len as u16).to_le_bytes()),
            (LenFieldWidth::Two, ByteOrder::BigEndian) => out.copy_from_slice(&(len as u16).to_be_bytes()),
            (LenFieldWidth::Four, ByteOrder::LittleEndian) => out.copy_from_slice(&(len as u32).to_le_bytes()),
            (LenFieldWidth::Four, ByteOrder::BigEndian) => out.copy_from_slice(&(len as u32).to_be_bytes()),
        }
    }

    fn decode_len(&self, buf: &[u8]) -> usize {
        match (self.len_width, self.byte_order) {
            (LenFieldWidth::One, _) => buf[0] as usize,
            (LenFieldWidth::Two, ByteOrder::LittleEndian) => u16::from_le_bytes([buf[0], buf[1]]) as usize,
            (LenFieldWidth::Two, ByteOrder::BigEndian) => u16::from_be_bytes([buf[0], buf[1]]) as usize,
            (LenFieldWidth::Four, ByteOrder::LittleEndian) => {
                u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize
            }
            (LenFieldWidth::Four, ByteOrder::BigEndian) => {
                u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize
            }
        }
    }

    /// Reads one length-prefixed message from `reader`.
    pub async fn read<R: AsyncRead + Unpin>(&self, reader: &mut R) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        let width = self.len_width.bytes();
        reader.read_exact(&mut len_buf[..width]).await?;
        let len = self.decode_len(&len_buf[..width]);
        self.check_len(len)?;

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data).await?;
        Ok(data)
    }

    /// Writes one or more fragments as a single length-prefixed message.
    pub async fn write<W: AsyncWrite + Unpin>(&self, writer: &mut W, fragments: &[bytes::Bytes]) -> Result<()> {
        let total_len: usize = fragments.iter().map(|f| f.len()).sum();
        self.check_len(total_len)?;

        let width = self.len_width.bytes();
        let mut len_buf = [0u8; 4];
        self.encode_len(total_len, &mut len_buf[..width]);

        writer.write_all(&len_buf[..width]).await?;
        for fragment in fragments {
            writer.write_all(fragment).await?;
        }
        Ok(())
    }
}

/// Bounds-only datagram framer for UDP. A datagram's boundary is the
/// boundary on the wire; this only validates size.
#[derive(Debug, Clone, Copy)]
pub struct UdpFraming {
    min_len: usize,
    max_len: usize,
}

impl Default for UdpFraming {
    fn default() -> Self {
        Self::new(1, 4096)
    }
}

impl UdpFraming {
    pub fn new(min_len: usize, max_len: usize) -> Self {
        Self { min_len, max_len }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn check(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.max_len || data.len() < self.min_len {
            return Err(NetworkError::FrameBounds {
                len: data.len(),
                min: self.min_len,
                max: self.max_len,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_two_byte_prefixed_message() {
        let framing = TcpFraming::new(LenFieldWidth::Two, 1, 4096, ByteOrder::BigEndian);
        let mut buf = Vec::new();
        framing
            .write(&mut buf, &[bytes::Bytes::from_static(b"hello")])
            .await
            .unwrap();
        assert_eq!(buf, vec![0, 5, b'h', b'e', b'l', b'l', b'o']);

        let mut cursor = std::io::Cursor::new(buf);
        let msg = framing.read(&mut cursor).await.unwrap();
        assert_eq!(msg, b"hello");
    }

    #[tokio::test]
    async fn rejects_messages_below_the_minimum() {
        let framing = TcpFraming::new(LenFieldWidth::Two, 2, 4096, ByteOrder::BigEndian);
        let mut buf = Vec::new();
        let err = framing.write(&mut buf, &[bytes::Bytes::from_static(b"x")]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn rejects_messages_above_the_maximum() {
        let framing = TcpFraming::new(LenFieldWidth::One, 1, 10, ByteOrder::BigEndian);
        let payload = vec![0u8; 11];
        let err = framing.write(&mut Vec::new(), &[bytes::Bytes::from(payload)]).await;
        assert!(err.is_err());
    }

    #[test]
    fn udp_framing_rejects_oversize_datagrams() {
        let framing = UdpFraming::new(1, 4);
        assert!(framing.check(b"hi").is_ok());
        assert!(framing.check(b"toolong").is_err());
    }
}
