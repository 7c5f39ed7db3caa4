//! MBAP header framing for Modbus TCP.
//!
//! Frame layout (big-endian): transaction id (2) + protocol id (2) +
//! length (2) + unit id (1) + PDU. The length field covers unit id and PDU,
//! so reads are size-driven; no markers or escaping are involved.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN};
use crate::error::{ModlinkError, ModlinkResult};
use crate::frame::{Adu, FrameCodec, Stream};

/// Length-driven MBAP codec. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpCodec;

impl TcpCodec {
    pub fn new() -> Self {
        Self
    }

    /// Serialize one frame. Public so tests and traffic logs can build the
    /// exact wire bytes without a stream.
    pub fn encode(adu: &Adu) -> ModlinkResult<Vec<u8>> {
        let length = adu.pdu.len() + 1;
        if length > MAX_MBAP_LENGTH {
            return Err(ModlinkError::io(format!(
                "PDU too large for MBAP frame: {} bytes",
                adu.pdu.len()
            )));
        }

        let mut buf = BytesMut::with_capacity(MBAP_HEADER_LEN + adu.pdu.len());
        buf.put_u16(adu.transaction_id);
        buf.put_u16(adu.protocol_id);
        buf.put_u16(length as u16);
        buf.put_u8(adu.unit_id);
        buf.put_slice(&adu.pdu);
        Ok(buf.to_vec())
    }
}

#[async_trait]
impl FrameCodec for TcpCodec {
    async fn write_frame(&mut self, io: &mut (dyn Stream + '_), adu: &Adu) -> ModlinkResult<()> {
        let frame = Self::encode(adu)?;
        trace!("[MBAP] TX {}", hex::encode(&frame));
        io.write_all(&frame).await?;
        Ok(())
    }

    async fn read_frame(&mut self, io: &mut (dyn Stream + '_)) -> ModlinkResult<Adu> {
        let mut header = [0u8; MBAP_HEADER_LEN];
        io.read_exact(&mut header).await?;

        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let unit_id = header[6];

        if length < 2 || length > MAX_MBAP_LENGTH {
            return Err(ModlinkError::io(format!(
                "invalid MBAP length field: {length}"
            )));
        }

        let mut pdu = vec![0u8; length - 1];
        io.read_exact(&mut pdu).await?;
        trace!(
            "[MBAP] RX tid={} pid={} unit={} {}",
            transaction_id,
            protocol_id,
            unit_id,
            hex::encode(&pdu)
        );

        Ok(Adu {
            transaction_id,
            protocol_id,
            unit_id,
            pdu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adu() -> Adu {
        Adu {
            transaction_id: 0x1234,
            protocol_id: 0,
            unit_id: 0x01,
            pdu: vec![0x03, 0x00, 0x01, 0x00, 0x02],
        }
    }

    #[test]
    fn test_encode_layout() {
        let frame = TcpCodec::encode(&adu()).unwrap();
        assert_eq!(
            frame,
            vec![0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x01, 0x00, 0x02]
        );
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut codec = TcpCodec::new();

        codec.write_frame(&mut a, &adu()).await.unwrap();
        let read = codec.read_frame(&mut b).await.unwrap();
        assert_eq!(read, adu());
    }

    #[tokio::test]
    async fn test_read_from_scripted_stream() {
        let mut stream = tokio_test::io::Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x11, 0x06, 0x2A])
            .build();
        let mut codec = TcpCodec::new();

        let adu = codec.read_frame(&mut stream).await.unwrap();
        assert_eq!(adu.transaction_id, 1);
        assert_eq!(adu.unit_id, 0x11);
        assert_eq!(adu.pdu, vec![0x06, 0x2A]);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_eof() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut codec = TcpCodec::new();

        let frame = TcpCodec::encode(&adu()).unwrap();
        a.write_all(&frame[..8]).await.unwrap();
        drop(a);

        let err = codec.read_frame(&mut b).await.unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn test_invalid_length_field() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut codec = TcpCodec::new();

        a.write_all(&[0x00, 0x01, 0x00, 0x00, 0x01, 0xFF, 0x01])
            .await
            .unwrap();
        let err = codec.read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ModlinkError::Io(_)));
    }
}
