//! ASCII framing: human-readable hex between ':' and CRLF with a trailing
//! LRC. Frame layout: ':' + hex(unit id + PDU + LRC) + "\r\n".

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{trace, warn};

use crate::constants::{ASCII_FRAME_END, ASCII_FRAME_START, MAX_PDU_SIZE};
use crate::error::{ModlinkError, ModlinkResult};
use crate::frame::{Adu, FrameCodec, Stream};

/// LRC over `data`: two's complement of the byte sum.
pub fn lrc(data: &[u8]) -> u8 {
    let sum = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    sum.wrapping_neg()
}

/// Marker-delimited ASCII codec. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsciiCodec;

impl AsciiCodec {
    pub fn new() -> Self {
        Self
    }

    /// Serialize one frame including markers and checksum.
    pub fn encode(adu: &Adu) -> Vec<u8> {
        let mut body = Vec::with_capacity(adu.pdu.len() + 2);
        body.push(adu.unit_id);
        body.extend_from_slice(&adu.pdu);
        body.push(lrc(&body));

        let mut frame = Vec::with_capacity(body.len() * 2 + 3);
        frame.push(ASCII_FRAME_START);
        frame.extend_from_slice(hex::encode_upper(&body).as_bytes());
        frame.extend_from_slice(ASCII_FRAME_END);
        frame
    }

    /// Decode the hex section between the markers.
    pub fn decode(hex_body: &[u8]) -> ModlinkResult<Adu> {
        let body = hex::decode(hex_body)
            .map_err(|e| ModlinkError::io(format!("invalid ASCII frame hex: {e}")))?;
        if body.len() < 3 {
            return Err(ModlinkError::io(format!(
                "ASCII frame too short: {} bytes",
                body.len()
            )));
        }

        let data_end = body.len() - 1;
        let received = body[data_end];
        let calculated = lrc(&body[..data_end]);
        if received != calculated {
            warn!(
                "[ASCII] LRC mismatch - expected 0x{:02X}, got 0x{:02X}",
                calculated, received
            );
            return Err(ModlinkError::io(format!(
                "ASCII LRC mismatch: expected 0x{calculated:02X}, got 0x{received:02X}"
            )));
        }
        Ok(Adu::headless(body[0], body[1..data_end].to_vec()))
    }
}

async fn read_byte(io: &mut (dyn Stream + '_)) -> ModlinkResult<u8> {
    let mut byte = [0u8; 1];
    io.read_exact(&mut byte).await?;
    Ok(byte[0])
}

#[async_trait]
impl FrameCodec for AsciiCodec {
    async fn write_frame(&mut self, io: &mut (dyn Stream + '_), adu: &Adu) -> ModlinkResult<()> {
        let frame = Self::encode(adu);
        trace!("[ASCII] TX {}", String::from_utf8_lossy(&frame).trim_end());
        io.write_all(&frame).await?;
        Ok(())
    }

    async fn read_frame(&mut self, io: &mut (dyn Stream + '_)) -> ModlinkResult<Adu> {
        // Scan to the start marker, discarding line noise.
        loop {
            if read_byte(io).await? == ASCII_FRAME_START {
                break;
            }
        }

        let mut hex_body = Vec::with_capacity((MAX_PDU_SIZE + 2) * 2);
        loop {
            let byte = read_byte(io).await?;
            if byte == b'\r' {
                break;
            }
            if hex_body.len() > (MAX_PDU_SIZE + 2) * 2 {
                return Err(ModlinkError::io("ASCII frame exceeds maximum length"));
            }
            hex_body.push(byte);
        }
        if read_byte(io).await? != b'\n' {
            return Err(ModlinkError::io("ASCII frame missing LF terminator"));
        }

        trace!("[ASCII] RX :{}", String::from_utf8_lossy(&hex_body));
        Self::decode(&hex_body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lrc() {
        // 0x01 + 0x03 + 0x00 + 0x01 + 0x00 + 0x02 = 0x07, LRC = 0xF9
        assert_eq!(lrc(&[0x01, 0x03, 0x00, 0x01, 0x00, 0x02]), 0xF9);
        assert_eq!(lrc(&[]), 0x00);
    }

    #[test]
    fn test_encode_is_readable_hex() {
        let adu = Adu::headless(0x01, vec![0x03, 0x00, 0x01, 0x00, 0x02]);
        let frame = AsciiCodec::encode(&adu);
        assert_eq!(frame, b":010300010002F9\r\n");
    }

    #[test]
    fn test_lrc_mismatch_rejected() {
        assert!(matches!(
            AsciiCodec::decode(b"010300010002F8"),
            Err(ModlinkError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_roundtrip_with_leading_noise() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut codec = AsciiCodec::new();

        a.write_all(b"\r\n").await.unwrap();
        let adu = Adu::headless(0x11, vec![0x06, 0x00, 0x01, 0x00, 0x03]);
        codec.write_frame(&mut a, &adu).await.unwrap();

        let read = codec.read_frame(&mut b).await.unwrap();
        assert_eq!(read, adu);
    }

    #[tokio::test]
    async fn test_truncated_frame_is_eof() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut codec = AsciiCodec::new();

        a.write_all(b":0103").await.unwrap();
        drop(a);

        let err = codec.read_frame(&mut b).await.unwrap_err();
        assert!(err.is_eof());
    }
}
