//! RTU framing: raw binary with no markers.
//!
//! The frame boundary is inferred from an inter-frame silence interval
//! (3.5 character times) and the trailing CRC-16 validates what was
//! collected. Frame layout: unit id (1) + PDU + CRC (2, little-endian).

use std::time::Duration;

use async_trait::async_trait;
use crc::{Crc, CRC_16_MODBUS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{trace, warn};

use crate::error::{ModlinkError, ModlinkResult};
use crate::frame::{Adu, FrameCodec, Stream};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Maximum RTU ADU size per the specification.
const MAX_ADU_SIZE: usize = 256;

/// CRC-16/MODBUS over `data` (init 0xFFFF, reflected). The low byte is
/// transmitted first, i.e. the checksum is appended with `to_le_bytes`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Inter-frame gap of 3.5 character times for the given baud rate.
/// One character is 11 bits (start + 8 data + parity + stop); rates above
/// 19200 use the fixed 1.75 ms prescribed by the specification.
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 {
        return Duration::from_millis(4);
    }
    if baud_rate > 19200 {
        return Duration::from_micros(1750);
    }
    let char_time_us = (11 * 1_000_000) / baud_rate as u64;
    Duration::from_micros(char_time_us * 35 / 10 + 100)
}

/// Silent-interval RTU codec.
#[derive(Debug, Clone, Copy)]
pub struct RtuCodec {
    gap: Duration,
}

impl RtuCodec {
    /// Codec with the default gap for 9600 baud.
    pub fn new() -> Self {
        Self::with_baud_rate(9600)
    }

    pub fn with_baud_rate(baud_rate: u32) -> Self {
        Self {
            gap: frame_gap(baud_rate),
        }
    }

    pub fn with_gap(gap: Duration) -> Self {
        Self { gap }
    }

    /// Serialize one frame: unit id + PDU + CRC.
    pub fn encode(adu: &Adu) -> Vec<u8> {
        let mut frame = Vec::with_capacity(adu.pdu.len() + 3);
        frame.push(adu.unit_id);
        frame.extend_from_slice(&adu.pdu);
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Validate a collected frame and strip the framing bytes.
    pub fn decode(frame: &[u8]) -> ModlinkResult<Adu> {
        if frame.len() < 4 {
            return Err(ModlinkError::io(format!(
                "RTU frame too short: {} bytes",
                frame.len()
            )));
        }
        let data_end = frame.len() - 2;
        let received = u16::from_le_bytes([frame[data_end], frame[data_end + 1]]);
        let calculated = crc16(&frame[..data_end]);
        if received != calculated {
            warn!(
                "[RTU] CRC mismatch - expected 0x{:04X}, got 0x{:04X}",
                calculated, received
            );
            return Err(ModlinkError::io(format!(
                "RTU CRC mismatch: expected 0x{calculated:04X}, got 0x{received:04X}"
            )));
        }
        Ok(Adu::headless(frame[0], frame[1..data_end].to_vec()))
    }
}

impl Default for RtuCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameCodec for RtuCodec {
    async fn write_frame(&mut self, io: &mut (dyn Stream + '_), adu: &Adu) -> ModlinkResult<()> {
        let frame = Self::encode(adu);
        trace!("[RTU] TX {}", hex::encode(&frame));
        io.write_all(&frame).await?;
        Ok(())
    }

    async fn read_frame(&mut self, io: &mut (dyn Stream + '_)) -> ModlinkResult<Adu> {
        let mut frame = Vec::with_capacity(MAX_ADU_SIZE);
        let mut chunk = [0u8; MAX_ADU_SIZE];

        // Block for the first bytes of a frame, then collect until the line
        // goes silent for one inter-frame gap.
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return Err(ModlinkError::Eof);
        }
        frame.extend_from_slice(&chunk[..n]);

        while frame.len() < MAX_ADU_SIZE {
            match timeout(self.gap, io.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => frame.extend_from_slice(&chunk[..n]),
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => break,
            }
        }

        trace!("[RTU] RX {}", hex::encode(&frame));
        Self::decode(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_known_vectors() {
        // Read holding registers request, wire bytes 95 CB
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x01, 0x00, 0x02]), 0xCB95);
        // Write single register request, wire bytes 98 0B
        assert_eq!(crc16(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]), 0x0B98);
        // Exception response, wire bytes C0 F1
        assert_eq!(crc16(&[0x01, 0x83, 0x02]), 0xF1C0);
    }

    #[test]
    fn test_encode_decode() {
        let adu = Adu::headless(0x01, vec![0x03, 0x00, 0x01, 0x00, 0x02]);
        let frame = RtuCodec::encode(&adu);
        assert_eq!(frame.len(), 8);
        assert_eq!(frame[0], 0x01);
        assert_eq!(&frame[6..], &0xCB95u16.to_le_bytes());

        let decoded = RtuCodec::decode(&frame).unwrap();
        assert_eq!(decoded, adu);
    }

    #[test]
    fn test_corrupted_crc_rejected() {
        let adu = Adu::headless(0x01, vec![0x03, 0x02, 0x00, 0x64]);
        let mut frame = RtuCodec::encode(&adu);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            RtuCodec::decode(&frame),
            Err(ModlinkError::Io(_))
        ));
    }

    #[test]
    fn test_frame_gap_calculation() {
        let gap_9600 = frame_gap(9600);
        assert!(gap_9600.as_millis() >= 4 && gap_9600.as_millis() <= 5);

        let gap_19200 = frame_gap(19200);
        assert!(gap_19200.as_millis() >= 2 && gap_19200.as_millis() <= 3);

        assert_eq!(frame_gap(115200).as_micros(), 1750);
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let mut codec = RtuCodec::with_gap(Duration::from_millis(5));

        let adu = Adu::headless(0x11, vec![0x03, 0x02, 0x00, 0x64]);
        codec.write_frame(&mut a, &adu).await.unwrap();
        drop(a);

        let read = codec.read_frame(&mut b).await.unwrap();
        assert_eq!(read, adu);
    }
}
