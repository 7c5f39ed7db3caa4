//! BIN framing: byte-stuffed binary between reserved start/end tokens.
//!
//! Two virtual semantic markers ([`BIN_FRAME_START`]/[`BIN_FRAME_END`],
//! deliberately outside the byte range) translate 1:1 to the wire-level
//! tokens. A payload byte that happens to equal either token value is
//! written twice so the receiver can tell a literal data byte from a true
//! frame boundary. Frame body: unit id (1) + PDU + CRC (2, little-endian).

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{trace, warn};

use crate::constants::{
    BIN_FRAME_END, BIN_FRAME_END_TOKEN, BIN_FRAME_START, BIN_FRAME_START_TOKEN,
};
use crate::error::{ModlinkError, ModlinkResult};
use crate::frame::rtu::crc16;
use crate::frame::{Adu, FrameCodec, Stream};

/// Stuffed upper bound: start + doubled body + CRC + end.
const MAX_FRAME_SIZE: usize = 2 + 2 * 259;

/// Append one symbol to the wire buffer. Each symbol is classified into
/// exactly one of: virtual-start, virtual-end, literal token byte (written
/// twice), or any other byte (written once).
pub fn push_symbol(out: &mut Vec<u8>, symbol: u16) {
    match symbol {
        BIN_FRAME_START => out.push(BIN_FRAME_START_TOKEN),
        BIN_FRAME_END => out.push(BIN_FRAME_END_TOKEN),
        _ => {
            let byte = symbol as u8;
            if byte == BIN_FRAME_START_TOKEN || byte == BIN_FRAME_END_TOKEN {
                out.push(byte);
                out.push(byte);
            } else {
                out.push(byte);
            }
        }
    }
}

/// Byte-stuff a payload. Multi-byte writes decompose to the single-byte
/// rule; there is no bulk path that could skip escaping.
pub fn stuff(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len());
    for &byte in payload {
        push_symbol(&mut out, byte as u16);
    }
    out
}

/// Result of scanning buffered wire bytes for one frame.
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// No complete frame yet.
    Incomplete,
    /// A lone end token sits at the very end of the buffer. It is a real
    /// boundary unless the next byte duplicates it; an idle line confirms it.
    Trailing { body: Vec<u8>, consumed: usize },
    /// A frame body and the number of wire bytes it consumed.
    Complete { body: Vec<u8>, consumed: usize },
}

fn scan(buf: &[u8]) -> Scan {
    let Some(start) = buf.iter().position(|&b| b == BIN_FRAME_START_TOKEN) else {
        return Scan::Incomplete;
    };

    let mut body = Vec::new();
    let mut i = start + 1;
    while i < buf.len() {
        let byte = buf[i];
        if byte != BIN_FRAME_START_TOKEN && byte != BIN_FRAME_END_TOKEN {
            body.push(byte);
            i += 1;
            continue;
        }
        match buf.get(i + 1) {
            Some(&next) if next == byte => {
                // doubled token: a literal data byte
                body.push(byte);
                i += 2;
            }
            Some(_) => {
                if byte == BIN_FRAME_END_TOKEN {
                    return Scan::Complete {
                        body,
                        consumed: i + 1,
                    };
                }
                // unescaped start token mid-frame: the previous frame was
                // aborted, resynchronize on the new one
                body.clear();
                i += 1;
            }
            None => {
                if byte == BIN_FRAME_END_TOKEN {
                    return Scan::Trailing {
                        body,
                        consumed: i + 1,
                    };
                }
                return Scan::Incomplete;
            }
        }
    }
    Scan::Incomplete
}

/// Byte-stuffed BIN codec with an internal scan buffer.
#[derive(Debug)]
pub struct BinCodec {
    buf: Vec<u8>,
    /// Idle interval that confirms a trailing lone end token.
    confirm: Duration,
}

impl BinCodec {
    pub fn new() -> Self {
        Self::with_confirm_interval(Duration::from_millis(10))
    }

    pub fn with_confirm_interval(confirm: Duration) -> Self {
        Self {
            buf: Vec::new(),
            confirm,
        }
    }

    /// Serialize one complete frame.
    pub fn encode(adu: &Adu) -> Vec<u8> {
        let mut body = Vec::with_capacity(adu.pdu.len() + 3);
        body.push(adu.unit_id);
        body.extend_from_slice(&adu.pdu);
        let crc = crc16(&body);
        body.extend_from_slice(&crc.to_le_bytes());

        let mut frame = Vec::with_capacity(body.len() + 2);
        push_symbol(&mut frame, BIN_FRAME_START);
        for &byte in &body {
            push_symbol(&mut frame, byte as u16);
        }
        push_symbol(&mut frame, BIN_FRAME_END);
        frame
    }

    fn decode_body(body: &[u8]) -> ModlinkResult<Adu> {
        if body.len() < 4 {
            return Err(ModlinkError::io(format!(
                "BIN frame too short: {} bytes",
                body.len()
            )));
        }
        let data_end = body.len() - 2;
        let received = u16::from_le_bytes([body[data_end], body[data_end + 1]]);
        let calculated = crc16(&body[..data_end]);
        if received != calculated {
            warn!(
                "[BIN] CRC mismatch - expected 0x{:04X}, got 0x{:04X}",
                calculated, received
            );
            return Err(ModlinkError::io(format!(
                "BIN CRC mismatch: expected 0x{calculated:04X}, got 0x{received:04X}"
            )));
        }
        Ok(Adu::headless(body[0], body[1..data_end].to_vec()))
    }
}

impl Default for BinCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameCodec for BinCodec {
    async fn write_frame(&mut self, io: &mut (dyn Stream + '_), adu: &Adu) -> ModlinkResult<()> {
        let frame = Self::encode(adu);
        trace!("[BIN] TX {}", hex::encode(&frame));
        io.write_all(&frame).await?;
        Ok(())
    }

    async fn read_frame(&mut self, io: &mut (dyn Stream + '_)) -> ModlinkResult<Adu> {
        let mut chunk = [0u8; 256];
        loop {
            match scan(&self.buf) {
                Scan::Complete { body, consumed } => {
                    self.buf.drain(..consumed);
                    trace!("[BIN] RX {}", hex::encode(&body));
                    return Self::decode_body(&body);
                }
                Scan::Trailing { body, consumed } => {
                    match tokio::time::timeout(self.confirm, io.read(&mut chunk)).await {
                        Ok(Ok(0)) | Err(_) => {
                            self.buf.drain(..consumed);
                            trace!("[BIN] RX {}", hex::encode(&body));
                            return Self::decode_body(&body);
                        }
                        Ok(Ok(n)) => self.buf.extend_from_slice(&chunk[..n]),
                        Ok(Err(err)) => return Err(err.into()),
                    }
                }
                Scan::Incomplete => {
                    if self.buf.len() > MAX_FRAME_SIZE {
                        self.buf.clear();
                        return Err(ModlinkError::io("BIN frame exceeds maximum length"));
                    }
                    let n = io.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(ModlinkError::Eof);
                    }
                    self.buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}
