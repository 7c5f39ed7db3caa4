//! Transport framing: mapping application data units to and from
//! self-delimited byte sequences on the wire.
//!
//! One codec variant is selected per connection and fixed for its lifetime:
//! [`tcp::TcpCodec`] (length-driven MBAP), [`rtu::RtuCodec`] (silent interval
//! + CRC), [`ascii::AsciiCodec`] (hex between markers + LRC) and
//! [`bin::BinCodec`] (byte-stuffed + CRC). Framing metadata never leaks above
//! this boundary; the layers above only see [`Adu`] values.

pub mod ascii;
pub mod bin;
pub mod rtu;
pub mod tcp;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ModlinkResult;

/// A bidirectional byte stream a frame codec can run over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// One application data unit as seen above the framing layer.
///
/// Headless wire formats (RTU/ASCII/BIN) carry no transaction or protocol
/// identifier; they report both as 0 on read and ignore them on write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
    /// Serialized PDU: function code + data section.
    pub pdu: Vec<u8>,
}

impl Adu {
    /// Headless ADU (transaction and protocol id 0).
    pub fn headless(unit_id: u8, pdu: Vec<u8>) -> Self {
        Self {
            transaction_id: 0,
            protocol_id: 0,
            unit_id,
            pdu,
        }
    }
}

/// Frame codec for one wire encoding.
#[async_trait]
pub trait FrameCodec: Send {
    /// Frame and write one ADU.
    async fn write_frame(&mut self, io: &mut (dyn Stream + '_), adu: &Adu) -> ModlinkResult<()>;

    /// Read and de-frame one ADU.
    ///
    /// A truncated frame surfaces as [`crate::ModlinkError::Eof`], a checksum
    /// mismatch as [`crate::ModlinkError::Io`]; the two cases are never folded
    /// together so the retry path can tell them apart.
    async fn read_frame(&mut self, io: &mut (dyn Stream + '_)) -> ModlinkResult<Adu>;
}
