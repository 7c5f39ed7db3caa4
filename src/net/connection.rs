//! Client-side connections and the transport seam the executor runs over.
//!
//! [`ModbusTransport`] is one request/response channel to a slave. The TCP
//! variant owns a reconnectable socket; the serial variant is generic over
//! the frame codec so RTU, ASCII and BIN share one implementation.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info};

use crate::error::{ModlinkError, ModlinkResult};
use crate::frame::ascii::AsciiCodec;
use crate::frame::bin::BinCodec;
use crate::frame::rtu::RtuCodec;
use crate::frame::tcp::TcpCodec;
use crate::frame::FrameCodec;
use crate::msg::{ModbusRequest, ModbusResponse};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One master-side channel to a slave device.
///
/// `open` on an already-open transport and `close` on an already-closed one
/// are both no-ops, so the executor's reconnect path can call them
/// unconditionally.
#[async_trait]
pub trait ModbusTransport: Send {
    async fn open(&mut self) -> ModlinkResult<()>;

    async fn close(&mut self) -> ModlinkResult<()>;

    fn is_open(&self) -> bool;

    /// Frame and send one request.
    async fn write_request(&mut self, request: &ModbusRequest) -> ModlinkResult<()>;

    /// Read and decode the next response frame.
    async fn read_response(&mut self) -> ModlinkResult<ModbusResponse>;

    /// Instant of the last successful open/write/read on this transport.
    fn last_activity(&self) -> Instant;
}

/// A reconnectable TCP socket with activity tracking.
#[derive(Debug)]
pub struct TcpConnection {
    addr: SocketAddr,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    last_activity: Instant,
}

impl TcpConnection {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream: None,
            last_activity: Instant::now(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub async fn connect(&mut self) -> ModlinkResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| {
                ModlinkError::io(format!("connect to {} timed out", self.addr))
            })??;
        stream.set_nodelay(true)?;
        info!("[TCP] connected to {}", self.addr);
        self.stream = Some(stream);
        self.touch();
        Ok(())
    }

    pub async fn close(&mut self) -> ModlinkResult<()> {
        if let Some(mut stream) = self.stream.take() {
            // best effort, the peer may already be gone
            let _ = stream.shutdown().await;
            debug!("[TCP] closed connection to {}", self.addr);
        }
        Ok(())
    }

    fn stream_mut(&mut self) -> ModlinkResult<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ModlinkError::io("connection is not open"))
    }
}

/// Modbus/TCP transport: MBAP framing over a [`TcpConnection`].
#[derive(Debug)]
pub struct TcpTransport {
    conn: TcpConnection,
    codec: TcpCodec,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            conn: TcpConnection::new(addr),
            codec: TcpCodec::new(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.conn = self.conn.with_connect_timeout(timeout);
        self
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn open(&mut self) -> ModlinkResult<()> {
        self.conn.connect().await
    }

    async fn close(&mut self) -> ModlinkResult<()> {
        self.conn.close().await
    }

    fn is_open(&self) -> bool {
        self.conn.is_connected()
    }

    async fn write_request(&mut self, request: &ModbusRequest) -> ModlinkResult<()> {
        let adu = request.to_adu();
        let stream = self.conn.stream_mut()?;
        self.codec.write_frame(stream, &adu).await?;
        self.conn.touch();
        Ok(())
    }

    async fn read_response(&mut self) -> ModlinkResult<ModbusResponse> {
        let stream = self.conn.stream_mut()?;
        let adu = self.codec.read_frame(stream).await?;
        self.conn.touch();
        ModbusResponse::from_adu(&adu)
    }

    fn last_activity(&self) -> Instant {
        self.conn.last_activity()
    }
}

/// Serial-line transport, generic over the headless frame codec.
pub struct SerialTransport<C: FrameCodec> {
    path: String,
    baud_rate: u32,
    codec: C,
    port: Option<SerialStream>,
    last_activity: Instant,
}

impl SerialTransport<RtuCodec> {
    /// RTU framing, with the silence interval derived from the baud rate.
    pub fn rtu(path: impl Into<String>, baud_rate: u32) -> Self {
        Self::with_codec(path, baud_rate, RtuCodec::with_baud_rate(baud_rate))
    }
}

impl SerialTransport<AsciiCodec> {
    pub fn ascii(path: impl Into<String>, baud_rate: u32) -> Self {
        Self::with_codec(path, baud_rate, AsciiCodec::new())
    }
}

impl SerialTransport<BinCodec> {
    pub fn bin(path: impl Into<String>, baud_rate: u32) -> Self {
        Self::with_codec(path, baud_rate, BinCodec::new())
    }
}

impl<C: FrameCodec> SerialTransport<C> {
    pub fn with_codec(path: impl Into<String>, baud_rate: u32, codec: C) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            codec,
            port: None,
            last_activity: Instant::now(),
        }
    }

    fn port_mut(&mut self) -> ModlinkResult<&mut SerialStream> {
        self.port
            .as_mut()
            .ok_or_else(|| ModlinkError::io("serial port is not open"))
    }
}

#[async_trait]
impl<C: FrameCodec> ModbusTransport for SerialTransport<C> {
    async fn open(&mut self) -> ModlinkResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = tokio_serial::new(&self.path, self.baud_rate)
            .open_native_async()
            .map_err(|err| {
                ModlinkError::io(format!("failed to open serial port {}: {err}", self.path))
            })?;
        info!("[Serial] opened {} at {} baud", self.path, self.baud_rate);
        self.port = Some(port);
        self.last_activity = Instant::now();
        Ok(())
    }

    async fn close(&mut self) -> ModlinkResult<()> {
        if self.port.take().is_some() {
            debug!("[Serial] closed {}", self.path);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn write_request(&mut self, request: &ModbusRequest) -> ModlinkResult<()> {
        let adu = request.to_adu();
        let Self { codec, port, .. } = self;
        let port = port
            .as_mut()
            .ok_or_else(|| ModlinkError::io("serial port is not open"))?;
        codec.write_frame(port, &adu).await?;
        self.last_activity = Instant::now();
        Ok(())
    }

    async fn read_response(&mut self) -> ModlinkResult<ModbusResponse> {
        let Self { codec, port, .. } = self;
        let port = port
            .as_mut()
            .ok_or_else(|| ModlinkError::io("serial port is not open"))?;
        let adu = codec.read_frame(port).await?;
        self.last_activity = Instant::now();
        ModbusResponse::from_adu(&adu)
    }

    fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_is_required_before_io() {
        let mut transport = TcpTransport::new("127.0.0.1:502".parse().unwrap());
        assert!(!transport.is_open());

        let request = ModbusRequest::new(
            1,
            crate::msg::RequestPdu::ReadHoldingRegisters {
                reference: 0,
                count: 1,
            },
        );
        let err = transport.write_request(&request).await.unwrap_err();
        assert!(matches!(err, ModlinkError::Io(_)));
    }

    #[tokio::test]
    async fn test_close_without_open_is_noop() {
        let mut transport = TcpTransport::new("127.0.0.1:502".parse().unwrap());
        transport.close().await.unwrap();
        assert!(!transport.is_open());
    }
}
