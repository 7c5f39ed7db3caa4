//! # Voltage Modlink
//!
//! Transaction-level Modbus engine: wire framing, retrying request
//! execution and server-side connection handling.
//!
//! ## Features
//!
//! - **Four wire encodings**: MBAP-framed Modbus/TCP, RTU (CRC + silence
//!   interval), ASCII (hex + LRC) and byte-stuffed BIN framing
//! - **Transaction execution**: retry with a shared budget for mismatched
//!   responses and I/O failures, transparent reconnection and guarded
//!   transaction-ID correlation
//! - **Server engine**: per-connection handler tasks with an idle-timeout
//!   watchdog, backed by a pluggable process image
//! - **Typed messages**: request/response payloads with protocol exception
//!   responses modeled as values, never panics
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//! use voltage_modlink::{
//!     ModbusRequest, ModbusTransaction, RequestPdu, TcpTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(Mutex::new(TcpTransport::new("10.0.0.5:502".parse()?)));
//!
//!     let mut txn = ModbusTransaction::new();
//!     txn.set_transport(transport);
//!     txn.set_request(ModbusRequest::new(
//!         1,
//!         RequestPdu::ReadHoldingRegisters { reference: 0, count: 10 },
//!     ));
//!
//!     let response = txn.execute().await?;
//!     println!("{:?}", response.pdu);
//!     Ok(())
//! }
//! ```

pub mod constants;
pub mod error;
pub mod frame;
pub mod msg;
pub mod net;
pub mod procimg;
pub mod transaction;

pub use error::{ModlinkError, ModlinkResult};
pub use frame::ascii::AsciiCodec;
pub use frame::bin::BinCodec;
pub use frame::rtu::RtuCodec;
pub use frame::tcp::TcpCodec;
pub use frame::{Adu, FrameCodec};
pub use msg::{
    ExceptionCode, ModbusRequest, ModbusResponse, ReadRegistersResponse, RequestPdu, ResponsePdu,
};
pub use net::{
    ImageService, ModbusService, ModbusTcpServer, ModbusTransport, SerialTransport, ServerConfig,
    TcpTransport,
};
pub use procimg::{ProcessImage, SimpleProcessImage};
pub use transaction::{ModbusTransaction, TransactionCounter, TransactionOptions};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
