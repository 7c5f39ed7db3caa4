//! Connections, transports and the server-side accept/dispatch machinery.

pub mod connection;
pub mod handler;
pub mod listener;

pub use connection::{ModbusTransport, SerialTransport, TcpConnection, TcpTransport};
pub use handler::{ConnectionHandler, ImageService, ModbusService};
pub use listener::{ModbusTcpServer, ServerConfig};
