//! Modbus/TCP server: accept loop spawning one handler task per connection.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ModlinkResult;
use crate::net::handler::{ConnectionHandler, ModbusService};

pub const DEFAULT_MODBUS_PORT: u16 = 502;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Idle seconds after which a connection is force-closed. 0 disables
    /// the watchdog.
    pub idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_MODBUS_PORT),
            idle_timeout_secs: 0,
        }
    }
}

/// Accepts Modbus/TCP connections and serves each on its own task.
pub struct ModbusTcpServer {
    listener: TcpListener,
    service: Arc<dyn ModbusService>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl ModbusTcpServer {
    pub async fn bind(config: &ServerConfig, service: Arc<dyn ModbusService>) -> ModlinkResult<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("[Server] listening on {}", config.bind_addr);
        Ok(Self {
            listener,
            service,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            shutdown: CancellationToken::new(),
        })
    }

    /// Actual bound address, useful when the config asked for port 0.
    pub fn local_addr(&self) -> ModlinkResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token that stops the accept loop and all spawned handlers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn serve(self) -> ModlinkResult<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("[Server] shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!("[Server] set_nodelay failed for {peer}: {err}");
                    }
                    info!("[Server] accepted connection from {peer}");
                    let handler = ConnectionHandler::new(stream, self.service.clone(), peer.to_string())
                        .with_idle_timeout(self.idle_timeout)
                        .with_shutdown(self.shutdown.child_token());
                    tokio::spawn(async move {
                        if let Err(err) = handler.run().await {
                            warn!("[Server] handler for {peer} failed: {err}");
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), DEFAULT_MODBUS_PORT);
        assert_eq!(config.idle_timeout_secs, 0);
    }

    #[test]
    fn test_config_deserializes_with_partial_fields() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"bind_addr":"127.0.0.1:1502"}"#).unwrap();
        assert_eq!(config.bind_addr.port(), 1502);
        assert_eq!(config.idle_timeout_secs, 0);
    }
}
