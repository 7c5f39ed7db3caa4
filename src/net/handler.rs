//! Server-side connection lifecycle: receive-dispatch-reply loop plus an
//! idle watchdog.
//!
//! Each accepted connection runs one handler task. The watchdog runs on its
//! own timer and coordinates with the loop through a one-shot cancellation
//! token; firing it unblocks the pending read so the handler can close the
//! stream itself. The stream is closed exactly once, whichever exit path
//! is taken.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::WATCHDOG_RESOLUTION;
use crate::error::{ModlinkError, ModlinkResult};
use crate::frame::tcp::TcpCodec;
use crate::frame::{FrameCodec, Stream};
use crate::msg::{ModbusRequest, ModbusResponse, ResponsePdu};
use crate::procimg::ProcessImage;

/// Request dispatch collaborator for the server loop.
pub trait ModbusService: Send + Sync {
    /// Produce the response payload for one request. Must not fail; protocol
    /// refusals are expressed as exception response variants.
    fn handle(&self, request: &ModbusRequest) -> ResponsePdu;
}

/// Dispatches requests against a process image.
pub struct ImageService {
    image: Arc<dyn ProcessImage>,
}

impl ImageService {
    pub fn new(image: Arc<dyn ProcessImage>) -> Self {
        Self { image }
    }
}

impl ModbusService for ImageService {
    fn handle(&self, request: &ModbusRequest) -> ResponsePdu {
        request.pdu.service(self.image.as_ref())
    }
}

/// One accepted connection's request/response loop.
pub struct ConnectionHandler<IO> {
    io: IO,
    codec: TcpCodec,
    service: Arc<dyn ModbusService>,
    peer: String,
    /// Zero disables the watchdog.
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl<IO: Stream> ConnectionHandler<IO> {
    pub fn new(io: IO, service: Arc<dyn ModbusService>, peer: impl Into<String>) -> Self {
        Self {
            io,
            codec: TcpCodec::new(),
            service,
            peer: peer.into(),
            idle_timeout: Duration::ZERO,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Serve until the peer disconnects, shutdown is requested, the idle
    /// watchdog fires or an I/O error occurs. A clean peer close and a
    /// watchdog close both count as normal termination.
    pub async fn run(mut self) -> ModlinkResult<()> {
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let idle_closed = CancellationToken::new();
        let watchdog = if self.idle_timeout > Duration::ZERO {
            Some(spawn_watchdog(
                self.peer.clone(),
                self.idle_timeout,
                last_activity.clone(),
                idle_closed.clone(),
            ))
        } else {
            None
        };

        let result = self.serve(&last_activity, &idle_closed).await;

        if let Some(handle) = watchdog {
            handle.abort();
        }
        let _ = self.io.shutdown().await;
        debug!("[{}] connection closed", self.peer);
        result
    }

    async fn serve(
        &mut self,
        last_activity: &Arc<Mutex<Instant>>,
        idle_closed: &CancellationToken,
    ) -> ModlinkResult<()> {
        loop {
            let adu = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("[{}] shutdown requested", self.peer);
                    return Ok(());
                }
                _ = idle_closed.cancelled() => {
                    warn!("[{}] closed by idle watchdog", self.peer);
                    return Ok(());
                }
                read = self.codec.read_frame(&mut self.io) => match read {
                    Ok(adu) => adu,
                    Err(err) if err.is_eof() => {
                        debug!("[{}] peer closed the connection", self.peer);
                        return Ok(());
                    }
                    Err(err) => {
                        warn!("[{}] read failed: {err}", self.peer);
                        return Err(err);
                    }
                }
            };
            touch(last_activity);

            let request = match ModbusRequest::from_adu(&adu) {
                Ok(request) => request,
                Err(err) => {
                    // an unparseable frame means the stream is out of sync
                    warn!("[{}] malformed request: {err}", self.peer);
                    return Err(err);
                }
            };
            debug!(
                "[{}] request tid={} unit={} fc=0x{:02X}",
                self.peer,
                request.transaction_id,
                request.unit_id,
                request.function_code()
            );

            let response = ModbusResponse::for_request(&request, self.service.handle(&request));
            self.codec.write_frame(&mut self.io, &response.to_adu()).await?;
            touch(last_activity);
        }
    }
}

fn touch(last_activity: &Arc<Mutex<Instant>>) {
    let mut guard = last_activity
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *guard = Instant::now();
}

fn idle_for(last_activity: &Arc<Mutex<Instant>>) -> Duration {
    last_activity
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .elapsed()
}

/// Recurring idle check with a fixed resolution ceiling. One-shot in effect:
/// firing the token is its last act.
fn spawn_watchdog(
    peer: String,
    idle_timeout: Duration,
    last_activity: Arc<Mutex<Instant>>,
    idle_closed: CancellationToken,
) -> JoinHandle<()> {
    let period = idle_timeout.min(WATCHDOG_RESOLUTION);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let idle = idle_for(&last_activity);
            if idle > idle_timeout {
                warn!(
                    "[{peer}] idle for {}s (limit {}s), forcing close",
                    idle.as_secs(),
                    idle_timeout.as_secs()
                );
                idle_closed.cancel();
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::constants::{EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS};
    use crate::frame::Adu;
    use crate::msg::RequestPdu;
    use crate::procimg::SimpleProcessImage;

    fn service_with_registers(values: &[u16]) -> Arc<dyn ModbusService> {
        let image = SimpleProcessImage::with_size(values.len(), 0);
        for (reference, &value) in values.iter().enumerate() {
            image.set_holding_register(reference as u16, value).unwrap();
        }
        Arc::new(ImageService::new(Arc::new(image)))
    }

    #[tokio::test]
    async fn test_request_dispatch_roundtrip() {
        let (mut client, server) = tokio::io::duplex(1024);
        let service = service_with_registers(&[0x1111, 0x2222, 0x3333]);
        let handler = ConnectionHandler::new(server, service, "test");
        let task = tokio::spawn(handler.run());

        let mut codec = TcpCodec::new();
        let request = ModbusRequest {
            transaction_id: 7,
            protocol_id: 0,
            unit_id: 1,
            pdu: RequestPdu::ReadHoldingRegisters {
                reference: 1,
                count: 2,
            },
        };
        codec
            .write_frame(&mut client, &request.to_adu())
            .await
            .unwrap();

        let adu = codec.read_frame(&mut client).await.unwrap();
        assert_eq!(adu.transaction_id, 7);
        assert_eq!(adu.unit_id, 1);
        assert_eq!(adu.pdu, vec![0x03, 0x04, 0x22, 0x22, 0x33, 0x33]);

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_out_of_range_read_yields_illegal_data_address() {
        let (mut client, server) = tokio::io::duplex(1024);
        let service = service_with_registers(&[0x1111]);
        let task = tokio::spawn(ConnectionHandler::new(server, service, "test").run());

        let mut codec = TcpCodec::new();
        let request = ModbusRequest::new(
            1,
            RequestPdu::ReadHoldingRegisters {
                reference: 100,
                count: 2,
            },
        );
        codec
            .write_frame(&mut client, &request.to_adu())
            .await
            .unwrap();

        let adu = codec.read_frame(&mut client).await.unwrap();
        assert_eq!(
            adu.pdu,
            vec![FC_READ_HOLDING_REGISTERS | EXCEPTION_FLAG, 0x02]
        );

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_terminates_the_loop() {
        let (client, server) = tokio::io::duplex(1024);
        let service = service_with_registers(&[0]);
        let shutdown = CancellationToken::new();
        let handler =
            ConnectionHandler::new(server, service, "test").with_shutdown(shutdown.clone());
        let task = tokio::spawn(handler.run());

        shutdown.cancel();
        task.await.unwrap().unwrap();
        drop(client);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_closes_idle_connection() {
        let (client, server) = tokio::io::duplex(1024);
        let service = service_with_registers(&[0]);
        let handler = ConnectionHandler::new(server, service, "test")
            .with_idle_timeout(Duration::from_millis(100));
        let task = tokio::spawn(handler.run());

        // below the threshold nothing happens
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!task.is_finished());

        // one more poll window pushes the idle time past the limit
        tokio::time::sleep(Duration::from_millis(150)).await;
        task.await.unwrap().unwrap();
        drop(client);
    }
}
