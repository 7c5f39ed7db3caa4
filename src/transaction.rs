//! Transaction execution: one request/response exchange with retry,
//! reconnection and transaction ID correlation.
//!
//! The executor shares its transport behind a mutex so concurrent callers
//! never interleave bytes on the wire; the write and all correlated reads of
//! one attempt happen inside a single critical section. Mismatched responses
//! and I/O failures drain one shared retry budget.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_RETRIES, MAX_TRANSACTION_ID};
use crate::error::{ModlinkError, ModlinkResult};
use crate::msg::{ModbusRequest, ModbusResponse};
use crate::net::connection::ModbusTransport;

/// Guarded correlation-id counter, shared by every request issued through
/// one logical channel.
///
/// Values stay in `[1, 65534]`; 0 is reserved for headless operation and is
/// never emitted. 65534 wraps back to 1.
#[derive(Debug)]
pub struct TransactionCounter(AtomicU16);

impl TransactionCounter {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Counter starting at `id`, clamped into the valid range.
    pub fn starting_at(id: u16) -> Self {
        Self(AtomicU16::new(id.clamp(1, MAX_TRANSACTION_ID)))
    }

    /// The id the next stamped request will carry.
    pub fn current(&self) -> u16 {
        self.0.load(Ordering::SeqCst)
    }

    /// Advance to the next id and return it.
    pub fn advance(&self) -> u16 {
        let mut current = self.0.load(Ordering::SeqCst);
        loop {
            let next = if current >= MAX_TRANSACTION_ID {
                1
            } else {
                current + 1
            };
            match self
                .0
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for TransactionCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry and correlation policy for one executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    /// Retry budget shared by mismatched-response re-reads and I/O failures.
    /// Coerced to at least one attempt.
    pub retries: u32,
    /// Stamp outgoing requests with a correlation id and verify it on the
    /// response. Must be disabled for headless transports (RTU/ASCII/BIN),
    /// whose responses always report id 0 and would be rejected as
    /// mismatches, and for slaves that echo garbage transaction ids.
    pub check_validity: bool,
    /// Close the connection after every transaction regardless of outcome.
    pub reconnecting: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            check_validity: true,
            reconnecting: false,
        }
    }
}

/// Outcome of one write+read cycle inside the critical section.
enum Attempt {
    /// A correlated (or correlation-exempt) response.
    Complete(ModbusResponse),
    /// Ends the whole call immediately.
    Fatal(ModlinkError),
    /// Costs one retry credit; the request will be re-sent.
    Failed(ModlinkError),
}

/// One request/response exchange against a shared transport.
///
/// A transport and a request must both be bound before [`execute`] is
/// called; a missing one fails with a configuration error before any I/O
/// is attempted.
///
/// [`execute`]: ModbusTransaction::execute
pub struct ModbusTransaction<T: ModbusTransport> {
    transport: Option<Arc<Mutex<T>>>,
    request: Option<ModbusRequest>,
    counter: Arc<TransactionCounter>,
    options: TransactionOptions,
}

impl<T: ModbusTransport> ModbusTransaction<T> {
    pub fn new() -> Self {
        Self {
            transport: None,
            request: None,
            counter: Arc::new(TransactionCounter::new()),
            options: TransactionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    /// Share a counter across executors driving the same logical channel.
    pub fn with_counter(mut self, counter: Arc<TransactionCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn set_transport(&mut self, transport: Arc<Mutex<T>>) {
        self.transport = Some(transport);
    }

    pub fn set_request(&mut self, request: ModbusRequest) {
        self.request = Some(request);
    }

    pub fn request(&self) -> Option<&ModbusRequest> {
        self.request.as_ref()
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn counter(&self) -> &Arc<TransactionCounter> {
        &self.counter
    }

    /// Run the bound request to completion.
    ///
    /// Mismatched responses are re-read without a fresh write; I/O failures
    /// re-send after reconnecting a dropped connection. Both paths consume
    /// from the same retry budget. A slave exception response is a valid,
    /// correlated reply and is never retried.
    pub async fn execute(&mut self) -> ModlinkResult<ModbusResponse> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| ModlinkError::Config("no transport bound to this transaction".into()))?;
        let request = self
            .request
            .as_mut()
            .ok_or_else(|| ModlinkError::Config("no request set".into()))?;

        if self.options.check_validity {
            request.transaction_id = self.counter.current();
        }
        let request = &*request;

        let result = Self::run_attempts(&transport, request, &self.options).await;

        if self.options.reconnecting {
            let _ = transport.lock().await.close().await;
        }

        let response = result?;
        if let Some(code) = response.exception() {
            debug!(
                "transaction {} refused by slave {}: {}",
                request.transaction_id, request.unit_id, code
            );
            return Err(ModlinkError::Slave(code));
        }
        if self.options.check_validity && response.transaction_id != request.transaction_id {
            return Err(ModlinkError::Mismatch {
                expected: request.transaction_id,
                actual: response.transaction_id,
            });
        }
        if self.options.check_validity {
            self.counter.advance();
        }
        Ok(response)
    }

    async fn run_attempts(
        transport: &Arc<Mutex<T>>,
        request: &ModbusRequest,
        options: &TransactionOptions,
    ) -> ModlinkResult<ModbusResponse> {
        let limit = options.retries.max(1);
        let mut tries = 0u32;

        {
            let mut guard = transport.lock().await;
            if !guard.is_open() {
                // failure to open here is fatal, no retry at this stage
                guard.open().await?;
            }
        }

        loop {
            let mut guard = transport.lock().await;
            match Self::exchange(&mut *guard, request, options, limit, &mut tries).await {
                Attempt::Complete(response) => return Ok(response),
                Attempt::Fatal(err) => return Err(err),
                Attempt::Failed(err) => {
                    tries += 1;
                    if tries >= limit {
                        warn!("transaction failed, retries exhausted: {err}");
                        return Err(ModlinkError::io(format!(
                            "executing transaction failed (tried {limit} times)"
                        )));
                    }
                    warn!("transaction attempt failed, retrying: {err}");
                    if err.is_eof() {
                        let _ = guard.close().await;
                    }
                    if !guard.is_open() {
                        // one reconnect per failed attempt; a connect failure
                        // here ends the whole call
                        guard.open().await?;
                    }
                }
            }
        }
    }

    /// One write plus the correlated-read sub-loop. Holds the transport
    /// lock for its whole duration.
    async fn exchange(
        transport: &mut T,
        request: &ModbusRequest,
        options: &TransactionOptions,
        limit: u32,
        tries: &mut u32,
    ) -> Attempt {
        if let Err(err) = transport.write_request(request).await {
            return Attempt::Failed(err);
        }
        loop {
            let response = match transport.read_response().await {
                Ok(response) => response,
                Err(err) => return Attempt::Failed(err),
            };
            let stale = options.check_validity
                && response.transaction_id != 0
                && response.transaction_id != request.transaction_id;
            if !stale {
                return Attempt::Complete(response);
            }
            // a stale or out-of-order reply; drain it and read again
            // without re-sending
            *tries += 1;
            warn!(
                "transaction ID mismatch: expected {}, got {} ({}/{} tries)",
                request.transaction_id, response.transaction_id, tries, limit
            );
            if *tries >= limit {
                return Attempt::Fatal(ModlinkError::io(format!(
                    "executing transaction failed (tried {limit} times)"
                )));
            }
        }
    }
}

impl<T: ModbusTransport> Default for ModbusTransaction<T> {
    fn default() -> Self {
        Self::new()
    }
}
