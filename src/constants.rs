//! Modbus protocol constants based on the official specification.
//!
//! Frame size limits are inherited from the RS485 ADU limit of 256 bytes:
//! ADU (256) - slave address (1) - CRC (2) = 253 bytes of PDU.

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header length for TCP framing.
/// Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) = 7 bytes.
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU (function code + data) size per the Modbus specification.
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum value of the MBAP length field (unit id + PDU).
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

// ============================================================================
// Transaction Identifiers
// ============================================================================

/// Default protocol identifier carried in the MBAP header.
pub const DEFAULT_PROTOCOL_ID: u16 = 0;

/// Highest transaction identifier before the counter wraps back to 1.
/// 0 is reserved as the "no correlation" sentinel for headless transports.
pub const MAX_TRANSACTION_ID: u16 = 65534;

/// Default number of transaction attempts before giving up.
pub const DEFAULT_RETRIES: u32 = 3;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Bit set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Maximum register count for FC03/FC04.
/// 1 (function) + 1 (byte count) + N*2 <= 253 gives N <= 125.
pub const MAX_READ_REGISTERS: u16 = 125;

// ============================================================================
// ASCII Framing
// ============================================================================

/// Start-of-frame marker on the ASCII wire.
pub const ASCII_FRAME_START: u8 = b':';

/// End-of-frame marker on the ASCII wire.
pub const ASCII_FRAME_END: &[u8] = b"\r\n";

// ============================================================================
// BIN Framing
// ============================================================================

/// Wire-level frame-start token of the BIN transport.
pub const BIN_FRAME_START_TOKEN: u8 = b'S';

/// Wire-level frame-end token of the BIN transport.
pub const BIN_FRAME_END_TOKEN: u8 = b'E';

/// Virtual in-band frame-start marker. Deliberately outside the byte range so
/// it can never collide with payload data; translated to
/// [`BIN_FRAME_START_TOKEN`] on the wire without duplication.
pub const BIN_FRAME_START: u16 = 1000;

/// Virtual in-band frame-end marker, translated to [`BIN_FRAME_END_TOKEN`].
pub const BIN_FRAME_END: u16 = 2000;

// ============================================================================
// Server Timing
// ============================================================================

/// Ceiling on the idle watchdog poll period. Connections with a longer idle
/// timeout are still checked at least this often.
pub const WATCHDOG_RESOLUTION: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_constants() {
        assert_eq!(MBAP_HEADER_LEN, 7);
        assert_eq!(MAX_PDU_SIZE, 253);
        assert_eq!(MAX_MBAP_LENGTH, 254);
    }

    #[test]
    fn test_register_limit() {
        let read_pdu_size = 1 + 1 + (MAX_READ_REGISTERS as usize * 2);
        assert!(read_pdu_size <= MAX_PDU_SIZE);
    }

    #[test]
    fn test_virtual_markers_outside_byte_range() {
        assert!(BIN_FRAME_START > u8::MAX as u16);
        assert!(BIN_FRAME_END > u8::MAX as u16);
        assert_ne!(BIN_FRAME_START_TOKEN, BIN_FRAME_END_TOKEN);
    }
}
