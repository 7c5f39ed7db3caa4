//! Message codec: typed Modbus request and response payloads.
//!
//! Each request variant knows its function code, how to serialize its fields
//! into a frame's data section and how to service itself against a
//! [`ProcessImage`]; each response variant knows how to deserialize that
//! section. Dispatch is by function code, with a `Raw` passthrough so the
//! framing and transaction layers are not limited to the typed set.
//!
//! The server-side path never fails past this boundary: an out-of-range
//! access becomes an illegal-data-address exception response, an unknown
//! function code an illegal-function exception response.

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::constants::{
    EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS, FC_WRITE_SINGLE_REGISTER,
    MAX_READ_REGISTERS,
};
use crate::error::{ModlinkError, ModlinkResult};
use crate::frame::Adu;
use crate::procimg::ProcessImage;

/// Modbus exception codes as defined by the protocol standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    /// A code outside the standard enumeration, carried verbatim.
    Other(u8),
}

impl ExceptionCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::SlaveDeviceFailure,
            0x05 => ExceptionCode::Acknowledge,
            0x06 => ExceptionCode::SlaveDeviceBusy,
            0x08 => ExceptionCode::MemoryParityError,
            0x0A => ExceptionCode::GatewayPathUnavailable,
            0x0B => ExceptionCode::GatewayTargetFailed,
            other => ExceptionCode::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::SlaveDeviceFailure => 0x04,
            ExceptionCode::Acknowledge => 0x05,
            ExceptionCode::SlaveDeviceBusy => 0x06,
            ExceptionCode::MemoryParityError => 0x08,
            ExceptionCode::GatewayPathUnavailable => 0x0A,
            ExceptionCode::GatewayTargetFailed => 0x0B,
            ExceptionCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionCode::IllegalFunction => "illegal function",
            ExceptionCode::IllegalDataAddress => "illegal data address",
            ExceptionCode::IllegalDataValue => "illegal data value",
            ExceptionCode::SlaveDeviceFailure => "slave device failure",
            ExceptionCode::Acknowledge => "acknowledge",
            ExceptionCode::SlaveDeviceBusy => "slave device busy",
            ExceptionCode::MemoryParityError => "memory parity error",
            ExceptionCode::GatewayPathUnavailable => "gateway path unavailable",
            ExceptionCode::GatewayTargetFailed => "gateway target failed to respond",
            ExceptionCode::Other(code) => return write!(f, "exception code 0x{code:02X}"),
        };
        write!(f, "{} (0x{:02X})", name, self.to_u8())
    }
}

/// A Modbus request as handed to the transaction executor.
///
/// `transaction_id` 0 means "no correlation requested" (headless transports);
/// the executor rewrites it between attempts and after completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusRequest {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
    pub pdu: RequestPdu,
}

impl ModbusRequest {
    /// New headless request with protocol id 0.
    pub fn new(unit_id: u8, pdu: RequestPdu) -> Self {
        Self {
            transaction_id: 0,
            protocol_id: 0,
            unit_id,
            pdu,
        }
    }

    pub fn function_code(&self) -> u8 {
        self.pdu.function_code()
    }

    /// Serialize the PDU (function code + data section).
    pub fn encode_pdu(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(self.pdu.function_code());
        self.pdu.encode(&mut buf);
        buf.to_vec()
    }

    pub fn to_adu(&self) -> Adu {
        Adu {
            transaction_id: self.transaction_id,
            protocol_id: self.protocol_id,
            unit_id: self.unit_id,
            pdu: self.encode_pdu(),
        }
    }

    pub fn from_adu(adu: &Adu) -> ModlinkResult<Self> {
        let (&function, data) = adu
            .pdu
            .split_first()
            .ok_or_else(|| ModlinkError::io("empty request PDU"))?;
        Ok(Self {
            transaction_id: adu.transaction_id,
            protocol_id: adu.protocol_id,
            unit_id: adu.unit_id,
            pdu: RequestPdu::decode(function, data)?,
        })
    }
}

/// Typed request payloads, dispatched by function code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPdu {
    /// FC 0x03 - read `count` holding registers starting at `reference`.
    ReadHoldingRegisters { reference: u16, count: u16 },
    /// FC 0x04 - read `count` input registers starting at `reference`.
    ReadInputRegisters { reference: u16, count: u16 },
    /// FC 0x06 - write one holding register.
    WriteSingleRegister { reference: u16, value: u16 },
    /// Any other function code, data section carried verbatim.
    Raw { function: u8, data: Vec<u8> },
}

impl RequestPdu {
    pub fn function_code(&self) -> u8 {
        match self {
            RequestPdu::ReadHoldingRegisters { .. } => FC_READ_HOLDING_REGISTERS,
            RequestPdu::ReadInputRegisters { .. } => FC_READ_INPUT_REGISTERS,
            RequestPdu::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            RequestPdu::Raw { function, .. } => *function,
        }
    }

    /// Serialize the data section (everything after the function code).
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            RequestPdu::ReadHoldingRegisters { reference, count }
            | RequestPdu::ReadInputRegisters { reference, count } => {
                buf.put_u16(*reference);
                buf.put_u16(*count);
            }
            RequestPdu::WriteSingleRegister { reference, value } => {
                buf.put_u16(*reference);
                buf.put_u16(*value);
            }
            RequestPdu::Raw { data, .. } => buf.put_slice(data),
        }
    }

    /// Deserialize a data section for the given function code.
    pub fn decode(function: u8, data: &[u8]) -> ModlinkResult<Self> {
        match function {
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
                let (reference, count) = decode_u16_pair(function, data)?;
                if function == FC_READ_HOLDING_REGISTERS {
                    Ok(RequestPdu::ReadHoldingRegisters { reference, count })
                } else {
                    Ok(RequestPdu::ReadInputRegisters { reference, count })
                }
            }
            FC_WRITE_SINGLE_REGISTER => {
                let (reference, value) = decode_u16_pair(function, data)?;
                Ok(RequestPdu::WriteSingleRegister { reference, value })
            }
            _ => Ok(RequestPdu::Raw {
                function,
                data: data.to_vec(),
            }),
        }
    }

    /// Service this request against a process image.
    ///
    /// Never fails: faults are converted to well-formed exception responses.
    pub fn service(&self, image: &dyn ProcessImage) -> ResponsePdu {
        match *self {
            RequestPdu::ReadHoldingRegisters { reference, count } => {
                if count == 0 || count > MAX_READ_REGISTERS {
                    return self.exception(ExceptionCode::IllegalDataValue);
                }
                match image.holding_registers(reference, count) {
                    Ok(registers) => {
                        ResponsePdu::ReadHoldingRegisters(ReadRegistersResponse::new(registers))
                    }
                    Err(_) => self.exception(ExceptionCode::IllegalDataAddress),
                }
            }
            RequestPdu::ReadInputRegisters { reference, count } => {
                if count == 0 || count > MAX_READ_REGISTERS {
                    return self.exception(ExceptionCode::IllegalDataValue);
                }
                match image.input_registers(reference, count) {
                    Ok(registers) => {
                        ResponsePdu::ReadInputRegisters(ReadRegistersResponse::new(registers))
                    }
                    Err(_) => self.exception(ExceptionCode::IllegalDataAddress),
                }
            }
            RequestPdu::WriteSingleRegister { reference, value } => {
                match image.set_holding_register(reference, value) {
                    Ok(()) => ResponsePdu::WriteSingleRegister { reference, value },
                    Err(_) => self.exception(ExceptionCode::IllegalDataAddress),
                }
            }
            RequestPdu::Raw { .. } => self.exception(ExceptionCode::IllegalFunction),
        }
    }

    fn exception(&self, code: ExceptionCode) -> ResponsePdu {
        ResponsePdu::Exception {
            function: self.function_code(),
            code,
        }
    }
}

fn decode_u16_pair(function: u8, data: &[u8]) -> ModlinkResult<(u16, u16)> {
    if data.len() < 4 {
        return Err(ModlinkError::io(format!(
            "truncated data section for function 0x{function:02X}: {} bytes",
            data.len()
        )));
    }
    Ok((
        u16::from_be_bytes([data[0], data[1]]),
        u16::from_be_bytes([data[2], data[3]]),
    ))
}

/// A Modbus response, either a success payload or an exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusResponse {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
    pub pdu: ResponsePdu,
}

impl ModbusResponse {
    /// Response mirroring the addressing fields of `request`.
    pub fn for_request(request: &ModbusRequest, pdu: ResponsePdu) -> Self {
        Self {
            transaction_id: request.transaction_id,
            protocol_id: request.protocol_id,
            unit_id: request.unit_id,
            pdu,
        }
    }

    pub fn function_code(&self) -> u8 {
        self.pdu.function_code()
    }

    /// The exception code if this is an exception-response variant.
    pub fn exception(&self) -> Option<ExceptionCode> {
        match self.pdu {
            ResponsePdu::Exception { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Serialize the PDU (function code + data section).
    pub fn encode_pdu(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u8(self.pdu.function_code());
        self.pdu.encode(&mut buf);
        buf.to_vec()
    }

    pub fn to_adu(&self) -> Adu {
        Adu {
            transaction_id: self.transaction_id,
            protocol_id: self.protocol_id,
            unit_id: self.unit_id,
            pdu: self.encode_pdu(),
        }
    }

    pub fn from_adu(adu: &Adu) -> ModlinkResult<Self> {
        let (&function, data) = adu
            .pdu
            .split_first()
            .ok_or_else(|| ModlinkError::io("empty response PDU"))?;
        Ok(Self {
            transaction_id: adu.transaction_id,
            protocol_id: adu.protocol_id,
            unit_id: adu.unit_id,
            pdu: ResponsePdu::decode(function, data)?,
        })
    }
}

/// Typed response payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponsePdu {
    ReadHoldingRegisters(ReadRegistersResponse),
    ReadInputRegisters(ReadRegistersResponse),
    WriteSingleRegister { reference: u16, value: u16 },
    /// `function` is the original (unflagged) function code.
    Exception { function: u8, code: ExceptionCode },
    Raw { function: u8, data: Vec<u8> },
}

impl ResponsePdu {
    pub fn function_code(&self) -> u8 {
        match self {
            ResponsePdu::ReadHoldingRegisters(_) => FC_READ_HOLDING_REGISTERS,
            ResponsePdu::ReadInputRegisters(_) => FC_READ_INPUT_REGISTERS,
            ResponsePdu::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            ResponsePdu::Exception { function, .. } => function | EXCEPTION_FLAG,
            ResponsePdu::Raw { function, .. } => *function,
        }
    }

    /// Serialize the data section (everything after the function code).
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            ResponsePdu::ReadHoldingRegisters(registers)
            | ResponsePdu::ReadInputRegisters(registers) => registers.encode(buf),
            ResponsePdu::WriteSingleRegister { reference, value } => {
                buf.put_u16(*reference);
                buf.put_u16(*value);
            }
            ResponsePdu::Exception { code, .. } => buf.put_u8(code.to_u8()),
            ResponsePdu::Raw { data, .. } => buf.put_slice(data),
        }
    }

    /// Deserialize a data section, dispatching by function code. An exception
    /// response is recognized by the flag bit before any typed dispatch.
    pub fn decode(function: u8, data: &[u8]) -> ModlinkResult<Self> {
        if function & EXCEPTION_FLAG != 0 {
            let code = *data.first().ok_or_else(|| {
                ModlinkError::io("truncated exception response: missing exception code")
            })?;
            return Ok(ResponsePdu::Exception {
                function: function & !EXCEPTION_FLAG,
                code: ExceptionCode::from_u8(code),
            });
        }

        match function {
            FC_READ_HOLDING_REGISTERS => Ok(ResponsePdu::ReadHoldingRegisters(
                ReadRegistersResponse::decode(data)?,
            )),
            FC_READ_INPUT_REGISTERS => Ok(ResponsePdu::ReadInputRegisters(
                ReadRegistersResponse::decode(data)?,
            )),
            FC_WRITE_SINGLE_REGISTER => {
                let (reference, value) = decode_u16_pair(function, data)?;
                Ok(ResponsePdu::WriteSingleRegister { reference, value })
            }
            _ => Ok(ResponsePdu::Raw {
                function,
                data: data.to_vec(),
            }),
        }
    }
}

/// Register payload of an FC03/FC04 response: byte count + register words.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadRegistersResponse {
    registers: Vec<u16>,
}

impl ReadRegistersResponse {
    pub fn new(registers: Vec<u16>) -> Self {
        Self { registers }
    }

    pub fn registers(&self) -> &[u16] {
        &self.registers
    }

    pub fn word_count(&self) -> usize {
        self.registers.len()
    }

    pub fn byte_count(&self) -> usize {
        self.registers.len() * 2
    }

    /// Register at `index` relative to the request's reference.
    pub fn register(&self, index: usize) -> Option<u16> {
        self.registers.get(index).copied()
    }

    /// Resize to exactly `count` registers: extra slots are zero-padded,
    /// surplus source registers are truncated.
    pub fn set_word_count(&mut self, count: usize) {
        self.registers.resize(count, 0);
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.byte_count() as u8);
        for register in &self.registers {
            buf.put_u16(*register);
        }
    }

    fn decode(data: &[u8]) -> ModlinkResult<Self> {
        let byte_count = *data
            .first()
            .ok_or_else(|| ModlinkError::io("truncated register response: missing byte count"))?
            as usize;
        if byte_count % 2 != 0 {
            return Err(ModlinkError::io(format!(
                "odd byte count in register response: {byte_count}"
            )));
        }
        let body = data
            .get(1..1 + byte_count)
            .ok_or_else(|| ModlinkError::io("truncated register response: short register data"))?;
        let registers = body
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Self { registers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procimg::SimpleProcessImage;

    #[test]
    fn test_request_pdu_roundtrip() {
        let pdu = RequestPdu::ReadHoldingRegisters {
            reference: 0x0001,
            count: 0x0002,
        };
        let mut buf = BytesMut::new();
        pdu.encode(&mut buf);
        assert_eq!(&buf[..], &[0x00, 0x01, 0x00, 0x02]);

        let decoded = RequestPdu::decode(FC_READ_HOLDING_REGISTERS, &buf).unwrap();
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn test_unknown_function_decodes_raw() {
        let decoded = RequestPdu::decode(0x2B, &[0x0E, 0x01]).unwrap();
        assert_eq!(
            decoded,
            RequestPdu::Raw {
                function: 0x2B,
                data: vec![0x0E, 0x01],
            }
        );
    }

    #[test]
    fn test_register_response_roundtrip() {
        let response = ReadRegistersResponse::new(vec![0x1234, 0x5678]);
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        assert_eq!(&buf[..], &[0x04, 0x12, 0x34, 0x56, 0x78]);

        let decoded = ReadRegistersResponse::decode(&buf).unwrap();
        assert_eq!(decoded.registers(), &[0x1234, 0x5678]);
        assert_eq!(decoded.word_count(), 2);
        assert_eq!(decoded.byte_count(), 4);
    }

    #[test]
    fn test_odd_byte_count_is_rejected() {
        let err = ReadRegistersResponse::decode(&[0x03, 0x12, 0x34, 0x56]).unwrap_err();
        assert!(matches!(err, ModlinkError::Io(_)));
    }

    #[test]
    fn test_set_word_count_pads_and_truncates() {
        let mut response = ReadRegistersResponse::new(vec![7, 8]);
        response.set_word_count(4);
        assert_eq!(response.registers(), &[7, 8, 0, 0]);

        response.set_word_count(1);
        assert_eq!(response.registers(), &[7]);
    }

    #[test]
    fn test_exception_response_function_code() {
        let pdu = ResponsePdu::Exception {
            function: FC_READ_HOLDING_REGISTERS,
            code: ExceptionCode::IllegalDataAddress,
        };
        assert_eq!(pdu.function_code(), 0x83);

        let mut buf = BytesMut::new();
        pdu.encode(&mut buf);
        assert_eq!(&buf[..], &[0x02]);

        let decoded = ResponsePdu::decode(0x83, &buf).unwrap();
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn test_service_reads_image() {
        let image = SimpleProcessImage::with_size(16, 0);
        image.set_holding_register(1, 0x00C8).unwrap();

        let request = RequestPdu::ReadHoldingRegisters {
            reference: 0,
            count: 3,
        };
        match request.service(&image) {
            ResponsePdu::ReadHoldingRegisters(registers) => {
                assert_eq!(registers.registers(), &[0, 0x00C8, 0]);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_service_out_of_range_is_illegal_address() {
        let image = SimpleProcessImage::with_size(8, 8);
        let request = RequestPdu::ReadHoldingRegisters {
            reference: 4,
            count: 8,
        };
        let response = request.service(&image);
        assert_eq!(
            response,
            ResponsePdu::Exception {
                function: FC_READ_HOLDING_REGISTERS,
                code: ExceptionCode::IllegalDataAddress,
            }
        );
        // function code on the wire is the original OR the flag bit
        assert_eq!(response.function_code() & !EXCEPTION_FLAG, 0x03);
    }

    #[test]
    fn test_service_unknown_function_is_illegal_function() {
        let image = SimpleProcessImage::with_size(1, 1);
        let request = RequestPdu::Raw {
            function: 0x2B,
            data: vec![],
        };
        assert_eq!(
            request.service(&image),
            ResponsePdu::Exception {
                function: 0x2B,
                code: ExceptionCode::IllegalFunction,
            }
        );
    }

    #[test]
    fn test_service_zero_count_is_illegal_value() {
        let image = SimpleProcessImage::with_size(8, 8);
        let request = RequestPdu::ReadInputRegisters {
            reference: 0,
            count: 0,
        };
        assert_eq!(
            request.service(&image),
            ResponsePdu::Exception {
                function: FC_READ_INPUT_REGISTERS,
                code: ExceptionCode::IllegalDataValue,
            }
        );
    }
}
