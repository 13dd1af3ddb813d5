//! USB bulk container codec.
//!
//! Every MTP phase travels as a container: a 12-byte little-endian header
//! (total length, container type, code, transaction id) followed by a payload.
//! Commands and responses carry up to five `u32` parameters as their payload.

use bytes::{Buf, BufMut};
use log::debug;
use std::time::Duration;

use super::codes::{ContainerKind, OperationCode, ResponseCode};
use super::errors::MtpError;
use super::transport::{Endpoint, UsbTransport};

/// Size of the bulk container header.
pub const HEADER_LEN: usize = 12;

/// Commands and responses never carry more than five parameters.
pub const MAX_PARAMS: usize = 5;

/// The fixed header in front of every bulk container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    /// Total container length including this header.
    pub length: u32,
    pub kind: ContainerKind,
    pub code: u16,
    pub transaction_id: u32,
}

impl ContainerHeader {
    /// Parses the header from the start of `bytes`.
    pub fn parse(bytes: &[u8]) -> Result<Self, MtpError> {
        if bytes.len() < HEADER_LEN {
            return Err(MtpError::framing(format!(
                "container header needs {} bytes, got {}",
                HEADER_LEN,
                bytes.len()
            )));
        }
        let mut buf = &bytes[..HEADER_LEN];
        Ok(Self {
            length: buf.get_u32_le(),
            kind: ContainerKind::from_raw(buf.get_u16_le()),
            code: buf.get_u16_le(),
            transaction_id: buf.get_u32_le(),
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.put_u32_le(self.length);
        out.put_u16_le(self.kind.raw());
        out.put_u16_le(self.code);
        out.put_u32_le(self.transaction_id);
    }

    /// Header for a data phase carrying `payload_len` bytes. Lengths past `u32::MAX` saturate.
    pub fn data(code: u16, transaction_id: u32, payload_len: u64) -> Self {
        let length = u32::try_from(payload_len + HEADER_LEN as u64).unwrap_or(u32::MAX);
        Self {
            length,
            kind: ContainerKind::Data,
            code,
            transaction_id,
        }
    }
}

/// A Command or Response container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub kind: ContainerKind,
    /// Operation code for commands, response code for responses.
    pub code: u16,
    pub transaction_id: u32,
    pub session_id: u32,
    pub params: Vec<u32>,
}

impl Container {
    pub fn command(operation: OperationCode, params: &[u32]) -> Self {
        Self {
            kind: ContainerKind::Command,
            code: operation.0,
            transaction_id: 0,
            session_id: 0,
            params: params.to_vec(),
        }
    }

    pub fn response_code(&self) -> ResponseCode {
        ResponseCode(self.code)
    }

    /// Returns the `index`-th parameter, or 0 if the device sent fewer.
    pub fn param(&self, index: usize) -> u32 {
        self.params.get(index).copied().unwrap_or(0)
    }
}

/// Encodes a Command container into its wire form.
pub fn encode_command(command: &Container) -> Result<Vec<u8>, MtpError> {
    if command.params.len() > MAX_PARAMS {
        return Err(MtpError::invalid_argument(format!(
            "a command carries at most {} parameters, got {}",
            MAX_PARAMS,
            command.params.len()
        )));
    }

    let length = HEADER_LEN + 4 * command.params.len();
    let mut out = Vec::with_capacity(length);
    ContainerHeader {
        length: length as u32,
        kind: ContainerKind::Command,
        code: command.code,
        transaction_id: command.transaction_id,
    }
    .write_to(&mut out);
    for param in &command.params {
        out.put_u32_le(*param);
    }
    Ok(out)
}

/// Writes a Command container as a single bulk transfer.
pub fn send_command<T: UsbTransport>(
    transport: &mut T,
    command: &Container,
    timeout: Duration,
) -> Result<(), MtpError> {
    let bytes = encode_command(command)?;
    transport.bulk_write(Endpoint::Out, &bytes, timeout)?;
    Ok(())
}

/// Decodes a Response from its parsed header and the bytes that followed it in the packet.
///
/// `operation` is the request's code, carried into protocol errors.
pub fn decode_response(header: &ContainerHeader, rest: &[u8], operation: OperationCode) -> Result<Container, MtpError> {
    if header.kind != ContainerKind::Response {
        return Err(MtpError::framing(format!(
            "got container type {:?} in response to {}, want Response",
            header.kind, operation
        )));
    }

    if (header.length as usize) < HEADER_LEN {
        return Err(MtpError::framing(format!(
            "header specified 0x{:x} bytes, less than the 0x{:x} byte header",
            header.length, HEADER_LEN
        )));
    }
    let declared = header.length as usize - HEADER_LEN;
    if declared > rest.len() {
        return Err(MtpError::framing(format!(
            "header specified 0x{:x} bytes, but have 0x{:x}",
            declared,
            rest.len()
        )));
    }

    let mut payload = &rest[..declared];
    let count = (declared / 4).min(MAX_PARAMS);
    let params = (0..count).map(|_| payload.get_u32_le()).collect();

    let response = Container {
        kind: ContainerKind::Response,
        code: header.code,
        transaction_id: header.transaction_id,
        session_id: 0,
        params,
    };

    let code = response.response_code();
    if !code.is_ok() {
        debug!("MTP response {} for {}", code, operation);
        return Err(MtpError::Protocol { code, operation });
    }
    Ok(response)
}
