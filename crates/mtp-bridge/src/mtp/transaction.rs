//! Transaction engine: runs one complete MTP operation over a transport.
//!
//! A transaction is Command → optional Data (either direction) → Response. The
//! engine owns framing of the data phase, transaction-id checking, the
//! split-header and trailing-null-packet device quirks, and progress reporting.
//! Any error returned from the progress callback aborts streaming immediately
//! and becomes the transaction's result.

use log::{debug, trace};
use std::io::{Read, Write};
use std::time::Duration;

use super::codes::{ContainerKind, OperationCode};
use super::container::{Container, ContainerHeader, HEADER_LEN, MAX_PARAMS, decode_response, send_command};
use super::errors::MtpError;
use super::transport::{Endpoint, UsbTransport};

/// Size of each raw bulk read/write during a data phase.
pub const CHUNK_SIZE: usize = 0x4000;

/// Timeout for the zero-length packet that terminates an outbound data phase.
const ZLP_TIMEOUT: Duration = Duration::from_millis(250);

/// How a device frames the first packet of a data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderMode {
    /// Header and the start of the payload share one packet.
    #[default]
    Combined,
    /// The header travels alone. Some devices require (and send) this.
    Separate,
}

/// Decides the header mode after seeing the first packet of an inbound data phase.
///
/// Once a session is in `Separate` mode it stays there.
pub fn next_header_mode(current: HeaderMode, first_packet_len: usize, declared_len: u32) -> HeaderMode {
    match current {
        HeaderMode::Separate => HeaderMode::Separate,
        HeaderMode::Combined if first_packet_len == HEADER_LEN && declared_len as usize > HEADER_LEN => {
            HeaderMode::Separate
        }
        HeaderMode::Combined => HeaderMode::Combined,
    }
}

/// Identifiers bound to a transaction run inside an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionIds {
    pub session_id: u32,
    pub transaction_id: u32,
}

/// Optional data phase of a transaction.
pub enum DataPhase<'a> {
    None,
    /// Host sends `size` bytes read from `source`.
    Outbound { source: &'a mut dyn Read, size: u64 },
    /// Device sends a payload, written to `sink`.
    Inbound { sink: &'a mut dyn Write },
}

/// Runs one transaction and returns the device's OK response.
///
/// `ids` is `None` outside a session (GetDeviceInfo before OpenSession, OpenSession
/// itself). Then both ids go out as zero and the echo check is skipped.
pub fn run<T: UsbTransport>(
    transport: &mut T,
    ids: Option<TransactionIds>,
    header_mode: &mut HeaderMode,
    timeout: Duration,
    request: &Container,
    data: DataPhase<'_>,
    progress: &mut dyn FnMut(u64) -> Result<(), MtpError>,
) -> Result<Container, MtpError> {
    let operation = OperationCode(request.code);
    let mut command = request.clone();
    command.kind = ContainerKind::Command;
    command.transaction_id = ids.map_or(0, |ids| ids.transaction_id);
    command.session_id = ids.map_or(0, |ids| ids.session_id);

    trace!(
        "MTP {} tid={} params={:x?}",
        operation, command.transaction_id, command.params
    );
    send_command(transport, &command, timeout)?;

    let mut sink = match data {
        DataPhase::Outbound { source, size } => {
            send_data(
                transport,
                *header_mode,
                &command,
                source,
                size,
                timeout,
                progress,
            )?;
            None
        }
        DataPhase::Inbound { sink } => Some(sink),
        DataPhase::None => None,
    };

    let packet_size = transport.max_packet_size(Endpoint::In).max(1);
    let mut first = vec![0u8; CHUNK_SIZE];
    let n = transport.bulk_read(Endpoint::In, &mut first, timeout)?;
    let header = ContainerHeader::parse(&first[..n])?;

    let response_packet = if header.kind == ContainerKind::Data {
        check_echo(&header, ids)?;
        *header_mode = next_header_mode(*header_mode, n, header.length);

        match sink.as_deref_mut() {
            Some(sink) => receive_data(transport, &header, &first[..n], packet_size, timeout, sink, progress)?,
            None => {
                receive_data(
                    transport,
                    &header,
                    &first[..n],
                    packet_size,
                    timeout,
                    &mut std::io::sink(),
                    &mut |_| Ok(()),
                )?;
                return Err(MtpError::sync(format!("unexpected data phase for {}", operation)));
            }
        }
    } else {
        Some(first[..n].to_vec())
    };

    let packet = match response_packet {
        Some(packet) => packet,
        None => {
            let mut buf = vec![0u8; packet_size.max(HEADER_LEN + 4 * MAX_PARAMS)];
            let n = transport.bulk_read(Endpoint::In, &mut buf, timeout)?;
            buf.truncate(n);
            buf
        }
    };

    let header = ContainerHeader::parse(&packet)?;
    if header.kind == ContainerKind::Response {
        check_echo(&header, ids)?;
    }
    decode_response(&header, &packet[HEADER_LEN..], operation)
}

fn check_echo(header: &ContainerHeader, ids: Option<TransactionIds>) -> Result<(), MtpError> {
    if let Some(ids) = ids
        && header.transaction_id != ids.transaction_id
    {
        return Err(MtpError::sync(format!(
            "transaction ID mismatch: sent {}, got {}",
            ids.transaction_id, header.transaction_id
        )));
    }
    Ok(())
}

/// Writes the outbound data phase: header plus payload in chunks, then a ZLP if needed.
fn send_data<T: UsbTransport>(
    transport: &mut T,
    header_mode: HeaderMode,
    command: &Container,
    source: &mut dyn Read,
    size: u64,
    timeout: Duration,
    progress: &mut dyn FnMut(u64) -> Result<(), MtpError>,
) -> Result<(), MtpError> {
    let packet_size = transport.max_packet_size(Endpoint::Out).max(1);
    let mut header = Vec::with_capacity(HEADER_LEN);
    ContainerHeader::data(command.code, command.transaction_id, size).write_to(&mut header);

    let mut last_len = 0usize;
    if header_mode == HeaderMode::Separate {
        transport.bulk_write(Endpoint::Out, &header, timeout)?;
        last_len = header.len();
        header.clear();
    }

    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let prefix = header.len();
        chunk[..prefix].copy_from_slice(&header);
        header.clear();

        let take = (CHUNK_SIZE - prefix).min(usize::try_from(size - sent).unwrap_or(usize::MAX));
        source.read_exact(&mut chunk[prefix..prefix + take]).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                MtpError::LocalIo {
                    message: format!("upload source ended after {} of {} bytes", sent, size),
                }
            } else {
                MtpError::local_io("couldn't read upload source", e)
            }
        })?;

        let len = prefix + take;
        if len == 0 {
            break;
        }
        transport.bulk_write(Endpoint::Out, &chunk[..len], timeout)?;
        last_len = len;

        if take > 0 {
            sent += take as u64;
            progress(sent)?;
        }
        if sent >= size {
            break;
        }
    }

    if last_len > 0 && last_len % packet_size == 0 {
        // Some devices never send their Response without it; failure here is harmless.
        if let Err(e) = transport.bulk_write(Endpoint::Out, &[], ZLP_TIMEOUT) {
            debug!("MTP zero-length packet after {} failed: {}", OperationCode(command.code), e);
        }
    }
    Ok(())
}

/// Reads the rest of an inbound data phase into `sink`.
///
/// Returns the Response packet if it already arrived (as the trailing "null"
/// packet, or glued to the end of the data), or `None` if it is still unread.
fn receive_data<T: UsbTransport>(
    transport: &mut T,
    header: &ContainerHeader,
    first_packet: &[u8],
    packet_size: usize,
    timeout: Duration,
    sink: &mut dyn Write,
    progress: &mut dyn FnMut(u64) -> Result<(), MtpError>,
) -> Result<Option<Vec<u8>>, MtpError> {
    let expected = match header.length {
        u32::MAX => None,
        len => Some(u64::from(len).saturating_sub(HEADER_LEN as u64)),
    };

    let mut received = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut last_read = first_packet.len();
    let header_only = first_packet.len() == HEADER_LEN && expected != Some(0);

    let (payload, overflow) = split_at_expected(&first_packet[HEADER_LEN..], expected, received);
    if !payload.is_empty() {
        sink.write_all(payload)
            .map_err(|e| MtpError::local_io("couldn't write download sink", e))?;
        received += payload.len() as u64;
        progress(received)?;
    }
    if !overflow.is_empty() {
        return Ok(Some(overflow.to_vec()));
    }

    let mut first = true;
    loop {
        let complete = expected.is_some_and(|expected| received >= expected);
        let short = last_read % packet_size != 0 && !(first && header_only);
        if complete || short {
            break;
        }
        first = false;

        last_read = transport.bulk_read(Endpoint::In, &mut buf, timeout)?;
        if last_read == 0 {
            // Zero-length packet terminates the data phase.
            return Ok(None);
        }

        let (payload, overflow) = split_at_expected(&buf[..last_read], expected, received);
        sink.write_all(payload)
            .map_err(|e| MtpError::local_io("couldn't write download sink", e))?;
        received += payload.len() as u64;
        progress(received)?;
        if !overflow.is_empty() {
            return Ok(Some(overflow.to_vec()));
        }
    }

    if let Some(expected) = expected
        && received < expected
    {
        debug!("MTP data phase ended after {} of {} bytes", received, expected);
    }

    if last_read % packet_size == 0 {
        // Expect a null packet. Some host controllers deliver the Response here instead.
        let n = transport.bulk_read(Endpoint::In, &mut buf, timeout)?;
        if n > 0 {
            return Ok(Some(buf[..n].to_vec()));
        }
    }
    Ok(None)
}

/// Splits `bytes` into the part that still belongs to the payload and whatever follows it.
fn split_at_expected(bytes: &[u8], expected: Option<u64>, received: u64) -> (&[u8], &[u8]) {
    match expected {
        Some(expected) => {
            let left = usize::try_from(expected.saturating_sub(received)).unwrap_or(usize::MAX);
            bytes.split_at(left.min(bytes.len()))
        }
        None => (bytes, &[]),
    }
}
