//! USB transport seam.
//!
//! The bridge never talks to libusb directly. A USB backend implements
//! [`UsbTransport`] for one device handle and [`DeviceOpener`] to produce new
//! handles; everything above this module is backend-agnostic.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Bulk endpoint direction, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Host to device (the "send" endpoint).
    Out,
    /// Device to host (the "fetch" endpoint).
    In,
}

/// Category of a transport failure, assigned by the backend where the failure happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportErrorKind {
    Timeout,
    Busy,
    Io,
    Access,
    NoDevice,
    /// The handle is closed or was never opened.
    NotOpen,
    Pipe,
    Overflow,
    Other,
}

/// A failed USB call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_open() -> Self {
        Self::new(TransportErrorKind::NotOpen, "device is not open")
    }

    pub fn timeout() -> Self {
        Self::new(TransportErrorKind::Timeout, "bulk transfer timed out")
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

/// One opened (or openable) USB device handle with an MTP interface.
///
/// All calls block until the transfer completes, fails, or `timeout` elapses.
pub trait UsbTransport: Send + 'static {
    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    /// Issues a USB port reset.
    fn reset(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Reads one bulk transfer into `buf`, returning the byte count.
    ///
    /// A transfer ends at the first short packet, so a read into a buffer larger
    /// than the max packet size can return several packets' worth of bytes.
    fn bulk_read(&mut self, endpoint: Endpoint, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Writes `data` as one bulk transfer. An empty slice writes a zero-length packet.
    fn bulk_write(&mut self, endpoint: Endpoint, data: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    fn max_packet_size(&self, endpoint: Endpoint) -> usize;
}

/// Produces fresh transports for the first MTP device found.
pub trait DeviceOpener: Send + Sync + 'static {
    type Transport: UsbTransport;

    fn open_device(&self) -> Result<Self::Transport, TransportError>;
}
