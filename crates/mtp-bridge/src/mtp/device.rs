//! An opened MTP device handle: transport, optional session, and per-call timeout.
//!
//! One method per MTP primitive. A transaction that fails with a fault that
//! poisons the connection drops the session and closes the transport, so the
//! handle reports itself closed from then on.

use log::{debug, warn};
use std::io::{Read, Write};
use std::time::Duration;

use super::codes::OperationCode;
use super::container::Container;
use super::dataset::{DeviceInfo, ObjectInfo, StorageInfo, decode_u32_array};
use super::errors::MtpError;
use super::session::Session;
use super::transaction::{self, DataPhase, HeaderMode};
use super::transport::UsbTransport;

/// Default per-transfer timeout until the orchestrator sets a call-class timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a new object landed, as reported by SendObjectInfo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLocation {
    pub storage_id: u32,
    pub parent: u32,
    pub handle: u32,
}

pub struct MtpDevice<T: UsbTransport> {
    transport: T,
    session: Option<Session>,
    /// Header mode for transactions run outside a session.
    sessionless_header_mode: HeaderMode,
    timeout: Duration,
}

impl<T: UsbTransport> MtpDevice<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            session: None,
            sessionless_header_mode: HeaderMode::Combined,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Opens the transport if it isn't open yet.
    pub fn open(&mut self) -> Result<(), MtpError> {
        if !self.transport.is_open() {
            self.transport.open()?;
        }
        Ok(())
    }

    /// Port reset, then close. Used when a session can't be opened.
    pub(crate) fn reset_and_close(&mut self) {
        self.session = None;
        if let Err(e) = self.transport.reset() {
            debug!("MTP reset failed: {}", e);
        }
        if let Err(e) = self.transport.close() {
            debug!("MTP close after reset failed: {}", e);
        }
    }

    /// Closes the session (best effort) and the transport.
    ///
    /// If CloseSession fails the device is reset so it doesn't keep a stale session.
    pub fn dispose(&mut self) {
        if !self.transport.is_open() {
            self.session = None;
            return;
        }
        if self.session.is_some()
            && let Err(e) = self.close_session()
        {
            debug!("MTP CloseSession during dispose failed: {}; resetting", e);
            let _ = self.transport.reset();
        }
        self.session = None;
        if let Err(e) = self.transport.close() {
            debug!("MTP close during dispose failed: {}", e);
        }
    }

    /// Runs one transaction with this handle's ids and timeout.
    pub(crate) fn transact(
        &mut self,
        request: Container,
        data: DataPhase<'_>,
        progress: &mut dyn FnMut(u64) -> Result<(), MtpError>,
    ) -> Result<Container, MtpError> {
        if !self.transport.is_open() {
            return Err(MtpError::PoisonedConnection {
                message: "device is not open".to_string(),
            });
        }

        let (ids, header_mode) = match self.session.as_mut() {
            Some(session) => (Some(session.next_ids()), session.header_mode_mut()),
            None => (None, &mut self.sessionless_header_mode),
        };
        let result = transaction::run(
            &mut self.transport,
            ids,
            header_mode,
            self.timeout,
            &request,
            data,
            progress,
        );

        if let Err(e) = &result
            && e.poisons_connection()
        {
            warn!("MTP fatal error {}; closing connection", e);
            self.session = None;
            if let Err(e) = self.transport.close() {
                debug!("MTP close after fatal error failed: {}", e);
            }
        }
        result
    }

    fn transact_simple(&mut self, operation: OperationCode, params: &[u32]) -> Result<Container, MtpError> {
        self.transact(Container::command(operation, params), DataPhase::None, &mut |_| Ok(()))
    }

    fn transact_read(&mut self, operation: OperationCode, params: &[u32]) -> Result<Vec<u8>, MtpError> {
        let mut data = Vec::new();
        self.transact(
            Container::command(operation, params),
            DataPhase::Inbound { sink: &mut data },
            &mut |_| Ok(()),
        )?;
        Ok(data)
    }

    // ========================================================================
    // Session primitives
    // ========================================================================

    pub fn open_session(&mut self, session_id: u32) -> Result<(), MtpError> {
        if self.session.is_some() {
            return Err(MtpError::Protocol {
                code: super::codes::ResponseCode::SESSION_ALREADY_OPEN,
                operation: OperationCode::OPEN_SESSION,
            });
        }
        self.transact_simple(OperationCode::OPEN_SESSION, &[session_id])?;
        self.session = Some(Session::new(session_id));
        debug!("MTP session 0x{:08x} opened", session_id);
        Ok(())
    }

    pub fn close_session(&mut self) -> Result<(), MtpError> {
        let result = self.transact_simple(OperationCode::CLOSE_SESSION, &[]);
        self.session = None;
        result.map(|_| ())
    }

    // ========================================================================
    // Query primitives
    // ========================================================================

    pub fn get_device_info(&mut self) -> Result<DeviceInfo, MtpError> {
        let data = self.transact_read(OperationCode::GET_DEVICE_INFO, &[])?;
        DeviceInfo::decode(&data)
    }

    /// Liveness check: a full DeviceInfo round trip.
    pub fn probe(&mut self) -> Result<(), MtpError> {
        self.get_device_info().map(|_| ())
    }

    pub fn get_storage_ids(&mut self) -> Result<Vec<u32>, MtpError> {
        let data = self.transact_read(OperationCode::GET_STORAGE_IDS, &[])?;
        decode_u32_array(&data)
    }

    pub fn get_storage_info(&mut self, storage_id: u32) -> Result<StorageInfo, MtpError> {
        let data = self.transact_read(OperationCode::GET_STORAGE_INFO, &[storage_id])?;
        StorageInfo::decode(&data)
    }

    /// Handles of all objects directly under `parent` (0xFFFFFFFF for the storage root).
    pub fn get_object_handles(&mut self, storage_id: u32, format: u16, parent: u32) -> Result<Vec<u32>, MtpError> {
        let data = self.transact_read(
            OperationCode::GET_OBJECT_HANDLES,
            &[storage_id, u32::from(format), parent],
        )?;
        decode_u32_array(&data)
    }

    pub fn get_object_info(&mut self, handle: u32) -> Result<ObjectInfo, MtpError> {
        let data = self.transact_read(OperationCode::GET_OBJECT_INFO, &[handle])?;
        ObjectInfo::decode(&data)
    }

    // ========================================================================
    // Transfer and mutation primitives
    // ========================================================================

    /// Streams an object's bytes into `sink`. Returns the number of bytes received.
    pub fn get_object(
        &mut self,
        handle: u32,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64) -> Result<(), MtpError>,
    ) -> Result<u64, MtpError> {
        let mut received = 0u64;
        self.transact(
            Container::command(OperationCode::GET_OBJECT, &[handle]),
            DataPhase::Inbound { sink },
            &mut |n| {
                received = n;
                progress(n)
            },
        )?;
        Ok(received)
    }

    /// Announces a new object. The device answers with where it will live.
    pub fn send_object_info(&mut self, info: &ObjectInfo) -> Result<ObjectLocation, MtpError> {
        let payload = info.encode()?;
        let response = self.transact(
            Container::command(OperationCode::SEND_OBJECT_INFO, &[info.storage_id, info.parent_object]),
            DataPhase::Outbound {
                source: &mut payload.as_slice(),
                size: payload.len() as u64,
            },
            &mut |_| Ok(()),
        )?;
        Ok(ObjectLocation {
            storage_id: response.param(0),
            parent: response.param(1),
            handle: response.param(2),
        })
    }

    /// Sends the content of the object announced by the last SendObjectInfo.
    pub fn send_object(
        &mut self,
        source: &mut dyn Read,
        size: u64,
        progress: &mut dyn FnMut(u64) -> Result<(), MtpError>,
    ) -> Result<(), MtpError> {
        self.transact(
            Container::command(OperationCode::SEND_OBJECT, &[]),
            DataPhase::Outbound { source, size },
            progress,
        )?;
        Ok(())
    }

    pub fn delete_object(&mut self, handle: u32) -> Result<(), MtpError> {
        self.transact_simple(OperationCode::DELETE_OBJECT, &[handle])?;
        Ok(())
    }
}

impl<T: UsbTransport> Drop for MtpDevice<T> {
    fn drop(&mut self) {
        if self.transport.is_open() {
            self.dispose();
        }
    }
}
