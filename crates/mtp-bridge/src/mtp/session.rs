//! MTP session state and the open/recover sequence.

use log::{debug, info, warn};
use std::time::Duration;
use uuid::Uuid;

use super::codes::ResponseCode;
use super::device::MtpDevice;
use super::errors::MtpError;
use super::transaction::{HeaderMode, TransactionIds};
use super::transport::UsbTransport;

/// Highest transaction id before the counter wraps. `0xFFFFFFFF` is reserved.
const LAST_TRANSACTION_ID: u32 = 0xFFFF_FFFE;

/// An open session on one device handle. Dropped when the handle closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    session_id: u32,
    next_transaction_id: u32,
    header_mode: HeaderMode,
}

impl Session {
    pub fn new(session_id: u32) -> Self {
        Self {
            session_id,
            next_transaction_id: 1,
            header_mode: HeaderMode::Combined,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn header_mode(&self) -> HeaderMode {
        self.header_mode
    }

    /// Takes the next transaction id. Ids run 1..=0xFFFFFFFE, then wrap to 1.
    pub(crate) fn next_ids(&mut self) -> TransactionIds {
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id = if transaction_id >= LAST_TRANSACTION_ID {
            1
        } else {
            transaction_id + 1
        };
        TransactionIds {
            session_id: self.session_id,
            transaction_id,
        }
    }

    pub(crate) fn header_mode_mut(&mut self) -> &mut HeaderMode {
        &mut self.header_mode
    }

    #[cfg(test)]
    pub(crate) fn set_next_transaction_id(&mut self, id: u32) {
        self.next_transaction_id = id;
    }
}

/// Random odd session id. Never 0 and never `0xFFFFFFFF`.
pub fn new_session_id() -> u32 {
    let bytes = Uuid::new_v4().into_bytes();
    let id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) | 1;
    if id == u32::MAX { 1 } else { id }
}

impl<T: UsbTransport> MtpDevice<T> {
    /// Opens a session unless one is already open on this handle.
    pub fn ensure_session(&mut self, recovery_delay: Duration) -> Result<(), MtpError> {
        if self.session().is_some() {
            return Ok(());
        }
        self.configure(recovery_delay)
    }

    /// Opens the device and a fresh session, resetting the device once if that fails.
    pub fn configure(&mut self, recovery_delay: Duration) -> Result<(), MtpError> {
        self.open()?;

        let mut result = self.open_session(new_session_id());
        if result.as_ref().err().and_then(MtpError::response_code) == Some(ResponseCode::SESSION_ALREADY_OPEN) {
            debug!("MTP session already open on device, closing it first");
            // Works without a valid transaction id on the devices we've seen.
            let _ = self.close_session();
            result = self.open_session(new_session_id());
        }

        let Err(e) = result else {
            return Ok(());
        };

        warn!("MTP OpenSession failed: {}; attempting reset", e);
        self.reset_and_close();
        std::thread::sleep(recovery_delay);

        self.open().map_err(|e| MtpError::SessionUnrecoverable {
            message: format!("opening after reset: {}", e),
        })?;
        self.open_session(new_session_id())
            .map_err(|e| MtpError::SessionUnrecoverable {
                message: format!("OpenSession after reset: {}", e),
            })?;
        info!("MTP session recovered after device reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_ids_increase() {
        let mut session = Session::new(7);
        let ids: Vec<u32> = (0..5).map(|_| session.next_ids().transaction_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(session.next_ids().session_id, 7);
    }

    #[test]
    fn test_transaction_ids_wrap_and_skip_zero() {
        let mut session = Session::new(7);
        session.set_next_transaction_id(LAST_TRANSACTION_ID);
        assert_eq!(session.next_ids().transaction_id, LAST_TRANSACTION_ID);
        assert_eq!(session.next_ids().transaction_id, 1);
    }

    #[test]
    fn test_session_ids_are_odd() {
        for _ in 0..100 {
            let id = new_session_id();
            assert_eq!(id % 2, 1);
            assert_ne!(id, u32::MAX);
        }
    }

    #[test]
    fn test_new_session_starts_combined() {
        assert_eq!(Session::new(1).header_mode(), HeaderMode::Combined);
    }
}
