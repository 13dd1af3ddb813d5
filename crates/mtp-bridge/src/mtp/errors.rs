//! Error types for MTP transactions and pooled connection calls.

use super::codes::{OperationCode, ResponseCode};
use super::transport::{TransportError, TransportErrorKind};

/// Every failure a bridge call can surface. Each variant is assigned where the
/// failure originates; retry decisions match on the variant, never on the text.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum MtpError {
    /// Malformed or undersized container.
    Framing { message: String },
    /// Lost transaction synchronization (id mismatch, unexpected data phase).
    Sync { message: String },
    /// Device rejected the operation with an MTP response code.
    Protocol {
        code: ResponseCode,
        operation: OperationCode,
    },
    /// The USB call itself failed.
    Transport { kind: TransportErrorKind, message: String },
    /// A handle that is closed, or failed its liveness probe.
    PoisonedConnection { message: String },
    /// Session could not be opened even after a device reset.
    SessionUnrecoverable { message: String },
    /// The task was cancelled by the caller.
    Cancelled { task_id: String },
    /// The bridge is shutting down.
    ShuttingDown,
    /// The attempt did not finish within the call-class timeout.
    Timeout { operation: String, timeout_ms: u64 },
    /// Caller passed an unusable identifier or name.
    InvalidArgument { message: String },
    /// Reading the upload source or writing the download sink failed.
    LocalIo { message: String },
    /// The blocking worker running the attempt died.
    Internal { message: String },
}

impl MtpError {
    /// Returns true if the handle that produced this error must be closed and never reused.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            Self::Framing { .. }
                | Self::Sync { .. }
                | Self::Transport { .. }
                | Self::PoisonedConnection { .. }
                | Self::SessionUnrecoverable { .. }
                | Self::Timeout { .. }
                | Self::Internal { .. }
        )
    }

    /// Returns true if this error says the handle was already closed.
    pub fn is_closed_connection(&self) -> bool {
        matches!(
            self,
            Self::PoisonedConnection { .. }
                | Self::Transport {
                    kind: TransportErrorKind::NotOpen,
                    ..
                }
        )
    }

    /// Returns the response code if the device rejected the operation.
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            Self::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    pub(crate) fn sync(message: impl Into<String>) -> Self {
        Self::Sync {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn local_io(context: &str, err: std::io::Error) -> Self {
        Self::LocalIo {
            message: format!("{context}: {err}"),
        }
    }

    /// Returns a user-friendly message for this error.
    pub fn user_message(&self) -> String {
        match self {
            Self::Framing { .. } | Self::Sync { .. } => {
                "The device sent an unexpected reply. Reconnect it and try again.".to_string()
            }
            Self::Protocol { code, .. } => match *code {
                ResponseCode::DEVICE_BUSY => "Device is busy. Wait a moment and try again.".to_string(),
                ResponseCode::STORE_FULL => "Device storage is full. Free up some space.".to_string(),
                ResponseCode::STORE_READ_ONLY | ResponseCode::OBJECT_WRITE_PROTECTED => {
                    "This storage is read-only. You can copy files from it, but not to it.".to_string()
                }
                ResponseCode::INVALID_OBJECT_HANDLE | ResponseCode::INVALID_PARENT_OBJECT => {
                    "File or folder not found. It may have been deleted.".to_string()
                }
                ResponseCode::ACCESS_DENIED => "Access denied. The device rejected the operation.".to_string(),
                _ => format!("Device reported an error: {}. Try reconnecting.", code),
            },
            Self::Transport { .. } | Self::PoisonedConnection { .. } => {
                "Lost connection to the device. Check the cable and unlock the device.".to_string()
            }
            Self::SessionUnrecoverable { .. } => {
                "Couldn't open a session with the device, even after resetting it. Reconnect it.".to_string()
            }
            Self::Cancelled { .. } => "The transfer was cancelled.".to_string(),
            Self::ShuttingDown => "The device bridge is shutting down.".to_string(),
            Self::Timeout { .. } => {
                "The operation timed out. The device may be slow or unresponsive. Try again.".to_string()
            }
            Self::InvalidArgument { message } => message.clone(),
            Self::LocalIo { message } => format!("Couldn't access the local file: {}", message),
            Self::Internal { message } => message.clone(),
        }
    }
}

impl std::fmt::Display for MtpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Framing { message } => write!(f, "Framing fault: {message}"),
            Self::Sync { message } => write!(f, "Sync fault: {message}"),
            Self::Protocol { code, operation } => write!(f, "{operation} failed: {code}"),
            Self::Transport { kind, message } => write!(f, "USB transfer failed ({kind:?}): {message}"),
            Self::PoisonedConnection { message } => write!(f, "Connection unusable: {message}"),
            Self::SessionUnrecoverable { message } => write!(f, "Session unrecoverable: {message}"),
            Self::Cancelled { task_id } => write!(f, "Task {task_id} cancelled"),
            Self::ShuttingDown => write!(f, "Bridge is shutting down"),
            Self::Timeout { operation, timeout_ms } => {
                write!(f, "{operation} timed out after {timeout_ms} ms")
            }
            Self::InvalidArgument { message } => write!(f, "Invalid argument: {message}"),
            Self::LocalIo { message } => write!(f, "Local I/O error: {message}"),
            Self::Internal { message } => write!(f, "Internal error: {message}"),
        }
    }
}

impl std::error::Error for MtpError {}

impl From<TransportError> for MtpError {
    fn from(e: TransportError) -> Self {
        if e.kind == TransportErrorKind::NotOpen {
            return Self::PoisonedConnection { message: e.message };
        }
        Self::Transport {
            kind: e.kind,
            message: e.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol(code: ResponseCode) -> MtpError {
        MtpError::Protocol {
            code,
            operation: OperationCode::GET_OBJECT,
        }
    }

    #[test]
    fn test_protocol_error_display() {
        let err = protocol(ResponseCode::INVALID_OBJECT_HANDLE);
        assert_eq!(err.to_string(), "GetObject failed: InvalidObjectHandle");
        assert_eq!(err.response_code(), Some(ResponseCode::INVALID_OBJECT_HANDLE));
    }

    #[test]
    fn test_fatal_errors_poison_connection() {
        assert!(MtpError::sync("transaction ID mismatch").poisons_connection());
        assert!(MtpError::framing("short header").poisons_connection());
        assert!(
            MtpError::Transport {
                kind: TransportErrorKind::Io,
                message: "LIBUSB_ERROR_IO".to_string(),
            }
            .poisons_connection()
        );
    }

    #[test]
    fn test_ordinary_errors_keep_connection() {
        assert!(!protocol(ResponseCode::STORE_FULL).poisons_connection());
        assert!(
            !MtpError::Cancelled {
                task_id: "t1".to_string()
            }
            .poisons_connection()
        );
        assert!(!MtpError::invalid_argument("zero id").poisons_connection());
        assert!(!MtpError::ShuttingDown.poisons_connection());
    }

    #[test]
    fn test_not_open_transport_error_becomes_poisoned_connection() {
        let err: MtpError = TransportError::not_open().into();
        assert!(matches!(err, MtpError::PoisonedConnection { .. }));
        assert!(err.is_closed_connection());

        let err: MtpError = TransportError::timeout().into();
        assert!(matches!(
            err,
            MtpError::Transport {
                kind: TransportErrorKind::Timeout,
                ..
            }
        ));
        assert!(!err.is_closed_connection());
    }

    #[test]
    fn test_user_messages() {
        assert!(protocol(ResponseCode::DEVICE_BUSY).user_message().contains("busy"));
        assert!(protocol(ResponseCode::STORE_FULL).user_message().contains("full"));
        assert!(protocol(ResponseCode(0xa801)).user_message().contains("RetCode 0xa801"));
        assert!(
            MtpError::Cancelled {
                task_id: "t1".to_string()
            }
            .user_message()
            .contains("cancelled")
        );
    }

    #[test]
    fn test_error_serialization() {
        let err = MtpError::Cancelled {
            task_id: "transfer-1".to_string(),
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"type\":\"cancelled\""), "JSON: {}", json);
        assert!(json.contains("\"task_id\":\"transfer-1\""), "JSON: {}", json);

        let json = serde_json::to_string(&protocol(ResponseCode::STORE_FULL)).unwrap();
        assert!(json.contains("\"type\":\"protocol\""), "JSON: {}", json);
        assert!(json.contains("\"code\":8204"), "JSON: {}", json);
    }

    #[test]
    fn test_all_error_variants_display() {
        let errors = vec![
            MtpError::framing("x"),
            MtpError::sync("x"),
            protocol(ResponseCode::GENERAL_ERROR),
            MtpError::Transport {
                kind: TransportErrorKind::Busy,
                message: "x".to_string(),
            },
            MtpError::PoisonedConnection {
                message: "x".to_string(),
            },
            MtpError::SessionUnrecoverable {
                message: "x".to_string(),
            },
            MtpError::Cancelled {
                task_id: "x".to_string(),
            },
            MtpError::ShuttingDown,
            MtpError::Timeout {
                operation: "download".to_string(),
                timeout_ms: 10,
            },
            MtpError::invalid_argument("x"),
            MtpError::LocalIo {
                message: "x".to_string(),
            },
            MtpError::Internal {
                message: "x".to_string(),
            },
        ];

        for err in errors {
            assert!(!err.to_string().is_empty());
            assert!(!err.user_message().is_empty());
        }
    }
}
