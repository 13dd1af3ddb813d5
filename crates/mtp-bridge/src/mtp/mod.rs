//! MTP (Media Transfer Protocol) over USB bulk transfers.
//!
//! # Architecture
//!
//! - `container`: Command/Data/Response container framing
//! - `transaction`: One operation end to end, including chunked data phases
//! - `session`: Opening and recovering a session on a handle
//! - `device`: An opened handle with one method per MTP primitive
//! - `connection`: Pool, retries, cancellation, and the host-facing operations
//! - `types`: Payloads for the host binding layer
//!
//! The USB layer itself lives behind [`transport::UsbTransport`].

pub mod codes;
pub mod connection;
pub mod container;
pub mod dataset;
pub mod device;
pub mod errors;
pub mod ids;
pub mod session;
pub mod transaction;
pub mod transport;
pub mod types;
#[cfg(any(test, feature = "virtual-device"))]
pub mod virtual_device;


pub use codes::{ContainerKind, OperationCode, ResponseCode, object_format};
pub use connection::{CancellationRegistry, Download, MtpConnectionManager, ProgressCallback};
pub use device::{MtpDevice, ObjectLocation};
pub use errors::MtpError;
pub use ids::{ObjectId, ParentId, StorageId};
pub use transport::{DeviceOpener, Endpoint, TransportError, TransportErrorKind, UsbTransport};
pub use types::{MtpDeviceSummary, MtpFileEntry, MtpOperationResult, MtpStorageInfo, MtpTransferProgress, MtpTransferType};
