//! MTP/PTP code tables: container kinds, operation codes, response codes, and object formats.
//!
//! Codes are newtypes over the raw `u16` so unknown vendor codes round-trip unchanged.

use serde::Serialize;
use std::fmt;

/// USB container type field of the bulk container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContainerKind {
    Undefined,
    Command,
    Data,
    Response,
    Event,
}

impl ContainerKind {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Self::Command,
            2 => Self::Data,
            3 => Self::Response,
            4 => Self::Event,
            _ => Self::Undefined,
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Self::Undefined => 0,
            Self::Command => 1,
            Self::Data => 2,
            Self::Response => 3,
            Self::Event => 4,
        }
    }
}

/// MTP operation code (the `Code` field of Command and Data containers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct OperationCode(pub u16);

impl OperationCode {
    pub const GET_DEVICE_INFO: Self = Self(0x1001);
    pub const OPEN_SESSION: Self = Self(0x1002);
    pub const CLOSE_SESSION: Self = Self(0x1003);
    pub const GET_STORAGE_IDS: Self = Self(0x1004);
    pub const GET_STORAGE_INFO: Self = Self(0x1005);
    pub const GET_NUM_OBJECTS: Self = Self(0x1006);
    pub const GET_OBJECT_HANDLES: Self = Self(0x1007);
    pub const GET_OBJECT_INFO: Self = Self(0x1008);
    pub const GET_OBJECT: Self = Self(0x1009);
    pub const DELETE_OBJECT: Self = Self(0x100B);
    pub const SEND_OBJECT_INFO: Self = Self(0x100C);
    pub const SEND_OBJECT: Self = Self(0x100D);

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::GET_DEVICE_INFO => "GetDeviceInfo",
            Self::OPEN_SESSION => "OpenSession",
            Self::CLOSE_SESSION => "CloseSession",
            Self::GET_STORAGE_IDS => "GetStorageIDs",
            Self::GET_STORAGE_INFO => "GetStorageInfo",
            Self::GET_NUM_OBJECTS => "GetNumObjects",
            Self::GET_OBJECT_HANDLES => "GetObjectHandles",
            Self::GET_OBJECT_INFO => "GetObjectInfo",
            Self::GET_OBJECT => "GetObject",
            Self::DELETE_OBJECT => "DeleteObject",
            Self::SEND_OBJECT_INFO => "SendObjectInfo",
            Self::SEND_OBJECT => "SendObject",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for OperationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Operation 0x{:04x}", self.0),
        }
    }
}

/// MTP response code (the `Code` field of Response containers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ResponseCode(pub u16);

impl ResponseCode {
    pub const OK: Self = Self(0x2001);
    pub const GENERAL_ERROR: Self = Self(0x2002);
    pub const SESSION_NOT_OPEN: Self = Self(0x2003);
    pub const INVALID_TRANSACTION_ID: Self = Self(0x2004);
    pub const OPERATION_NOT_SUPPORTED: Self = Self(0x2005);
    pub const PARAMETER_NOT_SUPPORTED: Self = Self(0x2006);
    pub const INCOMPLETE_TRANSFER: Self = Self(0x2007);
    pub const INVALID_STORAGE_ID: Self = Self(0x2008);
    pub const INVALID_OBJECT_HANDLE: Self = Self(0x2009);
    pub const STORE_FULL: Self = Self(0x200C);
    pub const OBJECT_WRITE_PROTECTED: Self = Self(0x200D);
    pub const STORE_READ_ONLY: Self = Self(0x200E);
    pub const ACCESS_DENIED: Self = Self(0x200F);
    pub const PARTIAL_DELETION: Self = Self(0x2012);
    pub const STORE_NOT_AVAILABLE: Self = Self(0x2013);
    pub const NO_VALID_OBJECT_INFO: Self = Self(0x2015);
    pub const DEVICE_BUSY: Self = Self(0x2019);
    pub const INVALID_PARENT_OBJECT: Self = Self(0x201A);
    pub const INVALID_PARAMETER: Self = Self(0x201D);
    pub const SESSION_ALREADY_OPEN: Self = Self(0x201E);
    pub const TRANSACTION_CANCELLED: Self = Self(0x201F);

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::OK => "OK",
            Self::GENERAL_ERROR => "GeneralError",
            Self::SESSION_NOT_OPEN => "SessionNotOpen",
            Self::INVALID_TRANSACTION_ID => "InvalidTransactionID",
            Self::OPERATION_NOT_SUPPORTED => "OperationNotSupported",
            Self::PARAMETER_NOT_SUPPORTED => "ParameterNotSupported",
            Self::INCOMPLETE_TRANSFER => "IncompleteTransfer",
            Self::INVALID_STORAGE_ID => "InvalidStorageID",
            Self::INVALID_OBJECT_HANDLE => "InvalidObjectHandle",
            Self::STORE_FULL => "StoreFull",
            Self::OBJECT_WRITE_PROTECTED => "ObjectWriteProtected",
            Self::STORE_READ_ONLY => "StoreReadOnly",
            Self::ACCESS_DENIED => "AccessDenied",
            Self::PARTIAL_DELETION => "PartialDeletion",
            Self::STORE_NOT_AVAILABLE => "StoreNotAvailable",
            Self::NO_VALID_OBJECT_INFO => "NoValidObjectInfo",
            Self::DEVICE_BUSY => "DeviceBusy",
            Self::INVALID_PARENT_OBJECT => "InvalidParentObject",
            Self::INVALID_PARAMETER => "InvalidParameter",
            Self::SESSION_ALREADY_OPEN => "SessionAlreadyOpen",
            Self::TRANSACTION_CANCELLED => "TransactionCancelled",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "RetCode 0x{:04x}", self.0),
        }
    }
}

/// Object format codes used when creating objects.
pub mod object_format {
    /// Generic file ("Undefined" in the PTP table).
    pub const GENERIC_FILE: u16 = 0x3000;
    /// Association, i.e. a folder.
    pub const FOLDER: u16 = 0x3001;
}

/// Association type for generic folders.
pub const ASSOCIATION_GENERIC_FOLDER: u16 = 0x0001;
