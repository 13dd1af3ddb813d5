//! Validated storage, object, and parent identifiers.
//!
//! Hosts pass raw `u32`s. They are checked here, before any device is touched.

use serde::Serialize;
use std::fmt;

use super::errors::MtpError;

/// A storage on the device. Zero is never a valid storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct StorageId(u32);

/// An object (file or folder) on the device. Zero is never a valid object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ObjectId(u32);

/// The folder an object lives in, or the storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ParentId(u32);

impl StorageId {
    pub fn new(raw: u32) -> Result<Self, MtpError> {
        if raw == 0 {
            return Err(MtpError::invalid_argument("invalid storage ID: 0"));
        }
        Ok(Self(raw))
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl ObjectId {
    pub fn new(raw: u32) -> Result<Self, MtpError> {
        if raw == 0 {
            return Err(MtpError::invalid_argument("invalid object ID: 0"));
        }
        Ok(Self(raw))
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl ParentId {
    /// Sentinel the protocol uses for "top level of the storage".
    pub const ROOT: Self = Self(0xFFFF_FFFF);

    pub fn new(raw: u32) -> Result<Self, MtpError> {
        if raw == 0 {
            return Err(MtpError::invalid_argument("invalid parent ID: 0"));
        }
        Ok(Self(raw))
    }

    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl From<ObjectId> for ParentId {
    fn from(id: ObjectId) -> Self {
        Self(id.0)
    }
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("root")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
