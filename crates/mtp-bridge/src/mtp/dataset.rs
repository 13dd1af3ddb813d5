//! MTP dataset encoding: DeviceInfo, StorageInfo, ObjectInfo, arrays, strings, and dates.
//!
//! All multi-byte fields are little-endian. Strings are a `u8` count of UTF-16
//! code units (including the terminating null, 0 for the empty string)
//! followed by the units. Dates are strings of the form `YYYYMMDDThhmmss`,
//! optionally followed by tenths of a second and a zone suffix, which we ignore.

use bytes::{Buf, BufMut};
use chrono::NaiveDateTime;
use serde::Serialize;

use super::codes::{ASSOCIATION_GENERIC_FOLDER, object_format};
use super::errors::MtpError;

const DATE_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Longest string a dataset can carry, in UTF-16 units, excluding the null.
pub const MAX_STRING_UNITS: usize = 254;

/// Bounds-checked little-endian reader over a dataset payload.
pub struct DatasetReader<'a> {
    buf: &'a [u8],
    what: &'static str,
}

impl<'a> DatasetReader<'a> {
    pub fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, what }
    }

    fn need(&self, n: usize) -> Result<(), MtpError> {
        if self.buf.remaining() < n {
            return Err(MtpError::framing(format!(
                "{} truncated: need {} more bytes, have {}",
                self.what,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn u8(&mut self) -> Result<u8, MtpError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self) -> Result<u16, MtpError> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self) -> Result<u32, MtpError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self) -> Result<u64, MtpError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn u16_array(&mut self) -> Result<Vec<u16>, MtpError> {
        let count = self.u32()? as usize;
        self.need(count.saturating_mul(2))?;
        Ok((0..count).map(|_| self.buf.get_u16_le()).collect())
    }

    pub fn u32_array(&mut self) -> Result<Vec<u32>, MtpError> {
        let count = self.u32()? as usize;
        self.need(count.saturating_mul(4))?;
        Ok((0..count).map(|_| self.buf.get_u32_le()).collect())
    }

    pub fn string(&mut self) -> Result<String, MtpError> {
        let units = self.u8()? as usize;
        self.need(units * 2)?;
        let mut chars: Vec<u16> = (0..units).map(|_| self.buf.get_u16_le()).collect();
        while chars.last() == Some(&0) {
            chars.pop();
        }
        Ok(String::from_utf16_lossy(&chars))
    }

    /// Reads a date string. Empty or unparseable dates are `None`.
    pub fn date(&mut self) -> Result<Option<NaiveDateTime>, MtpError> {
        Ok(parse_date(&self.string()?))
    }
}

fn parse_date(s: &str) -> Option<NaiveDateTime> {
    let stamp = s.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, DATE_FORMAT).ok()
}

/// Appends an MTP string. Fails if it doesn't fit the `u8` length prefix.
pub fn put_string(out: &mut Vec<u8>, s: &str) -> Result<(), MtpError> {
    if s.is_empty() {
        out.put_u8(0);
        return Ok(());
    }
    let units: Vec<u16> = s.encode_utf16().collect();
    if units.len() > MAX_STRING_UNITS {
        return Err(MtpError::invalid_argument(format!(
            "name is too long for the device ({} UTF-16 units, max {})",
            units.len(),
            MAX_STRING_UNITS
        )));
    }
    out.put_u8((units.len() + 1) as u8);
    for unit in units {
        out.put_u16_le(unit);
    }
    out.put_u16_le(0);
    Ok(())
}

fn put_date(out: &mut Vec<u8>, date: Option<NaiveDateTime>) -> Result<(), MtpError> {
    match date {
        Some(date) => put_string(out, &date.format(DATE_FORMAT).to_string()),
        None => put_string(out, ""),
    }
}

/// Decodes a `u32` array payload (storage ids, object handles).
pub fn decode_u32_array(bytes: &[u8]) -> Result<Vec<u32>, MtpError> {
    DatasetReader::new(bytes, "u32 array").u32_array()
}

// ============================================================================
// DeviceInfo
// ============================================================================

/// The DeviceInfo dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub standard_version: u16,
    pub vendor_extension_id: u32,
    pub vendor_extension_version: u16,
    pub vendor_extension_desc: String,
    pub functional_mode: u16,
    pub operations_supported: Vec<u16>,
    pub events_supported: Vec<u16>,
    pub device_properties_supported: Vec<u16>,
    pub capture_formats: Vec<u16>,
    pub playback_formats: Vec<u16>,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
}

impl DeviceInfo {
    pub fn decode(bytes: &[u8]) -> Result<Self, MtpError> {
        let mut r = DatasetReader::new(bytes, "DeviceInfo");
        Ok(Self {
            standard_version: r.u16()?,
            vendor_extension_id: r.u32()?,
            vendor_extension_version: r.u16()?,
            vendor_extension_desc: r.string()?,
            functional_mode: r.u16()?,
            operations_supported: r.u16_array()?,
            events_supported: r.u16_array()?,
            device_properties_supported: r.u16_array()?,
            capture_formats: r.u16_array()?,
            playback_formats: r.u16_array()?,
            manufacturer: r.string()?,
            model: r.string()?,
            device_version: r.string()?,
            serial_number: r.string()?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, MtpError> {
        let mut out = Vec::new();
        out.put_u16_le(self.standard_version);
        out.put_u32_le(self.vendor_extension_id);
        out.put_u16_le(self.vendor_extension_version);
        put_string(&mut out, &self.vendor_extension_desc)?;
        out.put_u16_le(self.functional_mode);
        for array in [
            &self.operations_supported,
            &self.events_supported,
            &self.device_properties_supported,
            &self.capture_formats,
            &self.playback_formats,
        ] {
            out.put_u32_le(array.len() as u32);
            for code in array {
                out.put_u16_le(*code);
            }
        }
        put_string(&mut out, &self.manufacturer)?;
        put_string(&mut out, &self.model)?;
        put_string(&mut out, &self.device_version)?;
        put_string(&mut out, &self.serial_number)?;
        Ok(out)
    }

    /// MTP version as "major.minor" (standard version 100 is "1.0").
    pub fn mtp_version(&self) -> String {
        format!("{}.{}", self.standard_version / 100, (self.standard_version % 100) / 10)
    }

    pub fn supports_operation(&self, code: u16) -> bool {
        self.operations_supported.contains(&code)
    }
}

// ============================================================================
// StorageInfo
// ============================================================================

/// The StorageInfo dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub storage_type: u16,
    pub filesystem_type: u16,
    pub access_capability: u16,
    pub max_capacity: u64,
    pub free_space_bytes: u64,
    pub free_space_objects: u32,
    pub storage_description: String,
    pub volume_identifier: String,
}

impl StorageInfo {
    pub fn decode(bytes: &[u8]) -> Result<Self, MtpError> {
        let mut r = DatasetReader::new(bytes, "StorageInfo");
        Ok(Self {
            storage_type: r.u16()?,
            filesystem_type: r.u16()?,
            access_capability: r.u16()?,
            max_capacity: r.u64()?,
            free_space_bytes: r.u64()?,
            free_space_objects: r.u32()?,
            storage_description: r.string()?,
            volume_identifier: r.string()?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, MtpError> {
        let mut out = Vec::new();
        out.put_u16_le(self.storage_type);
        out.put_u16_le(self.filesystem_type);
        out.put_u16_le(self.access_capability);
        out.put_u64_le(self.max_capacity);
        out.put_u64_le(self.free_space_bytes);
        out.put_u32_le(self.free_space_objects);
        put_string(&mut out, &self.storage_description)?;
        put_string(&mut out, &self.volume_identifier)?;
        Ok(out)
    }

    /// Access capability 0 is read-write; 1 and 2 are read-only variants.
    pub fn is_read_only(&self) -> bool {
        self.access_capability != 0
    }
}

// ============================================================================
// ObjectInfo
// ============================================================================

/// The ObjectInfo dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    pub storage_id: u32,
    pub object_format: u16,
    pub protection_status: u16,
    /// Object size, or `0xFFFFFFFF` for objects of 4 GiB and up.
    pub compressed_size: u32,
    pub thumb_format: u16,
    pub thumb_compressed_size: u32,
    pub thumb_pix_width: u32,
    pub thumb_pix_height: u32,
    pub image_pix_width: u32,
    pub image_pix_height: u32,
    pub image_bit_depth: u32,
    pub parent_object: u32,
    pub association_type: u16,
    pub association_desc: u32,
    pub sequence_number: u32,
    pub filename: String,
    pub capture_date: Option<NaiveDateTime>,
    pub modification_date: Option<NaiveDateTime>,
    pub keywords: String,
}

impl ObjectInfo {
    /// ObjectInfo for a new file of `size` bytes.
    pub fn new_file(storage_id: u32, parent: u32, name: &str, size: u64) -> Self {
        Self {
            storage_id,
            object_format: object_format::GENERIC_FILE,
            compressed_size: u32::try_from(size).unwrap_or(u32::MAX),
            parent_object: parent,
            filename: name.to_string(),
            ..Self::default()
        }
    }

    /// ObjectInfo for a new folder.
    pub fn new_folder(storage_id: u32, parent: u32, name: &str) -> Self {
        Self {
            storage_id,
            object_format: object_format::FOLDER,
            parent_object: parent,
            association_type: ASSOCIATION_GENERIC_FOLDER,
            filename: name.to_string(),
            ..Self::default()
        }
    }

    pub fn is_folder(&self) -> bool {
        self.object_format == object_format::FOLDER
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MtpError> {
        let mut r = DatasetReader::new(bytes, "ObjectInfo");
        Ok(Self {
            storage_id: r.u32()?,
            object_format: r.u16()?,
            protection_status: r.u16()?,
            compressed_size: r.u32()?,
            thumb_format: r.u16()?,
            thumb_compressed_size: r.u32()?,
            thumb_pix_width: r.u32()?,
            thumb_pix_height: r.u32()?,
            image_pix_width: r.u32()?,
            image_pix_height: r.u32()?,
            image_bit_depth: r.u32()?,
            parent_object: r.u32()?,
            association_type: r.u16()?,
            association_desc: r.u32()?,
            sequence_number: r.u32()?,
            filename: r.string()?,
            capture_date: r.date()?,
            modification_date: r.date()?,
            keywords: r.string()?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, MtpError> {
        let mut out = Vec::new();
        out.put_u32_le(self.storage_id);
        out.put_u16_le(self.object_format);
        out.put_u16_le(self.protection_status);
        out.put_u32_le(self.compressed_size);
        out.put_u16_le(self.thumb_format);
        out.put_u32_le(self.thumb_compressed_size);
        out.put_u32_le(self.thumb_pix_width);
        out.put_u32_le(self.thumb_pix_height);
        out.put_u32_le(self.image_pix_width);
        out.put_u32_le(self.image_pix_height);
        out.put_u32_le(self.image_bit_depth);
        out.put_u32_le(self.parent_object);
        out.put_u16_le(self.association_type);
        out.put_u32_le(self.association_desc);
        out.put_u32_le(self.sequence_number);
        put_string(&mut out, &self.filename)?;
        put_date(&mut out, self.capture_date)?;
        put_date(&mut out, self.modification_date)?;
        put_string(&mut out, &self.keywords)?;
        Ok(out)
    }
}
