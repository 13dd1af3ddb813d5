//! Host-facing payload types.
//!
//! These derive `Serialize` with camelCase names so the host binding layer can
//! hand them to its UI as-is.

use serde::{Deserialize, Serialize};

use super::dataset::{DeviceInfo, ObjectInfo, StorageInfo};
use super::ids::ObjectId;

/// A device found by a scan, with its storages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtpDeviceSummary {
    /// Manufacturer and model, for example "Samsung Galaxy S23".
    pub display_name: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    /// For example "1.0".
    pub mtp_version: String,
    pub device_version: String,
    pub vendor_extension: String,
    pub storages: Vec<MtpStorageInfo>,
}

impl MtpDeviceSummary {
    pub fn new(info: &DeviceInfo, storages: Vec<MtpStorageInfo>) -> Self {
        Self {
            display_name: display_name(&info.manufacturer, &info.model),
            manufacturer: info.manufacturer.clone(),
            model: info.model.clone(),
            serial_number: info.serial_number.clone(),
            mtp_version: info.mtp_version(),
            device_version: info.device_version.clone(),
            vendor_extension: info.vendor_extension_desc.clone(),
            storages,
        }
    }
}

/// Prefixes the manufacturer unless the model already names it.
pub fn display_name(manufacturer: &str, model: &str) -> String {
    if manufacturer.is_empty() || model.to_lowercase().contains(&manufacturer.to_lowercase()) {
        return model.to_string();
    }
    if model.is_empty() {
        return manufacturer.to_string();
    }
    format!("{} {}", manufacturer, model)
}

/// Information about a storage area on an MTP device.
///
/// Android devices typically have one or more storages: "Internal shared storage", "SD card", etc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtpStorageInfo {
    pub id: u32,
    pub description: String,
    /// In bytes.
    pub max_capacity: u64,
    /// In bytes.
    pub free_space: u64,
    pub is_read_only: bool,
}

impl MtpStorageInfo {
    pub fn new(id: u32, info: &StorageInfo) -> Self {
        Self {
            id,
            description: info.storage_description.clone(),
            max_capacity: info.max_capacity,
            free_space: info.free_space_bytes,
            is_read_only: info.is_read_only(),
        }
    }
}

/// A file or folder on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtpFileEntry {
    pub id: u32,
    pub parent_id: u32,
    pub storage_id: u32,
    pub name: String,
    /// 0xFFFFFFFF for files of 4 GiB and up (the dataset field is 32-bit).
    pub size: u64,
    pub is_folder: bool,
    /// Unix seconds, 0 if the device didn't report a date.
    pub mod_time: i64,
}

impl MtpFileEntry {
    pub fn new(id: ObjectId, info: &ObjectInfo) -> Self {
        Self {
            id: id.raw(),
            parent_id: info.parent_object,
            storage_id: info.storage_id,
            name: info.filename.clone(),
            size: u64::from(info.compressed_size),
            is_folder: info.is_folder(),
            mod_time: info
                .modification_date
                .map(|d| d.and_utc().timestamp())
                .unwrap_or(0),
        }
    }
}

/// Progress of a download or upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtpTransferProgress {
    pub task_id: String,
    pub transfer_type: MtpTransferType,
    /// Name of the object being transferred.
    pub current_file: String,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MtpTransferType {
    Download,
    Upload,
}

/// Result of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MtpOperationResult {
    pub task_id: String,
    /// Handle of the object that was downloaded or created.
    pub object_id: u32,
    pub bytes_transferred: u64,
}
