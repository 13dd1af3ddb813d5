//! MTP mutation operations (create folder, delete).

use log::{debug, info};

use super::MtpConnectionManager;
use crate::config::CallClass;
use crate::mtp::dataset::ObjectInfo;
use crate::mtp::errors::MtpError;
use crate::mtp::ids::{ObjectId, ParentId, StorageId};
use crate::mtp::transport::DeviceOpener;

/// Checks a new file or folder name before anything is sent to the device.
pub(super) fn validate_name(name: &str, max_length: usize) -> Result<(), MtpError> {
    if name.is_empty() {
        return Err(MtpError::invalid_argument("name can't be empty"));
    }
    let length = name.chars().count();
    if length > max_length {
        return Err(MtpError::invalid_argument(format!(
            "name is {} characters long; the limit is {}",
            length, max_length
        )));
    }
    if name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(MtpError::invalid_argument(format!("invalid name: {:?}", name)));
    }
    Ok(())
}

impl<O: DeviceOpener> MtpConnectionManager<O> {
    /// Creates a folder under `parent` (`0xFFFFFFFF` for the storage root).
    ///
    /// Returns the new folder's object id.
    pub async fn create_folder(&self, storage_id: u32, parent: u32, name: &str) -> Result<u32, MtpError> {
        let storage = StorageId::new(storage_id)?;
        let parent = ParentId::new(parent)?;
        validate_name(name, self.config.limits.max_name_length)?;

        let info = ObjectInfo::new_folder(storage.raw(), parent.raw(), name);
        debug!("MTP create_folder: {} under {} on storage {}", name, parent, storage);
        let location = self
            .with_device(CallClass::Normal, "create_folder", None, move |device, _| {
                device.send_object_info(&info)
            })
            .await?;

        info!("MTP created folder {} (object {})", name, location.handle);
        Ok(location.handle)
    }

    /// Deletes an object. Folders are deleted with their contents.
    pub async fn delete_object(&self, object_id: u32) -> Result<(), MtpError> {
        let id = ObjectId::new(object_id)?;
        self.with_device(CallClass::Normal, "delete_object", None, move |device, _| {
            device.delete_object(id.raw())
        })
        .await?;
        info!("MTP deleted object {}", id);
        Ok(())
    }
}
