//! Directory browsing operations.

use log::{debug, warn};

use super::MtpConnectionManager;
use crate::config::CallClass;
use crate::mtp::errors::MtpError;
use crate::mtp::ids::{ObjectId, ParentId, StorageId};
use crate::mtp::transport::DeviceOpener;
use crate::mtp::types::MtpFileEntry;

impl<O: DeviceOpener> MtpConnectionManager<O> {
    /// Lists the objects directly under `parent` (`0xFFFFFFFF` for the storage root).
    ///
    /// Objects whose info can't be read are skipped with a warning instead of
    /// failing the whole listing.
    pub async fn list_files(&self, storage_id: u32, parent: u32) -> Result<Vec<MtpFileEntry>, MtpError> {
        let storage = StorageId::new(storage_id)?;
        let parent = ParentId::new(parent)?;

        let entries = self
            .with_device(CallClass::Normal, "list_files", None, move |device, _| {
                let handles = device.get_object_handles(storage.raw(), 0, parent.raw())?;
                let mut entries = Vec::with_capacity(handles.len());
                for handle in handles {
                    let Ok(id) = ObjectId::new(handle) else {
                        warn!("MTP list_files: device listed handle 0 under {}", parent);
                        continue;
                    };
                    match device.get_object_info(handle) {
                        Ok(info) => entries.push(MtpFileEntry::new(id, &info)),
                        Err(e) if e.poisons_connection() => return Err(e),
                        Err(e) => warn!("MTP list_files: skipping object {}: {}", handle, e),
                    }
                }
                Ok(entries)
            })
            .await?;

        debug!(
            "MTP list_files: {} entries under {} on storage {}",
            entries.len(),
            parent,
            storage
        );
        Ok(entries)
    }

    pub async fn object_info(&self, object_id: u32) -> Result<MtpFileEntry, MtpError> {
        let id = ObjectId::new(object_id)?;
        self.with_device(CallClass::Normal, "object_info", None, move |device, _| {
            let info = device.get_object_info(id.raw())?;
            Ok(MtpFileEntry::new(id, &info))
        })
        .await
    }
}
