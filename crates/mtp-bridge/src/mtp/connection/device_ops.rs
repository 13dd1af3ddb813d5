//! Device-level operations: discovery, identity, storages, liveness.

use log::{debug, info, warn};

use super::MtpConnectionManager;
use crate::config::CallClass;
use crate::mtp::dataset::DeviceInfo;
use crate::mtp::device::MtpDevice;
use crate::mtp::errors::MtpError;
use crate::mtp::ids::StorageId;
use crate::mtp::transport::{DeviceOpener, UsbTransport};
use crate::mtp::types::{MtpDeviceSummary, MtpStorageInfo};

impl<O: DeviceOpener> MtpConnectionManager<O> {
    /// Finds the device and describes it, storages included.
    ///
    /// A device that answers DeviceInfo but fails to list its storages (locked
    /// phones do this) is still reported, with no storages.
    pub async fn scan(&self) -> Result<Vec<MtpDeviceSummary>, MtpError> {
        let summary = self
            .with_device(CallClass::Quick, "scan", None, |device, _| {
                let info = device.get_device_info()?;
                let storages = read_storages(device).unwrap_or_else(|e| {
                    warn!("MTP scan: couldn't read storages of {}: {}", info.model, e);
                    Vec::new()
                });
                Ok(MtpDeviceSummary::new(&info, storages))
            })
            .await?;
        info!(
            "MTP scan found {} (MTP {}, {} storage(s))",
            summary.display_name,
            summary.mtp_version,
            summary.storages.len()
        );
        Ok(vec![summary])
    }

    pub async fn device_info(&self) -> Result<DeviceInfo, MtpError> {
        self.with_device(CallClass::Quick, "device_info", None, |device, _| device.get_device_info())
            .await
    }

    pub async fn storages(&self) -> Result<Vec<MtpStorageInfo>, MtpError> {
        self.with_device(CallClass::Quick, "storages", None, |device, _| read_storages(device))
            .await
    }

    pub async fn storage_info(&self, storage_id: u32) -> Result<MtpStorageInfo, MtpError> {
        let storage = StorageId::new(storage_id)?;
        self.with_device(CallClass::Normal, "storage_info", None, move |device, _| {
            let info = device.get_storage_info(storage.raw())?;
            Ok(MtpStorageInfo::new(storage.raw(), &info))
        })
        .await
    }

    /// Re-reads a storage's capacity and free space, for example after a transfer.
    pub async fn refresh_storage(&self, storage_id: u32) -> Result<MtpStorageInfo, MtpError> {
        let info = self.storage_info(storage_id).await?;
        debug!(
            "MTP storage {} refreshed: {} of {} bytes free",
            info.id, info.free_space, info.max_capacity
        );
        Ok(info)
    }

    /// Round-trips DeviceInfo to check the device still answers.
    pub async fn check_connection(&self) -> Result<(), MtpError> {
        self.with_device(CallClass::Normal, "check_connection", None, |device, _| device.probe())
            .await
    }
}

fn read_storages<T: UsbTransport>(device: &mut MtpDevice<T>) -> Result<Vec<MtpStorageInfo>, MtpError> {
    let ids = device.get_storage_ids()?;
    let mut storages = Vec::with_capacity(ids.len());
    for id in ids {
        let info = device.get_storage_info(id)?;
        storages.push(MtpStorageInfo::new(id, &info));
    }
    Ok(storages)
}
