//! MTP file transfer operations (download and upload).
//!
//! Both directions stream in chunks through caller-supplied sinks and sources.
//! The factories are called once per attempt, so a retry starts from a fresh
//! sink or source instead of appending to a half-written one.

use chrono::Local;
use log::{debug, info, warn};
use std::io::{self, Read, Write};
use std::sync::Mutex;

use super::retry::CallContext;
use super::{MtpConnectionManager, ProgressCallback};
use crate::config::CallClass;
use crate::ignore_poison::IgnorePoison;
use crate::mtp::dataset::ObjectInfo;
use crate::mtp::device::MtpDevice;
use crate::mtp::errors::MtpError;
use crate::mtp::ids::{ObjectId, ParentId, StorageId};
use crate::mtp::transport::{DeviceOpener, UsbTransport};
use crate::mtp::types::{MtpOperationResult, MtpTransferProgress, MtpTransferType};

use super::mutation_ops::validate_name;

/// A finished download: the result payload and the sink the bytes went into.
pub struct Download<W> {
    pub result: MtpOperationResult,
    pub sink: W,
}

impl<O: DeviceOpener> MtpConnectionManager<O> {
    /// Downloads an object into a sink made by `sink_factory`.
    ///
    /// The object's info is read first, for its name and size. On failure the
    /// caller must discard whatever the sink received; no partial result is kept.
    pub async fn download<W, F>(
        &self,
        object_id: u32,
        task_id: &str,
        sink_factory: F,
        progress: Option<ProgressCallback>,
    ) -> Result<Download<W>, MtpError>
    where
        W: Write + Send + 'static,
        F: FnMut() -> io::Result<W> + Send + 'static,
    {
        let id = ObjectId::new(object_id)?;
        let large_file_threshold = self.config.limits.large_file_threshold;
        let sink_factory = Mutex::new(sink_factory);

        debug!("MTP download: object {}, task {}", id, task_id);
        let (bytes, sink) = self
            .with_device(CallClass::Download, "download", Some(task_id), move |device, ctx| {
                let info = device.get_object_info(id.raw())?;
                if info.is_folder() {
                    return Err(MtpError::invalid_argument(format!(
                        "object {} is a folder and can't be downloaded",
                        id
                    )));
                }
                let total = u64::from(info.compressed_size);
                if total > large_file_threshold {
                    info!("MTP download: large file {} ({} bytes)", info.filename, total);
                }

                let mut sink = {
                    let mut make_sink = sink_factory.lock_ignore_poison();
                    (*make_sink)().map_err(|e| MtpError::local_io("opening download destination", e))?
                };
                let mut report = reporter(ctx, progress.as_ref(), MtpTransferType::Download, &info.filename, total);
                let bytes = device.get_object(id.raw(), &mut sink, &mut report)?;
                sink.flush()
                    .map_err(|e| MtpError::local_io("flushing download destination", e))?;
                Ok((bytes, sink))
            })
            .await?;

        info!("MTP download complete: object {} ({} bytes)", id, bytes);
        Ok(Download {
            result: MtpOperationResult {
                task_id: task_id.to_string(),
                object_id: id.raw(),
                bytes_transferred: bytes,
            },
            sink,
        })
    }

    /// Uploads `size` bytes from a source made by `source_factory` as a new file
    /// named `name` under `parent` (`0xFFFFFFFF` for the storage root).
    ///
    /// Returns the new object's handle in the result.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload<R, F>(
        &self,
        storage_id: u32,
        parent: u32,
        name: &str,
        size: u64,
        task_id: &str,
        source_factory: F,
        progress: Option<ProgressCallback>,
    ) -> Result<MtpOperationResult, MtpError>
    where
        R: Read + Send + 'static,
        F: FnMut() -> io::Result<R> + Send + 'static,
    {
        let storage = StorageId::new(storage_id)?;
        let parent = ParentId::new(parent)?;
        validate_name(name, self.config.limits.max_name_length)?;
        let max_file_size = self.config.limits.max_file_size;
        if size > max_file_size {
            return Err(MtpError::invalid_argument(format!(
                "{} is {} bytes; files over {} bytes can't be uploaded",
                name, size, max_file_size
            )));
        }

        let name = name.to_string();
        let source_factory = Mutex::new(source_factory);
        debug!("MTP upload: {} ({} bytes) to {} on storage {}, task {}", name, size, parent, storage, task_id);

        let handle = self
            .with_device(CallClass::Normal, "upload", Some(task_id), move |device, ctx| {
                ctx.checkpoint()?;
                let mut info = ObjectInfo::new_file(storage.raw(), parent.raw(), &name, size);
                info.modification_date = Some(Local::now().naive_local());
                let location = device.send_object_info(&info)?;

                if let Err(e) = ctx.checkpoint() {
                    discard_announced(device, location.handle);
                    return Err(e);
                }
                let mut source = {
                    let mut make_source = source_factory.lock_ignore_poison();
                    match (*make_source)() {
                        Ok(source) => source,
                        Err(e) => {
                            discard_announced(device, location.handle);
                            return Err(MtpError::local_io("opening upload source", e));
                        }
                    }
                };

                let mut report = reporter(ctx, progress.as_ref(), MtpTransferType::Upload, &name, size);
                if let Err(e) = device.send_object(&mut source, size, &mut report) {
                    // The device took every byte and then refused them; the announced object is still there.
                    if matches!(e, MtpError::Protocol { .. }) {
                        discard_announced(device, location.handle);
                    }
                    return Err(e);
                }
                Ok(location.handle)
            })
            .await?;

        info!("MTP upload complete: object {} ({} bytes)", handle, size);
        Ok(MtpOperationResult {
            task_id: task_id.to_string(),
            object_id: handle,
            bytes_transferred: size,
        })
    }
}

/// Progress callback for one transfer: checks cancellation and the attempt
/// deadline, then tells the host.
fn reporter<'a>(
    ctx: &'a CallContext,
    progress: Option<&'a ProgressCallback>,
    transfer_type: MtpTransferType,
    file_name: &'a str,
    bytes_total: u64,
) -> impl FnMut(u64) -> Result<(), MtpError> + 'a {
    move |bytes_done| {
        ctx.checkpoint()?;
        if let Some(progress) = progress {
            progress(&MtpTransferProgress {
                task_id: ctx.task_id().to_string(),
                transfer_type,
                current_file: file_name.to_string(),
                bytes_done,
                bytes_total,
            });
        }
        Ok(())
    }
}

/// Deletes an object announced by SendObjectInfo whose content never arrived.
fn discard_announced<T: UsbTransport>(device: &mut MtpDevice<T>, handle: u32) {
    if !device.is_open() {
        return;
    }
    match device.delete_object(handle) {
        Ok(()) => debug!("MTP upload: removed unfinished object {}", handle),
        Err(e) => warn!("MTP upload: couldn't remove unfinished object {}: {}", handle, e),
    }
}
