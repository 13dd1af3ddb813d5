//! In-process virtual MTP device for end-to-end testing without hardware.
//!
//! [`VirtualDevice`] is a [`DeviceOpener`] over shared device state: storages,
//! an object tree, a device-side session, counters, and a queue of injected
//! faults. Each opened [`VirtualTransport`] speaks the wire protocol against
//! that state: it parses Command and Data containers written to the OUT
//! endpoint and queues Data/Response packets for the IN endpoint, packetized
//! to the max packet size the way a USB controller would deliver them.

use bytes::BufMut;
use chrono::NaiveDateTime;
use log::debug;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::codes::{ContainerKind, OperationCode, ResponseCode};
use super::container::{ContainerHeader, HEADER_LEN};
use super::dataset::{DatasetReader, DeviceInfo, ObjectInfo, StorageInfo};
use super::transport::{DeviceOpener, Endpoint, TransportError, TransportErrorKind, UsbTransport};
use crate::ignore_poison::IgnorePoison;

const DEFAULT_PACKET_SIZE: usize = 512;
const ROOT: u32 = 0xFFFF_FFFF;

/// A misbehavior to inject into the next matching command (or open).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The device never answers; the next read times out.
    Timeout,
    /// The command write fails with a busy error.
    Busy,
    /// The handle goes away: the command write fails with "not open".
    Disconnect,
    /// The command write fails with a generic I/O error.
    Io,
    /// The response echoes the wrong transaction id.
    WrongTransactionId,
    /// The response header claims to be a Command container.
    ResponseAsCommand,
    /// The operation is rejected with this code instead of running.
    Respond(ResponseCode),
    /// The response is delayed by this long.
    Stall(Duration),
    /// Opening a transport fails.
    FailOpen,
}

/// Wire-level quirks of real devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quirks {
    /// Sends the data header in its own packet.
    pub split_header: bool,
    /// Never sends a zero-length packet after a data phase that ends on a packet boundary.
    pub no_zero_length_packet: bool,
}

#[derive(Debug, Clone)]
struct FaultRule {
    operation: Option<OperationCode>,
    fault: Fault,
}

#[derive(Debug, Clone)]
struct VirtualStorage {
    info: StorageInfo,
}

#[derive(Debug, Clone)]
struct VirtualObject {
    storage_id: u32,
    /// 0 for objects at the storage root, as on real devices.
    parent: u32,
    name: String,
    is_folder: bool,
    data: Vec<u8>,
    modified: Option<NaiveDateTime>,
}

/// Counters observed by tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VirtualStats {
    pub opens: u32,
    pub closes: u32,
    pub resets: u32,
    pub sessions_opened: u32,
    pub commands: Vec<OperationCode>,
}

struct DeviceState {
    info: DeviceInfo,
    storages: BTreeMap<u32, VirtualStorage>,
    objects: BTreeMap<u32, VirtualObject>,
    next_handle: u32,
    session: Option<u32>,
    /// Handle announced by the last SendObjectInfo, waiting for SendObject.
    pending_send: Option<u32>,
    faults: Vec<FaultRule>,
    quirks: Quirks,
    packet_size: usize,
    stats: VirtualStats,
}

impl DeviceState {
    fn take_fault(&mut self, operation: Option<OperationCode>) -> Option<Fault> {
        let index = self.faults.iter().position(|rule| match operation {
            None => rule.fault == Fault::FailOpen,
            Some(op) => rule.fault != Fault::FailOpen && rule.operation.is_none_or(|want| want == op),
        })?;
        Some(self.faults.remove(index).fault)
    }

    fn parent_exists(&self, storage_id: u32, parent: u32) -> bool {
        parent == ROOT
            || parent == 0
            || self
                .objects
                .get(&parent)
                .is_some_and(|o| o.is_folder && o.storage_id == storage_id)
    }

    fn object_info(&self, handle: u32) -> Option<ObjectInfo> {
        let object = self.objects.get(&handle)?;
        let mut info = if object.is_folder {
            ObjectInfo::new_folder(object.storage_id, object.parent, &object.name)
        } else {
            ObjectInfo::new_file(object.storage_id, object.parent, &object.name, object.data.len() as u64)
        };
        info.modification_date = object.modified;
        Some(info)
    }

    fn remove_tree(&mut self, handle: u32) {
        let children: Vec<u32> = self
            .objects
            .iter()
            .filter(|(_, o)| o.parent == handle)
            .map(|(h, _)| *h)
            .collect();
        for child in children {
            self.remove_tree(child);
        }
        self.objects.remove(&handle);
    }

    fn used_bytes(&self, storage_id: u32) -> u64 {
        self.objects
            .values()
            .filter(|o| o.storage_id == storage_id)
            .map(|o| o.data.len() as u64)
            .sum()
    }
}

/// A virtual device. Clones share the same device state.
#[derive(Clone)]
pub struct VirtualDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for VirtualDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualDevice {
    /// A phone with one empty 64 GiB read-write storage (id `0x10001`).
    pub fn new() -> Self {
        let info = DeviceInfo {
            standard_version: 100,
            vendor_extension_id: 6,
            vendor_extension_version: 100,
            vendor_extension_desc: "microsoft.com: 1.0; android.com: 1.0;".to_string(),
            functional_mode: 0,
            operations_supported: vec![
                0x1001, 0x1002, 0x1003, 0x1004, 0x1005, 0x1007, 0x1008, 0x1009, 0x100B, 0x100C, 0x100D,
            ],
            manufacturer: "Google".to_string(),
            model: "Pixel 8".to_string(),
            device_version: "1.0".to_string(),
            serial_number: "VIRT0001".to_string(),
            ..DeviceInfo::default()
        };

        let device = Self {
            state: Arc::new(Mutex::new(DeviceState {
                info,
                storages: BTreeMap::new(),
                objects: BTreeMap::new(),
                next_handle: 1,
                session: None,
                pending_send: None,
                faults: Vec::new(),
                quirks: Quirks::default(),
                packet_size: DEFAULT_PACKET_SIZE,
                stats: VirtualStats::default(),
            })),
        };
        device.add_storage(0x10001, "Internal shared storage", 64 * 1024 * 1024 * 1024, false);
        device
    }

    pub fn with_quirks(self, quirks: Quirks) -> Self {
        self.state.lock_ignore_poison().quirks = quirks;
        self
    }

    pub fn with_packet_size(self, packet_size: usize) -> Self {
        self.state.lock_ignore_poison().packet_size = packet_size;
        self
    }

    pub fn set_identity(&self, manufacturer: &str, model: &str) {
        let mut state = self.state.lock_ignore_poison();
        state.info.manufacturer = manufacturer.to_string();
        state.info.model = model.to_string();
    }

    pub fn add_storage(&self, id: u32, description: &str, capacity: u64, read_only: bool) {
        let info = StorageInfo {
            storage_type: 3,
            filesystem_type: 2,
            access_capability: u16::from(read_only),
            max_capacity: capacity,
            free_space_bytes: capacity,
            free_space_objects: u32::MAX,
            storage_description: description.to_string(),
            volume_identifier: String::new(),
        };
        self.state.lock_ignore_poison().storages.insert(id, VirtualStorage { info });
    }

    /// Adds a folder. `parent` is `0xFFFFFFFF` for the storage root.
    pub fn add_folder(&self, storage_id: u32, parent: u32, name: &str) -> u32 {
        self.add_object(storage_id, parent, name, true, Vec::new())
    }

    /// Adds a file. `parent` is `0xFFFFFFFF` for the storage root.
    pub fn add_file(&self, storage_id: u32, parent: u32, name: &str, data: Vec<u8>) -> u32 {
        self.add_object(storage_id, parent, name, false, data)
    }

    fn add_object(&self, storage_id: u32, parent: u32, name: &str, is_folder: bool, data: Vec<u8>) -> u32 {
        let mut state = self.state.lock_ignore_poison();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.objects.insert(
            handle,
            VirtualObject {
                storage_id,
                parent: if parent == ROOT { 0 } else { parent },
                name: name.to_string(),
                is_folder,
                data,
                modified: NaiveDateTime::parse_from_str("20240102T030405", "%Y%m%dT%H%M%S").ok(),
            },
        );
        handle
    }

    /// Queues a fault for the next command with `operation` (any command if `None`).
    pub fn inject(&self, operation: Option<OperationCode>, fault: Fault) {
        self.state
            .lock_ignore_poison()
            .faults
            .push(FaultRule { operation, fault });
    }

    pub fn pending_faults(&self) -> usize {
        self.state.lock_ignore_poison().faults.len()
    }

    pub fn stats(&self) -> VirtualStats {
        self.state.lock_ignore_poison().stats.clone()
    }

    pub fn command_count(&self, operation: OperationCode) -> usize {
        self.state
            .lock_ignore_poison()
            .stats
            .commands
            .iter()
            .filter(|op| **op == operation)
            .count()
    }

    pub fn file_data(&self, handle: u32) -> Option<Vec<u8>> {
        self.state.lock_ignore_poison().objects.get(&handle).map(|o| o.data.clone())
    }

    pub fn object_name(&self, handle: u32) -> Option<String> {
        self.state.lock_ignore_poison().objects.get(&handle).map(|o| o.name.clone())
    }

    pub fn object_exists(&self, handle: u32) -> bool {
        self.state.lock_ignore_poison().objects.contains_key(&handle)
    }

    /// Whether the device itself thinks a session is open.
    pub fn has_session(&self) -> bool {
        self.state.lock_ignore_poison().session.is_some()
    }

    /// Opens a transport without going through [`DeviceOpener`].
    pub fn transport(&self) -> Result<VirtualTransport, TransportError> {
        let mut transport = VirtualTransport {
            state: Arc::clone(&self.state),
            open: false,
            inbound: VecDeque::new(),
            outbound: None,
            stall: None,
        };
        transport.open()?;
        Ok(transport)
    }
}

impl DeviceOpener for VirtualDevice {
    type Transport = VirtualTransport;

    fn open_device(&self) -> Result<VirtualTransport, TransportError> {
        self.transport()
    }
}

/// A data-out phase in progress.
struct Outbound {
    operation: OperationCode,
    transaction_id: u32,
    params: Vec<u32>,
    fault: Option<Fault>,
    bytes: Vec<u8>,
}

/// One opened handle on a [`VirtualDevice`].
pub struct VirtualTransport {
    state: Arc<Mutex<DeviceState>>,
    open: bool,
    inbound: VecDeque<Vec<u8>>,
    outbound: Option<Outbound>,
    stall: Option<Duration>,
}

impl VirtualTransport {
    fn packet_size(&self) -> usize {
        self.state.lock_ignore_poison().packet_size
    }

    fn queue_response(&mut self, code: ResponseCode, transaction_id: u32, params: &[u32], fault: Option<&Fault>) {
        let (kind, transaction_id) = match fault {
            Some(Fault::ResponseAsCommand) => (ContainerKind::Command, transaction_id),
            Some(Fault::WrongTransactionId) => (ContainerKind::Response, transaction_id.wrapping_add(1)),
            _ => (ContainerKind::Response, transaction_id),
        };
        let mut packet = Vec::with_capacity(HEADER_LEN + 4 * params.len());
        ContainerHeader {
            length: (HEADER_LEN + 4 * params.len()) as u32,
            kind,
            code: code.0,
            transaction_id,
        }
        .write_to(&mut packet);
        for p in params {
            packet.put_u32_le(*p);
        }
        self.inbound.push_back(packet);
    }

    fn queue_data(&mut self, operation: OperationCode, transaction_id: u32, payload: &[u8], fault: Option<&Fault>) {
        let transaction_id = match fault {
            Some(Fault::WrongTransactionId) => transaction_id.wrapping_add(1),
            _ => transaction_id,
        };
        let (quirks, packet_size) = {
            let state = self.state.lock_ignore_poison();
            (state.quirks, state.packet_size)
        };

        let mut header = Vec::with_capacity(HEADER_LEN);
        ContainerHeader::data(operation.0, transaction_id, payload.len() as u64).write_to(&mut header);

        let mut packets = Vec::new();
        if quirks.split_header {
            packets.push(header);
            packets.extend(payload.chunks(packet_size).map(<[u8]>::to_vec));
        } else {
            let mut whole = header;
            whole.extend_from_slice(payload);
            packets.extend(whole.chunks(packet_size).map(<[u8]>::to_vec));
        }
        if packets.last().is_some_and(|p| p.len() == packet_size) && !quirks.no_zero_length_packet {
            packets.push(Vec::new());
        }
        self.inbound.extend(packets);
    }

    fn handle_command(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let Ok(header) = ContainerHeader::parse(bytes) else {
            debug!("virtual device: ignoring runt write of {} bytes", bytes.len());
            return Ok(());
        };
        if header.kind != ContainerKind::Command {
            debug!("virtual device: ignoring {:?} container outside a data phase", header.kind);
            return Ok(());
        }
        let operation = OperationCode(header.code);
        let mut reader = DatasetReader::new(&bytes[HEADER_LEN..], "command params");
        let params: Vec<u32> = std::iter::from_fn(|| reader.u32().ok()).take(5).collect();

        let fault = {
            let mut state = self.state.lock_ignore_poison();
            state.stats.commands.push(operation);
            state.take_fault(Some(operation))
        };
        match &fault {
            Some(Fault::Busy) => {
                return Err(TransportError::new(TransportErrorKind::Busy, "LIBUSB_ERROR_BUSY"));
            }
            Some(Fault::Disconnect) => {
                self.open = false;
                return Err(TransportError::not_open());
            }
            Some(Fault::Io) => {
                return Err(TransportError::new(TransportErrorKind::Io, "LIBUSB_ERROR_IO"));
            }
            Some(Fault::Timeout) => return Ok(()),
            Some(Fault::Stall(d)) => self.stall = Some(*d),
            _ => {}
        }

        if matches!(operation, OperationCode::SEND_OBJECT_INFO | OperationCode::SEND_OBJECT) {
            self.outbound = Some(Outbound {
                operation,
                transaction_id: header.transaction_id,
                params,
                fault,
                bytes: Vec::new(),
            });
            return Ok(());
        }

        if let Some(Fault::Respond(code)) = fault {
            self.queue_response(code, header.transaction_id, &[], None);
            return Ok(());
        }
        self.execute(operation, header.transaction_id, &params, fault.as_ref());
        Ok(())
    }

    fn execute(&mut self, operation: OperationCode, tid: u32, params: &[u32], fault: Option<&Fault>) {
        let param = |i: usize| params.get(i).copied().unwrap_or(0);
        let outcome: Result<Option<Vec<u8>>, ResponseCode> = {
            let mut state = self.state.lock_ignore_poison();
            let needs_session = !matches!(
                operation,
                OperationCode::GET_DEVICE_INFO | OperationCode::OPEN_SESSION | OperationCode::CLOSE_SESSION
            );
            if needs_session && state.session.is_none() {
                Err(ResponseCode::SESSION_NOT_OPEN)
            } else {
                match operation {
                    OperationCode::OPEN_SESSION => {
                        if state.session.is_some() {
                            Err(ResponseCode::SESSION_ALREADY_OPEN)
                        } else if param(0) == 0 {
                            Err(ResponseCode::INVALID_PARAMETER)
                        } else {
                            state.session = Some(param(0));
                            state.stats.sessions_opened += 1;
                            Ok(None)
                        }
                    }
                    OperationCode::CLOSE_SESSION => match state.session.take() {
                        Some(_) => Ok(None),
                        None => Err(ResponseCode::SESSION_NOT_OPEN),
                    },
                    OperationCode::GET_DEVICE_INFO => state
                        .info
                        .encode()
                        .map(Some)
                        .map_err(|_| ResponseCode::GENERAL_ERROR),
                    OperationCode::GET_STORAGE_IDS => {
                        let mut out = Vec::new();
                        out.put_u32_le(state.storages.len() as u32);
                        for id in state.storages.keys() {
                            out.put_u32_le(*id);
                        }
                        Ok(Some(out))
                    }
                    OperationCode::GET_STORAGE_INFO => match state.storages.get(&param(0)) {
                        Some(storage) => {
                            let mut info = storage.info.clone();
                            info.free_space_bytes = info.max_capacity.saturating_sub(state.used_bytes(param(0)));
                            info.encode().map(Some).map_err(|_| ResponseCode::GENERAL_ERROR)
                        }
                        None => Err(ResponseCode::INVALID_STORAGE_ID),
                    },
                    OperationCode::GET_OBJECT_HANDLES => {
                        let (storage_id, parent) = (param(0), param(2));
                        let want_parent = if parent == ROOT { 0 } else { parent };
                        if !state.parent_exists(storage_id, parent) {
                            Err(ResponseCode::INVALID_PARENT_OBJECT)
                        } else {
                            let handles: Vec<u32> = state
                                .objects
                                .iter()
                                .filter(|(_, o)| o.storage_id == storage_id && o.parent == want_parent)
                                .map(|(h, _)| *h)
                                .collect();
                            let mut out = Vec::new();
                            out.put_u32_le(handles.len() as u32);
                            for h in handles {
                                out.put_u32_le(h);
                            }
                            Ok(Some(out))
                        }
                    }
                    OperationCode::GET_OBJECT_INFO => match state.object_info(param(0)) {
                        Some(info) => info.encode().map(Some).map_err(|_| ResponseCode::GENERAL_ERROR),
                        None => Err(ResponseCode::INVALID_OBJECT_HANDLE),
                    },
                    OperationCode::GET_OBJECT => match state.objects.get(&param(0)) {
                        Some(o) if !o.is_folder => Ok(Some(o.data.clone())),
                        _ => Err(ResponseCode::INVALID_OBJECT_HANDLE),
                    },
                    OperationCode::DELETE_OBJECT => {
                        let handle = param(0);
                        match state.objects.get(&handle).map(|o| o.storage_id) {
                            None => Err(ResponseCode::INVALID_OBJECT_HANDLE),
                            Some(storage_id) if state.storages.get(&storage_id).is_some_and(|s| s.info.is_read_only()) => {
                                Err(ResponseCode::STORE_READ_ONLY)
                            }
                            Some(_) => {
                                state.remove_tree(handle);
                                Ok(None)
                            }
                        }
                    }
                    _ => Err(ResponseCode::OPERATION_NOT_SUPPORTED),
                }
            }
        };

        match outcome {
            Ok(Some(payload)) => {
                self.queue_data(operation, tid, &payload, fault);
                self.queue_response(ResponseCode::OK, tid, &[], fault);
            }
            Ok(None) => self.queue_response(ResponseCode::OK, tid, &[], fault),
            Err(code) => self.queue_response(code, tid, &[], fault),
        }
    }

    fn finish_outbound(&mut self, outbound: Outbound) {
        let Outbound {
            operation,
            transaction_id: tid,
            params,
            fault,
            bytes,
        } = outbound;
        let payload = &bytes[HEADER_LEN.min(bytes.len())..];

        if let Some(Fault::Respond(code)) = fault {
            self.queue_response(code, tid, &[], None);
            return;
        }

        let outcome: Result<Vec<u32>, ResponseCode> = {
            let mut state = self.state.lock_ignore_poison();
            if state.session.is_none() {
                Err(ResponseCode::SESSION_NOT_OPEN)
            } else if operation == OperationCode::SEND_OBJECT_INFO {
                let storage_id = params.first().copied().unwrap_or(0);
                let parent = params.get(1).copied().unwrap_or(0);
                match ObjectInfo::decode(payload) {
                    Err(_) => Err(ResponseCode::INVALID_PARAMETER),
                    Ok(info) => match state.storages.get(&storage_id).map(|s| s.info.clone()) {
                        None => Err(ResponseCode::INVALID_STORAGE_ID),
                        Some(storage) if storage.is_read_only() => Err(ResponseCode::STORE_READ_ONLY),
                        Some(storage)
                            if u64::from(info.compressed_size)
                                > storage.max_capacity.saturating_sub(state.used_bytes(storage_id)) =>
                        {
                            Err(ResponseCode::STORE_FULL)
                        }
                        Some(_) if !state.parent_exists(storage_id, parent) => Err(ResponseCode::INVALID_PARENT_OBJECT),
                        Some(_) => {
                            let handle = state.next_handle;
                            state.next_handle += 1;
                            state.objects.insert(
                                handle,
                                VirtualObject {
                                    storage_id,
                                    parent: if parent == ROOT { 0 } else { parent },
                                    name: info.filename.clone(),
                                    is_folder: info.is_folder(),
                                    data: Vec::new(),
                                    modified: info.modification_date,
                                },
                            );
                            if !info.is_folder() {
                                state.pending_send = Some(handle);
                            }
                            Ok(vec![storage_id, parent, handle])
                        }
                    },
                }
            } else {
                match state.pending_send.take() {
                    None => Err(ResponseCode::NO_VALID_OBJECT_INFO),
                    Some(handle) => match state.objects.get_mut(&handle) {
                        Some(object) => {
                            object.data = payload.to_vec();
                            Ok(Vec::new())
                        }
                        None => Err(ResponseCode::NO_VALID_OBJECT_INFO),
                    },
                }
            }
        };

        match outcome {
            Ok(params) => self.queue_response(ResponseCode::OK, tid, &params, fault.as_ref()),
            Err(code) => self.queue_response(code, tid, &[], fault.as_ref()),
        }
    }
}

impl UsbTransport for VirtualTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock_ignore_poison();
        if state.take_fault(None).is_some() {
            return Err(TransportError::new(TransportErrorKind::Access, "LIBUSB_ERROR_ACCESS"));
        }
        state.stats.opens += 1;
        self.open = true;
        self.inbound.clear();
        self.outbound = None;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Ok(());
        }
        self.state.lock_ignore_poison().stats.closes += 1;
        self.open = false;
        self.inbound.clear();
        self.outbound = None;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock_ignore_poison();
        state.stats.resets += 1;
        state.session = None;
        state.pending_send = None;
        self.inbound.clear();
        self.outbound = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn bulk_read(&mut self, _endpoint: Endpoint, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::not_open());
        }
        if let Some(stall) = self.stall.take() {
            std::thread::sleep(stall);
            if stall >= timeout {
                return Err(TransportError::timeout());
            }
        }

        let packet_size = self.packet_size();
        let Some(first) = self.inbound.pop_front() else {
            return Err(TransportError::timeout());
        };
        if first.len() > buf.len() {
            return Err(TransportError::new(TransportErrorKind::Overflow, "LIBUSB_ERROR_OVERFLOW"));
        }

        // A transfer keeps collecting packets until a short one arrives or the buffer is full.
        let mut n = first.len();
        buf[..n].copy_from_slice(&first);
        let mut last_len = first.len();
        while last_len == packet_size
            && let Some(next) = self.inbound.front()
            && n + next.len() <= buf.len()
        {
            let Some(next) = self.inbound.pop_front() else {
                break;
            };
            buf[n..n + next.len()].copy_from_slice(&next);
            n += next.len();
            last_len = next.len();
        }
        Ok(n)
    }

    fn bulk_write(&mut self, _endpoint: Endpoint, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        if !self.open {
            return Err(TransportError::not_open());
        }

        if let Some(outbound) = self.outbound.as_mut() {
            outbound.bytes.extend_from_slice(data);
            let declared = ContainerHeader::parse(&outbound.bytes).map(|h| h.length as usize).ok();
            if declared.is_some_and(|len| outbound.bytes.len() >= len)
                && let Some(outbound) = self.outbound.take()
            {
                self.finish_outbound(outbound);
            }
            return Ok(data.len());
        }

        if data.is_empty() {
            return Ok(0);
        }
        self.handle_command(data)?;
        Ok(data.len())
    }

    fn max_packet_size(&self, _endpoint: Endpoint) -> usize {
        self.packet_size()
    }
}
