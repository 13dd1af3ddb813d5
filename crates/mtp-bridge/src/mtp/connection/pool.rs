//! Pool of opened device handles.
//!
//! Entries are either free (the handle sits in the pool) or leased (the handle is
//! out with a caller, the entry keeps its place). The pool never holds more than
//! `max_size` entries. Handles are probed before reuse and disposed when removed.
//!
//! No device I/O happens under the pool lock: handles are taken out of their entry
//! before probing and disposing.

use log::{debug, warn};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::ignore_poison::IgnorePoison;
use crate::mtp::device::MtpDevice;
use crate::mtp::errors::MtpError;
use crate::mtp::transport::UsbTransport;

struct PoolEntry<T: UsbTransport> {
    id: u64,
    /// `None` while leased.
    device: Option<MtpDevice<T>>,
    last_used: Instant,
    /// Monotonic touch counter. Breaks ties between entries released in the same instant.
    touched: u64,
}

impl<T: UsbTransport> PoolEntry<T> {
    fn in_use(&self) -> bool {
        self.device.is_none()
    }
}

struct PoolState<T: UsbTransport> {
    entries: Vec<PoolEntry<T>>,
    next_id: u64,
    clock: u64,
    closed: bool,
}

impl<T: UsbTransport> PoolState<T> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn position(&self, id: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Index of the least recently used free entry.
    fn oldest_free(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.in_use())
            .min_by_key(|(_, e)| (e.last_used, e.touched))
            .map(|(i, _)| i)
    }

    /// Index of the most recently used free entry.
    fn newest_free(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.in_use())
            .max_by_key(|(_, e)| (e.last_used, e.touched))
            .map(|(i, _)| i)
    }
}

/// A handle checked out of the pool, or freshly opened.
pub struct Lease<T: UsbTransport> {
    /// Entry this handle came from. `None` for a freshly opened handle.
    slot: Option<u64>,
    pub device: MtpDevice<T>,
}

impl<T: UsbTransport> Lease<T> {
    /// Wraps a handle that didn't come from the pool.
    pub fn fresh(device: MtpDevice<T>) -> Self {
        Self { slot: None, device }
    }

    /// Returns true if this handle was reused from the pool.
    pub fn is_pooled(&self) -> bool {
        self.slot.is_some()
    }
}

pub struct DevicePool<T: UsbTransport> {
    state: Mutex<PoolState<T>>,
    max_size: usize,
}

impl<T: UsbTransport> DevicePool<T> {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                entries: Vec::new(),
                next_id: 1,
                clock: 0,
                closed: false,
            }),
            max_size: max_size.max(1),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Number of entries, free or leased.
    pub fn len(&self) -> usize {
        self.state.lock_ignore_poison().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_len(&self) -> usize {
        self.state.lock_ignore_poison().entries.iter().filter(|e| !e.in_use()).count()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock_ignore_poison().closed
    }

    /// Checks out the most recently used free handle that passes a liveness probe.
    ///
    /// Handles that fail the probe are disposed and their entries removed. Returns
    /// `Ok(None)` when no free handle is usable, so the caller opens a new one.
    pub fn acquire(&self, probe_timeout: Duration) -> Result<Option<Lease<T>>, MtpError> {
        loop {
            let (id, mut device) = {
                let mut state = self.state.lock_ignore_poison();
                if state.closed {
                    return Err(MtpError::ShuttingDown);
                }
                let Some(index) = state.newest_free() else {
                    return Ok(None);
                };
                let touched = state.tick();
                let entry = &mut state.entries[index];
                let Some(device) = entry.device.take() else {
                    return Ok(None);
                };
                entry.last_used = Instant::now();
                entry.touched = touched;
                (entry.id, device)
            };

            device.set_timeout(probe_timeout);
            match device.probe() {
                Ok(()) => {
                    debug!("MTP pool: reusing handle #{}", id);
                    return Ok(Some(Lease { slot: Some(id), device }));
                }
                Err(e) => {
                    warn!("MTP pool: handle #{} failed its probe ({}); discarding", id, e);
                    self.remove_entry(id);
                    device.dispose();
                }
            }
        }
    }

    /// Returns a handle to the pool after a call that didn't poison it.
    ///
    /// A handle that no longer fits (pool full of leased entries, or pool closed) is disposed.
    pub fn release(&self, lease: Lease<T>) {
        let Lease { slot, device } = lease;
        if !device.is_open() {
            if let Some(id) = slot {
                self.remove_entry(id);
            }
            return;
        }

        let mut evicted = None;
        let rejected = {
            let mut state = self.state.lock_ignore_poison();
            let touched = state.tick();
            let now = Instant::now();

            if state.closed {
                if let Some(index) = slot.and_then(|id| state.position(id)) {
                    state.entries.remove(index);
                }
                Some(device)
            } else if let Some(index) = slot.and_then(|id| state.position(id)) {
                let entry = &mut state.entries[index];
                entry.device = Some(device);
                entry.last_used = now;
                entry.touched = touched;
                None
            } else {
                if state.entries.len() >= self.max_size
                    && let Some(index) = state.oldest_free()
                {
                    let entry = state.entries.remove(index);
                    debug!("MTP pool: full, evicting least recently used handle #{}", entry.id);
                    evicted = entry.device;
                }
                if state.entries.len() >= self.max_size {
                    Some(device)
                } else {
                    let id = state.next_id;
                    state.next_id += 1;
                    state.entries.push(PoolEntry {
                        id,
                        device: Some(device),
                        last_used: now,
                        touched,
                    });
                    None
                }
            }
        };

        if let Some(mut device) = evicted {
            device.dispose();
        }
        if let Some(mut device) = rejected {
            debug!("MTP pool: no room for returned handle; disposing it");
            device.dispose();
        }
    }

    /// Removes a handle's entry for good and disposes the handle.
    pub fn evict(&self, lease: Lease<T>) {
        let Lease { slot, mut device } = lease;
        if let Some(id) = slot {
            self.remove_entry(id);
        }
        device.dispose();
    }

    /// Disposes free handles idle for longer than `ttl`. Returns how many were removed.
    pub fn sweep_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let expired = self.take_free_where(|e| now.saturating_duration_since(e.last_used) > ttl);
        let count = expired.len();
        dispose_all(expired);
        if count > 0 {
            debug!("MTP pool: swept {} idle handle(s)", count);
        }
        count
    }

    /// Disposes every free handle. Leased handles stay with their callers.
    pub fn clear(&self) -> usize {
        let free = self.take_free_where(|_| true);
        let count = free.len();
        dispose_all(free);
        count
    }

    /// Closes the pool: disposes every free handle and makes later acquires fail.
    ///
    /// Leased handles are disposed when their caller returns them.
    pub fn close(&self) -> usize {
        let free = {
            let mut state = self.state.lock_ignore_poison();
            state.closed = true;
            let entries = std::mem::take(&mut state.entries);
            entries.into_iter().filter_map(|e| e.device).collect::<Vec<_>>()
        };
        let count = free.len();
        dispose_all(free);
        count
    }

    fn remove_entry(&self, id: u64) {
        let mut state = self.state.lock_ignore_poison();
        if let Some(index) = state.position(id) {
            state.entries.remove(index);
        }
    }

    fn take_free_where(&self, predicate: impl Fn(&PoolEntry<T>) -> bool) -> Vec<MtpDevice<T>> {
        let mut state = self.state.lock_ignore_poison();
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.entries)
            .into_iter()
            .partition(|e| !e.in_use() && predicate(e));
        state.entries = kept;
        taken.into_iter().filter_map(|e| e.device).collect()
    }
}

fn dispose_all<T: UsbTransport>(devices: Vec<MtpDevice<T>>) {
    for mut device in devices {
        device.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtp::virtual_device::{VirtualDevice, VirtualTransport};

    fn last_used(pool: &DevicePool<VirtualTransport>) -> Instant {
        pool.state.lock_ignore_poison().entries[0].last_used
    }

    #[test]
    fn test_acquire_refreshes_last_used() {
        let device = VirtualDevice::new();
        let mut mtp = MtpDevice::new(device.transport().unwrap());
        mtp.configure(Duration::ZERO).unwrap();
        let pool = DevicePool::new(2);
        pool.release(Lease::fresh(mtp));
        let released_at = last_used(&pool);

        std::thread::sleep(Duration::from_millis(20));
        let _leased = pool.acquire(Duration::from_secs(1)).unwrap().unwrap();
        assert!(last_used(&pool) > released_at);
    }
}
