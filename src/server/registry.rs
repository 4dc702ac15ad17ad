//! Registered targets (blades) and the registry that routes frames to
//! them.
//!
//! A target is the (major, minor, interface) triple plus its backing
//! device, identity strings, config blob, the 16-slot in-flight table,
//! and an atomic busy count. The registry is an ordered list under one
//! mutex; the ingress fan-out iterates it with the lock held, so any
//! per-target work done inside the fan-out must be enqueue-only.

use crate::net::NetIf;
use crate::protocol::types::{CONFIG_MAX, NSLOTS, SHELF_BCAST, SLOT_BCAST};
use crate::storage::{BlockDev, SectorIo, StorageError};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Why an `add` was refused.
#[derive(Debug, Error)]
pub enum AddError {
    #[error("interface not registered")]
    NoInterface,

    #[error("cannot open backing device: {0}")]
    Device(#[from] StorageError),

    #[error("zero sized backing device")]
    ZeroCapacity,

    #[error("target already exists")]
    Exists,
}

impl AddError {
    pub fn errno(&self) -> i32 {
        match self {
            AddError::NoInterface => -libc::ENOENT,
            AddError::Device(_) => -libc::ENOENT,
            AddError::ZeroCapacity => -libc::ENOENT,
            AddError::Exists => -libc::EEXIST,
        }
    }
}

/// Why a `del` was refused.
#[derive(Debug, Error)]
pub enum DelError {
    #[error("no such target")]
    NotFound,

    #[error("target is busy")]
    Busy,
}

impl DelError {
    pub fn errno(&self) -> i32 {
        match self {
            DelError::NotFound => -libc::ENOENT,
            DelError::Busy => -libc::EBUSY,
        }
    }
}

/// Space-pad `s` into a fixed-width identity field.
pub fn spncpy<const N: usize>(s: &str) -> [u8; N] {
    let mut out = [b' '; N];
    for (d, s) in out.iter_mut().zip(s.bytes()) {
        *d = s;
    }
    out
}

/// The 16-entry in-flight request table. Slots are allocated by the
/// service worker and released by I/O completions; at most one of the
/// two ever touches a given slot.
pub struct SlotTable {
    slots: [AtomicBool; NSLOTS],
}

impl SlotTable {
    fn new() -> SlotTable {
        SlotTable {
            slots: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    /// First free slot, or None when all 16 are in flight.
    pub fn alloc(&self) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    pub fn release(&self, idx: usize) {
        self.slots[idx].store(false, Ordering::Release);
    }

    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.load(Ordering::Acquire))
            .count()
    }
}

/// One exported blade.
pub struct Target {
    pub major: u16,
    pub minor: u8,
    pub iface: Arc<dyn NetIf>,
    pub path: String,
    /// Backing device identity (device numbers) for the management surface.
    pub bdev_id: String,

    dev: Box<dyn BlockDev>,
    sectors: u64,
    model: Mutex<[u8; 40]>,
    serial: Mutex<[u8; 20]>,
    config: Mutex<Vec<u8>>,
    pub slots: SlotTable,
    busy: AtomicU32,
}

impl Target {
    pub fn new(
        major: u16,
        minor: u8,
        iface: Arc<dyn NetIf>,
        dev: Box<dyn BlockDev>,
        path: &str,
        bdev_id: String,
        model: &str,
        serial: &str,
    ) -> Target {
        let sectors = dev.sectors();
        Target {
            major,
            minor,
            iface,
            path: path.to_string(),
            bdev_id,
            dev,
            sectors,
            model: Mutex::new(spncpy(model)),
            serial: Mutex::new(spncpy(serial)),
            config: Mutex::new(Vec::new()),
            slots: SlotTable::new(),
            busy: AtomicU32::new(0),
        }
    }

    pub fn ifname(&self) -> &str {
        self.iface.name()
    }

    pub fn sectors(&self) -> u64 {
        self.sectors
    }

    pub fn busy(&self) -> u32 {
        self.busy.load(Ordering::Acquire)
    }

    pub fn inc_busy(&self) {
        self.busy.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_busy(&self) {
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn submit(&self, io: SectorIo) {
        self.dev.submit(io)
    }

    pub fn model(&self) -> [u8; 40] {
        *self.model.lock().unwrap()
    }

    pub fn set_model(&self, s: &str) {
        *self.model.lock().unwrap() = spncpy(s);
    }

    pub fn serial(&self) -> [u8; 20] {
        *self.serial.lock().unwrap()
    }

    pub fn set_serial(&self, s: &str) {
        *self.serial.lock().unwrap() = spncpy(s);
    }

    pub fn config(&self) -> Vec<u8> {
        self.config.lock().unwrap().clone()
    }

    /// Replace the config blob. Callers must have checked the cap; this
    /// guards it again so an oversized blob can never be stored.
    pub fn set_config(&self, blob: &[u8]) -> bool {
        if blob.len() > CONFIG_MAX {
            return false;
        }
        let mut config = self.config.lock().unwrap();
        config.clear();
        config.extend_from_slice(blob);
        true
    }
}

/// Ordered collection of targets, newest first.
pub struct Registry {
    list: Mutex<Vec<Arc<Target>>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            list: Mutex::new(Vec::new()),
        }
    }

    /// Insert a fully constructed target. Fails with [`AddError::Exists`]
    /// if the (major, minor, interface) triple is taken.
    pub fn add(&self, target: Arc<Target>) -> Result<(), AddError> {
        let mut list = self.list.lock().unwrap();
        if list.iter().any(|t| {
            t.major == target.major && t.minor == target.minor && t.ifname() == target.ifname()
        }) {
            return Err(AddError::Exists);
        }
        list.insert(0, target);
        Ok(())
    }

    /// Remove a target; refused while its busy count is non-zero.
    pub fn del(&self, major: u16, minor: u8, ifname: &str) -> Result<Arc<Target>, DelError> {
        let mut list = self.list.lock().unwrap();
        let idx = list
            .iter()
            .position(|t| t.major == major && t.minor == minor && t.ifname() == ifname)
            .ok_or(DelError::NotFound)?;
        if list[idx].busy() != 0 {
            return Err(DelError::Busy);
        }
        Ok(list.remove(idx))
    }

    pub fn find(&self, major: u16, minor: u8, ifname: &str) -> Option<Arc<Target>> {
        self.list
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.major == major && t.minor == minor && t.ifname() == ifname)
            .cloned()
    }

    /// Invoke `f` for every target the frame addresses, holding the
    /// registry lock for the whole fan-out. 0xFFFF / 0xFF act as
    /// wildcards; the arrival interface must match exactly.
    pub fn for_each_matching<F>(&self, major: u16, minor: u8, ifname: &str, mut f: F)
    where
        F: FnMut(&Arc<Target>),
    {
        let list = self.list.lock().unwrap();
        for t in list.iter() {
            if (major == t.major || major == SHELF_BCAST)
                && (minor == t.minor || minor == SLOT_BCAST)
                && t.ifname() == ifname
            {
                f(t);
            }
        }
    }

    /// Snapshot every target, for the management surface.
    pub fn snapshot(&self) -> Vec<Arc<Target>> {
        self.list.lock().unwrap().clone()
    }

    /// Snapshot and clear, for teardown.
    pub fn drain(&self) -> Vec<Arc<Target>> {
        std::mem::take(&mut *self.list.lock().unwrap())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
