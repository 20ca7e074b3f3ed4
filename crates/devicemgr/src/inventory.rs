//! Device tables
//!
//! [`Inventory`] is the lock-free core of the device manager: an arena of
//! device records keyed by [`DeviceKey`] plus two ordered per-kind indices,
//! `devices` (everything known) and `available` (unallocated and healthy).
//! Nothing here performs I/O; [`crate::manager::Manager`] wraps it in an async
//! mutex and forwards the plugin calls.
//!
//! Invariants maintained by every method:
//! - a key appears at most once in `devices[kind]` and in `available[kind]`
//! - `available[kind]` only holds keys also in `devices[kind]`
//! - an allocated or unhealthy device is never in `available`

use std::collections::HashMap;
use std::collections::HashSet;

use crate::device::Device;
use crate::device::DeviceKey;
use crate::device::Health;
use crate::error::DeviceManagerError;

#[derive(Debug)]
struct Record {
    device: Device,
    allocated: bool,
    pooled: bool,
}

/// Outcome of [`Inventory::release`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    /// Devices put back into `available`.
    pub returned: usize,
    /// Devices cleared of their allocation but kept out because unhealthy.
    pub unhealthy: usize,
    /// Devices the inventory does not know (any more).
    pub unknown: usize,
}

#[derive(Debug, Default)]
pub struct Inventory {
    records: HashMap<DeviceKey, Record>,
    devices: HashMap<String, Vec<DeviceKey>>,
    available: HashMap<String, Vec<DeviceKey>>,
    // allocation marks of devices purged while allocated
    held: HashSet<DeviceKey>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the tables from a pre-restart snapshot. Every capacity device
    /// not listed in `available` is considered allocated.
    pub fn seeded(capacity: Vec<Device>, available: &[DeviceKey]) -> Self {
        let available: HashSet<&DeviceKey> = available.iter().collect();
        let mut inventory = Self::new();
        for device in capacity {
            if !available.contains(&device.key()) {
                inventory.held.insert(device.key());
            }
            inventory.add_device(device);
        }
        inventory
    }

    /// Inserts or replaces a device. A new key is allocated if it was held,
    /// otherwise it joins `available` when healthy.
    pub fn add_device(&mut self, device: Device) {
        let key = device.key();
        let kind = key.kind.clone();

        let allocated = match self.records.get(&key) {
            Some(existing) => existing.allocated,
            None => {
                self.devices.entry(kind.clone()).or_default().push(key.clone());
                self.held.remove(&key)
            }
        };

        let pooled = !allocated && device.is_healthy();
        let was_pooled = self.records.get(&key).is_some_and(|r| r.pooled);
        self.records.insert(
            key.clone(),
            Record {
                device,
                allocated,
                pooled,
            },
        );

        match (was_pooled, pooled) {
            (false, true) => self.available.entry(kind).or_default().push(key),
            (true, false) => self.unpool(&key),
            _ => {}
        }
    }

    /// Forgets every device of `vendor`, remembering the allocated ones as
    /// held. Returns how many devices were removed.
    pub fn delete_devices(&mut self, vendor: &str) -> usize {
        let keys: Vec<DeviceKey> = self
            .records
            .keys()
            .filter(|key| key.vendor == vendor)
            .cloned()
            .collect();

        for key in &keys {
            if let Some(record) = self.records.remove(key) {
                if record.allocated {
                    self.held.insert(key.clone());
                }
            }
            remove_key(&mut self.devices, key);
            remove_key(&mut self.available, key);
        }
        keys.len()
    }

    /// Replaces the vendor's devices with a fresh discovery result.
    pub fn install_devices(&mut self, vendor: &str, devices: Vec<Device>) {
        self.delete_devices(vendor);
        for device in devices {
            self.add_device(device);
        }
    }

    /// Takes the first `count` available devices of `kind` and marks them
    /// allocated. Leaves the tables untouched on failure.
    pub fn take_available(
        &mut self,
        kind: &str,
        count: i64,
    ) -> Result<Vec<Device>, DeviceManagerError> {
        let pool = self.available.get(kind).map_or(0, Vec::len);
        let wanted = usize::try_from(count).ok().filter(|n| *n <= pool);
        let Some(wanted) = wanted else {
            return Err(DeviceManagerError::ResourceExhausted {
                kind: kind.to_string(),
                requested: count,
                available: pool,
            });
        };
        if wanted == 0 {
            return Ok(Vec::new());
        }

        let keys: Vec<DeviceKey> = match self.available.get_mut(kind) {
            Some(pool) => pool.drain(..wanted).collect(),
            None => Vec::new(),
        };

        let mut taken = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.records.get_mut(&key) {
                record.allocated = true;
                record.pooled = false;
                taken.push(record.device.clone());
            }
        }
        Ok(taken)
    }

    /// Marks a known device allocated without going through `available`.
    /// Returns false for unknown keys.
    pub fn mark_allocated(&mut self, key: &DeviceKey) -> bool {
        let Some(record) = self.records.get_mut(key) else {
            return false;
        };
        record.allocated = true;
        if record.pooled {
            record.pooled = false;
            self.unpool(key);
        }
        true
    }

    /// Clears the allocation of `devices`, returning healthy ones to
    /// `available`. Releasing twice is harmless.
    pub fn release(&mut self, devices: &[Device]) -> Released {
        let mut released = Released::default();
        for device in devices {
            let key = device.key();
            let Some(record) = self.records.get_mut(&key) else {
                self.held.remove(&key);
                released.unknown += 1;
                continue;
            };

            record.allocated = false;
            if !record.device.is_healthy() {
                released.unhealthy += 1;
                continue;
            }
            if !record.pooled {
                record.pooled = true;
                self.available
                    .entry(key.kind.clone())
                    .or_default()
                    .push(key);
            }
            released.returned += 1;
        }
        released
    }

    /// Flags a device unhealthy and pulls it out of `available`. Returns the
    /// updated device only when its health actually changed.
    pub fn mark_unhealthy(&mut self, key: &DeviceKey) -> Option<Device> {
        let record = self.records.get_mut(key)?;
        if record.device.health == Health::Unhealthy {
            return None;
        }
        record.device.health = Health::Unhealthy;
        let device = record.device.clone();
        if record.pooled {
            record.pooled = false;
            self.unpool(key);
        }
        Some(device)
    }

    pub fn get(&self, key: &DeviceKey) -> Option<&Device> {
        self.records.get(key).map(|r| &r.device)
    }

    pub fn is_allocated(&self, key: &DeviceKey) -> bool {
        self.records.get(key).is_some_and(|r| r.allocated)
    }

    /// Allocated, or purged while allocated.
    pub fn is_claimed(&self, key: &DeviceKey) -> bool {
        self.is_allocated(key) || self.held.contains(key)
    }

    /// Every known device, per kind, in insertion order.
    pub fn devices(&self) -> HashMap<String, Vec<Device>> {
        self.snapshot(&self.devices)
    }

    /// Available devices per kind, in allocation order. Every known kind has
    /// an entry, possibly empty.
    pub fn available(&self) -> HashMap<String, Vec<Device>> {
        let mut available = self.snapshot(&self.available);
        for kind in self.devices.keys() {
            available.entry(kind.clone()).or_default();
        }
        available
    }

    /// Allocated devices, in no particular order.
    pub fn allocated(&self) -> Vec<Device> {
        self.records
            .values()
            .filter(|r| r.allocated)
            .map(|r| r.device.clone())
            .collect()
    }

    fn snapshot(&self, index: &HashMap<String, Vec<DeviceKey>>) -> HashMap<String, Vec<Device>> {
        index
            .iter()
            .filter(|(_, keys)| !keys.is_empty())
            .map(|(kind, keys)| {
                let devices = keys
                    .iter()
                    .filter_map(|key| self.records.get(key))
                    .map(|r| r.device.clone())
                    .collect();
                (kind.clone(), devices)
            })
            .collect()
    }

    fn unpool(&mut self, key: &DeviceKey) {
        if let Some(pool) = self.available.get_mut(&key.kind) {
            pool.retain(|k| k != key);
        }
    }
}

fn remove_key(index: &mut HashMap<String, Vec<DeviceKey>>, key: &DeviceKey) {
    if let Some(keys) = index.get_mut(&key.kind) {
        keys.retain(|k| k != key);
        if keys.is_empty() {
            index.remove(&key.kind);
        }
    }
}
