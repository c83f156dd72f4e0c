//! The device registry (C4): connection-owned, devices self-register.
//!
//! The registry only holds [`Weak`] references — the device's owner (user
//! code, via the `Arc<Device>` returned by [`crate::device::Device::new`])
//! is what keeps it alive. This mirrors spec.md §4.4's "weak associations":
//! the registry exists so the receive worker can *locate* a device, not to
//! keep it alive.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use crate::device::Device;

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<u32, Weak<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: &Arc<Device>) {
        self.devices.lock().unwrap().insert(device.id(), Arc::downgrade(device));
    }

    pub fn remove(&self, id: u32) {
        self.devices.lock().unwrap().remove(&id);
    }

    /// Looks up a device by id. Upgrades the weak reference; a stale entry
    /// (device already dropped) is pruned and treated as a miss.
    pub fn find(&self, id: u32) -> Option<Arc<Device>> {
        let mut devices = self.devices.lock().unwrap();
        match devices.get(&id).and_then(Weak::upgrade) {
            Some(device) => Some(device),
            None => {
                devices.remove(&id);
                None
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.devices.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;

    #[test]
    fn insert_find_remove() {
        let conn = Connection::new();
        let device = Device::new(42, &conn);
        assert_eq!(conn.registry().find(42).map(|d| d.id()), Some(42));
        drop(device);
        assert_eq!(conn.registry().find(42), None);
        assert_eq!(conn.registry().len(), 0);
    }

    #[test]
    fn miss_is_none() {
        let conn = Connection::new();
        assert!(conn.registry().find(7).is_none());
    }
}
