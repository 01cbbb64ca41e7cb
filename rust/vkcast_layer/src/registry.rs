//! Handle-keyed object registries.
//!
//! Dispatchable handles (instances, devices, queues, command buffers) start
//! with the loader's dispatch-table pointer, and that word is shared between
//! a parent handle and the child handles created from it. Keying instance
//! and device state by it lets a queue or command buffer find its owning
//! device without any extra bookkeeping. Non-dispatchable handles
//! (swapchains) are keyed by their handle value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Read the loader dispatch pointer from a dispatchable handle.
///
/// # Safety
/// `raw` must be the raw value of a live dispatchable Vulkan handle.
pub unsafe fn dispatch_key(raw: u64) -> u64 {
    *(raw as usize as *const usize) as u64
}

/// A mutex-guarded keyed store. Lookups hand out `Arc`s so entry points can
/// keep using state while another thread mutates the map.
pub struct ObjectMap<T> {
    inner: Mutex<HashMap<u64, Arc<T>>>,
}

impl<T> ObjectMap<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<T>>> {
        self.inner.lock().unwrap()
    }

    pub fn insert(&self, key: u64, value: Arc<T>) {
        self.lock().insert(key, value);
    }

    pub fn get(&self, key: u64) -> Option<Arc<T>> {
        self.lock().get(&key).cloned()
    }

    pub fn remove(&self, key: u64) -> Option<Arc<T>> {
        self.lock().remove(&key)
    }

    /// Visit every entry with the map lock held.
    pub fn walk(&self, mut f: impl FnMut(&Arc<T>)) {
        for value in self.lock().values() {
            f(value);
        }
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.lock().drain().map(|(_, v)| v).collect()
    }
}

impl<T> Default for ObjectMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Shaped like a dispatchable handle: the first word is the loader's
    // dispatch pointer.
    #[repr(C)]
    struct FakeHandle {
        loader_data: usize,
        payload: u64,
    }

    #[test]
    fn child_handle_shares_parent_key() {
        let table = 0x1cd_c0de_usize;
        let device = FakeHandle {
            loader_data: table,
            payload: 1,
        };
        let queue = FakeHandle {
            loader_data: table,
            payload: 2,
        };

        let dev_key = unsafe { dispatch_key(&device as *const _ as u64) };
        let queue_key = unsafe { dispatch_key(&queue as *const _ as u64) };
        assert_eq!(dev_key, table as u64);
        assert_eq!(dev_key, queue_key);
    }

    #[test]
    fn insert_get_remove() {
        let map: ObjectMap<&str> = ObjectMap::new();
        map.insert(7, Arc::new("seven"));
        assert_eq!(map.get(7).as_deref(), Some(&"seven"));
        assert!(map.get(8).is_none());

        let removed = map.remove(7).unwrap();
        assert_eq!(*removed, "seven");
        assert!(map.get(7).is_none());
    }

    #[test]
    fn walk_sees_every_entry() {
        let map: ObjectMap<u32> = ObjectMap::new();
        for i in 0..4 {
            map.insert(i, Arc::new(i as u32 * 10));
        }
        let mut seen = Vec::new();
        map.walk(|v| seen.push(**v));
        seen.sort();
        assert_eq!(seen, vec![0, 10, 20, 30]);

        assert_eq!(map.drain().len(), 4);
        assert!(map.get(0).is_none());
    }
}
