//! # Quarantine
//!
//! Released allocations stay reserved and poisoned here until enough newer
//! releases push them out. Each device has its own FIFO; the cap bounds the
//! bytes held per device.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use csan_core::{ByteSize, DeviceHandle};

use crate::allocation::AllocationRecord;

#[derive(Debug, Default)]
struct DeviceQueue {
    entries: VecDeque<Arc<AllocationRecord>>,
    bytes: u64,
}

/// Size-bounded holding area for released allocations
#[derive(Debug)]
pub struct Quarantine {
    cap: u64,
    queues: RwLock<HashMap<DeviceHandle, Arc<Mutex<DeviceQueue>>>>,
}

impl Quarantine {
    /// Create a quarantine holding at most `cap` bytes per device
    pub fn new(cap: ByteSize) -> Self {
        Self {
            cap: cap.as_bytes(),
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Per-device cap
    pub fn cap(&self) -> ByteSize {
        ByteSize::from_bytes(self.cap)
    }

    fn queue(&self, device: DeviceHandle) -> Arc<Mutex<DeviceQueue>> {
        if let Some(queue) = self.queues.read().get(&device) {
            return queue.clone();
        }
        self.queues.write().entry(device).or_default().clone()
    }

    /// Hold `record` and return the records that fall out, oldest first
    ///
    /// The caller frees the evicted records and drops them from the index.
    pub fn put(&self, device: DeviceHandle, record: Arc<AllocationRecord>) -> Vec<Arc<AllocationRecord>> {
        let queue = self.queue(device);
        let mut queue = queue.lock();

        queue.bytes += record.alloc_size;
        queue.entries.push_back(record);

        let mut evicted = Vec::new();
        while queue.bytes > self.cap {
            let Some(oldest) = queue.entries.pop_front() else {
                break;
            };
            queue.bytes -= oldest.alloc_size;
            log::info!(
                "quarantine evicts {} ({} bytes) on {:?}",
                oldest.alloc_begin,
                oldest.alloc_size,
                device
            );
            evicted.push(oldest);
        }
        evicted
    }

    /// Bytes currently held for `device`
    pub fn held_bytes(&self, device: DeviceHandle) -> u64 {
        self.queues.read().get(&device).map_or(0, |q| q.lock().bytes)
    }

    /// Records currently held for `device`
    pub fn held_count(&self, device: DeviceHandle) -> usize {
        self.queues.read().get(&device).map_or(0, |q| q.lock().entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csan_core::{AllocKind, ContextHandle, DeviceAddr};

    fn record(begin: u64, size: u64) -> Arc<AllocationRecord> {
        Arc::new(AllocationRecord::new(
            ContextHandle::new(1),
            None,
            AllocKind::Device,
            DeviceAddr::new(begin),
            size,
            DeviceAddr::new(begin),
            size,
        ))
    }

    #[test]
    fn test_fifo_eviction() {
        let quarantine = Quarantine::new(ByteSize::from_bytes(100));
        let dev = DeviceHandle::new(1);

        assert!(quarantine.put(dev, record(0x1000, 40)).is_empty());
        assert!(quarantine.put(dev, record(0x2000, 40)).is_empty());
        let evicted = quarantine.put(dev, record(0x3000, 40));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].alloc_begin, DeviceAddr::new(0x1000));
        assert_eq!(quarantine.held_bytes(dev), 80);

        let evicted = quarantine.put(dev, record(0x4000, 90));
        let begins: Vec<u64> = evicted.iter().map(|r| r.alloc_begin.raw()).collect();
        assert_eq!(begins, [0x2000, 0x3000]);
        assert_eq!(quarantine.held_bytes(dev), 90);
    }

    #[test]
    fn test_oversized_record_evicts_itself() {
        let quarantine = Quarantine::new(ByteSize::from_bytes(64));
        let dev = DeviceHandle::new(1);
        let evicted = quarantine.put(dev, record(0x1000, 128));
        assert_eq!(evicted.len(), 1);
        assert_eq!(quarantine.held_count(dev), 0);
    }

    #[test]
    fn test_devices_independent() {
        let quarantine = Quarantine::new(ByteSize::from_bytes(64));
        let a = DeviceHandle::new(1);
        let b = DeviceHandle::new(2);
        assert!(quarantine.put(a, record(0x1000, 64)).is_empty());
        assert!(quarantine.put(b, record(0x2000, 64)).is_empty());
        assert_eq!(quarantine.held_bytes(a), 64);
        assert_eq!(quarantine.held_bytes(b), 64);
    }

    #[test]
    fn test_total_stays_under_cap() {
        let quarantine = Quarantine::new(ByteSize::from_bytes(1000));
        let dev = DeviceHandle::new(1);
        for i in 0..50u64 {
            quarantine.put(dev, record(0x1000 * (i + 1), 48 + (i * 37) % 200));
            assert!(quarantine.held_bytes(dev) <= 1000);
        }
    }
}
