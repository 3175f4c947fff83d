//! # Allocation Index
//!
//! Process-wide map from raw allocation start to record. Lookups of an
//! arbitrary address use the nearest preceding key.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use csan_core::DeviceAddr;

use crate::allocation::AllocationRecord;

/// Address-ordered index of every tracked allocation
#[derive(Debug, Default)]
pub struct AllocationIndex {
    records: RwLock<BTreeMap<u64, Arc<AllocationRecord>>>,
}

impl AllocationIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a record
    pub fn insert(&self, record: Arc<AllocationRecord>) {
        let key = record.alloc_begin.raw();
        if let Some(old) = self.records.write().insert(key, record) {
            // the runtime handed out the same base twice
            log::warn!("allocation index replaced stale record at {}", old.alloc_begin);
        }
    }

    /// Stop tracking the record starting at `alloc_begin`
    pub fn remove(&self, alloc_begin: DeviceAddr) -> Option<Arc<AllocationRecord>> {
        self.records.write().remove(&alloc_begin.raw())
    }

    /// Record with the largest start not above `addr`
    ///
    /// The record is not guaranteed to contain `addr`.
    pub fn find_by_address(&self, addr: DeviceAddr) -> Option<Arc<AllocationRecord>> {
        self.records
            .read()
            .range(..=addr.raw())
            .next_back()
            .map(|(_, record)| record.clone())
    }

    /// Number of tracked records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Snapshot of every record
    pub fn records(&self) -> Vec<Arc<AllocationRecord>> {
        self.records.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csan_core::{AllocKind, ContextHandle};

    fn record(begin: u64) -> Arc<AllocationRecord> {
        Arc::new(AllocationRecord::new(
            ContextHandle::new(1),
            None,
            AllocKind::Host,
            DeviceAddr::new(begin),
            64,
            DeviceAddr::new(begin + 16),
            16,
        ))
    }

    #[test]
    fn test_nearest_preceding() {
        let index = AllocationIndex::new();
        index.insert(record(0x1000));
        index.insert(record(0x2000));

        assert!(index.find_by_address(DeviceAddr::new(0xfff)).is_none());
        let found = index.find_by_address(DeviceAddr::new(0x1000)).unwrap();
        assert_eq!(found.alloc_begin, DeviceAddr::new(0x1000));
        let found = index.find_by_address(DeviceAddr::new(0x1fff)).unwrap();
        assert_eq!(found.alloc_begin, DeviceAddr::new(0x1000));
        let found = index.find_by_address(DeviceAddr::new(0x9000)).unwrap();
        assert_eq!(found.alloc_begin, DeviceAddr::new(0x2000));
    }

    #[test]
    fn test_remove() {
        let index = AllocationIndex::new();
        index.insert(record(0x1000));
        assert_eq!(index.len(), 1);
        assert!(index.remove(DeviceAddr::new(0x1000)).is_some());
        assert!(index.remove(DeviceAddr::new(0x1000)).is_none());
        assert!(index.is_empty());
    }
}
