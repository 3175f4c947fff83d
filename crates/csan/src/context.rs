//! # Context and Device Records
//!
//! Per-device shadow information and per-context pending shadow writes.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

use csan_core::{ContextHandle, DeviceHandle, Error, Result};
use csan_shadow::{DeviceShadow, DeviceShape};

use crate::allocation::AllocationRecord;

// =============================================================================
// DEVICE RECORD
// =============================================================================

/// A device known to the sanitizer
#[derive(Debug)]
pub struct DeviceRecord {
    /// Provisioned shadow of the device
    pub shadow: DeviceShadow,
    /// Base address alignment of allocations
    pub alignment: u64,
    /// Work-group local memory size
    pub local_mem_size: u64,
}

impl DeviceRecord {
    /// Native device handle
    pub fn handle(&self) -> DeviceHandle {
        self.shadow.device
    }

    /// Device shape
    pub fn shape(&self) -> DeviceShape {
        self.shadow.shape
    }
}

// =============================================================================
// CONTEXT RECORD
// =============================================================================

/// A context known to the sanitizer
#[derive(Debug)]
pub struct ContextRecord {
    /// Native context handle
    pub handle: ContextHandle,
    /// Devices of the context
    pub devices: Vec<DeviceHandle>,
    /// Records awaiting a shadow write, per device
    pending: HashMap<DeviceHandle, Mutex<Vec<Arc<AllocationRecord>>>>,
}

impl ContextRecord {
    /// Create a record with an empty pending list per device
    pub fn new(handle: ContextHandle, devices: Vec<DeviceHandle>) -> Self {
        let pending = devices.iter().map(|&d| (d, Mutex::new(Vec::new()))).collect();
        Self {
            handle,
            devices,
            pending,
        }
    }

    /// Queue `record` for a shadow write on each of `devices`
    pub fn enqueue(&self, devices: &[DeviceHandle], record: &Arc<AllocationRecord>) -> Result<()> {
        for device in devices {
            let list = self.pending.get(device).ok_or(Error::InvalidDevice)?;
            list.lock().push(record.clone());
        }
        Ok(())
    }

    /// Queue `record` on its owning device, or on every device if it has none
    /// or is host-wide
    pub fn enqueue_owned(&self, record: &Arc<AllocationRecord>) -> Result<()> {
        match record.device {
            Some(device) if !record.kind.is_host_wide() => self.enqueue(&[device], record),
            _ => self.enqueue(&self.devices, record),
        }
    }

    /// Run `paint` over every pending record of `device`
    ///
    /// The list is cleared only if every record was painted.
    pub fn drain<F>(&self, device: DeviceHandle, mut paint: F) -> Result<usize>
    where
        F: FnMut(&AllocationRecord) -> Result<()>,
    {
        let list = self.pending.get(&device).ok_or(Error::InvalidDevice)?;
        let mut list = list.lock();
        for record in list.iter() {
            paint(record)?;
        }
        let count = list.len();
        list.clear();
        Ok(count)
    }

    /// Number of records pending on `device`
    pub fn pending_count(&self, device: DeviceHandle) -> usize {
        self.pending.get(&device).map_or(0, |list| list.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csan_core::{AllocKind, DeviceAddr};

    fn record(kind: AllocKind, device: Option<DeviceHandle>) -> Arc<AllocationRecord> {
        Arc::new(AllocationRecord::new(
            ContextHandle::new(1),
            device,
            kind,
            DeviceAddr::new(0x1000),
            48,
            DeviceAddr::new(0x1010),
            8,
        ))
    }

    #[test]
    fn test_host_records_go_everywhere() {
        let a = DeviceHandle::new(10);
        let b = DeviceHandle::new(11);
        let ctx = ContextRecord::new(ContextHandle::new(1), alloc::vec![a, b]);

        ctx.enqueue_owned(&record(AllocKind::Host, None)).unwrap();
        ctx.enqueue_owned(&record(AllocKind::Device, Some(b))).unwrap();
        assert_eq!(ctx.pending_count(a), 1);
        assert_eq!(ctx.pending_count(b), 2);
    }

    #[test]
    fn test_failed_drain_keeps_list() {
        let a = DeviceHandle::new(10);
        let ctx = ContextRecord::new(ContextHandle::new(1), alloc::vec![a]);
        ctx.enqueue_owned(&record(AllocKind::Device, Some(a))).unwrap();

        let result = ctx.drain(a, |_| Err(Error::OutOfDeviceMemory));
        assert_eq!(result, Err(Error::OutOfDeviceMemory));
        assert_eq!(ctx.pending_count(a), 1);

        assert_eq!(ctx.drain(a, |_| Ok(())), Ok(1));
        assert_eq!(ctx.pending_count(a), 0);
    }

    #[test]
    fn test_unknown_device() {
        let ctx = ContextRecord::new(ContextHandle::new(1), Vec::new());
        let r = record(AllocKind::Device, Some(DeviceHandle::new(3)));
        assert_eq!(ctx.enqueue_owned(&r), Err(Error::InvalidDevice));
    }
}
