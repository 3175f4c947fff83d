//! # Memory Buffers
//!
//! A runtime memory buffer is backed lazily, one sanitizer allocation per
//! device that uses it. Contents follow the buffer from device to device
//! through a host staging allocation.

use alloc::sync::Arc;

use hashbrown::HashMap;
use spin::Mutex;

use csan_core::{AllocKind, ContextHandle, DeviceAddr, DeviceHandle, Error, QueueHandle, Result, UsmDesc};

use crate::interceptor::Interceptor;

/// Largest alignment requested for buffer backings
pub const MAX_BUFFER_ALIGNMENT: u64 = 128;

#[derive(Debug, Default)]
struct Backings {
    allocations: HashMap<DeviceHandle, DeviceAddr>,
    /// Device holding the most recent contents
    last_synced: Option<DeviceHandle>,
}

#[derive(Debug)]
enum Storage {
    Root {
        host_ptr: Option<DeviceAddr>,
        backings: Mutex<Backings>,
    },
    Sub {
        parent: Arc<MemBuffer>,
        origin: u64,
    },
}

/// A memory buffer tracked by the sanitizer
#[derive(Debug)]
pub struct MemBuffer {
    context: ContextHandle,
    size: u64,
    storage: Storage,
}

impl MemBuffer {
    /// Create a buffer, optionally initialised from host memory at `host_ptr`
    pub fn new(context: ContextHandle, size: u64, host_ptr: Option<DeviceAddr>) -> Self {
        Self {
            context,
            size,
            storage: Storage::Root {
                host_ptr,
                backings: Mutex::new(Backings::default()),
            },
        }
    }

    /// Create a view of `size` bytes at `origin` inside `parent`
    pub fn sub_buffer(parent: Arc<MemBuffer>, origin: u64, size: u64) -> Result<Self> {
        if origin.checked_add(size).map_or(true, |end| end > parent.size) {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            context: parent.context,
            size,
            storage: Storage::Sub { parent, origin },
        })
    }

    /// Buffer size
    pub fn size(&self) -> u64 {
        self.size
    }

    fn alignment(&self) -> u64 {
        self.size.next_power_of_two().min(MAX_BUFFER_ALIGNMENT)
    }

    /// Device address of the buffer on `device`
    ///
    /// The first request from a device allocates its backing. If another
    /// device holds newer contents they are copied over on `queue`.
    pub fn handle(&self, csan: &Interceptor, queue: QueueHandle, device: DeviceHandle) -> Result<DeviceAddr> {
        let (host_ptr, backings) = match &self.storage {
            Storage::Sub { parent, origin } => return Ok(parent.handle(csan, queue, device)? + *origin),
            Storage::Root { host_ptr, backings } => (*host_ptr, backings),
        };
        let runtime = csan.runtime();
        let mut backings = backings.lock();

        let (ptr, fresh) = match backings.allocations.get(&device) {
            Some(&ptr) => (ptr, false),
            None => {
                let desc = UsmDesc::aligned(self.alignment() as u32);
                let ptr = csan.allocate_memory(self.context, Some(device), &desc, self.size, AllocKind::MemBuffer)?;
                backings.allocations.insert(device, ptr);
                (ptr, true)
            }
        };

        match backings.last_synced {
            Some(last) if last != device => {
                let src = backings.allocations.get(&last).copied().ok_or(Error::InvalidDevice)?;
                let staging = csan.allocate_memory(self.context, None, &UsmDesc::default(), self.size, AllocKind::Host)?;
                let copied = runtime
                    .enqueue_usm_memcpy(queue, true, staging, src, self.size)
                    .and_then(|()| runtime.enqueue_usm_memcpy(queue, true, ptr, staging, self.size));
                let released = csan.release_memory(self.context, staging);
                copied?;
                released?;
                log::debug!("buffer migrated from {:?} to {:?}", last, device);
            }
            None if fresh => {
                if let Some(host_ptr) = host_ptr {
                    runtime.enqueue_usm_memcpy(queue, true, ptr, host_ptr, self.size)?;
                }
            }
            _ => {}
        }
        backings.last_synced = Some(device);
        Ok(ptr)
    }

    /// Release every device backing
    pub fn free(&self, csan: &Interceptor) -> Result<()> {
        let Storage::Root { backings, .. } = &self.storage else {
            return Ok(());
        };
        let mut backings = backings.lock();
        let mut first = None;
        for (_, ptr) in backings.allocations.drain() {
            if let Err(e) = csan.release_memory(self.context, ptr) {
                first.get_or_insert(e);
            }
        }
        backings.last_synced = None;
        first.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csan_core::mock::MockRuntime;
    use csan_core::{ComputeRuntime, DeviceKind, Options};

    struct Setup {
        rt: Arc<MockRuntime>,
        csan: Interceptor,
        context: ContextHandle,
        a: DeviceHandle,
        b: DeviceHandle,
    }

    fn setup() -> Setup {
        let rt = Arc::new(MockRuntime::new());
        let a = rt.add_device(DeviceKind::Cpu, 8, 0);
        let b = rt.add_device(DeviceKind::Gpu, 8, 0);
        let context = rt.add_context(&[a, b]);
        let csan = Interceptor::new(rt.clone(), Options::default());
        Setup { rt, csan, context, a, b }
    }

    #[test]
    fn test_lazy_backing_with_host_data() {
        let s = setup();
        let host = s.rt.usm_host_alloc(s.context, &UsmDesc::default(), 16).unwrap();
        s.rt.write_bytes(host, b"sanitized buffer");
        let buffer = MemBuffer::new(s.context, 16, Some(host));
        let queue = s.rt.user_queue(s.context, s.a);

        let ptr = buffer.handle(&s.csan, queue, s.a).unwrap();
        assert!(ptr.is_aligned(16));
        assert_eq!(s.rt.read_bytes(ptr, 16), b"sanitized buffer");
        assert_eq!(buffer.handle(&s.csan, queue, s.a).unwrap(), ptr);
        let record = s.csan.find_alloc_by_address(ptr).unwrap();
        assert_eq!(record.kind, AllocKind::MemBuffer);
    }

    #[test]
    fn test_migration_between_devices() {
        let s = setup();
        let buffer = MemBuffer::new(s.context, 8, None);
        let queue = s.rt.user_queue(s.context, s.a);

        let on_a = buffer.handle(&s.csan, queue, s.a).unwrap();
        s.rt.write_bytes(on_a, &[7; 8]);
        let on_b = buffer.handle(&s.csan, queue, s.b).unwrap();
        assert_ne!(on_a, on_b);
        assert_eq!(s.rt.read_bytes(on_b, 8), [7; 8]);
        // staging allocation released again
        assert_eq!(s.csan.allocations().len(), 2);
    }

    #[test]
    fn test_sub_buffer_offsets() {
        let s = setup();
        let parent = Arc::new(MemBuffer::new(s.context, 256, None));
        let queue = s.rt.user_queue(s.context, s.a);
        let sub = MemBuffer::sub_buffer(parent.clone(), 64, 32).unwrap();
        let base = parent.handle(&s.csan, queue, s.a).unwrap();
        assert_eq!(sub.handle(&s.csan, queue, s.a).unwrap(), base + 64);
        assert!(MemBuffer::sub_buffer(parent, 250, 32).is_err());
    }

    #[test]
    fn test_free_releases_all_backings() {
        let s = setup();
        let buffer = MemBuffer::new(s.context, 1000, None);
        let queue = s.rt.user_queue(s.context, s.a);
        buffer.handle(&s.csan, queue, s.a).unwrap();
        buffer.handle(&s.csan, queue, s.b).unwrap();
        assert_eq!(s.csan.allocations().len(), 2);
        buffer.free(&s.csan).unwrap();
        assert!(s.csan.allocations().is_empty());
    }
}
