//! # Shadow Provisioning
//!
//! The process owns one shadow range per device shape. Host-like devices
//! share a single host reservation that the platform commits on first touch.
//! Tiled accelerators share a single device virtual reservation whose pages
//! are backed by physical memory one at a time, the first time a paint
//! lands on them.
//!
//! ```text
//!   virtual reservation (1 << 46)
//!   ┌──────┬──────┬──────┬──────┬─────────────────────────┐
//!   │mapped│      │mapped│      │        unmapped         │
//!   └──────┴──────┴──────┴──────┴─────────────────────────┘
//!      ▲             ▲
//!      └── physical page + zero fill, created on first paint
//! ```

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use csan_core::{
    ComputeRuntime, ContextHandle, DeviceAddr, DeviceHandle, Error, PhysicalMemHandle, QueueHandle, Result,
    VirtualMemAccess,
};

use crate::mapping::{DeviceShape, ShadowLayouts, ShadowRange};

// =============================================================================
// DEVICE SHADOW
// =============================================================================

/// Shadow of one device, as returned by [`ShadowEngine::provision`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceShadow {
    /// Device the shadow describes
    pub device: DeviceHandle,
    /// Shape of the device
    pub shape: DeviceShape,
    /// Provisioned shadow range
    pub range: ShadowRange,
}

// =============================================================================
// PROCESS STATE
// =============================================================================

#[derive(Debug)]
struct HostShadow {
    range: ShadowRange,
}

#[derive(Debug)]
struct TiledShadow {
    /// Context the reservation was made in
    context: ContextHandle,
    range: ShadowRange,
    page_size: u64,
    /// Mapped pages by base address
    pages: BTreeMap<u64, PhysicalMemHandle>,
}

/// Shadow provisioning and painting for every device of the process
#[derive(Debug)]
pub struct ShadowEngine {
    runtime: Arc<dyn ComputeRuntime>,
    layouts: ShadowLayouts,
    host: Mutex<Option<HostShadow>>,
    tiled: Mutex<Option<TiledShadow>>,
}

impl ShadowEngine {
    /// Create an engine with the default layouts
    pub fn new(runtime: Arc<dyn ComputeRuntime>) -> Self {
        Self::with_layouts(runtime, ShadowLayouts::default())
    }

    /// Create an engine with explicit layouts
    pub fn with_layouts(runtime: Arc<dyn ComputeRuntime>, layouts: ShadowLayouts) -> Self {
        Self {
            runtime,
            layouts,
            host: Mutex::new(None),
            tiled: Mutex::new(None),
        }
    }

    /// Layout parameters in use
    pub fn layouts(&self) -> &ShadowLayouts {
        &self.layouts
    }

    pub(crate) fn runtime(&self) -> &dyn ComputeRuntime {
        &*self.runtime
    }

    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Provision the shadow range of `device`
    ///
    /// The first device of each shape creates the process-wide reservation;
    /// later devices share it.
    pub fn provision(&self, context: ContextHandle, device: DeviceHandle, shape: DeviceShape) -> Result<DeviceShadow> {
        let range = match shape {
            DeviceShape::HostLike => self.provision_host()?,
            DeviceShape::TiledAccelerator => self.provision_tiled(context, device)?,
        };
        log::debug!("shadow for {:?} ({:?}): [{}, {})", device, shape, range.base, range.limit);
        Ok(DeviceShadow { device, shape, range })
    }

    fn provision_host(&self) -> Result<ShadowRange> {
        let mut host = self.host.lock();
        if let Some(shadow) = host.as_ref() {
            return Ok(shadow.range);
        }
        let size = self.layouts.host.reservation;
        let base = self.runtime.host_reserve(size).map_err(|e| {
            log::error!("failed to reserve {:#x} bytes of host shadow: {}", size, e);
            e
        })?;
        let range = ShadowRange::new(base, size);
        log::info!("host shadow reserved at {}", base);
        *host = Some(HostShadow { range });
        Ok(range)
    }

    fn provision_tiled(&self, context: ContextHandle, device: DeviceHandle) -> Result<ShadowRange> {
        let mut tiled = self.tiled.lock();
        if let Some(shadow) = tiled.as_ref() {
            return Ok(shadow.range);
        }
        let page_size = self.runtime.virtual_mem_granularity(context, device)?;
        let size = self.layouts.tiled.reservation;
        let base = self.runtime.virtual_mem_reserve(context, size).map_err(|e| {
            log::error!("failed to reserve {:#x} bytes of device shadow: {}", size, e);
            e
        })?;
        let range = ShadowRange::new(base, size);
        log::info!("device shadow reserved at {} (page size {:#x})", base, page_size);
        *tiled = Some(TiledShadow {
            context,
            range,
            page_size,
            pages: BTreeMap::new(),
        });
        Ok(range)
    }

    /// Back every page of `[begin, end]` in the tiled reservation
    ///
    /// Newly mapped pages are zero-filled on `queue` before anything else
    /// is written to them.
    pub(crate) fn ensure_mapped(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        queue: QueueHandle,
        begin: DeviceAddr,
        end: DeviceAddr,
    ) -> Result<()> {
        let mut guard = self.tiled.lock();
        let tiled = guard.as_mut().ok_or(Error::InvalidDevice)?;
        let page_size = tiled.page_size;
        let mut page = begin.align_down(page_size);
        while page <= end {
            if !tiled.pages.contains_key(&page.raw()) {
                let memory = self.map_page(context, device, queue, page, page_size)?;
                tiled.pages.insert(page.raw(), memory);
                log::debug!("mapped shadow page {}", page);
            }
            page = page + page_size;
        }
        Ok(())
    }

    /// Back `page` with new physical memory and zero it on `queue`
    ///
    /// On failure nothing stays mapped or allocated.
    fn map_page(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        queue: QueueHandle,
        page: DeviceAddr,
        page_size: u64,
    ) -> Result<PhysicalMemHandle> {
        let memory = self.runtime.physical_mem_create(context, device, page_size)?;
        if let Err(e) = self
            .runtime
            .virtual_mem_map(context, page, page_size, memory, 0, VirtualMemAccess::READ_WRITE)
        {
            log::error!("failed to map shadow page {}: {}", page, e);
            let _ = self.runtime.physical_mem_release(memory);
            return Err(e);
        }
        if let Err(e) = self.runtime.enqueue_usm_fill(queue, page, 0, page_size) {
            log::error!("failed to zero shadow page {}: {}", page, e);
            let _ = self.runtime.virtual_mem_unmap(context, page, page_size);
            let _ = self.runtime.physical_mem_release(memory);
            return Err(e);
        }
        Ok(memory)
    }

    /// Number of mapped tiled shadow pages
    pub fn mapped_pages(&self) -> usize {
        self.tiled.lock().as_ref().map_or(0, |t| t.pages.len())
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Unmap and release every shadow page and reservation
    ///
    /// Every step is attempted; the first failure is returned.
    pub fn teardown(&self) -> Result<()> {
        let mut first = None;
        let mut note = |r: Result<()>| {
            if let Err(e) = r {
                log::warn!("shadow teardown: {}", e);
                first.get_or_insert(e);
            }
        };

        if let Some(tiled) = self.tiled.lock().take() {
            for (&page, &memory) in &tiled.pages {
                note(self.runtime.virtual_mem_unmap(tiled.context, DeviceAddr::new(page), tiled.page_size));
                note(self.runtime.physical_mem_release(memory));
            }
            note(self.runtime.virtual_mem_free(tiled.context, tiled.range.base, tiled.range.size()));
        }
        if let Some(host) = self.host.lock().take() {
            note(self.runtime.host_release(host.range.base, host.range.size()));
        }

        first.map_or(Ok(()), Err)
    }
}

impl Drop for ShadowEngine {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csan_core::mock::{Call, MockRuntime};
    use csan_core::DeviceKind;

    fn engine() -> (Arc<MockRuntime>, ShadowEngine) {
        let rt = Arc::new(MockRuntime::new());
        let engine = ShadowEngine::new(rt.clone());
        (rt, engine)
    }

    #[test]
    fn test_host_reservation_shared() {
        let (rt, engine) = engine();
        let a = rt.add_device(DeviceKind::Cpu, 8, 0);
        let b = rt.add_device(DeviceKind::Cpu, 8, 0);
        let ctx = rt.add_context(&[a, b]);
        let sa = engine.provision(ctx, a, DeviceShape::HostLike).unwrap();
        let sb = engine.provision(ctx, b, DeviceShape::HostLike).unwrap();
        assert_eq!(sa.range, sb.range);
        assert_eq!(sa.range.size(), 0x0000_0800_0000_0000);
    }

    #[test]
    fn test_tiled_pages_mapped_once() {
        let (rt, engine) = engine();
        let dev = rt.add_device(DeviceKind::Gpu, 8, 0);
        let ctx = rt.add_context(&[dev]);
        let queue = rt.queue_create(ctx, dev).unwrap();
        let shadow = engine.provision(ctx, dev, DeviceShape::TiledAccelerator).unwrap();

        let begin = shadow.range.base + 0x100;
        engine.ensure_mapped(ctx, dev, queue, begin, begin + 0x10).unwrap();
        engine.ensure_mapped(ctx, dev, queue, begin, begin + 0x10).unwrap();
        assert_eq!(engine.mapped_pages(), 1);
        assert_eq!(rt.mapped_pages(), 1);

        // straddles into the second page
        engine.ensure_mapped(ctx, dev, queue, begin, begin + 0x10000).unwrap();
        assert_eq!(engine.mapped_pages(), 2);
    }

    #[test]
    fn test_physical_exhaustion_propagates() {
        let (rt, engine) = engine();
        let dev = rt.add_device(DeviceKind::Gpu, 8, 0);
        let ctx = rt.add_context(&[dev]);
        let queue = rt.queue_create(ctx, dev).unwrap();
        let shadow = engine.provision(ctx, dev, DeviceShape::TiledAccelerator).unwrap();

        rt.fail_physical_memory(Some(Error::OutOfDeviceMemory));
        let result = engine.ensure_mapped(ctx, dev, queue, shadow.range.base, shadow.range.base);
        assert_eq!(result, Err(Error::OutOfDeviceMemory));
        assert_eq!(engine.mapped_pages(), 0);
    }

    #[test]
    fn test_unzeroed_page_not_kept() {
        let (rt, engine) = engine();
        let dev = rt.add_device(DeviceKind::Gpu, 8, 0);
        let ctx = rt.add_context(&[dev]);
        let queue = rt.queue_create(ctx, dev).unwrap();
        let shadow = engine.provision(ctx, dev, DeviceShape::TiledAccelerator).unwrap();

        rt.fail_fills(Some(Error::OutOfResources));
        let result = engine.ensure_mapped(ctx, dev, queue, shadow.range.base, shadow.range.base);
        assert_eq!(result, Err(Error::OutOfResources));
        assert_eq!(engine.mapped_pages(), 0);
        assert_eq!(rt.mapped_pages(), 0);
        assert_eq!(rt.physical_blocks(), 0);

        // the page is mapped and zeroed again on the next attempt
        rt.fail_fills(None);
        engine.ensure_mapped(ctx, dev, queue, shadow.range.base, shadow.range.base).unwrap();
        assert_eq!(engine.mapped_pages(), 1);
        assert!(rt.calls().iter().any(|c| matches!(c, Call::Fill { ptr, .. } if *ptr == shadow.range.base)));
    }

    #[test]
    fn test_reservation_failure_propagates() {
        let (rt, engine) = engine();
        let dev = rt.add_device(DeviceKind::Gpu, 8, 0);
        let ctx = rt.add_context(&[dev]);
        rt.fail_virtual_reserve(Some(Error::OutOfVirtualAddressSpace));
        let result = engine.provision(ctx, dev, DeviceShape::TiledAccelerator);
        assert_eq!(result, Err(Error::OutOfVirtualAddressSpace));

        // nothing was cached, so a later attempt reserves afresh
        rt.fail_virtual_reserve(None);
        assert!(engine.provision(ctx, dev, DeviceShape::TiledAccelerator).is_ok());
    }

    #[test]
    fn test_teardown_releases_pages() {
        let (rt, engine) = engine();
        let dev = rt.add_device(DeviceKind::Gpu, 8, 0);
        let ctx = rt.add_context(&[dev]);
        let queue = rt.queue_create(ctx, dev).unwrap();
        let shadow = engine.provision(ctx, dev, DeviceShape::TiledAccelerator).unwrap();
        engine
            .ensure_mapped(ctx, dev, queue, shadow.range.base, shadow.range.base + 0x20000)
            .unwrap();
        assert_eq!(rt.physical_blocks(), 3);

        engine.teardown().unwrap();
        assert_eq!(rt.physical_blocks(), 0);
        assert_eq!(rt.mapped_pages(), 0);
        assert_eq!(engine.mapped_pages(), 0);
    }
}
