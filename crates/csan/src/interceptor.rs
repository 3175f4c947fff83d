//! # Interceptor
//!
//! Entry points called around every allocate, free and launch of the
//! compute runtime, plus the context and device registration hooks.

use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::RwLock;

use csan_core::{
    AllocKind, ComputeRuntime, ContextHandle, DeviceAddr, DeviceHandle, DeviceKind, Error, Options, Result,
    UsmDesc, SHADOW_GRANULARITY,
};
use csan_shadow::{DeviceShape, ShadowEngine, ShadowLayouts};

use crate::allocation::{AllocationRecord, RedzoneLayout};
use crate::context::{ContextRecord, DeviceRecord};
use crate::quarantine::Quarantine;
use crate::report::{Diagnostic, ViolationKind};
use crate::tracker::AllocationIndex;

/// The sanitizer
#[derive(Debug)]
pub struct Interceptor {
    runtime: Arc<dyn ComputeRuntime>,
    options: Options,
    shadow: ShadowEngine,
    allocations: AllocationIndex,
    quarantine: Option<Quarantine>,
    contexts: RwLock<HashMap<ContextHandle, Arc<ContextRecord>>>,
    devices: RwLock<HashMap<DeviceHandle, Arc<DeviceRecord>>>,
}

impl Interceptor {
    /// Create a sanitizer over `runtime`
    pub fn new(runtime: Arc<dyn ComputeRuntime>, options: Options) -> Self {
        Self::with_layouts(runtime, options, ShadowLayouts::default())
    }

    /// Create a sanitizer with explicit shadow layouts
    pub fn with_layouts(runtime: Arc<dyn ComputeRuntime>, options: Options, layouts: ShadowLayouts) -> Self {
        let quarantine = options.quarantine_cap().map(Quarantine::new);
        log::info!(
            "sanitizer options: debug={} quarantine={} detect_locals={}",
            options.debug,
            options.quarantine_size_mb,
            options.detect_locals
        );
        Self {
            shadow: ShadowEngine::with_layouts(runtime.clone(), layouts),
            runtime,
            options,
            allocations: AllocationIndex::new(),
            quarantine,
            contexts: RwLock::new(HashMap::new()),
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Runtime the sanitizer calls into
    pub fn runtime(&self) -> &dyn ComputeRuntime {
        &*self.runtime
    }

    /// Options in effect
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Shadow engine
    pub fn shadow(&self) -> &ShadowEngine {
        &self.shadow
    }

    /// Allocation index
    pub fn allocations(&self) -> &AllocationIndex {
        &self.allocations
    }

    /// Quarantine, unless disabled
    pub fn quarantine(&self) -> Option<&Quarantine> {
        self.quarantine.as_ref()
    }

    // =========================================================================
    // Registration hooks
    // =========================================================================

    /// Register `context` and every device it was created with
    pub fn insert_context(&self, context: ContextHandle) -> Result<Arc<ContextRecord>> {
        if let Some(record) = self.contexts.read().get(&context) {
            return Ok(record.clone());
        }
        let devices = self.runtime.context_devices(context)?;
        for &device in &devices {
            self.insert_device(context, device)?;
        }
        let record = Arc::new(ContextRecord::new(context, devices));
        log::debug!("context {:?} registered with {} devices", context, record.devices.len());
        Ok(self.contexts.write().entry(context).or_insert(record).clone())
    }

    /// Forget `context`
    pub fn erase_context(&self, context: ContextHandle) -> Result<()> {
        self.contexts
            .write()
            .remove(&context)
            .map(|_| ())
            .ok_or(Error::InvalidContext)
    }

    /// Register `device` and provision its shadow
    pub fn insert_device(&self, context: ContextHandle, device: DeviceHandle) -> Result<Arc<DeviceRecord>> {
        if let Some(record) = self.devices.read().get(&device) {
            return Ok(record.clone());
        }
        let info = self.runtime.device_info(device)?;
        let shape = match info.kind {
            DeviceKind::Cpu => DeviceShape::HostLike,
            DeviceKind::Gpu => DeviceShape::TiledAccelerator,
            DeviceKind::Other => {
                log::error!("unsupported device {:?}", device);
                return Err(Error::UnsupportedDevice);
            }
        };
        let shadow = self.shadow.provision(context, device, shape)?;
        let record = Arc::new(DeviceRecord {
            shadow,
            alignment: u64::from(info.mem_base_addr_align),
            local_mem_size: info.local_mem_size,
        });
        Ok(self.devices.write().entry(device).or_insert(record).clone())
    }

    /// Forget `device`
    pub fn erase_device(&self, device: DeviceHandle) -> Result<()> {
        self.devices
            .write()
            .remove(&device)
            .map(|_| ())
            .ok_or(Error::InvalidDevice)
    }

    /// Record of `context`, registering it on first use
    pub fn context_record(&self, context: ContextHandle) -> Result<Arc<ContextRecord>> {
        self.insert_context(context)
    }

    /// Record of `device`, if registered
    pub fn device_record(&self, device: DeviceHandle) -> Option<Arc<DeviceRecord>> {
        self.devices.read().get(&device).cloned()
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `size` bytes of `kind` memory bracketed by redzones
    ///
    /// Alignment zero selects the device's base alignment, or the shadow
    /// granularity for host memory.
    pub fn allocate_memory(
        &self,
        context: ContextHandle,
        device: Option<DeviceHandle>,
        desc: &UsmDesc,
        size: u64,
        kind: AllocKind,
    ) -> Result<DeviceAddr> {
        if !kind.is_user_releasable() {
            return Err(Error::InvalidArgument);
        }
        if size == 0 {
            return Err(Error::InvalidSize);
        }
        let requested = u64::from(desc.align);
        if requested != 0 && !requested.is_power_of_two() {
            log::error!("alignment {} is not a power of two", requested);
            return Err(Error::InvalidAlignment);
        }

        let context_record = self.context_record(context)?;
        if let Some(d) = device.filter(|d| !context_record.devices.contains(d)) {
            log::error!("device {:?} is not part of context {:?}", d, context);
            return Err(Error::InvalidDevice);
        }
        let device_record = device.map(|d| self.insert_device(context, d)).transpose()?;

        let alignment = match (requested, &device_record) {
            (0, Some(record)) => record.alignment,
            (0, None) => SHADOW_GRANULARITY,
            (align, _) => align,
        };
        let layout = RedzoneLayout::new(size, alignment).map_err(|e| {
            log::error!("allocation of {:#x} bytes with redzones exceeds the address space", size);
            e
        })?;

        let rt = &self.runtime;
        let alloc_begin = match (kind, device) {
            (AllocKind::Host, _) | (AllocKind::MemBuffer, None) => rt.usm_host_alloc(context, desc, layout.needed),
            (AllocKind::Device | AllocKind::MemBuffer, Some(d)) => rt.usm_device_alloc(context, d, desc, layout.needed),
            (AllocKind::Shared, d) => rt.usm_shared_alloc(context, d.unwrap_or(DeviceHandle::null()), desc, layout.needed),
            (AllocKind::Device, None) => return Err(Error::InvalidDevice),
            (AllocKind::DeviceGlobal, _) => return Err(Error::InvalidArgument),
        }?;

        let user_begin = layout.user_begin(alloc_begin);
        let record = Arc::new(AllocationRecord::new(
            context,
            device,
            kind,
            alloc_begin,
            layout.needed,
            user_begin,
            size,
        ));
        log::debug!(
            "alloc {} {}: [{}, {}) in [{}, +{:#x})",
            kind,
            size,
            record.user_begin,
            record.user_end,
            alloc_begin,
            layout.needed
        );

        context_record.enqueue_owned(&record)?;
        self.allocations.insert(record);
        Ok(user_begin)
    }

    /// Release an allocation made by [`Interceptor::allocate_memory`]
    pub fn release_memory(&self, context: ContextHandle, ptr: DeviceAddr) -> Result<()> {
        let record = self
            .allocations
            .find_by_address(ptr)
            .filter(|record| record.contains(ptr));
        let Some(record) = record else {
            Diagnostic::host(ViolationKind::BadFree, ptr, None).emit();
            return Err(Error::BadFree);
        };

        if record.context != context {
            if ptr == record.user_begin {
                Diagnostic::host(ViolationKind::BadContext, ptr, Some(record)).emit();
                return Err(Error::BadContext);
            }
            Diagnostic::host(ViolationKind::BadFree, ptr, Some(record)).emit();
            return Err(Error::BadFree);
        }
        if ptr != record.user_begin {
            Diagnostic::host(ViolationKind::InvalidFree, ptr, Some(record)).emit();
            return Err(Error::InvalidFree);
        }
        if !record.kind.is_user_releasable() {
            Diagnostic::host(ViolationKind::BadFree, ptr, Some(record)).emit();
            return Err(Error::BadFree);
        }
        if !record.mark_released() {
            Diagnostic::host(ViolationKind::DoubleFree, ptr, Some(record)).emit();
            return Err(Error::DoubleFree);
        }

        log::debug!("free {} {}", record.kind, ptr);
        self.context_record(context)?.enqueue_owned(&record)?;

        let Some(quarantine) = &self.quarantine else {
            self.allocations.remove(record.alloc_begin);
            return self.runtime.usm_free(context, record.alloc_begin);
        };

        let owner = record.device.unwrap_or(DeviceHandle::null());
        let mut first = None;
        for evicted in quarantine.put(owner, record) {
            self.allocations.remove(evicted.alloc_begin);
            if let Err(e) = self.runtime.usm_free(evicted.context, evicted.alloc_begin) {
                log::error!("failed to free evicted allocation {}: {}", evicted.alloc_begin, e);
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Record whose allocation start is the closest at or below `addr`
    pub fn find_alloc_by_address(&self, addr: DeviceAddr) -> Option<Arc<AllocationRecord>> {
        self.allocations.find_by_address(addr)
    }

    /// Release all shadow memory
    pub fn teardown(&self) -> Result<()> {
        self.shadow.teardown()
    }

    /// Registered contexts
    pub fn contexts(&self) -> Vec<ContextHandle> {
        self.contexts.read().keys().copied().collect()
    }
}
