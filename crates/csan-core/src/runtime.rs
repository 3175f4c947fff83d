//! # Compute Runtime Call Surface
//!
//! The sanitizer consumes the underlying compute runtime only through this
//! trait. Adapters for real runtimes implement it by forwarding to their
//! dispatch tables; tests use [`crate::mock::MockRuntime`].
//!
//! ## Trait Layout
//!
//! ```text
//! ComputeRuntime
//!    │
//!    ├── USM            host / device / shared alloc, free
//!    ├── Enqueue        fill, copy, device-global read/write, event wait
//!    ├── Objects        device info, context/queue/program/kernel queries
//!    ├── Virtual Memory reserve, map/unmap, physical pages
//!    └── Host Memory    reserve/fill of host-resident shadow
//! ```

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::error::Result;
use crate::types::*;

// =============================================================================
// DESCRIPTORS
// =============================================================================

/// USM allocation properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsmDesc {
    /// Requested alignment; zero lets the allocator choose
    pub align: u32,
}

impl UsmDesc {
    /// Descriptor with an explicit alignment
    pub const fn aligned(align: u32) -> Self {
        Self { align }
    }
}

/// Device category as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// CPU device sharing the host address space
    Cpu,
    /// Discrete GPU
    Gpu,
    /// Anything else (FPGA, custom accelerators)
    Other,
}

/// Device properties the sanitizer depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device category
    pub kind: DeviceKind,
    /// Base address alignment of allocations, in bytes
    pub mem_base_addr_align: u32,
    /// Work-group local memory size, in bytes
    pub local_mem_size: u64,
}

bitflags::bitflags! {
    /// Access rights of a virtual memory mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VirtualMemAccess: u32 {
        /// Mapping is readable
        const READ = 1 << 0;
        /// Mapping is writable
        const WRITE = 1 << 1;
        /// Read and write
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

// =============================================================================
// RUNTIME TRAIT
// =============================================================================

/// The narrow call surface of the compute runtime
///
/// Every method mirrors one runtime entry point. Errors are returned
/// unchanged to the sanitizer, which propagates them to its caller.
pub trait ComputeRuntime: Send + Sync + fmt::Debug {
    // -------------------------------------------------------------------------
    // USM
    // -------------------------------------------------------------------------

    /// Allocate host USM
    fn usm_host_alloc(&self, context: ContextHandle, desc: &UsmDesc, size: u64) -> Result<DeviceAddr>;

    /// Allocate device USM on `device`
    fn usm_device_alloc(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &UsmDesc,
        size: u64,
    ) -> Result<DeviceAddr>;

    /// Allocate shared USM associated with `device`
    fn usm_shared_alloc(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        desc: &UsmDesc,
        size: u64,
    ) -> Result<DeviceAddr>;

    /// Free any USM allocation
    fn usm_free(&self, context: ContextHandle, ptr: DeviceAddr) -> Result<()>;

    // -------------------------------------------------------------------------
    // Enqueue
    // -------------------------------------------------------------------------

    /// Fill `size` bytes at `ptr` with `value`, in queue order
    fn enqueue_usm_fill(&self, queue: QueueHandle, ptr: DeviceAddr, value: u8, size: u64) -> Result<()>;

    /// Copy `size` bytes from `src` to `dst`, in queue order
    fn enqueue_usm_memcpy(
        &self,
        queue: QueueHandle,
        blocking: bool,
        dst: DeviceAddr,
        src: DeviceAddr,
        size: u64,
    ) -> Result<()>;

    /// Write `src` into the device global `name` of `program`
    fn enqueue_device_global_write(
        &self,
        queue: QueueHandle,
        program: ProgramHandle,
        name: &str,
        blocking: bool,
        offset: u64,
        src: &[u8],
    ) -> Result<()>;

    /// Read the device global `name` of `program` into `dst`
    ///
    /// The read starts after every event of `wait_list` completed and
    /// returns the event of the read itself.
    fn enqueue_device_global_read(
        &self,
        queue: QueueHandle,
        program: ProgramHandle,
        name: &str,
        blocking: bool,
        offset: u64,
        dst: &mut [u8],
        wait_list: &[EventHandle],
    ) -> Result<EventHandle>;

    /// Block until every event completed
    fn event_wait(&self, events: &[EventHandle]) -> Result<()>;

    // -------------------------------------------------------------------------
    // Object queries
    // -------------------------------------------------------------------------

    /// Query device properties
    fn device_info(&self, device: DeviceHandle) -> Result<DeviceInfo>;

    /// Devices a context was created with
    fn context_devices(&self, context: ContextHandle) -> Result<Vec<DeviceHandle>>;

    /// Increment the context reference count
    fn context_retain(&self, context: ContextHandle) -> Result<()>;

    /// Decrement the context reference count
    fn context_release(&self, context: ContextHandle) -> Result<()>;

    /// Create an in-order queue
    fn queue_create(&self, context: ContextHandle, device: DeviceHandle) -> Result<QueueHandle>;

    /// Block until every command submitted to `queue` completed
    fn queue_finish(&self, queue: QueueHandle) -> Result<()>;

    /// Release a queue
    fn queue_release(&self, queue: QueueHandle) -> Result<()>;

    /// Context a queue belongs to
    fn queue_context(&self, queue: QueueHandle) -> Result<ContextHandle>;

    /// Device a queue submits to
    fn queue_device(&self, queue: QueueHandle) -> Result<DeviceHandle>;

    /// Program a kernel was created from
    fn kernel_program(&self, kernel: KernelHandle) -> Result<ProgramHandle>;

    /// Kernel function name
    fn kernel_name(&self, kernel: KernelHandle) -> Result<String>;

    /// Devices a program is built for
    fn program_devices(&self, program: ProgramHandle) -> Result<Vec<DeviceHandle>>;

    // -------------------------------------------------------------------------
    // Virtual / physical memory
    // -------------------------------------------------------------------------

    /// Page size of virtual memory mappings on `device`
    fn virtual_mem_granularity(&self, context: ContextHandle, device: DeviceHandle) -> Result<u64>;

    /// Reserve a virtual address range without backing memory
    fn virtual_mem_reserve(&self, context: ContextHandle, size: u64) -> Result<DeviceAddr>;

    /// Free a reserved virtual address range
    fn virtual_mem_free(&self, context: ContextHandle, addr: DeviceAddr, size: u64) -> Result<()>;

    /// Map physical memory into a reserved range
    fn virtual_mem_map(
        &self,
        context: ContextHandle,
        addr: DeviceAddr,
        size: u64,
        memory: PhysicalMemHandle,
        offset: u64,
        access: VirtualMemAccess,
    ) -> Result<()>;

    /// Unmap a previously mapped range
    fn virtual_mem_unmap(&self, context: ContextHandle, addr: DeviceAddr, size: u64) -> Result<()>;

    /// Create physical device memory
    fn physical_mem_create(
        &self,
        context: ContextHandle,
        device: DeviceHandle,
        size: u64,
    ) -> Result<PhysicalMemHandle>;

    /// Release physical device memory
    fn physical_mem_release(&self, memory: PhysicalMemHandle) -> Result<()>;

    // -------------------------------------------------------------------------
    // Host memory
    // -------------------------------------------------------------------------

    /// Reserve host address space that is committed on first touch
    fn host_reserve(&self, size: u64) -> Result<DeviceAddr>;

    /// Release a host reservation
    fn host_release(&self, addr: DeviceAddr, size: u64) -> Result<()>;

    /// Fill host memory without going through any interception
    fn host_fill(&self, addr: DeviceAddr, value: u8, size: u64) -> Result<()>;
}
