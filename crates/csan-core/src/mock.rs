//! # Mock Runtime
//!
//! In-memory [`ComputeRuntime`] for tests.
//!
//! Memory is a single sparse byte-addressable space shared by host and
//! devices. Each memory kind allocates from its own bump region so that
//! device USM on a GPU carries the device-local tag bits a real tiled
//! accelerator would hand out. Every enqueue is recorded in a call log so
//! tests can assert ordering.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::runtime::*;
use crate::types::*;

const PAGE_SIZE: u64 = 4096;

/// Base of host USM allocations
pub const HOST_USM_BASE: u64 = 0x0000_1000_0000_0000;
/// Base of device USM allocations on CPU devices
pub const CPU_DEVICE_USM_BASE: u64 = 0x0000_1800_0000_0000;
/// Base of shared USM allocations
pub const SHARED_USM_BASE: u64 = 0x0000_2000_0000_0000;
/// Base of device USM allocations on GPU devices (device-local tag set)
pub const GPU_DEVICE_USM_BASE: u64 = 0xFF00_1000_0000_0000;
/// Base of host reservations
pub const HOST_RESERVE_BASE: u64 = 0x0000_6000_0000_0000;
/// Base of virtual memory reservations
pub const VIRTUAL_RESERVE_BASE: u64 = 0x0000_7000_0000_0000;

/// Alignment of every mock allocation unless a larger one is requested
pub const MIN_ALLOC_ALIGN: u64 = 16;

/// One recorded runtime call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `enqueue_usm_fill`
    Fill {
        /// Queue
        queue: QueueHandle,
        /// Destination
        ptr: DeviceAddr,
        /// Fill byte
        value: u8,
        /// Byte count
        size: u64,
    },
    /// `host_fill`
    HostFill {
        /// Destination
        ptr: DeviceAddr,
        /// Fill byte
        value: u8,
        /// Byte count
        size: u64,
    },
    /// `enqueue_usm_memcpy`
    Memcpy {
        /// Destination
        dst: DeviceAddr,
        /// Source
        src: DeviceAddr,
        /// Byte count
        size: u64,
    },
    /// `enqueue_device_global_write`
    GlobalWrite {
        /// Queue
        queue: QueueHandle,
        /// Symbol name
        name: String,
    },
    /// `enqueue_device_global_read`
    GlobalRead {
        /// Queue
        queue: QueueHandle,
        /// Symbol name
        name: String,
        /// Events waited on
        wait_list: Vec<EventHandle>,
    },
    /// [`MockRuntime::launch`]
    Launch {
        /// Queue
        queue: QueueHandle,
        /// Kernel
        kernel: KernelHandle,
    },
    /// `queue_finish`
    Finish {
        /// Queue
        queue: QueueHandle,
    },
    /// `usm_free`
    Free {
        /// Freed pointer
        ptr: DeviceAddr,
    },
    /// `virtual_mem_map`
    Map {
        /// Mapped page
        addr: DeviceAddr,
        /// Mapping size
        size: u64,
    },
}

#[derive(Debug)]
struct MockDevice {
    info: DeviceInfo,
    granularity: u64,
}

#[derive(Debug, Default)]
struct MockProgram {
    devices: Vec<DeviceHandle>,
    globals: HashMap<String, Vec<u8>>,
}

#[derive(Debug)]
struct MockKernel {
    program: ProgramHandle,
    name: String,
}

#[derive(Debug, Clone, Copy)]
struct MockQueue {
    context: ContextHandle,
    device: DeviceHandle,
}

#[derive(Debug, Default)]
struct State {
    devices: HashMap<DeviceHandle, MockDevice>,
    contexts: HashMap<ContextHandle, Vec<DeviceHandle>>,
    context_refs: HashMap<ContextHandle, i64>,
    programs: HashMap<ProgramHandle, MockProgram>,
    kernels: HashMap<KernelHandle, MockKernel>,
    queues: HashMap<QueueHandle, MockQueue>,
    /// Live USM allocations: base -> size
    allocations: BTreeMap<u64, u64>,
    /// Reserved virtual ranges: base -> size
    reservations: BTreeMap<u64, u64>,
    /// Mapped virtual pages: page base -> (size, physical memory)
    mappings: BTreeMap<u64, (u64, PhysicalMemHandle)>,
    physical: HashMap<PhysicalMemHandle, u64>,
    calls: Vec<Call>,
    alloc_failure: Option<Error>,
    physical_failure: Option<Error>,
    reserve_failure: Option<Error>,
    fill_failure: Option<Error>,
    /// Frees that fail: allocation base -> error
    free_failures: HashMap<u64, Error>,
}

/// Thread-safe in-memory compute runtime
#[derive(Debug)]
pub struct MockRuntime {
    state: Mutex<State>,
    memory: Mutex<HashMap<u64, Box<[u8; PAGE_SIZE as usize]>>>,
    next_handle: AtomicU64,
    host_usm_next: AtomicU64,
    cpu_device_usm_next: AtomicU64,
    shared_usm_next: AtomicU64,
    gpu_device_usm_next: AtomicU64,
    host_reserve_next: AtomicU64,
    virtual_reserve_next: AtomicU64,
}

impl MockRuntime {
    /// Create an empty runtime
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            memory: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            host_usm_next: AtomicU64::new(HOST_USM_BASE),
            cpu_device_usm_next: AtomicU64::new(CPU_DEVICE_USM_BASE),
            shared_usm_next: AtomicU64::new(SHARED_USM_BASE),
            gpu_device_usm_next: AtomicU64::new(GPU_DEVICE_USM_BASE),
            host_reserve_next: AtomicU64::new(HOST_RESERVE_BASE),
            virtual_reserve_next: AtomicU64::new(VIRTUAL_RESERVE_BASE),
        }
    }

    fn handle<T>(&self) -> Handle<T> {
        Handle::new(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    // =========================================================================
    // Topology
    // =========================================================================

    /// Add a device
    pub fn add_device(&self, kind: DeviceKind, mem_base_addr_align: u32, local_mem_size: u64) -> DeviceHandle {
        let device = self.handle();
        self.state.lock().devices.insert(device, MockDevice {
            info: DeviceInfo {
                kind,
                mem_base_addr_align,
                local_mem_size,
            },
            granularity: 64 * 1024,
        });
        device
    }

    /// Add a context over `devices`
    pub fn add_context(&self, devices: &[DeviceHandle]) -> ContextHandle {
        let context = self.handle();
        let mut state = self.state.lock();
        state.contexts.insert(context, devices.to_vec());
        state.context_refs.insert(context, 1);
        context
    }

    /// Add a program built for `devices`
    pub fn add_program(&self, devices: &[DeviceHandle]) -> ProgramHandle {
        let program = self.handle();
        self.state.lock().programs.insert(program, MockProgram {
            devices: devices.to_vec(),
            globals: HashMap::new(),
        });
        program
    }

    /// Define a zero-initialised device global
    pub fn define_global(&self, program: ProgramHandle, name: &str, size: usize) {
        if let Some(p) = self.state.lock().programs.get_mut(&program) {
            p.globals.insert(name.to_string(), vec![0; size]);
        }
    }

    /// Overwrite a device global, as device code would
    pub fn set_global(&self, program: ProgramHandle, name: &str, bytes: &[u8]) {
        if let Some(p) = self.state.lock().programs.get_mut(&program) {
            p.globals.insert(name.to_string(), bytes.to_vec());
        }
    }

    /// Current contents of a device global
    pub fn global(&self, program: ProgramHandle, name: &str) -> Option<Vec<u8>> {
        self.state.lock().programs.get(&program)?.globals.get(name).cloned()
    }

    /// Add a kernel of `program`
    pub fn add_kernel(&self, program: ProgramHandle, name: &str) -> KernelHandle {
        let kernel = self.handle();
        self.state.lock().kernels.insert(kernel, MockKernel {
            program,
            name: name.to_string(),
        });
        kernel
    }

    /// Create a user queue
    pub fn user_queue(&self, context: ContextHandle, device: DeviceHandle) -> QueueHandle {
        let queue = self.handle();
        self.state.lock().queues.insert(queue, MockQueue { context, device });
        queue
    }

    /// Record a kernel launch and return its completion event
    pub fn launch(&self, queue: QueueHandle, kernel: KernelHandle) -> EventHandle {
        self.state.lock().calls.push(Call::Launch { queue, kernel });
        self.handle()
    }

    // =========================================================================
    // Failure injection
    // =========================================================================

    /// Make every USM allocation fail with `error`
    pub fn fail_allocations(&self, error: Option<Error>) {
        self.state.lock().alloc_failure = error;
    }

    /// Make physical memory creation fail with `error`
    pub fn fail_physical_memory(&self, error: Option<Error>) {
        self.state.lock().physical_failure = error;
    }

    /// Make device virtual reservations fail with `error`
    pub fn fail_virtual_reserve(&self, error: Option<Error>) {
        self.state.lock().reserve_failure = error;
    }

    /// Make queue fills fail with `error`
    pub fn fail_fills(&self, error: Option<Error>) {
        self.state.lock().fill_failure = error;
    }

    /// Make the free of the allocation at `ptr` fail with `error`
    pub fn fail_free_of(&self, ptr: DeviceAddr, error: Error) {
        self.state.lock().free_failures.insert(ptr.raw(), error);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Read bytes from the sparse memory (untouched bytes read as zero)
    pub fn read_bytes(&self, addr: DeviceAddr, len: usize) -> Vec<u8> {
        let memory = self.memory.lock();
        (0..len as u64)
            .map(|i| {
                let a = addr.raw() + i;
                memory
                    .get(&(a / PAGE_SIZE))
                    .map_or(0, |page| page[(a % PAGE_SIZE) as usize])
            })
            .collect()
    }

    /// Write bytes into the sparse memory
    pub fn write_bytes(&self, addr: DeviceAddr, bytes: &[u8]) {
        let mut memory = self.memory.lock();
        for (i, &b) in bytes.iter().enumerate() {
            let a = addr.raw() + i as u64;
            let page = memory
                .entry(a / PAGE_SIZE)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
            page[(a % PAGE_SIZE) as usize] = b;
        }
    }

    /// Snapshot of the call log
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Clear the call log
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Whether `ptr` is a live USM allocation
    pub fn is_allocated(&self, ptr: DeviceAddr) -> bool {
        self.state.lock().allocations.contains_key(&ptr.raw())
    }

    /// Number of live USM allocations
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Number of live queues (user and internal)
    pub fn live_queues(&self) -> usize {
        self.state.lock().queues.len()
    }

    /// Reference count of a context
    pub fn context_refs(&self, context: ContextHandle) -> i64 {
        self.state.lock().context_refs.get(&context).copied().unwrap_or(0)
    }

    /// Number of mapped virtual pages
    pub fn mapped_pages(&self) -> usize {
        self.state.lock().mappings.len()
    }

    /// Number of live physical memory blocks
    pub fn physical_blocks(&self) -> usize {
        self.state.lock().physical.len()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn bump(&self, next: &AtomicU64, desc: &UsmDesc, size: u64) -> Result<DeviceAddr> {
        let mut state = self.state.lock();
        if let Some(error) = state.alloc_failure {
            return Err(error);
        }
        let align = u64::from(desc.align).max(MIN_ALLOC_ALIGN);
        let mut current = next.load(Ordering::Relaxed);
        let base = loop {
            let base = (current + align - 1) & !(align - 1);
            match next.compare_exchange(current, base + size, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break base,
                Err(actual) => current = actual,
            }
        };
        state.allocations.insert(base, size);
        Ok(DeviceAddr::new(base))
    }

    fn fill(&self, addr: DeviceAddr, value: u8, size: u64) {
        let mut memory = self.memory.lock();
        for a in addr.raw()..addr.raw() + size {
            let page = memory
                .entry(a / PAGE_SIZE)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
            page[(a % PAGE_SIZE) as usize] = value;
        }
    }

    /// Reject device access to reserved-but-unmapped virtual pages
    fn check_mapped(state: &State, addr: DeviceAddr, size: u64) -> Result<()> {
        let start = addr.raw();
        let end = start + size;
        let reserved = state
            .reservations
            .range(..=start)
            .next_back()
            .is_some_and(|(&base, &len)| start < base + len);
        if !reserved {
            return Ok(());
        }
        let mut cursor = start;
        while cursor < end {
            let (&page, &(len, _)) = state
                .mappings
                .range(..=cursor)
                .next_back()
                .filter(|&(&page, &(len, _))| cursor < page + len)
                .ok_or(Error::InvalidArgument)?;
            cursor = page + len;
        }
        Ok(())
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeRuntime for MockRuntime {
    fn usm_host_alloc(&self, _context: ContextHandle, desc: &UsmDesc, size: u64) -> Result<DeviceAddr> {
        self.bump(&self.host_usm_next, desc, size)
    }

    fn usm_device_alloc(
        &self,
        _context: ContextHandle,
        device: DeviceHandle,
        desc: &UsmDesc,
        size: u64,
    ) -> Result<DeviceAddr> {
        let kind = self.device_info(device)?.kind;
        match kind {
            DeviceKind::Gpu => self.bump(&self.gpu_device_usm_next, desc, size),
            _ => self.bump(&self.cpu_device_usm_next, desc, size),
        }
    }

    fn usm_shared_alloc(
        &self,
        _context: ContextHandle,
        _device: DeviceHandle,
        desc: &UsmDesc,
        size: u64,
    ) -> Result<DeviceAddr> {
        self.bump(&self.shared_usm_next, desc, size)
    }

    fn usm_free(&self, _context: ContextHandle, ptr: DeviceAddr) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(&error) = state.free_failures.get(&ptr.raw()) {
            return Err(error);
        }
        state.allocations.remove(&ptr.raw()).ok_or(Error::InvalidArgument)?;
        state.calls.push(Call::Free { ptr });
        Ok(())
    }

    fn enqueue_usm_fill(&self, queue: QueueHandle, ptr: DeviceAddr, value: u8, size: u64) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.queues.contains_key(&queue) {
                return Err(Error::InvalidQueue);
            }
            if let Some(error) = state.fill_failure {
                return Err(error);
            }
            Self::check_mapped(&state, ptr, size)?;
            state.calls.push(Call::Fill {
                queue,
                ptr,
                value,
                size,
            });
        }
        self.fill(ptr, value, size);
        Ok(())
    }

    fn enqueue_usm_memcpy(
        &self,
        queue: QueueHandle,
        _blocking: bool,
        dst: DeviceAddr,
        src: DeviceAddr,
        size: u64,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            if !state.queues.contains_key(&queue) {
                return Err(Error::InvalidQueue);
            }
            state.calls.push(Call::Memcpy { dst, src, size });
        }
        let bytes = self.read_bytes(src, size as usize);
        self.write_bytes(dst, &bytes);
        Ok(())
    }

    fn enqueue_device_global_write(
        &self,
        queue: QueueHandle,
        program: ProgramHandle,
        name: &str,
        _blocking: bool,
        offset: u64,
        src: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let global = state
            .programs
            .get_mut(&program)
            .ok_or(Error::InvalidArgument)?
            .globals
            .get_mut(name)
            .ok_or(Error::SymbolNotFound)?;
        let start = offset as usize;
        let end = start + src.len();
        if end > global.len() {
            return Err(Error::InvalidArgument);
        }
        global[start..end].copy_from_slice(src);
        state.calls.push(Call::GlobalWrite {
            queue,
            name: name.to_string(),
        });
        Ok(())
    }

    fn enqueue_device_global_read(
        &self,
        queue: QueueHandle,
        program: ProgramHandle,
        name: &str,
        _blocking: bool,
        offset: u64,
        dst: &mut [u8],
        wait_list: &[EventHandle],
    ) -> Result<EventHandle> {
        {
            let mut state = self.state.lock();
            let global = state
                .programs
                .get(&program)
                .ok_or(Error::InvalidArgument)?
                .globals
                .get(name)
                .ok_or(Error::SymbolNotFound)?;
            let start = offset as usize;
            let end = start + dst.len();
            if end > global.len() {
                return Err(Error::InvalidArgument);
            }
            dst.copy_from_slice(&global[start..end]);
            state.calls.push(Call::GlobalRead {
                queue,
                name: name.to_string(),
                wait_list: wait_list.to_vec(),
            });
        }
        Ok(self.handle())
    }

    fn event_wait(&self, _events: &[EventHandle]) -> Result<()> {
        Ok(())
    }

    fn device_info(&self, device: DeviceHandle) -> Result<DeviceInfo> {
        self.state
            .lock()
            .devices
            .get(&device)
            .map(|d| d.info)
            .ok_or(Error::InvalidDevice)
    }

    fn context_devices(&self, context: ContextHandle) -> Result<Vec<DeviceHandle>> {
        self.state
            .lock()
            .contexts
            .get(&context)
            .cloned()
            .ok_or(Error::InvalidContext)
    }

    fn context_retain(&self, context: ContextHandle) -> Result<()> {
        let mut state = self.state.lock();
        let refs = state.context_refs.get_mut(&context).ok_or(Error::InvalidContext)?;
        *refs += 1;
        Ok(())
    }

    fn context_release(&self, context: ContextHandle) -> Result<()> {
        let mut state = self.state.lock();
        let refs = state.context_refs.get_mut(&context).ok_or(Error::InvalidContext)?;
        *refs -= 1;
        Ok(())
    }

    fn queue_create(&self, context: ContextHandle, device: DeviceHandle) -> Result<QueueHandle> {
        let queue = self.handle();
        let mut state = self.state.lock();
        if !state.contexts.contains_key(&context) {
            return Err(Error::InvalidContext);
        }
        state.queues.insert(queue, MockQueue { context, device });
        Ok(queue)
    }

    fn queue_finish(&self, queue: QueueHandle) -> Result<()> {
        let mut state = self.state.lock();
        if !state.queues.contains_key(&queue) {
            return Err(Error::InvalidQueue);
        }
        state.calls.push(Call::Finish { queue });
        Ok(())
    }

    fn queue_release(&self, queue: QueueHandle) -> Result<()> {
        self.state
            .lock()
            .queues
            .remove(&queue)
            .map(|_| ())
            .ok_or(Error::InvalidQueue)
    }

    fn queue_context(&self, queue: QueueHandle) -> Result<ContextHandle> {
        self.state
            .lock()
            .queues
            .get(&queue)
            .map(|q| q.context)
            .ok_or(Error::InvalidQueue)
    }

    fn queue_device(&self, queue: QueueHandle) -> Result<DeviceHandle> {
        self.state
            .lock()
            .queues
            .get(&queue)
            .map(|q| q.device)
            .ok_or(Error::InvalidQueue)
    }

    fn kernel_program(&self, kernel: KernelHandle) -> Result<ProgramHandle> {
        self.state
            .lock()
            .kernels
            .get(&kernel)
            .map(|k| k.program)
            .ok_or(Error::InvalidArgument)
    }

    fn kernel_name(&self, kernel: KernelHandle) -> Result<String> {
        self.state
            .lock()
            .kernels
            .get(&kernel)
            .map(|k| k.name.clone())
            .ok_or(Error::InvalidArgument)
    }

    fn program_devices(&self, program: ProgramHandle) -> Result<Vec<DeviceHandle>> {
        self.state
            .lock()
            .programs
            .get(&program)
            .map(|p| p.devices.clone())
            .ok_or(Error::InvalidArgument)
    }

    fn virtual_mem_granularity(&self, _context: ContextHandle, device: DeviceHandle) -> Result<u64> {
        self.state
            .lock()
            .devices
            .get(&device)
            .map(|d| d.granularity)
            .ok_or(Error::InvalidDevice)
    }

    fn virtual_mem_reserve(&self, _context: ContextHandle, size: u64) -> Result<DeviceAddr> {
        if let Some(error) = self.state.lock().reserve_failure {
            return Err(error);
        }
        let base = self.virtual_reserve_next.fetch_add(size, Ordering::AcqRel);
        self.state.lock().reservations.insert(base, size);
        Ok(DeviceAddr::new(base))
    }

    fn virtual_mem_free(&self, _context: ContextHandle, addr: DeviceAddr, _size: u64) -> Result<()> {
        self.state
            .lock()
            .reservations
            .remove(&addr.raw())
            .map(|_| ())
            .ok_or(Error::InvalidArgument)
    }

    fn virtual_mem_map(
        &self,
        _context: ContextHandle,
        addr: DeviceAddr,
        size: u64,
        memory: PhysicalMemHandle,
        _offset: u64,
        _access: VirtualMemAccess,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.physical.contains_key(&memory) {
            return Err(Error::InvalidArgument);
        }
        if state.mappings.contains_key(&addr.raw()) {
            return Err(Error::InvalidArgument);
        }
        state.mappings.insert(addr.raw(), (size, memory));
        state.calls.push(Call::Map { addr, size });
        Ok(())
    }

    fn virtual_mem_unmap(&self, _context: ContextHandle, addr: DeviceAddr, _size: u64) -> Result<()> {
        self.state
            .lock()
            .mappings
            .remove(&addr.raw())
            .map(|_| ())
            .ok_or(Error::InvalidArgument)
    }

    fn physical_mem_create(
        &self,
        _context: ContextHandle,
        _device: DeviceHandle,
        size: u64,
    ) -> Result<PhysicalMemHandle> {
        let memory = self.handle();
        let mut state = self.state.lock();
        if let Some(error) = state.physical_failure {
            return Err(error);
        }
        state.physical.insert(memory, size);
        Ok(memory)
    }

    fn physical_mem_release(&self, memory: PhysicalMemHandle) -> Result<()> {
        self.state
            .lock()
            .physical
            .remove(&memory)
            .map(|_| ())
            .ok_or(Error::InvalidArgument)
    }

    fn host_reserve(&self, size: u64) -> Result<DeviceAddr> {
        Ok(DeviceAddr::new(self.host_reserve_next.fetch_add(size, Ordering::AcqRel)))
    }

    fn host_release(&self, _addr: DeviceAddr, _size: u64) -> Result<()> {
        Ok(())
    }

    fn host_fill(&self, addr: DeviceAddr, value: u8, size: u64) -> Result<()> {
        self.state.lock().calls.push(Call::HostFill { ptr: addr, value, size });
        self.fill(addr, value, size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_memory() {
        let rt = MockRuntime::new();
        let addr = DeviceAddr::new(0x1000_0000 - 2);
        rt.write_bytes(addr, &[1, 2, 3, 4]);
        assert_eq!(rt.read_bytes(addr, 4), vec![1, 2, 3, 4]);
        assert_eq!(rt.read_bytes(DeviceAddr::new(0x2000_0000), 2), vec![0, 0]);
    }

    #[test]
    fn test_fill_requires_mapping_inside_reservation() {
        let rt = MockRuntime::new();
        let dev = rt.add_device(DeviceKind::Gpu, 8, 0);
        let ctx = rt.add_context(&[dev]);
        let queue = rt.queue_create(ctx, dev).unwrap();
        let base = rt.virtual_mem_reserve(ctx, 1 << 20).unwrap();

        assert_eq!(rt.enqueue_usm_fill(queue, base, 1, 16), Err(Error::InvalidArgument));

        let mem = rt.physical_mem_create(ctx, dev, 65536).unwrap();
        rt.virtual_mem_map(ctx, base, 65536, mem, 0, VirtualMemAccess::READ_WRITE)
            .unwrap();
        assert!(rt.enqueue_usm_fill(queue, base, 1, 16).is_ok());
        assert_eq!(rt.read_bytes(base, 2), vec![1, 1]);
    }

    #[test]
    fn test_allocation_regions() {
        let rt = MockRuntime::new();
        let gpu = rt.add_device(DeviceKind::Gpu, 8, 0);
        let ctx = rt.add_context(&[gpu]);
        let host = rt.usm_host_alloc(ctx, &UsmDesc::default(), 64).unwrap();
        let device = rt.usm_device_alloc(ctx, gpu, &UsmDesc::aligned(256), 64).unwrap();
        assert!(host.raw() >= HOST_USM_BASE && host.raw() < CPU_DEVICE_USM_BASE);
        assert_eq!(device.raw() & 0xFF00_0000_0000_0000, 0xFF00_0000_0000_0000);
        assert!(device.is_aligned(256));
        assert!(rt.usm_free(ctx, host).is_ok());
        assert_eq!(rt.usm_free(ctx, host), Err(Error::InvalidArgument));
    }
}
