//! # Launch Instrumentation
//!
//! Per-launch protocol between the host and instrumented device code.
//!
//! ```text
//!   Preparing ──▶ ShadowFlushed ──▶ Launched ──▶ ReportRead ──▶ Done
//!       │               │               │             │
//!       │ device        │ pending       │ user        │ classify
//!       │ globals,      │ shadow        │ kernel      │ report
//!       │ local shadow  │ drained       │             │
//! ```
//!
//! All sanitizer writes go through an internal queue that is finished before
//! the application's kernel is enqueued.

use bytemuck::Pod;

use csan_core::protocol::{self, DeviceSanitizerReport};
use csan_core::{
    ComputeRuntime, ContextHandle, DeviceAddr, DeviceHandle, Error, EventHandle, KernelHandle, ProgramHandle,
    QueueHandle, Result, UsmDesc, SHADOW_SCALE,
};
use csan_shadow::DeviceShape;

use crate::interceptor::Interceptor;
use crate::report::Diagnostic;

// =============================================================================
// MANAGED QUEUE
// =============================================================================

/// Internal queue, finished and released when dropped
#[derive(Debug)]
pub struct ManagedQueue<'a> {
    runtime: &'a dyn ComputeRuntime,
    handle: QueueHandle,
}

impl<'a> ManagedQueue<'a> {
    /// Create a queue on `device`
    pub fn new(runtime: &'a dyn ComputeRuntime, context: ContextHandle, device: DeviceHandle) -> Result<Self> {
        let handle = runtime.queue_create(context, device)?;
        Ok(Self { runtime, handle })
    }

    /// Native queue handle
    pub fn handle(&self) -> QueueHandle {
        self.handle
    }
}

impl Drop for ManagedQueue<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.runtime.queue_finish(self.handle) {
            log::error!("failed to finish internal queue {:?}: {}", self.handle, e);
        }
        if let Err(e) = self.runtime.queue_release(self.handle) {
            log::error!("failed to release internal queue {:?}: {}", self.handle, e);
        }
    }
}

// =============================================================================
// LAUNCH CONTEXT
// =============================================================================

/// Progress of one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    /// Device globals being written
    Preparing,
    /// Shadow complete; the kernel may be enqueued
    ShadowFlushed,
    /// Kernel enqueued
    Launched,
    /// Report read back
    ReportRead,
    /// Launch complete
    Done,
}

/// Local-memory shadow allocated for one launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalShadow {
    /// Device address of the shadow
    pub begin: DeviceAddr,
    /// Size in bytes
    pub size: u64,
}

/// State of one kernel launch
///
/// Holds a reference on the context for its whole lifetime, and owns the
/// local-memory shadow allocated for the launch.
#[derive(Debug)]
pub struct LaunchContext<'a> {
    runtime: &'a dyn ComputeRuntime,
    context: ContextHandle,
    /// Work dimensions in use (1 to 3)
    pub work_dim: u32,
    /// Global work size per dimension
    pub global_size: [u64; 3],
    /// Local work size per dimension; `None` lets the runtime choose
    pub local_size: Option<[u64; 3]>,
    local_shadow: Option<LocalShadow>,
    report: DeviceSanitizerReport,
    state: LaunchState,
}

impl<'a> LaunchContext<'a> {
    /// Begin a launch in `context`
    pub fn new(
        runtime: &'a dyn ComputeRuntime,
        context: ContextHandle,
        work_dim: u32,
        global_size: &[u64],
        local_size: Option<&[u64]>,
    ) -> Result<Self> {
        let dims = work_dim as usize;
        if !(1..=3).contains(&dims) || global_size.len() < dims || local_size.is_some_and(|l| l.len() < dims) {
            return Err(Error::InvalidArgument);
        }
        let mut global = [1; 3];
        global[..dims].copy_from_slice(&global_size[..dims]);
        let local = local_size.map(|l| {
            let mut local = [1; 3];
            local[..dims].copy_from_slice(&l[..dims]);
            local
        });

        runtime.context_retain(context)?;
        Ok(Self {
            runtime,
            context,
            work_dim,
            global_size: global,
            local_size: local,
            local_shadow: None,
            report: DeviceSanitizerReport::empty(),
            state: LaunchState::Preparing,
        })
    }

    /// Current state
    pub fn state(&self) -> LaunchState {
        self.state
    }

    /// Local-memory shadow, when one was allocated
    pub fn local_shadow(&self) -> Option<LocalShadow> {
        self.local_shadow
    }

    /// Report read back after the launch
    pub fn report(&self) -> &DeviceSanitizerReport {
        &self.report
    }

    /// Number of work-groups of the launch, `None` if it overflows
    pub fn work_group_count(&self) -> Option<u64> {
        let local = self.local_size.unwrap_or([1; 3]);
        (0..self.work_dim as usize)
            .map(|i| self.global_size[i].div_ceil(local[i].max(1)))
            .try_fold(1u64, u64::checked_mul)
    }
}

impl Drop for LaunchContext<'_> {
    fn drop(&mut self) {
        if let Some(local) = self.local_shadow.take() {
            if let Err(e) = self.runtime.usm_free(self.context, local.begin) {
                log::error!("failed to free local shadow {}: {}", local.begin, e);
            }
        }
        if let Err(e) = self.runtime.context_release(self.context) {
            log::error!("failed to release context {:?}: {}", self.context, e);
        }
    }
}

/// Result of a finished launch
#[derive(Debug, Clone)]
pub enum LaunchOutcome {
    /// Report read, nothing detected
    Clean,
    /// Program carries no report symbol
    Uninstrumented,
    /// Device code detected a violation
    Violation(Diagnostic),
}

// =============================================================================
// PROTOCOL
// =============================================================================

fn write_global<T: Pod>(
    runtime: &dyn ComputeRuntime,
    queue: QueueHandle,
    program: ProgramHandle,
    name: &str,
    value: &T,
) -> bool {
    match runtime.enqueue_device_global_write(queue, program, name, true, 0, bytemuck::bytes_of(value)) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("failed to write device global \"{}\": {}", name, e);
            false
        }
    }
}

impl Interceptor {
    /// Prepare a launch of `kernel` on `queue`
    ///
    /// On success every pending shadow write of the queue's device is
    /// complete and the kernel may be enqueued.
    pub fn pre_launch_kernel(&self, kernel: KernelHandle, queue: QueueHandle, launch: &mut LaunchContext<'_>) -> Result<()> {
        let runtime = self.runtime();
        let context = runtime.queue_context(queue)?;
        let device = runtime.queue_device(queue)?;
        let program = runtime.kernel_program(kernel)?;

        let context_record = self.context_record(context)?;
        let device_record = self.insert_device(context, device)?;
        let shadow = device_record.shadow;

        launch.state = LaunchState::Preparing;
        let internal = ManagedQueue::new(runtime, context, device)?;
        let q = internal.handle();

        write_global(runtime, q, program, protocol::ASAN_DEBUG, &u64::from(self.options().debug));
        write_global(runtime, q, program, protocol::ASAN_SHADOW_MEMORY_GLOBAL_START, &shadow.range.base.raw());
        write_global(runtime, q, program, protocol::ASAN_SHADOW_MEMORY_GLOBAL_END, &shadow.range.last().raw());
        write_global(runtime, q, program, protocol::DEVICE_TYPE, &(shadow.shape.tag() as u64));

        if shadow.shape == DeviceShape::TiledAccelerator && self.options().detect_locals {
            let groups = launch.work_group_count();
            let Some(size) = groups
                .and_then(|n| n.checked_mul(device_record.local_mem_size))
                .map(|bytes| bytes >> SHADOW_SCALE)
            else {
                log::error!("too many work-groups ({:?}) for local memory shadow", groups);
                return Err(Error::OutOfDeviceMemory);
            };
            if size > 0 {
                let begin = runtime
                    .usm_device_alloc(context, device, &UsmDesc::default(), size)
                    .map_err(|e| {
                        if e == Error::OutOfDeviceMemory {
                            log::error!(
                                "too many work-groups ({:?}) for local memory shadow: {} bytes requested",
                                groups,
                                size
                            );
                        }
                        e
                    })?;
                launch.local_shadow = Some(LocalShadow { begin, size });
                runtime.enqueue_usm_fill(q, begin, 0, size)?;
                write_global(runtime, q, program, protocol::ASAN_SHADOW_MEMORY_LOCAL_START, &begin.raw());
                write_global(
                    runtime,
                    q,
                    program,
                    protocol::ASAN_SHADOW_MEMORY_LOCAL_END,
                    &(begin.raw() + size - 1),
                );
            }
        }

        let painted = context_record.drain(device, |record| {
            self.shadow().paint_allocation(context, &shadow, q, &record.pattern())
        })?;
        log::debug!("flushed {} shadow writes to {:?} before launch", painted, device);

        drop(internal);
        launch.state = LaunchState::ShadowFlushed;
        Ok(())
    }

    /// Read back and classify the report after `kernel` was enqueued
    ///
    /// `event` is the kernel's completion event on entry and the report
    /// read's event on return.
    pub fn post_launch_kernel(
        &self,
        kernel: KernelHandle,
        queue: QueueHandle,
        event: &mut EventHandle,
        launch: &mut LaunchContext<'_>,
    ) -> Result<LaunchOutcome> {
        let runtime = self.runtime();
        launch.state = LaunchState::Launched;
        let program = runtime.kernel_program(kernel)?;

        let wait = [*event];
        let read = runtime.enqueue_device_global_read(
            queue,
            program,
            protocol::DEVICE_SANITIZER_REPORT_MEM,
            true,
            0,
            bytemuck::bytes_of_mut(&mut launch.report),
            &wait,
        );
        match read {
            Ok(read_event) => *event = read_event,
            Err(Error::SymbolNotFound) => {
                log::debug!("kernel has no sanitizer report, treated as uninstrumented");
                launch.state = LaunchState::Done;
                return Ok(LaunchOutcome::Uninstrumented);
            }
            Err(e) => {
                log::error!("failed to read sanitizer report of {:?}: {}", kernel, e);
                return Err(e);
            }
        }
        launch.state = LaunchState::ReportRead;

        let outcome = if launch.report.is_set() {
            let name = runtime.kernel_name(kernel).unwrap_or_default();
            let address = DeviceAddr::new(launch.report.address);
            let diagnostic = Diagnostic::device(&launch.report, name, self.find_alloc_by_address(address));
            diagnostic.emit();
            LaunchOutcome::Violation(diagnostic)
        } else {
            LaunchOutcome::Clean
        };
        launch.state = LaunchState::Done;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use csan_core::mock::MockRuntime;
    use csan_core::DeviceKind;

    #[test]
    fn test_managed_queue_released() {
        let rt = MockRuntime::new();
        let dev = rt.add_device(DeviceKind::Gpu, 8, 0);
        let ctx = rt.add_context(&[dev]);
        {
            let queue = ManagedQueue::new(&rt, ctx, dev).unwrap();
            assert_eq!(rt.queue_device(queue.handle()), Ok(dev));
            assert_eq!(rt.live_queues(), 1);
        }
        assert_eq!(rt.live_queues(), 0);
    }

    #[test]
    fn test_launch_context_reference() {
        let rt = Arc::new(MockRuntime::new());
        let dev = rt.add_device(DeviceKind::Gpu, 8, 0);
        let ctx = rt.add_context(&[dev]);
        {
            let launch = LaunchContext::new(&*rt, ctx, 2, &[100, 64], Some(&[16, 16])).unwrap();
            assert_eq!(rt.context_refs(ctx), 2);
            // ceil(100 / 16) * 4
            assert_eq!(launch.work_group_count(), Some(28));
            assert_eq!(launch.state(), LaunchState::Preparing);
        }
        assert_eq!(rt.context_refs(ctx), 1);
    }

    #[test]
    fn test_launch_context_rejects_bad_dims() {
        let rt = MockRuntime::new();
        let dev = rt.add_device(DeviceKind::Gpu, 8, 0);
        let ctx = rt.add_context(&[dev]);
        assert!(LaunchContext::new(&rt, ctx, 0, &[1], None).is_err());
        assert!(LaunchContext::new(&rt, ctx, 2, &[1], None).is_err());
        assert_eq!(rt.context_refs(ctx), 1);
    }

    #[test]
    fn test_default_local_size() {
        let rt = MockRuntime::new();
        let dev = rt.add_device(DeviceKind::Gpu, 8, 0);
        let ctx = rt.add_context(&[dev]);
        let launch = LaunchContext::new(&rt, ctx, 1, &[37], None).unwrap();
        assert_eq!(launch.work_group_count(), Some(37));
    }

    #[test]
    fn test_work_group_count_overflow() {
        let rt = MockRuntime::new();
        let dev = rt.add_device(DeviceKind::Gpu, 8, 0);
        let ctx = rt.add_context(&[dev]);
        let launch = LaunchContext::new(&rt, ctx, 2, &[1 << 40, 1 << 40], None).unwrap();
        assert_eq!(launch.work_group_count(), None);
    }
}
