//! # Device Global Registry
//!
//! Instrumented programs describe their device globals in two symbols: a
//! count and an array of [`DeviceGlobalInfo`]. Each global becomes a
//! tracked allocation whose trailing padding is poisoned like a redzone.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use bytemuck::Zeroable;

use csan_core::protocol::{self, DeviceGlobalInfo};
use csan_core::{AllocKind, ContextHandle, DeviceAddr, Error, ProgramHandle, Result};

use crate::allocation::AllocationRecord;
use crate::interceptor::Interceptor;
use crate::launch::ManagedQueue;

impl Interceptor {
    /// Track the device globals of `program` on every device it is built for
    ///
    /// Returns the number of distinct globals registered. A program without
    /// sanitizer metadata registers none, and entries whose padded size is
    /// smaller than the global are skipped.
    pub fn register_device_globals(&self, context: ContextHandle, program: ProgramHandle) -> Result<usize> {
        let runtime = self.runtime();
        let context_record = self.context_record(context)?;
        let mut registered = 0;

        for device in runtime.program_devices(program)? {
            self.insert_device(context, device)?;
            let queue = ManagedQueue::new(runtime, context, device)?;

            let mut count = 0u64;
            if let Err(e) = runtime.enqueue_device_global_read(
                queue.handle(),
                program,
                protocol::ASAN_DEVICE_GLOBAL_COUNT,
                true,
                0,
                bytemuck::bytes_of_mut(&mut count),
                &[],
            ) {
                log::info!("no device globals in {:?} for {:?} ({})", program, device, e);
                continue;
            }

            if count == 0 {
                continue;
            }
            if count > protocol::MAX_DEVICE_GLOBALS {
                log::error!("{:?} claims {} device globals on {:?}", program, count, device);
                return Err(Error::InvalidArgument);
            }
            let mut infos: Vec<DeviceGlobalInfo> = vec![Zeroable::zeroed(); count as usize];
            runtime
                .enqueue_device_global_read(
                    queue.handle(),
                    program,
                    protocol::ASAN_DEVICE_GLOBAL_METADATA,
                    true,
                    0,
                    bytemuck::cast_slice_mut(&mut infos),
                    &[],
                )
                .map_err(|e| {
                    log::error!("failed to read device global metadata of {:?}: {}", program, e);
                    e
                })?;

            for info in &infos {
                if info.size > info.size_with_redzone || info.addr.checked_add(info.size_with_redzone).is_none() {
                    log::warn!(
                        "malformed device global at {:#x} ({} of {} bytes) skipped",
                        info.addr,
                        info.size,
                        info.size_with_redzone
                    );
                    continue;
                }
                let addr = DeviceAddr::new(info.addr);
                let record = match self.allocations().find_by_address(addr) {
                    Some(known) if known.alloc_begin == addr && known.kind == AllocKind::DeviceGlobal => known,
                    _ => {
                        let record = Arc::new(AllocationRecord::new(
                            context,
                            Some(device),
                            AllocKind::DeviceGlobal,
                            addr,
                            info.size_with_redzone,
                            addr,
                            info.size,
                        ));
                        log::debug!(
                            "device global at {} ({} of {} bytes) on {:?}",
                            addr,
                            info.size,
                            info.size_with_redzone,
                            device
                        );
                        self.allocations().insert(record.clone());
                        registered += 1;
                        record
                    }
                };
                context_record.enqueue(&[device], &record)?;
            }
        }

        Ok(registered)
    }
}
