//! # Shadow Painting
//!
//! Writes shadow bytes for address ranges and for whole allocations.
//!
//! Layout of a painted live allocation (one cell per granule):
//!
//! ```text
//!  alloc_begin        user_begin              user_end          alloc_end
//!  │                  │                       │                 │
//!  ▼                  ▼                       ▼                 ▼
//!  ┌────┬────┬────┬───┬────┬────┬────┬────┬───┬────┬────┬────┬───┐
//!  │ rz │ rz │ .. │rz │ 00 │ 00 │ .. │ 00 │ k │ rz │ .. │ rz │rz │
//!  └────┴────┴────┴───┴────┴────┴────┴────┴───┴────┴────┴────┴───┘
//!                                          └ k = user_end % 8
//! ```

use csan_core::{AllocKind, ContextHandle, DeviceAddr, Error, QueueHandle, Result, SHADOW_GRANULARITY};

use crate::mapping::DeviceShape;
use crate::provision::{DeviceShadow, ShadowEngine};

/// The bytes a tracked allocation occupies, and its state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowPattern {
    /// First byte of the raw allocation, left redzone included
    pub alloc_begin: DeviceAddr,
    /// Size of the raw allocation
    pub alloc_size: u64,
    /// First byte visible to the application
    pub user_begin: DeviceAddr,
    /// One past the last byte visible to the application
    pub user_end: DeviceAddr,
    /// Whether the application released the allocation
    pub released: bool,
    /// Kind, selecting the poison byte
    pub kind: AllocKind,
}

impl ShadowPattern {
    /// One past the last byte of the raw allocation
    pub fn alloc_end(&self) -> DeviceAddr {
        self.alloc_begin + self.alloc_size
    }
}

impl ShadowEngine {
    /// Write `value` into every shadow byte covering `[begin, begin + size)`
    ///
    /// Host-like shadow is written directly. Tiled shadow is written with a
    /// fill on `queue`, after mapping any page the range touches.
    pub fn paint(
        &self,
        context: ContextHandle,
        shadow: &DeviceShadow,
        queue: QueueHandle,
        begin: DeviceAddr,
        size: u64,
        value: u8,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let layouts = self.layouts();
        let shadow_begin = layouts.address_to_shadow(shadow.shape, shadow.range.base, begin);
        let shadow_end = layouts.address_to_shadow(shadow.shape, shadow.range.base, begin + (size - 1));
        if !shadow.range.contains(shadow_begin) || !shadow.range.contains(shadow_end) {
            log::error!(
                "shadow of [{}, {}) is outside [{}, {})",
                begin,
                begin + size,
                shadow.range.base,
                shadow.range.limit
            );
            return Err(Error::ShadowOutOfBounds);
        }
        let len = shadow_end - shadow_begin + 1;

        log::debug!("paint [{}, {}) -> {:#04x} ({} shadow bytes)", begin, begin + size, value, len);

        match shadow.shape {
            DeviceShape::HostLike => self.runtime().host_fill(shadow_begin, value, len),
            DeviceShape::TiledAccelerator => {
                self.ensure_mapped(context, shadow.device, queue, shadow_begin, shadow_end)?;
                self.runtime().enqueue_usm_fill(queue, shadow_begin, value, len)
            }
        }
    }

    /// Paint the complete shadow pattern of an allocation
    pub fn paint_allocation(
        &self,
        context: ContextHandle,
        shadow: &DeviceShadow,
        queue: QueueHandle,
        pattern: &ShadowPattern,
    ) -> Result<()> {
        let kind = pattern.kind;

        if pattern.released {
            return self.paint(
                context,
                shadow,
                queue,
                pattern.alloc_begin,
                pattern.alloc_size,
                kind.deallocated_magic(),
            );
        }

        self.paint(context, shadow, queue, pattern.alloc_begin, pattern.alloc_size, 0)?;

        // left redzone
        let left = pattern.user_begin - pattern.alloc_begin;
        self.paint(context, shadow, queue, pattern.alloc_begin, left, kind.redzone_magic())?;

        // right redzone, from the first whole granule after the user region
        let right_begin = pattern.user_end.align_up(SHADOW_GRANULARITY);
        let alloc_end = pattern.alloc_end();
        if right_begin < alloc_end {
            self.paint(context, shadow, queue, right_begin, alloc_end - right_begin, kind.redzone_magic())?;
        }

        // partial granule
        let valid = pattern.user_end.raw() % SHADOW_GRANULARITY;
        if valid != 0 {
            self.paint(context, shadow, queue, pattern.user_end, 1, valid as u8)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use csan_core::kind::magic;
    use csan_core::mock::{Call, MockRuntime};
    use csan_core::{ComputeRuntime, DeviceKind};

    struct Fixture {
        rt: Arc<MockRuntime>,
        engine: ShadowEngine,
        context: ContextHandle,
        queue: QueueHandle,
        shadow: DeviceShadow,
    }

    fn fixture(kind: DeviceKind, shape: DeviceShape) -> Fixture {
        let rt = Arc::new(MockRuntime::new());
        let engine = ShadowEngine::new(rt.clone());
        let device = rt.add_device(kind, 8, 0);
        let context = rt.add_context(&[device]);
        let queue = rt.queue_create(context, device).unwrap();
        let shadow = engine.provision(context, device, shape).unwrap();
        Fixture {
            rt,
            engine,
            context,
            queue,
            shadow,
        }
    }

    impl Fixture {
        fn shadow_bytes(&self, addr: u64, size: u64) -> Vec<u8> {
            let layouts = self.engine.layouts();
            let begin = layouts.address_to_shadow(self.shadow.shape, self.shadow.range.base, DeviceAddr::new(addr));
            self.rt.read_bytes(begin, (size / SHADOW_GRANULARITY) as usize)
        }
    }

    fn pattern(user_size: u64, released: bool) -> ShadowPattern {
        let alloc_begin = DeviceAddr::new(0x1000_0000_0000);
        let user_begin = alloc_begin + 16;
        ShadowPattern {
            alloc_begin,
            alloc_size: 48,
            user_begin,
            user_end: user_begin + user_size,
            released,
            kind: AllocKind::Device,
        }
    }

    #[test]
    fn test_paint_zero_size_is_noop() {
        let f = fixture(DeviceKind::Cpu, DeviceShape::HostLike);
        f.engine
            .paint(f.context, &f.shadow, f.queue, DeviceAddr::new(0x1000), 0, 0xff)
            .unwrap();
        assert!(f.rt.calls().is_empty());
    }

    #[test]
    fn test_paint_covers_partial_granules() {
        let f = fixture(DeviceKind::Cpu, DeviceShape::HostLike);
        f.engine
            .paint(f.context, &f.shadow, f.queue, DeviceAddr::new(0x1004), 8, 0x81)
            .unwrap();
        // [0x1004, 0x100c) touches granules 0x1000 and 0x1008
        assert_eq!(f.shadow_bytes(0x1000, 24), [0x81, 0x81, 0]);
    }

    #[test]
    fn test_ten_byte_allocation() {
        let f = fixture(DeviceKind::Cpu, DeviceShape::HostLike);
        let p = pattern(10, false);
        f.engine.paint_allocation(f.context, &f.shadow, f.queue, &p).unwrap();
        assert_eq!(f.shadow_bytes(p.alloc_begin.raw(), 48), [0x81, 0x81, 0, 2, 0x81, 0x81]);
    }

    #[test]
    fn test_granule_aligned_user_region() {
        let f = fixture(DeviceKind::Cpu, DeviceShape::HostLike);
        let p = pattern(16, false);
        f.engine.paint_allocation(f.context, &f.shadow, f.queue, &p).unwrap();
        assert_eq!(f.shadow_bytes(p.alloc_begin.raw(), 48), [0x81, 0x81, 0, 0, 0x81, 0x81]);
    }

    #[test]
    fn test_released_allocation_fully_poisoned() {
        let f = fixture(DeviceKind::Cpu, DeviceShape::HostLike);
        let live = pattern(10, false);
        f.engine.paint_allocation(f.context, &f.shadow, f.queue, &live).unwrap();
        let released = pattern(10, true);
        f.engine.paint_allocation(f.context, &f.shadow, f.queue, &released).unwrap();
        assert_eq!(
            f.shadow_bytes(released.alloc_begin.raw(), 48),
            [magic::USM_DEVICE_DEALLOCATED; 6]
        );
    }

    #[test]
    fn test_device_global_has_no_left_redzone() {
        let f = fixture(DeviceKind::Cpu, DeviceShape::HostLike);
        let addr = DeviceAddr::new(0x2000_0000);
        let p = ShadowPattern {
            alloc_begin: addr,
            alloc_size: 32,
            user_begin: addr,
            user_end: addr + 4,
            released: false,
            kind: AllocKind::DeviceGlobal,
        };
        f.engine.paint_allocation(f.context, &f.shadow, f.queue, &p).unwrap();
        assert_eq!(f.shadow_bytes(addr.raw(), 32), [4, 0x85, 0x85, 0x85]);
    }

    #[test]
    fn test_tiled_paint_maps_then_fills() {
        let f = fixture(DeviceKind::Gpu, DeviceShape::TiledAccelerator);
        let addr = DeviceAddr::new(0xFF00_1000_0000_0000);
        f.engine.paint(f.context, &f.shadow, f.queue, addr, 64, 0x81).unwrap();

        let calls = f.rt.calls();
        assert!(matches!(calls[0], Call::Map { .. }));
        assert!(matches!(calls[1], Call::Fill { value: 0, .. }));
        assert!(matches!(calls[2], Call::Fill { value: 0x81, size: 8, .. }));
        assert_eq!(f.shadow_bytes(addr.raw(), 64), [0x81; 8]);
    }

    #[test]
    fn test_tiled_fill_failure_propagates() {
        let f = fixture(DeviceKind::Gpu, DeviceShape::TiledAccelerator);
        f.rt.queue_release(f.queue).unwrap();
        let result = f
            .engine
            .paint(f.context, &f.shadow, f.queue, DeviceAddr::new(0x1000), 8, 0x81);
        assert_eq!(result, Err(Error::InvalidQueue));
    }

    #[test]
    fn test_out_of_range_shadow_is_an_error() {
        let f = fixture(DeviceKind::Cpu, DeviceShape::HostLike);
        // beyond a 47-bit address space
        let result = f
            .engine
            .paint(f.context, &f.shadow, f.queue, DeviceAddr::new(0x8000_0000_0000), 8, 0);
        assert_eq!(result, Err(Error::ShadowOutOfBounds));
    }
}
