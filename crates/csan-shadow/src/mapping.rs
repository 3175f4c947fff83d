//! # Address to Shadow Mapping
//!
//! Per-shape translation of an application address into the address of the
//! shadow byte that describes its granule.

use csan_core::protocol::DeviceTypeTag;
use csan_core::{DeviceAddr, SHADOW_SCALE};

// =============================================================================
// DEVICE SHAPE
// =============================================================================

/// The two device shapes the sanitizer instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceShape {
    /// Device sharing the host address space; shadow is host memory
    HostLike,
    /// Discrete tiled accelerator; shadow is device virtual memory mapped on demand
    TiledAccelerator,
}

impl DeviceShape {
    /// Tag written into `__DeviceType`
    pub const fn tag(self) -> DeviceTypeTag {
        match self {
            Self::HostLike => DeviceTypeTag::Cpu,
            Self::TiledAccelerator => DeviceTypeTag::GpuPvc,
        }
    }
}

// =============================================================================
// LAYOUTS
// =============================================================================

/// Shadow layout of host-like devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLayout {
    /// Bytes of host address space reserved for shadow
    pub reservation: u64,
}

impl HostLayout {
    /// Layout for a 47-bit user address space
    pub const DEFAULT: Self = Self {
        reservation: 0x0000_0800_0000_0000,
    };
}

impl Default for HostLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Shadow layout of tiled accelerators
///
/// Device-local addresses carry a tag in their high byte and map into the
/// upper half of the reservation; every other address is a 47-bit virtual
/// address mapping into the lower half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiledLayout {
    /// Bits identifying device-local memory
    pub device_tag_mask: u64,
    /// Address bits kept for device-local memory
    pub device_addr_mask: u64,
    /// Address bits kept for virtual addresses
    pub va_mask: u64,
    /// Offset of the device-local half of the shadow
    pub device_shadow_offset: u64,
    /// Bytes of device virtual address space reserved for shadow
    pub reservation: u64,
}

impl TiledLayout {
    /// Layout of the Ponte Vecchio generation
    pub const DEFAULT: Self = Self {
        device_tag_mask: 0xFF00_0000_0000_0000,
        device_addr_mask: 0x0000_FFFF_FFFF_FFFF,
        va_mask: 0x0000_7FFF_FFFF_FFFF,
        device_shadow_offset: 0x0000_2000_0000_0000,
        reservation: 1 << 46,
    };
}

impl Default for TiledLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Layout parameters of every shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShadowLayouts {
    /// Host-like devices
    pub host: HostLayout,
    /// Tiled accelerators
    pub tiled: TiledLayout,
}

impl ShadowLayouts {
    /// Reserved shadow bytes for `shape`
    pub const fn reservation(&self, shape: DeviceShape) -> u64 {
        match shape {
            DeviceShape::HostLike => self.host.reservation,
            DeviceShape::TiledAccelerator => self.tiled.reservation,
        }
    }

    /// Shadow byte address of `addr` on a device of `shape`
    pub const fn address_to_shadow(&self, shape: DeviceShape, base: DeviceAddr, addr: DeviceAddr) -> DeviceAddr {
        let addr = addr.raw();
        let offset = match shape {
            DeviceShape::HostLike => addr >> SHADOW_SCALE,
            DeviceShape::TiledAccelerator => {
                let t = &self.tiled;
                if addr & t.device_tag_mask != 0 {
                    t.device_shadow_offset + ((addr & t.device_addr_mask) >> SHADOW_SCALE)
                } else {
                    (addr & t.va_mask) >> SHADOW_SCALE
                }
            }
        };
        DeviceAddr::new(base.raw() + offset)
    }
}

/// Shadow byte address of `addr` under the default layouts
pub const fn address_to_shadow(shape: DeviceShape, base: DeviceAddr, addr: DeviceAddr) -> DeviceAddr {
    ShadowLayouts {
        host: HostLayout::DEFAULT,
        tiled: TiledLayout::DEFAULT,
    }
    .address_to_shadow(shape, base, addr)
}

// =============================================================================
// SHADOW RANGE
// =============================================================================

/// A provisioned shadow range `[base, limit)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowRange {
    /// First shadow byte
    pub base: DeviceAddr,
    /// One past the last shadow byte
    pub limit: DeviceAddr,
}

impl ShadowRange {
    /// Range of `size` bytes starting at `base`
    pub const fn new(base: DeviceAddr, size: u64) -> Self {
        Self {
            base,
            limit: DeviceAddr::new(base.raw() + size),
        }
    }

    /// Last shadow byte (inclusive bound handed to device code)
    pub const fn last(&self) -> DeviceAddr {
        DeviceAddr::new(self.limit.raw() - 1)
    }

    /// Range size in bytes
    pub const fn size(&self) -> u64 {
        self.limit.raw() - self.base.raw()
    }

    /// Whether `addr` is a byte of the range
    pub const fn contains(&self, addr: DeviceAddr) -> bool {
        addr.raw() >= self.base.raw() && addr.raw() < self.limit.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: DeviceAddr = DeviceAddr::new(0x7000_0000_0000);

    #[test]
    fn test_host_mapping() {
        let shadow = address_to_shadow(DeviceShape::HostLike, BASE, DeviceAddr::new(0x1000));
        assert_eq!(shadow.raw(), 0x7000_0000_0000 + 0x200);
        let next = address_to_shadow(DeviceShape::HostLike, BASE, DeviceAddr::new(0x1007));
        assert_eq!(shadow, next);
    }

    #[test]
    fn test_tiled_va_half() {
        let shadow = address_to_shadow(
            DeviceShape::TiledAccelerator,
            BASE,
            DeviceAddr::new(0x8000_1234_5678),
        );
        // bit 47 is outside the VA mask
        assert_eq!(shadow.raw(), BASE.raw() + (0x1234_5678 >> 3));
    }

    #[test]
    fn test_tiled_device_half() {
        let shadow = address_to_shadow(
            DeviceShape::TiledAccelerator,
            BASE,
            DeviceAddr::new(0xFF00_1000_0000_0040),
        );
        assert_eq!(shadow.raw(), BASE.raw() + 0x2000_0000_0000 + (0x1000_0000_0040 >> 3));
        let layouts = ShadowLayouts::default();
        assert!(shadow.raw() < BASE.raw() + layouts.reservation(DeviceShape::TiledAccelerator));
    }

    #[test]
    fn test_custom_tiled_layout() {
        let layouts = ShadowLayouts {
            host: HostLayout::DEFAULT,
            tiled: TiledLayout {
                device_tag_mask: 0xF000_0000_0000_0000,
                device_addr_mask: 0xFFFF,
                va_mask: 0xFFFF,
                device_shadow_offset: 0x1_0000,
                reservation: 0x2_0000,
            },
        };
        let shadow = layouts.address_to_shadow(
            DeviceShape::TiledAccelerator,
            DeviceAddr::null(),
            DeviceAddr::new(0xF000_0000_0001_0080),
        );
        assert_eq!(shadow.raw(), 0x1_0000 + 0x10);
    }

    #[test]
    fn test_range_bounds() {
        let range = ShadowRange::new(BASE, 0x100);
        assert!(range.contains(BASE));
        assert!(range.contains(range.last()));
        assert!(!range.contains(range.limit));
        assert_eq!(range.size(), 0x100);
    }

    #[test]
    fn test_shape_tags() {
        assert_eq!(DeviceShape::HostLike.tag() as u64, 1);
        assert_eq!(DeviceShape::TiledAccelerator.tag() as u64, 2);
    }
}
