//! # Allocation Kinds
//!
//! The closed set of memory kinds the sanitizer brackets, and the shadow
//! bytes that tell device instrumentation which kind a poisoned granule
//! belongs to.
//!
//! Shadow byte encoding (one byte per 8-byte granule):
//!
//! | Value      | Meaning                                     |
//! |------------|---------------------------------------------|
//! | `0`        | all 8 bytes accessible                      |
//! | `1..=7`    | only the first `k` bytes accessible         |
//! | `0x80..`   | poisoned; the value identifies the reason   |

use core::fmt;

/// Shadow byte values shared with device-compiled instrumentation
pub mod magic {
    /// Redzone of a device USM allocation
    pub const USM_DEVICE_REDZONE: u8 = 0x81;
    /// Redzone of a host USM allocation
    pub const USM_HOST_REDZONE: u8 = 0x82;
    /// Redzone of a shared USM allocation
    pub const USM_SHARED_REDZONE: u8 = 0x83;
    /// Redzone of a memory buffer
    pub const MEM_BUFFER_REDZONE: u8 = 0x84;
    /// Redzone of a device global variable
    pub const DEVICE_GLOBAL_REDZONE: u8 = 0x85;

    /// Released device USM allocation
    pub const USM_DEVICE_DEALLOCATED: u8 = 0x91;
    /// Released host USM allocation
    pub const USM_HOST_DEALLOCATED: u8 = 0x92;
    /// Released shared USM allocation
    pub const USM_SHARED_DEALLOCATED: u8 = 0x93;
    /// Released memory buffer
    pub const MEM_BUFFER_DEALLOCATED: u8 = 0x94;

    /// Redzone of work-group local memory (painted by device code)
    pub const SHARED_LOCAL_REDZONE: u8 = 0xa1;

    /// Whether a shadow value marks the granule as poisoned
    #[inline]
    pub const fn is_poison(value: u8) -> bool {
        (value as i8) < 0
    }
}

/// Kind of a tracked allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKind {
    /// Host USM, visible to every device of the context
    Host,
    /// Device USM, local to one device
    Device,
    /// Shared USM, migrates between host and one device
    Shared,
    /// Backing storage of a runtime memory buffer
    MemBuffer,
    /// Device global variable discovered in a program
    DeviceGlobal,
}

impl AllocKind {
    /// Shadow byte painted over the redzones
    pub const fn redzone_magic(self) -> u8 {
        match self {
            Self::Host => magic::USM_HOST_REDZONE,
            Self::Device => magic::USM_DEVICE_REDZONE,
            Self::Shared => magic::USM_SHARED_REDZONE,
            Self::MemBuffer => magic::MEM_BUFFER_REDZONE,
            Self::DeviceGlobal => magic::DEVICE_GLOBAL_REDZONE,
        }
    }

    /// Shadow byte painted over a released allocation
    ///
    /// Device globals are never released; they keep their redzone byte.
    pub const fn deallocated_magic(self) -> u8 {
        match self {
            Self::Host => magic::USM_HOST_DEALLOCATED,
            Self::Device => magic::USM_DEVICE_DEALLOCATED,
            Self::Shared => magic::USM_SHARED_DEALLOCATED,
            Self::MemBuffer => magic::MEM_BUFFER_DEALLOCATED,
            Self::DeviceGlobal => magic::DEVICE_GLOBAL_REDZONE,
        }
    }

    /// Whether every device of the context observes this allocation
    ///
    /// Such allocations are queued for a shadow write on all devices.
    pub const fn is_host_wide(self) -> bool {
        matches!(self, Self::Host)
    }

    /// Whether the application may free this allocation
    pub const fn is_user_releasable(self) -> bool {
        !matches!(self, Self::DeviceGlobal)
    }
}

impl fmt::Display for AllocKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "Host USM"),
            Self::Device => write!(f, "Device USM"),
            Self::Shared => write!(f, "Shared USM"),
            Self::MemBuffer => write!(f, "Memory Buffer"),
            Self::DeviceGlobal => write!(f, "Device Global"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [AllocKind; 5] = [
        AllocKind::Host,
        AllocKind::Device,
        AllocKind::Shared,
        AllocKind::MemBuffer,
        AllocKind::DeviceGlobal,
    ];

    #[test]
    fn test_poison_bytes_are_negative() {
        for kind in ALL {
            assert!(magic::is_poison(kind.redzone_magic()));
            assert!(magic::is_poison(kind.deallocated_magic()));
        }
        assert!(!magic::is_poison(0));
        assert!(!magic::is_poison(7));
    }

    #[test]
    fn test_redzone_bytes_distinct() {
        for (i, a) in ALL.iter().enumerate() {
            for b in &ALL[i + 1..] {
                assert_ne!(a.redzone_magic(), b.redzone_magic());
            }
        }
    }

    #[test]
    fn test_releasable() {
        assert!(AllocKind::Device.is_user_releasable());
        assert!(!AllocKind::DeviceGlobal.is_user_releasable());
        assert!(AllocKind::Host.is_host_wide());
        assert!(!AllocKind::Shared.is_host_wide());
    }
}
