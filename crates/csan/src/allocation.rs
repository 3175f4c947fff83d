//! # Allocation Records
//!
//! One [`AllocationRecord`] exists per live or quarantined allocation. The
//! record is shared between the address index, the pending shadow-write
//! lists and the quarantine; the index alone decides when it goes away.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Once;

use csan_core::{AllocKind, ContextHandle, DeviceAddr, DeviceHandle, Error, Result, SHADOW_GRANULARITY};
use csan_shadow::ShadowPattern;

// =============================================================================
// REDZONES
// =============================================================================

/// Largest user size of each redzone class
const RZ_CLASS_LIMITS: [u64; 7] = [
    64 - 16,
    128 - 32,
    512 - 64,
    4096 - 128,
    (1 << 14) - 256,
    (1 << 15) - 512,
    (1 << 16) - 1024,
];

/// Redzone class of a user size
pub fn redzone_log(user_size: u64) -> u32 {
    RZ_CLASS_LIMITS
        .iter()
        .position(|&limit| user_size <= limit)
        .unwrap_or(RZ_CLASS_LIMITS.len()) as u32
}

/// Redzone bytes of a class
pub const fn redzone_size(log: u32) -> u64 {
    16 << log
}

/// Placement of a user region inside a raw allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedzoneLayout {
    /// Effective alignment of the user region
    pub alignment: u64,
    /// Size of each redzone
    pub redzone: u64,
    /// Bytes to request from the runtime
    pub needed: u64,
}

impl RedzoneLayout {
    /// Compute the layout of `size` bytes at `alignment`
    ///
    /// `alignment` must already be a power of two; it is raised to the
    /// shadow granularity. Fails with [`Error::OutOfResources`] when the
    /// raw size does not fit in the address space.
    pub fn new(size: u64, alignment: u64) -> Result<Self> {
        let alignment = alignment.max(SHADOW_GRANULARITY);
        let redzone = redzone_size(redzone_log(size));
        let slack = if alignment > SHADOW_GRANULARITY { alignment } else { 0 };
        let needed = size
            .div_ceil(alignment)
            .checked_mul(alignment)
            .and_then(|rounded| rounded.checked_add(2 * redzone))
            .and_then(|needed| needed.checked_add(slack))
            .ok_or(Error::OutOfResources)?;
        Ok(Self {
            alignment,
            redzone,
            needed,
        })
    }

    /// User region start inside a raw allocation at `alloc_begin`
    pub fn user_begin(&self, alloc_begin: DeviceAddr) -> DeviceAddr {
        (alloc_begin + self.redzone).align_up(self.alignment)
    }
}

// =============================================================================
// STACK TRACES
// =============================================================================

/// Call-site backtrace captured at allocate or release time
pub struct StackTrace {
    #[cfg(feature = "std")]
    inner: std::backtrace::Backtrace,
}

impl StackTrace {
    /// Capture the current call stack (honours `RUST_BACKTRACE`)
    pub fn capture() -> Self {
        Self {
            #[cfg(feature = "std")]
            inner: std::backtrace::Backtrace::capture(),
        }
    }

    /// Whether frames were recorded
    pub fn is_captured(&self) -> bool {
        #[cfg(feature = "std")]
        {
            self.inner.status() == std::backtrace::BacktraceStatus::Captured
        }
        #[cfg(not(feature = "std"))]
        {
            false
        }
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackTrace")
            .field("captured", &self.is_captured())
            .finish()
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        #[cfg(feature = "std")]
        if self.is_captured() {
            return write!(f, "{}", self.inner);
        }
        write!(f, "    <backtrace unavailable>")
    }
}

// =============================================================================
// ALLOCATION RECORD
// =============================================================================

/// A tracked allocation
#[derive(Debug)]
pub struct AllocationRecord {
    /// First byte of the raw allocation, left redzone included
    pub alloc_begin: DeviceAddr,
    /// First byte visible to the application
    pub user_begin: DeviceAddr,
    /// One past the last byte visible to the application
    pub user_end: DeviceAddr,
    /// Raw allocation size, both redzones included
    pub alloc_size: u64,
    /// Allocation kind
    pub kind: AllocKind,
    /// Owning context
    pub context: ContextHandle,
    /// Owning device; `None` for host-wide allocations
    pub device: Option<DeviceHandle>,
    released: AtomicBool,
    alloc_stack: StackTrace,
    release_stack: Once<StackTrace>,
}

impl AllocationRecord {
    /// Create a live record and capture the allocation stack
    pub fn new(
        context: ContextHandle,
        device: Option<DeviceHandle>,
        kind: AllocKind,
        alloc_begin: DeviceAddr,
        alloc_size: u64,
        user_begin: DeviceAddr,
        user_size: u64,
    ) -> Self {
        debug_assert!(alloc_begin <= user_begin);
        debug_assert!(user_begin + user_size <= alloc_begin + alloc_size);
        Self {
            alloc_begin,
            user_begin,
            user_end: user_begin + user_size,
            alloc_size,
            kind,
            context,
            device,
            released: AtomicBool::new(false),
            alloc_stack: StackTrace::capture(),
            release_stack: Once::new(),
        }
    }

    /// One past the last byte of the raw allocation
    pub fn alloc_end(&self) -> DeviceAddr {
        self.alloc_begin + self.alloc_size
    }

    /// Bytes visible to the application
    pub fn user_size(&self) -> u64 {
        self.user_end - self.user_begin
    }

    /// Whether `addr` lies inside the raw allocation
    pub fn contains(&self, addr: DeviceAddr) -> bool {
        addr >= self.alloc_begin && addr < self.alloc_end()
    }

    /// Whether the application released the allocation
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Mark the record released and capture the release stack
    ///
    /// Returns `false` if it was already released.
    pub fn mark_released(&self) -> bool {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.release_stack.call_once(StackTrace::capture);
        true
    }

    /// Stack of the allocating call
    pub fn alloc_stack(&self) -> &StackTrace {
        &self.alloc_stack
    }

    /// Stack of the releasing call, once released
    pub fn release_stack(&self) -> Option<&StackTrace> {
        self.release_stack.get()
    }

    /// Shadow pattern of the record in its current state
    pub fn pattern(&self) -> ShadowPattern {
        ShadowPattern {
            alloc_begin: self.alloc_begin,
            alloc_size: self.alloc_size,
            user_begin: self.user_begin,
            user_end: self.user_end,
            released: self.is_released(),
            kind: self.kind,
        }
    }
}
