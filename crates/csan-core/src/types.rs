//! # CSAN Core Types
//!
//! Strongly typed addresses, sizes and runtime object handles.

use core::fmt;
use core::ops::{Add, Sub};

// =============================================================================
// DEVICE ADDRESS
// =============================================================================

/// An address as the compute runtime hands it out
///
/// USM pointers, shadow addresses and virtual reservations all live in this
/// space. It is NOT dereferenced by the sanitizer; every access goes through
/// the runtime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DeviceAddr(u64);

impl DeviceAddr {
    /// Create a new address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check alignment (`alignment` must be a power of two)
    #[inline]
    pub const fn is_aligned(self, alignment: u64) -> bool {
        self.0 & (alignment - 1) == 0
    }

    /// Align up to boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }

    /// Align down to boundary
    #[inline]
    pub const fn align_down(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self(self.0 & !mask)
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for DeviceAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl Sub<DeviceAddr> for DeviceAddr {
    type Output = u64;

    fn sub(self, rhs: DeviceAddr) -> Self::Output {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Debug for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get as MiB
    #[inline]
    pub const fn as_mib(self) -> u64 {
        self.0 / (1024 * 1024)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 * 1024 {
            write!(f, "{} GiB", self.0 / (1024 * 1024 * 1024))
        } else if self.0 >= 1024 * 1024 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque handle to a runtime object
///
/// Handles are type-safe wrappers that prevent mixing a queue with a
/// context, a kernel with a program, and so on. The sanitizer only
/// compares and hashes them.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: core::marker::PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a new handle
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self {
            id,
            _marker: core::marker::PhantomData,
        }
    }

    /// Create a null handle
    #[inline]
    pub const fn null() -> Self {
        Self::new(0)
    }

    /// Get the raw ID
    #[inline]
    pub const fn id(self) -> u64 {
        self.id
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.id == 0
    }
}

// Manual impls: derives would put bounds on the marker type.
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = core::any::type_name::<T>();
        let short = name.rsplit("::").next().unwrap_or(name);
        write!(f, "{}(0x{:x})", short.trim_end_matches("Marker"), self.id)
    }
}

// Marker types for handles
/// Marker for context handle
#[derive(Debug)]
pub struct ContextMarker;
/// Marker for device handle
#[derive(Debug)]
pub struct DeviceMarker;
/// Marker for queue handle
#[derive(Debug)]
pub struct QueueMarker;
/// Marker for program handle
#[derive(Debug)]
pub struct ProgramMarker;
/// Marker for kernel handle
#[derive(Debug)]
pub struct KernelMarker;
/// Marker for event handle
#[derive(Debug)]
pub struct EventMarker;
/// Marker for physical memory handle
#[derive(Debug)]
pub struct PhysicalMemMarker;

/// Handle to a runtime context
pub type ContextHandle = Handle<ContextMarker>;
/// Handle to a compute device
pub type DeviceHandle = Handle<DeviceMarker>;
/// Handle to a command queue
pub type QueueHandle = Handle<QueueMarker>;
/// Handle to a compiled program
pub type ProgramHandle = Handle<ProgramMarker>;
/// Handle to a kernel
pub type KernelHandle = Handle<KernelMarker>;
/// Handle to a completion event
pub type EventHandle = Handle<EventMarker>;
/// Handle to a physical memory block
pub type PhysicalMemHandle = Handle<PhysicalMemMarker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_alignment() {
        let addr = DeviceAddr::new(0x1003);
        assert!(!addr.is_aligned(8));
        assert_eq!(addr.align_up(8), DeviceAddr::new(0x1008));
        assert_eq!(addr.align_down(8), DeviceAddr::new(0x1000));
        assert!(DeviceAddr::new(0x1000).is_aligned(4096));
    }

    #[test]
    fn test_addr_arithmetic() {
        let base = DeviceAddr::new(0x2000);
        assert_eq!(base + 0x10, DeviceAddr::new(0x2010));
        assert_eq!((base + 0x10) - base, 0x10);
    }

    #[test]
    fn test_handle_identity() {
        let a = ContextHandle::new(7);
        let b = ContextHandle::new(7);
        assert_eq!(a, b);
        assert!(ContextHandle::null().is_null());
        assert_eq!(alloc::format!("{:?}", a), "Context(0x7)");
    }

    #[test]
    fn test_byte_size_display() {
        assert_eq!(alloc::format!("{}", ByteSize::from_mib(16)), "16 MiB");
        assert_eq!(alloc::format!("{}", ByteSize::from_bytes(48)), "48 B");
    }
}
