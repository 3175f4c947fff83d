//! # Device Instrumentation Protocol
//!
//! Symbol names and byte layouts shared with device-compiled
//! instrumentation. Everything here is a wire contract: field order, widths
//! and values must not change without changing the device library too.
//!
//! ```text
//!   host                                   device program
//!   ────                                   ──────────────
//!   __AsanDebug                    ──────▶ verbose device prints
//!   __AsanShadowMemoryGlobalStart  ──────▶ shadow range checks
//!   __AsanShadowMemoryGlobalEnd    ──────▶
//!   __AsanShadowMemoryLocalStart   ──────▶ local memory shadow
//!   __AsanShadowMemoryLocalEnd     ──────▶
//!   __DeviceType                   ──────▶ address → shadow formula
//!   __AsanDeviceGlobalCount        ◀────── instrumented globals
//!   __AsanDeviceGlobalMetadata     ◀──────
//!   __DeviceSanitizerReportMem     ◀────── violation report
//! ```

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

// =============================================================================
// SYMBOL NAMES
// =============================================================================

/// Debug flag (`u64`)
pub const ASAN_DEBUG: &str = "__AsanDebug";
/// Lower bound of the global shadow range (`u64`)
pub const ASAN_SHADOW_MEMORY_GLOBAL_START: &str = "__AsanShadowMemoryGlobalStart";
/// Upper bound of the global shadow range (`u64`)
pub const ASAN_SHADOW_MEMORY_GLOBAL_END: &str = "__AsanShadowMemoryGlobalEnd";
/// Lower bound of the local-memory shadow range (`u64`)
pub const ASAN_SHADOW_MEMORY_LOCAL_START: &str = "__AsanShadowMemoryLocalStart";
/// Upper bound (inclusive) of the local-memory shadow range (`u64`)
pub const ASAN_SHADOW_MEMORY_LOCAL_END: &str = "__AsanShadowMemoryLocalEnd";
/// Device shape tag (`u64`, see [`DeviceTypeTag`])
pub const DEVICE_TYPE: &str = "__DeviceType";
/// Number of instrumented device globals (`u64`)
pub const ASAN_DEVICE_GLOBAL_COUNT: &str = "__AsanDeviceGlobalCount";
/// Array of [`DeviceGlobalInfo`]
pub const ASAN_DEVICE_GLOBAL_METADATA: &str = "__AsanDeviceGlobalMetadata";
/// Largest device-global count accepted from a program
pub const MAX_DEVICE_GLOBALS: u64 = 1 << 16;
/// A single [`DeviceSanitizerReport`]
pub const DEVICE_SANITIZER_REPORT_MEM: &str = "__DeviceSanitizerReportMem";

// =============================================================================
// DEVICE TYPE TAG
// =============================================================================

/// Device shape as device code sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum DeviceTypeTag {
    /// Not instrumented
    Unknown = 0,
    /// Host-like device sharing the host address space
    Cpu = 1,
    /// Tiled discrete accelerator
    GpuPvc = 2,
}

// =============================================================================
// DEVICE GLOBAL METADATA
// =============================================================================

/// One instrumented device global, as emitted by the device compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DeviceGlobalInfo {
    /// Declared size of the variable
    pub size: u64,
    /// Size including the trailing redzone
    pub size_with_redzone: u64,
    /// Device address of the variable
    pub addr: u64,
}

const_assert_eq!(core::mem::size_of::<DeviceGlobalInfo>(), 24);

// =============================================================================
// VIOLATION REPORT
// =============================================================================

/// Maximum length of the source file name in a report
pub const MAX_FILE_NAME_SIZE: usize = 256;
/// Maximum length of the function name in a report
pub const MAX_FUNC_NAME_SIZE: usize = 128;

/// What the device instrumentation detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorType {
    /// Unclassified violation
    Unknown = 0,
    /// Access to a redzone
    OutOfBounds = 1,
    /// Misaligned access
    Misaligned = 2,
    /// Access to released memory
    UseAfterFree = 3,
    /// Shadow address outside the provisioned range
    OutOfShadowBounds = 4,
    /// Device type tag not recognised by device code
    UnknownDevice = 5,
    /// Dereference of a null pointer
    NullPointer = 6,
}

impl ErrorType {
    /// Decode the raw report value
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::OutOfBounds,
            2 => Self::Misaligned,
            3 => Self::UseAfterFree,
            4 => Self::OutOfShadowBounds,
            5 => Self::UnknownDevice,
            6 => Self::NullPointer,
            _ => Self::Unknown,
        }
    }

    /// Short name used in diagnostics
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown-error",
            Self::OutOfBounds => "out-of-bounds-access",
            Self::Misaligned => "misaligned-access",
            Self::UseAfterFree => "use-after-free",
            Self::OutOfShadowBounds => "out-of-shadow-bounds-access",
            Self::UnknownDevice => "unknown-device",
            Self::NullPointer => "null-pointer-access",
        }
    }
}

/// Memory kind the faulting address belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryType {
    /// Not determined by device code
    Unknown = 0,
    /// Device USM
    DeviceUsm = 1,
    /// Host USM
    HostUsm = 2,
    /// Shared USM
    SharedUsm = 3,
    /// Work-group local memory
    Local = 4,
    /// Work-item private memory
    Private = 5,
    /// Memory buffer
    MemBuffer = 6,
    /// Device global variable
    DeviceGlobal = 7,
}

impl MemoryType {
    /// Decode the raw report value
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::DeviceUsm,
            2 => Self::HostUsm,
            3 => Self::SharedUsm,
            4 => Self::Local,
            5 => Self::Private,
            6 => Self::MemBuffer,
            7 => Self::DeviceGlobal,
            _ => Self::Unknown,
        }
    }

    /// Short name used in diagnostics
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::DeviceUsm => "Device USM",
            Self::HostUsm => "Host USM",
            Self::SharedUsm => "Shared USM",
            Self::Local => "Local Memory",
            Self::Private => "Private Memory",
            Self::MemBuffer => "Memory Buffer",
            Self::DeviceGlobal => "Device Global",
        }
    }
}

/// Violation report written by device code, read back after each launch
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct DeviceSanitizerReport {
    /// Non-zero once device code recorded a violation
    pub flag: i32,
    /// NUL-terminated source file name
    pub file: [u8; MAX_FILE_NAME_SIZE],
    /// NUL-terminated function name
    pub func: [u8; MAX_FUNC_NAME_SIZE],
    /// Source line
    pub line: i32,
    /// Global id of the faulting work item
    pub gid: [u64; 3],
    /// Local id of the faulting work item
    pub lid: [u64; 3],
    /// Faulting address
    pub address: u64,
    /// Non-zero for a write access
    pub is_write: u8,
    /// Non-zero if device code continued after the report
    pub is_recover: u8,
    /// Reserved
    pub reserved: [u8; 2],
    /// Access width in bytes
    pub access_size: u32,
    /// Raw [`MemoryType`]
    pub memory_type: u32,
    /// Raw [`ErrorType`]
    pub error_type: u32,
}

const_assert_eq!(core::mem::size_of::<DeviceSanitizerReport>(), 464);

impl DeviceSanitizerReport {
    /// An empty report (flag clear)
    pub fn empty() -> Self {
        Zeroable::zeroed()
    }

    /// Whether device code recorded a violation
    pub fn is_set(&self) -> bool {
        self.flag != 0
    }

    /// Decoded error type
    pub fn error_type(&self) -> ErrorType {
        ErrorType::from_raw(self.error_type)
    }

    /// Decoded memory type
    pub fn memory_type(&self) -> MemoryType {
        MemoryType::from_raw(self.memory_type)
    }

    /// Source file name up to the first NUL
    pub fn file(&self) -> &str {
        c_str(&self.file)
    }

    /// Function name up to the first NUL
    pub fn func(&self) -> &str {
        c_str(&self.func)
    }
}

fn c_str(bytes: &[u8]) -> &str {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    match core::str::from_utf8(&bytes[..len]) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or(""),
    }
}
