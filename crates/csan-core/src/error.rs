//! # CSAN Error Handling
//!
//! Error types for the sanitizer stack.
//!
//! Error handling follows these principles:
//! - Usage errors are detected synchronously and each gets its own variant
//! - Resource exhaustion reported by the runtime propagates unchanged
//! - Device-detected violations are diagnostics, not errors
//! - Errors are `no_std` compatible and `Copy`

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// CSAN Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// CSAN unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Usage Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidArgument,
    /// Requested alignment is not zero or a power of two
    InvalidAlignment,
    /// Zero-sized allocation request
    InvalidSize,
    /// Pointer is not managed by the sanitizer
    BadFree,
    /// Pointer belongs to a different context than the one freeing it
    BadContext,
    /// Pointer lies inside an allocation but is not its start
    InvalidFree,
    /// Allocation was already released
    DoubleFree,

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// Generic resource exhaustion
    OutOfResources,
    /// Out of host memory
    OutOfHostMemory,
    /// Out of device memory
    OutOfDeviceMemory,
    /// No free virtual address range of the requested size
    OutOfVirtualAddressSpace,

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Device is neither host-like nor a tiled accelerator
    UnsupportedDevice,
    /// Malformed sanitizer option
    InvalidConfig,

    // =========================================================================
    // Runtime Object Errors
    // =========================================================================
    /// Unknown or released context
    InvalidContext,
    /// Queue creation or lookup failed
    InvalidQueue,
    /// Unknown device
    InvalidDevice,
    /// Program does not define the named device global
    SymbolNotFound,
    /// Address maps outside the provisioned shadow range
    ShadowOutOfBounds,
    /// Runtime failure without a more specific classification
    Unknown,
}

impl Error {
    /// Whether this is a resource exhaustion error
    pub const fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            Self::OutOfResources
                | Self::OutOfHostMemory
                | Self::OutOfDeviceMemory
                | Self::OutOfVirtualAddressSpace
        )
    }

    /// Whether this error reports misuse of the allocation API
    pub const fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument
                | Self::InvalidAlignment
                | Self::InvalidSize
                | Self::BadFree
                | Self::BadContext
                | Self::InvalidFree
                | Self::DoubleFree
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Usage
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidAlignment => write!(f, "alignment is not a power of two"),
            Self::InvalidSize => write!(f, "invalid allocation size"),
            Self::BadFree => write!(f, "attempting to free a pointer not allocated by the sanitizer"),
            Self::BadContext => write!(f, "attempting to free a pointer from another context"),
            Self::InvalidFree => write!(f, "attempting to free a pointer that is not an allocation start"),
            Self::DoubleFree => write!(f, "attempting double free"),

            // Resource
            Self::OutOfResources => write!(f, "out of resources"),
            Self::OutOfHostMemory => write!(f, "out of host memory"),
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),
            Self::OutOfVirtualAddressSpace => write!(f, "out of virtual address space"),

            // Configuration
            Self::UnsupportedDevice => write!(f, "unsupported device type"),
            Self::InvalidConfig => write!(f, "invalid sanitizer option"),

            // Runtime objects
            Self::InvalidContext => write!(f, "invalid context"),
            Self::InvalidQueue => write!(f, "invalid queue"),
            Self::InvalidDevice => write!(f, "invalid device"),
            Self::SymbolNotFound => write!(f, "device global not found"),
            Self::ShadowOutOfBounds => write!(f, "address outside shadow memory"),
            Self::Unknown => write!(f, "unknown runtime error"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert!(Error::DoubleFree.is_usage());
        assert!(!Error::DoubleFree.is_exhaustion());
        assert!(Error::OutOfDeviceMemory.is_exhaustion());
        assert!(!Error::UnsupportedDevice.is_usage());
    }

    #[test]
    fn test_display() {
        assert_eq!(alloc::format!("{}", Error::DoubleFree), "attempting double free");
    }
}
