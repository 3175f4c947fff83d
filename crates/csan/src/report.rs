//! # Diagnostics
//!
//! Host-detected usage errors and device-detected violations are turned
//! into a [`Diagnostic`] and logged at `error`. Formatting never affects the
//! status returned to the caller.

use alloc::string::String;
use alloc::sync::Arc;
use core::fmt;

use csan_core::protocol::{DeviceSanitizerReport, ErrorType, MemoryType};
use csan_core::DeviceAddr;

use crate::allocation::AllocationRecord;

/// What went wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// Free of an address the sanitizer does not track
    BadFree,
    /// Free through a context other than the allocating one
    BadContext,
    /// Free of a pointer inside an allocation
    InvalidFree,
    /// Second free of the same allocation
    DoubleFree,
    /// Device access to released memory
    UseAfterFree,
    /// Device access to a redzone
    OutOfBounds,
    /// Any other device-reported violation
    Generic,
}

impl ViolationKind {
    /// Report name
    pub const fn name(self) -> &'static str {
        match self {
            Self::BadFree => "bad-free",
            Self::BadContext => "bad-context",
            Self::InvalidFree => "bad-free",
            Self::DoubleFree => "double-free",
            Self::UseAfterFree => "use-after-free",
            Self::OutOfBounds => "out-of-bounds-access",
            Self::Generic => "device-violation",
        }
    }
}

/// Faulting device access
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAccess {
    /// Kernel that faulted
    pub kernel: String,
    /// Source location
    pub file: String,
    /// Function
    pub func: String,
    /// Line
    pub line: i32,
    /// Global id of the work item
    pub gid: [u64; 3],
    /// Local id of the work item
    pub lid: [u64; 3],
    /// Write rather than read
    pub is_write: bool,
    /// Access width in bytes
    pub size: u32,
    /// Error type as reported by the device
    pub error_type: ErrorType,
    /// Memory type as reported by the device
    pub memory_type: MemoryType,
}

/// A sanitizer report
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Classification
    pub kind: ViolationKind,
    /// Offending address
    pub address: DeviceAddr,
    /// Allocation the address belongs to, when known
    pub allocation: Option<Arc<AllocationRecord>>,
    /// Device-side details for violations found in kernels
    pub access: Option<DeviceAccess>,
}

impl Diagnostic {
    /// Host-side usage error
    pub fn host(kind: ViolationKind, address: DeviceAddr, allocation: Option<Arc<AllocationRecord>>) -> Self {
        Self {
            kind,
            address,
            allocation,
            access: None,
        }
    }

    /// Classify a device report
    ///
    /// `allocation` is the record found at the faulting address; it is only
    /// attached to use-after-free reports.
    pub fn device(report: &DeviceSanitizerReport, kernel: String, allocation: Option<Arc<AllocationRecord>>) -> Self {
        let error_type = report.error_type();
        let kind = match error_type {
            ErrorType::UseAfterFree => ViolationKind::UseAfterFree,
            ErrorType::OutOfBounds => ViolationKind::OutOfBounds,
            _ => ViolationKind::Generic,
        };
        let address = DeviceAddr::new(report.address);
        let allocation = allocation.filter(|r| kind == ViolationKind::UseAfterFree && r.contains(address));
        Self {
            kind,
            address,
            allocation,
            access: Some(DeviceAccess {
                kernel,
                file: report.file().into(),
                func: report.func().into(),
                line: report.line,
                gid: report.gid,
                lid: report.lid,
                is_write: report.is_write != 0,
                size: report.access_size,
                error_type,
                memory_type: report.memory_type(),
            }),
        }
    }

    /// Log the report
    pub fn emit(&self) {
        log::error!("{}", self);
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ERROR: DeviceSanitizer: {} on address {}", self.kind.name(), self.address)?;

        if let Some(access) = &self.access {
            writeln!(
                f,
                "{} of size {} in kernel <{}> LID({}, {}, {}) GID({}, {}, {})",
                if access.is_write { "WRITE" } else { "READ" },
                access.size,
                access.kernel,
                access.lid[0],
                access.lid[1],
                access.lid[2],
                access.gid[0],
                access.gid[1],
                access.gid[2]
            )?;
            writeln!(f, "  #0 {} {}:{}", access.func, access.file, access.line)?;
            if self.kind == ViolationKind::Generic {
                writeln!(
                    f,
                    "  {} in {}",
                    access.error_type.name(),
                    access.memory_type.name()
                )?;
            }
        }

        if let Some(record) = &self.allocation {
            writeln!(
                f,
                "{} of {} bytes at [{}, {})",
                record.kind,
                record.user_size(),
                record.user_begin,
                record.user_end
            )?;
            if let Some(stack) = record.release_stack() {
                writeln!(f, "released here:\n{}", stack)?;
            }
            writeln!(f, "allocated here:\n{}", record.alloc_stack())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use csan_core::{AllocKind, ContextHandle};

    fn report(error_type: ErrorType, address: u64) -> DeviceSanitizerReport {
        let mut report = DeviceSanitizerReport::empty();
        report.flag = 1;
        report.error_type = error_type as u32;
        report.memory_type = MemoryType::DeviceUsm as u32;
        report.address = address;
        report.access_size = 4;
        report.is_write = 1;
        report
    }

    fn record() -> Arc<AllocationRecord> {
        Arc::new(AllocationRecord::new(
            ContextHandle::new(1),
            None,
            AllocKind::Device,
            DeviceAddr::new(0x1000),
            48,
            DeviceAddr::new(0x1010),
            10,
        ))
    }

    #[test]
    fn test_classification() {
        let d = Diagnostic::device(&report(ErrorType::UseAfterFree, 0x1010), "k".into(), Some(record()));
        assert_eq!(d.kind, ViolationKind::UseAfterFree);
        assert!(d.allocation.is_some());

        let d = Diagnostic::device(&report(ErrorType::OutOfBounds, 0x101a), "k".into(), Some(record()));
        assert_eq!(d.kind, ViolationKind::OutOfBounds);
        assert!(d.allocation.is_none());

        let d = Diagnostic::device(&report(ErrorType::NullPointer, 0), "k".into(), None);
        assert_eq!(d.kind, ViolationKind::Generic);
    }

    #[test]
    fn test_unrelated_record_not_attached() {
        let d = Diagnostic::device(&report(ErrorType::UseAfterFree, 0x9000), "k".into(), Some(record()));
        assert!(d.allocation.is_none());
    }

    #[test]
    fn test_display() {
        let d = Diagnostic::device(&report(ErrorType::OutOfBounds, 0x101a), "vadd".into(), None);
        let text = d.to_string();
        assert!(text.contains("out-of-bounds-access"));
        assert!(text.contains("WRITE of size 4 in kernel <vadd>"));

        let record = record();
        record.mark_released();
        let d = Diagnostic::host(ViolationKind::DoubleFree, record.user_begin, Some(record));
        let text = d.to_string();
        assert!(text.contains("double-free"));
        assert!(text.contains("released here"));
    }
}
