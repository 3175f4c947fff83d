//! # CSAN
//!
//! Memory-safety sanitizer layer for compute runtimes.
//!
//! Every allocation is bracketed by poisoned redzones and described in
//! shadow memory. Released allocations are held in a quarantine so that
//! stale accesses still hit poisoned shadow. Around each kernel launch the
//! sanitizer flushes pending shadow writes, hands the shadow layout to the
//! instrumented kernel, and reads back whatever violation the kernel
//! reported.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Interceptor                            │
//! │                                                                 │
//! │  allocate / release        launch                 programs      │
//! │        │                     │                       │          │
//! │  ┌─────▼──────┐     ┌────────▼────────┐    ┌─────────▼───────┐  │
//! │  │ Allocation │     │     Launch      │    │  Device Global  │  │
//! │  │  Tracker   │◀────│ Instrumentation │    │    Registry     │  │
//! │  └─────┬──────┘     └────────┬────────┘    └─────────┬───────┘  │
//! │        │  ┌────────────┐     │                       │          │
//! │        ├─▶│ Quarantine │     │                       │          │
//! │        │  └────────────┘     │                       │          │
//! │  ┌─────▼─────────────────────▼───────────────────────▼───────┐  │
//! │  │              pending shadow writes per device             │  │
//! │  └───────────────────────────┬───────────────────────────────┘  │
//! └──────────────────────────────┼──────────────────────────────────┘
//!                                ▼
//!                      csan-shadow ShadowEngine
//! ```
//!
//! ## Installation
//!
//! The runtime adapter installs the sanitizer once per process and routes
//! its entry points through [`interceptor()`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocation;
pub mod buffer;
pub mod context;
pub mod device_global;
pub mod interceptor;
pub mod launch;
pub mod quarantine;
pub mod report;
pub mod tracker;

pub use allocation::{AllocationRecord, RedzoneLayout, StackTrace};
pub use buffer::MemBuffer;
pub use interceptor::Interceptor;
pub use launch::{LaunchContext, LaunchOutcome, LaunchState, ManagedQueue};
pub use report::{Diagnostic, ViolationKind};

use alloc::sync::Arc;

use spin::Once;

use csan_core::{ComputeRuntime, Options};

static INTERCEPTOR: Once<Interceptor> = Once::new();

/// Install the process-wide sanitizer
///
/// Only the first call creates the sanitizer; later calls return it
/// unchanged.
pub fn install(runtime: Arc<dyn ComputeRuntime>, options: Options) -> &'static Interceptor {
    INTERCEPTOR.call_once(|| {
        if options.debug {
            log::set_max_level(log::LevelFilter::Debug);
        }
        Interceptor::new(runtime, options)
    })
}

/// The installed sanitizer, if any
pub fn interceptor() -> Option<&'static Interceptor> {
    INTERCEPTOR.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use csan_core::mock::MockRuntime;

    #[test]
    fn test_install_once() {
        let first = install(Arc::new(MockRuntime::new()), Options::default());
        let options = Options {
            debug: true,
            ..Options::default()
        };
        let second = install(Arc::new(MockRuntime::new()), options);
        assert!(core::ptr::eq(first, second));
        assert!(!second.options().debug);
        assert!(interceptor().is_some());
    }
}
