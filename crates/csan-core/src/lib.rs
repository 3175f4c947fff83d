//! # CSAN Core
//!
//! Foundational types shared by every layer of the compute sanitizer.
//!
//! The sanitizer sits between an application and a compute runtime. It
//! never reimplements the runtime: everything it needs (allocation, fills,
//! device-global access, virtual memory) goes through the narrow
//! [`ComputeRuntime`] call surface defined here.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        csan-core                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │   Types     │  │  Runtime    │  │  Device Protocol    │  │
//! │  │ (DeviceAddr,│  │  (call      │  │  (symbols, report,  │  │
//! │  │  handles)   │  │   surface)  │  │   poison bytes)     │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────┘  │
//! │  ┌─────────────┐  ┌─────────────┐                           │
//! │  │   Error     │  │  Options    │                           │
//! │  └─────────────┘  └─────────────┘                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod error;
pub mod kind;
pub mod protocol;
pub mod runtime;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-exports for convenience
pub use config::Options;
pub use error::{Error, Result};
pub use kind::AllocKind;
pub use runtime::{ComputeRuntime, DeviceInfo, DeviceKind, UsmDesc, VirtualMemAccess};
pub use types::*;

/// Each shadow byte describes this many bytes of application memory
pub const SHADOW_GRANULARITY: u64 = 8;

/// log2 of [`SHADOW_GRANULARITY`]
pub const SHADOW_SCALE: u32 = 3;
