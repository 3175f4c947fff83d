//! # CSAN Shadow Memory
//!
//! Shadow memory engine of the compute sanitizer.
//!
//! One shadow byte describes one 8-byte granule of application memory.
//! Device instrumentation reads it before every access; the host side
//! writes it whenever an allocation is created, released or registered.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        ShadowEngine                           │
//! │                                                               │
//! │  ┌──────────────┐   ┌────────────────┐   ┌─────────────────┐  │
//! │  │   Mapping    │   │  Provisioning  │   │    Painting     │  │
//! │  │ addr → shadow│   │ host reserve / │   │ ranges, whole   │  │
//! │  │  per shape   │   │ lazy VM pages  │   │  allocations    │  │
//! │  └──────────────┘   └────────────────┘   └─────────────────┘  │
//! │           │                 │                     │           │
//! │           └─────────────────┴──────────┬──────────┘           │
//! │                                        ▼                      │
//! │                              ComputeRuntime                   │
//! └───────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod mapping;
pub mod paint;
pub mod provision;

pub use mapping::{address_to_shadow, DeviceShape, HostLayout, ShadowLayouts, ShadowRange, TiledLayout};
pub use paint::ShadowPattern;
pub use provision::{DeviceShadow, ShadowEngine};
