//! LWKT shared ABI types.
//!
//! Canonical definitions for everything that crosses a subsystem boundary:
//! priority bands, thread state encodings, the in-memory message layout,
//! result codes, syscall numbers and capability-port constants. Subsystems
//! import from here rather than defining their own copies.
//!
//! Layout-carrying types are `#[repr(C)]` and checked with compile-time
//! offset assertions.

#![no_std]
#![deny(unsafe_code)]

pub mod caps;
pub mod error;
pub mod msg;
pub mod syscall;
pub mod task;

/// Upper bound on logical CPUs a machine may be booted with.
pub const MAX_CPUS: usize = 64;

pub use caps::*;
pub use error::*;
pub use msg::*;
pub use syscall::*;
pub use task::*;
