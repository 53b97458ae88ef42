//! Hardware access seams.
//!
//! This module isolates everything that touches the machine. It provides:
//! 1. **MSR access:** The [`MsrIo`] trait and its `/dev/cpu/N/msr` backed
//!    implementation.
//! 2. **CPUID:** The [`Cpuid`] trait and the native instruction wrapper.
//! 3. **Register map:** Fixed-ABI model-specific-register addresses and
//!    field layouts.
//!
//! Both traits exist so the entire core can be driven against a mock
//! register file in tests; production code uses the OS-backed impls.

pub mod cpuid;
pub mod msr;

pub use cpuid::{Cpuid, CpuidRegs, NativeCpuid};
pub use msr::{DevMsr, MsrIo};
