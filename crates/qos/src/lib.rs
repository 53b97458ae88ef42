//! Platform quality-of-service control library.
//!
//! This crate manages a CPU's cache-monitoring and resource-partitioning
//! hardware from user space:
//! 1. **Monitoring:** Last-level cache occupancy, local/total/remote memory
//!    bandwidth, IPC and cache miss/reference rates per core, task or
//!    device channel.
//! 2. **Allocation:** L3 and L2 way-mask partitioning with optional
//!    code/data separation, and per-class memory-bandwidth throttling.
//! 3. **Back-ends:** Direct model-specific registers, the kernel resctrl
//!    filesystem, and memory-mapped registers for device-side agents, all
//!    behind one interface selection.
//!
//! Everything hangs off a [`Qos`] context built at init; operations are
//! serialised in-process by an internal lock and across processes by an
//! advisory file lock.

/// Allocation manager: class definitions, associations, assignment, reset.
pub mod alloc;
/// Back-end registry: register, kernel-filesystem and memory-mapped paths.
pub mod backend;
/// Capability catalog and its discovery.
pub mod caps;
/// Common error and mask types.
pub mod common;
/// Init-time configuration record.
pub mod config;
/// Library lifecycle: context, builder, locks.
pub mod context;
/// Hardware access seams: MSR and CPUID traits.
pub mod hw;
/// Monitoring manager: IDs, groups, polling.
pub mod monitor;
/// CPU topology snapshot and probe.
pub mod topology;

/// The library context; construct with `Qos::init` or `Qos::builder`.
pub use crate::context::{Qos, QosBuilder};
/// Init-time configuration; deserializes from JSON or use `Config::default()`.
pub use crate::config::Config;
/// Library error type returned by every public operation.
pub use crate::common::{Error, Result};
/// Capability catalog handed out by `Qos::capabilities`.
pub use crate::caps::{Capabilities, MonEvent, MonEvents};
/// Monitoring group handle and counter values.
pub use crate::monitor::{EventValues, MonGroup, PollStatus};
/// Allocation class definitions.
pub use crate::alloc::{CatCos, MbaCos, ResetConfig, Technologies, Technology};
/// Device-channel address for the memory-mapped back-end.
pub use crate::backend::mmio::ChannelId;
