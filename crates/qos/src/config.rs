//! Configuration consumed at library init.
//!
//! This module defines the configuration record and its enums. It provides:
//! 1. **Defaults:** Baseline values used when a field is omitted.
//! 2. **Structures:** The [`Config`] record consumed by `Qos::init`.
//! 3. **Enums:** Interface selection, verbosity, tri-state feature requests.
//!
//! Configuration is supplied via JSON (the CLI's `--config`) or use
//! `Config::default()` for programmatic callers.

use serde::Deserialize;

/// Default configuration constants.
mod defaults {
    /// Retry budget for a counter read that reports "not yet available".
    pub const UNAVAILABLE_RETRIES: u32 = 3;

    /// Counter width assumed when the capability catalog reports width 0.
    pub const MBM_COUNTER_WIDTH: u8 = 24;
}

/// Retry budget for unavailable-counter reads, bounded per the polling
/// contract.
pub const UNAVAILABLE_RETRIES: u32 = defaults::UNAVAILABLE_RETRIES;

/// Fallback memory-bandwidth counter width in bits.
pub const DEFAULT_MBM_COUNTER_WIDTH: u8 = defaults::MBM_COUNTER_WIDTH;

/// Back-end interface selection.
///
/// `Auto` prefers the kernel resctrl filesystem when it is mounted and falls
/// back to direct model-specific-register access otherwise. `Mmio` is
/// additive: device-channel operations use memory-mapped registers alongside
/// whichever CPU-side interface was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Interface {
    /// Prefer the kernel filesystem, fall back to registers.
    #[default]
    Auto,
    /// Direct model-specific-register access.
    #[serde(alias = "MSR")]
    Register,
    /// Kernel resctrl pseudo-filesystem.
    #[serde(alias = "OS")]
    Filesystem,
    /// Memory-mapped registers for device-side agents, alongside a CPU-side
    /// interface chosen as for `Auto`.
    Mmio,
}

/// Log verbosity requested by the caller.
///
/// The library emits `tracing` events; it never installs a subscriber. This
/// setting is advice for whoever does (the CLI maps it to a level filter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Verbosity {
    /// No output.
    Silent,
    /// Warnings and errors.
    #[default]
    Default,
    /// Informational messages.
    Verbose,
    /// Full debug output.
    SuperVerbose,
}

/// Tri-state request for a latchable platform feature.
///
/// `Any` keeps whatever state the platform currently has; `On`/`Off` request
/// a reconfigure at init, which fails with a resource error when the platform
/// cannot honour it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum Toggle {
    /// Keep the currently latched state.
    #[default]
    Any,
    /// Request the feature enabled.
    On,
    /// Request the feature disabled.
    Off,
}

/// Sub-NUMA-cluster monitoring mode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SncMode {
    /// Keep the current mode.
    #[default]
    Any,
    /// Monitoring IDs are enumerated per NUMA node.
    Local,
    /// Monitoring IDs are enumerated per last-level cache.
    Total,
}

/// Configuration record consumed at init.
///
/// Every field is optional in the JSON form; missing fields take the
/// defaults shown by `Config::default()`.
///
/// # Examples
///
/// ```
/// use pqctl_core::config::{Config, Interface, Toggle};
///
/// let json = r#"{ "interface": "Register", "l3_cdp": "On" }"#;
/// let config: Config = serde_json::from_str(json).unwrap();
/// assert_eq!(config.interface, Interface::Register);
/// assert_eq!(config.l3_cdp, Toggle::On);
/// assert_eq!(config.mba_controller, Toggle::Any);
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Back-end interface choice.
    #[serde(default)]
    pub interface: Interface,

    /// Log verbosity advice for the subscriber owner.
    #[serde(default)]
    pub verbose: Verbosity,

    /// Request L3 code/data partitioning on or off at init.
    #[serde(default)]
    pub l3_cdp: Toggle,

    /// Request L2 code/data partitioning on or off at init.
    #[serde(default)]
    pub l2_cdp: Toggle,

    /// Request the memory-bandwidth controller (MBps targets) on or off.
    #[serde(default)]
    pub mba_controller: Toggle,

    /// Request device-channel (I/O) monitoring and allocation on or off.
    #[serde(default)]
    pub iordt: Toggle,

    /// Sub-NUMA-cluster monitoring mode.
    #[serde(default)]
    pub snc: SncMode,

    /// One-shot policy for cores found bound to a non-zero monitoring ID at
    /// init: rebind them to ID 0 instead of marking the ID unavailable.
    /// Also overrides the in-use check on the performance counters needed
    /// for IPC and LLC-miss monitoring.
    #[serde(default)]
    pub reclaim_in_use_rmid: bool,
}
