//! Capability catalog.
//!
//! This module describes what the platform's monitoring and allocation
//! hardware offers. It provides:
//! 1. **Events:** The monitoring event set ([`MonEvents`]) used throughout
//!    the monitoring manager.
//! 2. **Descriptors:** Per-technology capability records.
//! 3. **Catalog:** The [`Capabilities`] container built once at init.
//!
//! The catalog is immutable after discovery except for the enable flags
//! that the allocation manager flips on a successful reconfigure (CDP,
//! bandwidth controller, device-channel support).

pub mod discover;

use crate::common::{Error, Result};
use crate::config::DEFAULT_MBM_COUNTER_WIDTH;

/// One monitoring event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonEvent {
    /// Last-level cache occupancy.
    LlcOccupancy,
    /// Local memory bandwidth.
    LocalBw,
    /// Total memory bandwidth.
    TotalBw,
    /// Remote memory bandwidth, derived as total minus local.
    RemoteBw,
    /// Instructions per cycle, from the architectural fixed counters.
    Ipc,
    /// Last-level cache misses, from a programmable counter.
    LlcMisses,
    /// Last-level cache references, from a programmable counter.
    LlcReferences,
}

impl MonEvent {
    /// # Returns
    ///
    /// The bit representing this event in [`MonEvents`] masks.
    pub const fn bit(self) -> u32 {
        match self {
            MonEvent::LlcOccupancy => 1 << 0,
            MonEvent::LocalBw => 1 << 1,
            MonEvent::TotalBw => 1 << 2,
            MonEvent::RemoteBw => 1 << 3,
            MonEvent::Ipc => 1 << 4,
            MonEvent::LlcMisses => 1 << 5,
            MonEvent::LlcReferences => 1 << 6,
        }
    }

    /// # Returns
    ///
    /// The hardware event id programmed into the event-select register,
    /// or `None` for events not backed by per-RMID counters.
    pub const fn hw_event_id(self) -> Option<u8> {
        match self {
            MonEvent::LlcOccupancy => Some(1),
            MonEvent::TotalBw => Some(2),
            MonEvent::LocalBw => Some(3),
            _ => None,
        }
    }

    /// All event kinds, in bit order.
    pub const ALL: [MonEvent; 7] = [
        MonEvent::LlcOccupancy,
        MonEvent::LocalBw,
        MonEvent::TotalBw,
        MonEvent::RemoteBw,
        MonEvent::Ipc,
        MonEvent::LlcMisses,
        MonEvent::LlcReferences,
    ];
}

/// Set of monitoring events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonEvents(u32);

impl MonEvents {
    /// The empty set.
    pub const EMPTY: MonEvents = MonEvents(0);

    /// Builds a set from individual events.
    ///
    /// # Arguments
    ///
    /// * `events` - The events to include.
    ///
    /// # Returns
    ///
    /// The set containing exactly those events.
    pub fn of(events: &[MonEvent]) -> Self {
        let mut bits = 0;
        for e in events {
            bits |= e.bit();
        }
        MonEvents(bits)
    }

    /// Tests set membership.
    ///
    /// # Arguments
    ///
    /// * `event` - The event to test for.
    ///
    /// # Returns
    ///
    /// `true` when the set contains the event.
    pub fn contains(self, event: MonEvent) -> bool {
        self.0 & event.bit() != 0
    }

    /// # Returns
    ///
    /// `true` when no event is selected.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Extends the set by one event.
    ///
    /// # Arguments
    ///
    /// * `event` - The event to add.
    ///
    /// # Returns
    ///
    /// The union of the set and the event.
    #[must_use]
    pub fn with(self, event: MonEvent) -> Self {
        MonEvents(self.0 | event.bit())
    }

    /// # Returns
    ///
    /// An iterator over the events present in the set, in bit order.
    pub fn iter(self) -> impl Iterator<Item = MonEvent> {
        MonEvent::ALL.into_iter().filter(move |e| self.contains(*e))
    }

    /// # Returns
    ///
    /// `true` when any per-RMID event (occupancy or bandwidth) is
    /// selected. Remote bandwidth implies both local and total reads.
    pub fn needs_rmid(self) -> bool {
        self.contains(MonEvent::LlcOccupancy)
            || self.contains(MonEvent::LocalBw)
            || self.contains(MonEvent::TotalBw)
            || self.contains(MonEvent::RemoteBw)
    }

    /// # Returns
    ///
    /// `true` when any architectural performance counter is needed.
    pub fn needs_perf(self) -> bool {
        self.contains(MonEvent::Ipc)
            || self.contains(MonEvent::LlcMisses)
            || self.contains(MonEvent::LlcReferences)
    }
}

/// Capability record for one monitoring event.
#[derive(Debug, Clone, Copy)]
pub struct MonitorEventCap {
    /// The event described.
    pub event: MonEvent,
    /// Highest monitoring ID usable with this event; may be lower than the
    /// platform maximum.
    pub max_rmid: u32,
    /// Factor converting raw counter units to bytes.
    pub scale_factor: u64,
    /// Counter width in bits; 0 means unknown.
    pub counter_width: u8,
    /// Whether device-channel agents can report this event.
    pub supports_iordt: bool,
    /// Whether task-scoped monitoring of this event is available.
    pub supports_pid: bool,
}

/// Monitoring capability.
#[derive(Debug, Clone, Default)]
pub struct MonitorCap {
    /// Platform-wide monitoring ID count per cluster.
    pub max_rmid: u32,
    /// Supported events.
    pub events: Vec<MonitorEventCap>,
    /// Number of sub-NUMA clusters per last-level cache; 1 when SNC is off.
    pub snc_num: u32,
    /// Device-channel monitoring presence.
    pub iordt_supported: bool,
    /// Device-channel monitoring latched on.
    pub iordt_enabled: bool,
}

impl MonitorCap {
    /// Looks up the capability record for one event.
    ///
    /// # Arguments
    ///
    /// * `event` - The event to look up.
    ///
    /// # Returns
    ///
    /// The event's record, or `None` when it is unsupported.
    pub fn event(&self, event: MonEvent) -> Option<&MonitorEventCap> {
        self.events.iter().find(|e| e.event == event)
    }

    /// Tests whether a whole event set is supported.
    ///
    /// # Arguments
    ///
    /// * `events` - The requested event set.
    ///
    /// # Returns
    ///
    /// `true` when every event in the set is supported.
    pub fn supports(&self, events: MonEvents) -> bool {
        events.iter().all(|e| self.event(e).is_some())
    }

    /// Effective monitoring-ID ceiling for a request.
    ///
    /// # Arguments
    ///
    /// * `events` - The requested event set.
    ///
    /// # Returns
    ///
    /// The minimum `max_rmid` across the selected per-RMID events.
    pub fn event_max_rmid(&self, events: MonEvents) -> u32 {
        let mut max = self.max_rmid;
        for e in events.iter() {
            if e.hw_event_id().is_none() && e != MonEvent::RemoteBw {
                continue;
            }
            if let Some(cap) = self.event(e) {
                max = max.min(cap.max_rmid);
            }
        }
        max
    }

    /// # Returns
    ///
    /// A map from event bit to scale factor, for display layers converting
    /// raw counter units to bytes.
    pub fn scales(&self) -> std::collections::BTreeMap<u32, u64> {
        self.events
            .iter()
            .map(|e| (e.event.bit(), e.scale_factor))
            .collect()
    }

    /// # Returns
    ///
    /// The counter width for bandwidth wrap-around arithmetic, falling
    /// back to the library default when the platform does not report one.
    pub fn mbm_counter_width(&self) -> u8 {
        let width = self
            .event(MonEvent::TotalBw)
            .or_else(|| self.event(MonEvent::LocalBw))
            .map_or(0, |e| e.counter_width);
        if width == 0 {
            DEFAULT_MBM_COUNTER_WIDTH
        } else {
            width
        }
    }
}

/// Cache-allocation capability, shared by the L3 and L2 technologies.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheAllocCap {
    /// Number of classes visible to callers. Halved while code/data
    /// partitioning is enabled.
    pub num_classes: u32,
    /// Number of ways in the partitionable cache.
    pub num_ways: u32,
    /// Size of one way in bytes.
    pub way_size: u32,
    /// Ways shared with other agents; a class must not select only these.
    pub way_contention: u64,
    /// Code/data partitioning available.
    pub cdp_supported: bool,
    /// Code/data partitioning latched on.
    pub cdp_enabled: bool,
    /// Non-contiguous way masks accepted.
    pub non_contiguous_cbm: bool,
    /// Device-channel allocation available (L3 only).
    pub iordt_supported: bool,
    /// Device-channel allocation latched on (L3 only).
    pub iordt_enabled: bool,
}

/// Memory-bandwidth-allocation capability, shared by MBA and SMBA.
#[derive(Debug, Clone, Copy, Default)]
pub struct MbaCap {
    /// Number of throttling classes.
    pub num_classes: u32,
    /// Highest accepted bandwidth value (percent in throttle mode).
    pub throttle_max: u32,
    /// Granularity of accepted values.
    pub throttle_step: u32,
    /// Delay values scale linearly.
    pub is_linear: bool,
    /// Bandwidth controller (MBps targets) available.
    pub ctrl_supported: bool,
    /// Bandwidth controller latched on.
    pub ctrl_enabled: bool,
    /// 4.0 extensions available.
    pub mba40_supported: bool,
    /// 4.0 extensions latched on.
    pub mba40_enabled: bool,
}

/// Immutable description of what the platform offers.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Monitoring, when present.
    pub monitor: Option<MonitorCap>,
    /// L3 cache allocation, when present.
    pub l3ca: Option<CacheAllocCap>,
    /// L2 cache allocation, when present.
    pub l2ca: Option<CacheAllocCap>,
    /// Memory-bandwidth allocation, when present.
    pub mba: Option<MbaCap>,
    /// Slow-memory-bandwidth allocation, when present.
    pub smba: Option<MbaCap>,
}

impl Capabilities {
    /// Monitoring capability or an error naming the missing technology.
    pub fn monitor(&self) -> Result<&MonitorCap> {
        self.monitor
            .as_ref()
            .ok_or_else(|| Error::Resource("monitoring".into()))
    }

    /// L3 cache-allocation capability or an error.
    pub fn l3ca(&self) -> Result<&CacheAllocCap> {
        self.l3ca
            .as_ref()
            .ok_or_else(|| Error::Resource("L3 cache allocation".into()))
    }

    /// L2 cache-allocation capability or an error.
    pub fn l2ca(&self) -> Result<&CacheAllocCap> {
        self.l2ca
            .as_ref()
            .ok_or_else(|| Error::Resource("L2 cache allocation".into()))
    }

    /// Memory-bandwidth-allocation capability or an error.
    pub fn mba(&self) -> Result<&MbaCap> {
        self.mba
            .as_ref()
            .ok_or_else(|| Error::Resource("memory-bandwidth allocation".into()))
    }

    /// Slow-memory-bandwidth-allocation capability or an error.
    pub fn smba(&self) -> Result<&MbaCap> {
        self.smba
            .as_ref()
            .ok_or_else(|| Error::Resource("slow-memory-bandwidth allocation".into()))
    }

    /// # Returns
    ///
    /// `true` when no technology at all was recognised.
    pub fn is_empty(&self) -> bool {
        self.monitor.is_none()
            && self.l3ca.is_none()
            && self.l2ca.is_none()
            && self.mba.is_none()
            && self.smba.is_none()
    }
}
