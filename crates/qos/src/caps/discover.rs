//! Capability discovery.
//!
//! Probes the feature-enumeration CPUID leaves once at init and derives the
//! immutable catalog:
//! 1. **Monitoring:** Leaf 0xF, event list and per-event ID ceilings.
//! 2. **L3/L2 allocation:** Leaf 0x10 sub-leaves 1 and 2, plus the latched
//!    code/data-partitioning state read from the QoS configuration
//!    registers of every socket.
//! 3. **Bandwidth allocation:** Leaf 0x10 sub-leaf 3, with the AMD
//!    slow-memory variant from the extended leaf.
//!
//! Discovery never mutates platform state; requested reconfigures happen
//! later through the allocation manager's reset path.

use tracing::{debug, info, warn};

use crate::caps::{
    Capabilities, CacheAllocCap, MbaCap, MonEvent, MonitorCap, MonitorEventCap,
};
use crate::common::{Error, Result};
use crate::hw::cpuid::Cpuid;
use crate::hw::msr::{self, MsrIo};
use crate::topology::{Topology, Vendor};

/// Feature leaf: EBX bit 12 = monitoring, bit 15 = allocation.
const LEAF_FEATURES: u32 = 0x7;
const FEATURE_MON: u32 = 1 << 12;
const FEATURE_ALLOC: u32 = 1 << 15;

/// Monitoring enumeration leaf.
const LEAF_MON: u32 = 0xF;
/// Allocation enumeration leaf.
const LEAF_ALLOC: u32 = 0x10;
/// AMD extended allocation leaf carrying the slow-memory variant.
const LEAF_AMD_EXT: u32 = 0x8000_0020;

/// Probes the platform and derives the capability catalog.
///
/// Fails with a resource error when no recognised technology is present
/// at all.
///
/// # Arguments
///
/// * `topo` - The topology snapshot.
/// * `cpuid` - Source of enumeration leaves.
/// * `io` - Register access for latched-state reads; `None` on the kernel
///   interface, whose caller overrides the affected flags afterwards.
/// * `resctrl_present` - Widens the catalog with the capabilities only the
///   kernel interface offers (task-scoped monitoring, the bandwidth
///   controller).
///
/// # Returns
///
/// The immutable capability catalog.
pub fn discover(
    topo: &Topology,
    cpuid: &dyn Cpuid,
    io: Option<&dyn MsrIo>,
    resctrl_present: bool,
) -> Result<Capabilities> {
    let features = cpuid.leaf(LEAF_FEATURES, 0)?.ebx;
    let mut caps = Capabilities::default();

    if features & FEATURE_MON != 0 {
        caps.monitor = discover_monitor(cpuid, resctrl_present)?;
    }
    if features & FEATURE_ALLOC != 0 {
        let resources = cpuid.leaf(LEAF_ALLOC, 0)?.ebx;
        if resources & (1 << 1) != 0 {
            caps.l3ca = Some(discover_cache_alloc(topo, cpuid, io, CacheLevel::L3)?);
        }
        if resources & (1 << 2) != 0 {
            caps.l2ca = Some(discover_cache_alloc(topo, cpuid, io, CacheLevel::L2)?);
        }
        if resources & (1 << 3) != 0 {
            caps.mba = Some(discover_mba(cpuid, resctrl_present)?);
        }
    }
    if topo.vendor == Vendor::Amd {
        caps.smba = discover_smba(cpuid)?;
    }

    if caps.is_empty() {
        return Err(Error::Resource(
            "no monitoring or allocation technology present".into(),
        ));
    }
    info!(
        monitor = caps.monitor.is_some(),
        l3ca = caps.l3ca.is_some(),
        l2ca = caps.l2ca.is_some(),
        mba = caps.mba.is_some(),
        smba = caps.smba.is_some(),
        "capability discovery complete"
    );
    Ok(caps)
}

fn discover_monitor(cpuid: &dyn Cpuid, resctrl_present: bool) -> Result<Option<MonitorCap>> {
    let top = cpuid.leaf(LEAF_MON, 0)?;
    // EDX bit 1: L3 monitoring resource present.
    if top.edx & (1 << 1) == 0 {
        return Ok(None);
    }
    let max_rmid = top.ebx + 1;

    let l3 = cpuid.leaf(LEAF_MON, 1)?;
    let scale = u64::from(l3.ebx);
    let event_max_rmid = l3.ecx + 1;
    // EAX bits 7..0: counter width as an offset from 24 bits.
    let width_off = l3.eax & 0xFF;
    let counter_width = if width_off == 0 { 0 } else { 24 + width_off as u8 };
    let iordt_occup = l3.eax & (1 << 9) != 0;
    let iordt_bw = l3.eax & (1 << 10) != 0;

    let mut events = Vec::new();
    let mut push = |event, max, scale, width, iordt| {
        events.push(MonitorEventCap {
            event,
            max_rmid: max,
            scale_factor: scale,
            counter_width: width,
            supports_iordt: iordt,
            supports_pid: resctrl_present,
        });
    };
    if l3.edx & (1 << 0) != 0 {
        push(MonEvent::LlcOccupancy, event_max_rmid, scale, 0, iordt_occup);
    }
    let total = l3.edx & (1 << 1) != 0;
    let local = l3.edx & (1 << 2) != 0;
    if total {
        push(MonEvent::TotalBw, event_max_rmid, scale, counter_width, iordt_bw);
    }
    if local {
        push(MonEvent::LocalBw, event_max_rmid, scale, counter_width, iordt_bw);
    }
    if total && local {
        push(MonEvent::RemoteBw, event_max_rmid, scale, counter_width, false);
    }
    // Architectural performance events do not consume monitoring IDs.
    push(MonEvent::Ipc, max_rmid, 1, 0, false);
    push(MonEvent::LlcMisses, max_rmid, 1, 0, false);
    push(MonEvent::LlcReferences, max_rmid, 1, 0, false);

    debug!(max_rmid, events = events.len(), "monitoring enumerated");
    Ok(Some(MonitorCap {
        max_rmid,
        events,
        snc_num: 1,
        iordt_supported: iordt_occup || iordt_bw,
        iordt_enabled: false,
    }))
}

/// Which cache level a CAT capability describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheLevel {
    L3,
    L2,
}

fn discover_cache_alloc(
    topo: &Topology,
    cpuid: &dyn Cpuid,
    io: Option<&dyn MsrIo>,
    level: CacheLevel,
) -> Result<CacheAllocCap> {
    let (subleaf, cfg_msr, mask_start, way_size) = match level {
        CacheLevel::L3 => (1, msr::MSR_L3_QOS_CFG, msr::MSR_L3CA_MASK_START, topo.l3.way_size),
        CacheLevel::L2 => (2, msr::MSR_L2_QOS_CFG, msr::MSR_L2CA_MASK_START, topo.l2.way_size),
    };
    let r = cpuid.leaf(LEAF_ALLOC, subleaf)?;
    let num_ways = (r.eax & 0x1F) + 1;
    let way_contention = u64::from(r.ebx);
    let cdp_supported = r.ecx & (1 << 2) != 0;
    let non_contiguous_cbm = r.ecx & (1 << 3) != 0;
    let mut num_classes = (r.edx & 0xFFFF) + 1;

    if num_classes <= 1 {
        if let Some(io) = io {
            // Enumeration did not yield a class count; probe the mask
            // block on one core, stopping at the first register that
            // rejects the access.
            num_classes = probe_num_classes(io, topo, mask_start);
            warn!(?level, num_classes, "class count taken from register probe");
        }
    }

    let cdp_enabled = match (cdp_supported, io) {
        (true, Some(io)) => latched_cdp_state(topo, io, cfg_msr)?,
        // Without register access the latched state comes from the kernel
        // interface; the caller overrides this flag from resctrl info.
        _ => false,
    };
    if cdp_enabled {
        num_classes /= 2;
    }

    Ok(CacheAllocCap {
        num_classes,
        num_ways,
        way_size,
        way_contention,
        cdp_supported,
        cdp_enabled,
        non_contiguous_cbm,
        iordt_supported: false,
        iordt_enabled: false,
    })
}

/// Reads the latched code/data-partitioning bit on one core of every
/// socket. Sockets must agree; a mixed state cannot be repaired at run
/// time and requires a reboot.
fn latched_cdp_state(topo: &Topology, io: &dyn MsrIo, cfg_msr: u32) -> Result<bool> {
    let mut state: Option<bool> = None;
    for socket in topo.sockets() {
        let lcore = topo
            .cores_of_socket(socket)
            .first()
            .copied()
            .ok_or_else(|| Error::Other(format!("socket {socket} has no cores")))?;
        let enabled = io.read(lcore, cfg_msr)? & msr::QOS_CFG_CDP_ENABLE != 0;
        match state {
            None => state = Some(enabled),
            Some(prev) if prev != enabled => {
                return Err(Error::Other(format!(
                    "code/data partitioning state differs between sockets \
                     (socket {socket} disagrees); reboot required"
                )));
            }
            Some(_) => {}
        }
    }
    Ok(state.unwrap_or(false))
}

/// Counts usable allocation classes by reading successive mask registers on
/// one core until the hardware rejects the access.
fn probe_num_classes(io: &dyn MsrIo, topo: &Topology, mask_start: u32) -> u32 {
    let Some(core) = topo.cores.first().map(|c| c.lcore) else {
        return 0;
    };
    let mut count = 0;
    while count < 128 {
        if io.read(core, mask_start + count).is_err() {
            break;
        }
        count += 1;
    }
    count
}

fn discover_mba(cpuid: &dyn Cpuid, resctrl_present: bool) -> Result<MbaCap> {
    let r = cpuid.leaf(LEAF_ALLOC, 3)?;
    let max_delay = (r.eax & 0xFFF) + 1;
    let is_linear = r.ecx & (1 << 2) != 0;
    let num_classes = (r.edx & 0xFFFF) + 1;
    // In linear mode the delay granularity is the complement of the
    // largest delay; accepted percentages are its multiples up to 100.
    let throttle_step = if is_linear {
        (100u32.saturating_sub(max_delay)).max(1)
    } else {
        1
    };
    Ok(MbaCap {
        num_classes,
        throttle_max: 100,
        throttle_step,
        is_linear,
        ctrl_supported: resctrl_present,
        ctrl_enabled: false,
        mba40_supported: false,
        mba40_enabled: false,
    })
}

/// Slow-memory bandwidth allocation from the AMD extended leaf.
fn discover_smba(cpuid: &dyn Cpuid) -> Result<Option<MbaCap>> {
    let top = cpuid.leaf(LEAF_AMD_EXT, 0)?;
    if top.ebx & (1 << 2) == 0 {
        return Ok(None);
    }
    let r = cpuid.leaf(LEAF_AMD_EXT, 2)?;
    let num_classes = (r.edx & 0xFFFF) + 1;
    Ok(Some(MbaCap {
        num_classes,
        throttle_max: (r.eax & 0xFFFF).max(1),
        throttle_step: 1,
        is_linear: true,
        ctrl_supported: true,
        ctrl_enabled: true,
        mba40_supported: false,
        mba40_enabled: false,
    }))
}
