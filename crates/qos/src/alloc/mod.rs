//! Allocation manager.
//!
//! Maintains class-of-service definitions per technology and domain,
//! associates cores, tasks and device channels with classes, and
//! orchestrates global reconfigurations:
//! 1. **Class writes:** Validated against the capability catalog, written
//!    through the active back-end, mirrored for first-available scans.
//! 2. **Associations:** The manager is the sole writer of the association
//!    tables; readers see consistent values under the global lock.
//! 3. **Reset:** Returns every class to the permissive default and every
//!    entity to class 0; optionally flips code/data partitioning, the
//!    bandwidth controller or device-channel support on the way.

use std::collections::BTreeMap;

use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

use crate::backend::mmio::ChannelId;
use crate::backend::resctrl::schemata::Schemata;
use crate::backend::{Backends, CpuBackend};
use crate::caps::{Capabilities, CacheAllocCap, MbaCap};
use crate::common::{mask, Error, Result};
use crate::config::Toggle;
use crate::hw::msr;
use crate::topology::Topology;

/// A cache-allocation class definition.
///
/// The two-mask form is only valid while code/data partitioning is on, the
/// single-mask form only while it is off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatCos {
    /// One way mask covering code and data.
    Mask(u64),
    /// Separate code and data way masks.
    Cdp {
        /// Ways for instruction lines.
        code: u64,
        /// Ways for data lines.
        data: u64,
    },
}

/// A memory-bandwidth class definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbaCos {
    /// Percentage of bandwidth while the controller is off, megabytes per
    /// second while it is on.
    pub mb_max: u32,
    /// Interpret `mb_max` as an MBps target.
    pub ctrl: bool,
}

/// One allocation technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Technology {
    /// L3 cache allocation.
    L3Ca,
    /// L2 cache allocation.
    L2Ca,
    /// Memory-bandwidth allocation.
    Mba,
}

impl Technology {
    const fn bit(self) -> u32 {
        match self {
            Technology::L3Ca => 1 << 0,
            Technology::L2Ca => 1 << 1,
            Technology::Mba => 1 << 2,
        }
    }
}

/// Set of allocation technologies for first-available assignment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Technologies(u32);

impl Technologies {
    /// Builds a set from individual technologies.
    pub fn of(techs: &[Technology]) -> Self {
        let mut bits = 0;
        for t in techs {
            bits |= t.bit();
        }
        Technologies(bits)
    }

    /// Returns `true` when the set contains `tech`.
    pub fn contains(self, tech: Technology) -> bool {
        self.0 & tech.bit() != 0
    }

    /// Returns `true` when no technology is selected.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Reconfiguration requests accepted by the allocation reset.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetConfig {
    /// L3 code/data partitioning.
    pub l3_cdp: Toggle,
    /// L2 code/data partitioning.
    pub l2_cdp: Toggle,
    /// Bandwidth controller mode.
    pub mba_ctrl: Toggle,
    /// Device-channel allocation.
    pub iordt: Toggle,
}

impl ResetConfig {
    fn is_plain(&self) -> bool {
        matches!(
            (self.l3_cdp, self.l2_cdp, self.mba_ctrl, self.iordt),
            (Toggle::Any, Toggle::Any, Toggle::Any, Toggle::Any)
        )
    }
}

/// Error of a batched class write: some classes may already be applied.
#[derive(Debug, ThisError)]
#[error("{written} classes written before failure: {source}")]
pub struct BatchError {
    /// Number of classes successfully written before the failure.
    pub written: usize,
    /// The failure itself.
    #[source]
    pub source: Error,
}

/// Allocation manager state: per-domain class mirrors and association
/// tables.
#[derive(Debug, Default)]
pub(crate) struct AllocMgr {
    l3: BTreeMap<u32, Vec<CatCos>>,
    l2: BTreeMap<u32, Vec<CatCos>>,
    mba: BTreeMap<u32, Vec<MbaCos>>,
    smba: BTreeMap<u32, Vec<MbaCos>>,
    core_cos: BTreeMap<u32, u32>,
}

/// # Arguments
///
/// * `cap` - The cache-allocation capability of the technology.
///
/// # Returns
///
/// The permissive default definition in the current partitioning mode.
fn default_cat(cap: &CacheAllocCap) -> CatCos {
    let full = mask::max_mask(cap.num_ways);
    if cap.cdp_enabled {
        CatCos::Cdp {
            code: full,
            data: full,
        }
    } else {
        CatCos::Mask(full)
    }
}

/// # Arguments
///
/// * `cap` - The bandwidth-allocation capability.
///
/// # Returns
///
/// The permissive default definition in the current controller mode.
fn default_mba(cap: &MbaCap) -> MbaCos {
    if cap.ctrl_enabled {
        MbaCos {
            mb_max: u32::MAX,
            ctrl: true,
        }
    } else {
        MbaCos {
            mb_max: cap.throttle_max,
            ctrl: false,
        }
    }
}

impl AllocMgr {
    /// Builds the manager, reading the current class definitions and
    /// associations from the hardware or the kernel filesystem.
    pub fn init(topo: &Topology, caps: &Capabilities, backends: &Backends) -> Result<Self> {
        let mut mgr = AllocMgr::default();
        mgr.rebuild_mirror(topo, caps);

        match &backends.cpu {
            CpuBackend::Msr(backend) => {
                if let Some(cap) = &caps.l3ca {
                    for domain in topo.l3cat_ids() {
                        let lcore = topo.one_core_of_l3cat(domain).ok_or(Error::Init)?;
                        let defs = mgr.l3.get_mut(&domain).ok_or(Error::Init)?;
                        for (class, def) in defs.iter_mut().enumerate() {
                            *def = read_cat_msr(backend, lcore, msr::MSR_L3CA_MASK_START, cap, class as u32)?;
                        }
                    }
                }
                if let Some(cap) = &caps.l2ca {
                    for domain in topo.l2_ids() {
                        let lcore = topo.one_core_of_l2(domain).ok_or(Error::Init)?;
                        let defs = mgr.l2.get_mut(&domain).ok_or(Error::Init)?;
                        for (class, def) in defs.iter_mut().enumerate() {
                            *def = read_cat_msr(backend, lcore, msr::MSR_L2CA_MASK_START, cap, class as u32)?;
                        }
                    }
                }
                if caps.mba.is_some() {
                    for domain in topo.mba_ids() {
                        let lcore = topo.one_core_of_mba(domain).ok_or(Error::Init)?;
                        let defs = mgr.mba.get_mut(&domain).ok_or(Error::Init)?;
                        for (class, def) in defs.iter_mut().enumerate() {
                            def.mb_max = backend.mba_get(lcore, class as u32)?;
                        }
                    }
                }
                if caps.smba.is_some() {
                    for domain in topo.smba_ids() {
                        let lcore = topo.one_core_of_smba(domain).ok_or(Error::Init)?;
                        let defs = mgr.smba.get_mut(&domain).ok_or(Error::Init)?;
                        for (class, def) in defs.iter_mut().enumerate() {
                            let mbps = backend.smba_get(lcore, class as u32)?;
                            // Register value 0 means unthrottled.
                            def.mb_max = if mbps == 0 { u32::MAX } else { mbps };
                        }
                    }
                }
                for core in &topo.cores {
                    mgr.core_cos
                        .insert(core.lcore, backend.cos_assoc_get(core.lcore)?);
                }
            }
            CpuBackend::Resctrl(fs) => {
                let num_classes = Self::class_limit(caps);
                for class in 0..num_classes {
                    let Ok(sch) = fs.read_schemata(class) else {
                        continue;
                    };
                    mgr.absorb_schemata(caps, class, &sch);
                }
                for core in &topo.cores {
                    mgr.core_cos
                        .insert(core.lcore, fs.core_class(core.lcore, num_classes)?);
                }
            }
        }
        Ok(mgr)
    }

    /// Sizes the mirror tables to the catalog, filling with permissive
    /// defaults.
    fn rebuild_mirror(&mut self, topo: &Topology, caps: &Capabilities) {
        self.l3.clear();
        self.l2.clear();
        self.mba.clear();
        if let Some(cap) = &caps.l3ca {
            for domain in topo.l3cat_ids() {
                self.l3
                    .insert(domain, vec![default_cat(cap); cap.num_classes as usize]);
            }
        }
        if let Some(cap) = &caps.l2ca {
            for domain in topo.l2_ids() {
                self.l2
                    .insert(domain, vec![default_cat(cap); cap.num_classes as usize]);
            }
        }
        if let Some(cap) = &caps.mba {
            for domain in topo.mba_ids() {
                self.mba
                    .insert(domain, vec![default_mba(cap); cap.num_classes as usize]);
            }
        }
        if let Some(cap) = &caps.smba {
            for domain in topo.smba_ids() {
                self.smba
                    .insert(domain, vec![default_mba(cap); cap.num_classes as usize]);
            }
        }
    }

    fn absorb_schemata(&mut self, caps: &Capabilities, class: u32, sch: &Schemata) {
        let cdp_l3 = caps.l3ca.map_or(false, |c| c.cdp_enabled);
        let cdp_l2 = caps.l2ca.map_or(false, |c| c.cdp_enabled);
        for (domain, defs) in &mut self.l3 {
            if let Some(def) = defs.get_mut(class as usize) {
                if cdp_l3 {
                    if let (Some(&code), Some(&data)) =
                        (sch.l3_code.get(domain), sch.l3_data.get(domain))
                    {
                        *def = CatCos::Cdp { code, data };
                    }
                } else if let Some(&m) = sch.l3.get(domain) {
                    *def = CatCos::Mask(m);
                }
            }
        }
        for (domain, defs) in &mut self.l2 {
            if let Some(def) = defs.get_mut(class as usize) {
                if cdp_l2 {
                    if let (Some(&code), Some(&data)) =
                        (sch.l2_code.get(domain), sch.l2_data.get(domain))
                    {
                        *def = CatCos::Cdp { code, data };
                    }
                } else if let Some(&m) = sch.l2.get(domain) {
                    *def = CatCos::Mask(m);
                }
            }
        }
        for (domain, defs) in &mut self.mba {
            if let Some(def) = defs.get_mut(class as usize) {
                if let Some(&v) = sch.mb.get(domain) {
                    def.mb_max = v as u32;
                }
            }
        }
        for (domain, defs) in &mut self.smba {
            if let Some(def) = defs.get_mut(class as usize) {
                if let Some(&v) = sch.smba.get(domain) {
                    def.mb_max = v as u32;
                }
            }
        }
    }

    fn check_cat_def(cap: &CacheAllocCap, class_id: u32, def: &CatCos) -> Result<()> {
        if class_id >= cap.num_classes {
            return Err(Error::param(format!(
                "class {class_id} exceeds the {} available classes",
                cap.num_classes
            )));
        }
        let check = |m: u64| {
            mask::check_class_mask(m, cap.num_ways, cap.way_contention, cap.non_contiguous_cbm)
                .map_err(Error::Parameter)
        };
        match (cap.cdp_enabled, def) {
            (false, CatCos::Mask(m)) => check(*m),
            (true, CatCos::Cdp { code, data }) => {
                check(*code)?;
                check(*data)
            }
            (true, CatCos::Mask(_)) => Err(Error::param(
                "single-mask definition while code/data partitioning is on",
            )),
            (false, CatCos::Cdp { .. }) => Err(Error::param(
                "code/data definition while partitioning is off",
            )),
        }
    }

    /// Writes one L3 class definition on one domain.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `domain` - L3 cache-allocation domain id.
    /// * `class_id` - Class of service to write.
    /// * `def` - The definition, matching the current partitioning mode.
    pub fn set_l3(
        &mut self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        domain: u32,
        class_id: u32,
        def: CatCos,
    ) -> Result<()> {
        let cap = caps.l3ca()?;
        let defs = self
            .l3
            .get_mut(&domain)
            .ok_or_else(|| Error::param(format!("{domain} is not an L3 allocation domain")))?;
        Self::check_cat_def(cap, class_id, &def)?;

        match &backends.cpu {
            CpuBackend::Msr(backend) => {
                let lcore = topo.one_core_of_l3cat(domain).ok_or(Error::Init)?;
                write_cat_msr(backend, lcore, msr::MSR_L3CA_MASK_START, class_id, &def)?;
            }
            CpuBackend::Resctrl(fs) => {
                let mut sch = fs.read_schemata(class_id).unwrap_or_default();
                match def {
                    CatCos::Mask(m) => {
                        sch.l3.insert(domain, m);
                    }
                    CatCos::Cdp { code, data } => {
                        sch.l3_code.insert(domain, code);
                        sch.l3_data.insert(domain, data);
                    }
                }
                fs.write_schemata(class_id, &sch)?;
            }
        }
        defs[class_id as usize] = def;
        debug!(domain, class_id, ?def, "L3 class written");
        Ok(())
    }

    /// Writes one L2 class definition on one domain.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `domain` - L2 cluster id.
    /// * `class_id` - Class of service to write.
    /// * `def` - The definition, matching the current partitioning mode.
    pub fn set_l2(
        &mut self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        domain: u32,
        class_id: u32,
        def: CatCos,
    ) -> Result<()> {
        let cap = caps.l2ca()?;
        let defs = self
            .l2
            .get_mut(&domain)
            .ok_or_else(|| Error::param(format!("{domain} is not an L2 allocation domain")))?;
        Self::check_cat_def(cap, class_id, &def)?;

        match &backends.cpu {
            CpuBackend::Msr(backend) => {
                let lcore = topo.one_core_of_l2(domain).ok_or(Error::Init)?;
                write_cat_msr(backend, lcore, msr::MSR_L2CA_MASK_START, class_id, &def)?;
            }
            CpuBackend::Resctrl(fs) => {
                let mut sch = fs.read_schemata(class_id).unwrap_or_default();
                match def {
                    CatCos::Mask(m) => {
                        sch.l2.insert(domain, m);
                    }
                    CatCos::Cdp { code, data } => {
                        sch.l2_code.insert(domain, code);
                        sch.l2_data.insert(domain, data);
                    }
                }
                fs.write_schemata(class_id, &sch)?;
            }
        }
        defs[class_id as usize] = def;
        debug!(domain, class_id, ?def, "L2 class written");
        Ok(())
    }

    /// Writes several classes on one domain, stopping at the first failure
    /// and reporting how many were applied. Prior writes stay applied.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `domain` - L3 cache-allocation domain id.
    /// * `defs` - `(class, definition)` pairs, written in order.
    ///
    /// # Returns
    ///
    /// The number of classes written, which is `defs.len()` on success.
    pub fn set_l3_batch(
        &mut self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        domain: u32,
        defs: &[(u32, CatCos)],
    ) -> std::result::Result<usize, BatchError> {
        for (written, (class_id, def)) in defs.iter().enumerate() {
            self.set_l3(topo, caps, backends, domain, *class_id, *def)
                .map_err(|source| BatchError { written, source })?;
        }
        Ok(defs.len())
    }

    /// Programs one bandwidth class.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `domain` - Memory-bandwidth domain id.
    /// * `class_id` - Class of service to program.
    /// * `def` - Percentage or MBps target per the controller flag.
    ///
    /// # Returns
    ///
    /// The value the hardware rounded to.
    pub fn set_mba(
        &mut self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        domain: u32,
        class_id: u32,
        def: MbaCos,
    ) -> Result<u32> {
        let cap = caps.mba()?;
        let defs = self
            .mba
            .get_mut(&domain)
            .ok_or_else(|| Error::param(format!("{domain} is not a bandwidth domain")))?;
        if class_id >= cap.num_classes {
            return Err(Error::param(format!(
                "class {class_id} exceeds the {} available classes",
                cap.num_classes
            )));
        }

        let actual = if def.ctrl {
            if !cap.ctrl_enabled {
                return Err(Error::Resource("bandwidth controller is off".into()));
            }
            if def.mb_max == 0 {
                return Err(Error::param("an MBps target of zero is invalid"));
            }
            def.mb_max
        } else {
            if def.mb_max == 0 || def.mb_max > cap.throttle_max {
                return Err(Error::param(format!(
                    "bandwidth {}% outside 1..={}%",
                    def.mb_max, cap.throttle_max
                )));
            }
            // Hardware quantises to the throttling granularity; round the
            // request down so a class never gets more than asked.
            let step = cap.throttle_step.max(1);
            ((def.mb_max / step) * step).max(step)
        };

        match &backends.cpu {
            CpuBackend::Msr(backend) => {
                if def.ctrl {
                    return Err(Error::InterfaceUnsupported);
                }
                let lcore = topo.one_core_of_mba(domain).ok_or(Error::Init)?;
                backend.mba_set(lcore, class_id, actual)?;
            }
            CpuBackend::Resctrl(fs) => {
                let mut sch = fs.read_schemata(class_id).unwrap_or_default();
                sch.mb.insert(domain, u64::from(actual));
                fs.write_schemata(class_id, &sch)?;
            }
        }
        defs[class_id as usize] = MbaCos {
            mb_max: actual,
            ctrl: def.ctrl,
        };
        debug!(domain, class_id, requested = def.mb_max, actual, "bandwidth class written");
        Ok(actual)
    }

    /// Reads back one L3 class definition.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `domain` - L3 cache-allocation domain id.
    /// * `class_id` - Class of service to read.
    ///
    /// # Returns
    ///
    /// The class definition in the current partitioning mode.
    pub fn get_l3(
        &self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        domain: u32,
        class_id: u32,
    ) -> Result<CatCos> {
        let cap = caps.l3ca()?;
        if class_id >= cap.num_classes {
            return Err(Error::param(format!("class {class_id} out of range")));
        }
        match &backends.cpu {
            CpuBackend::Msr(backend) => {
                let lcore = topo.one_core_of_l3cat(domain).ok_or_else(|| {
                    Error::param(format!("{domain} is not an L3 allocation domain"))
                })?;
                read_cat_msr(backend, lcore, msr::MSR_L3CA_MASK_START, cap, class_id)
            }
            CpuBackend::Resctrl(_) => self
                .l3
                .get(&domain)
                .and_then(|defs| defs.get(class_id as usize))
                .copied()
                .ok_or_else(|| Error::param(format!("{domain} is not an L3 allocation domain"))),
        }
    }

    /// Reads back one L2 class definition.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `domain` - L2 cluster id.
    /// * `class_id` - Class of service to read.
    ///
    /// # Returns
    ///
    /// The class definition in the current partitioning mode.
    pub fn get_l2(
        &self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        domain: u32,
        class_id: u32,
    ) -> Result<CatCos> {
        let cap = caps.l2ca()?;
        if class_id >= cap.num_classes {
            return Err(Error::param(format!("class {class_id} out of range")));
        }
        match &backends.cpu {
            CpuBackend::Msr(backend) => {
                let lcore = topo
                    .one_core_of_l2(domain)
                    .ok_or_else(|| Error::param(format!("{domain} is not an L2 domain")))?;
                read_cat_msr(backend, lcore, msr::MSR_L2CA_MASK_START, cap, class_id)
            }
            CpuBackend::Resctrl(_) => self
                .l2
                .get(&domain)
                .and_then(|defs| defs.get(class_id as usize))
                .copied()
                .ok_or_else(|| Error::param(format!("{domain} is not an L2 domain"))),
        }
    }

    /// Reads back one bandwidth class definition.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `domain` - Memory-bandwidth domain id.
    /// * `class_id` - Class of service to read.
    ///
    /// # Returns
    ///
    /// The bandwidth value currently programmed for the class.
    pub fn get_mba(
        &self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        domain: u32,
        class_id: u32,
    ) -> Result<MbaCos> {
        let cap = caps.mba()?;
        if class_id >= cap.num_classes {
            return Err(Error::param(format!("class {class_id} out of range")));
        }
        match &backends.cpu {
            CpuBackend::Msr(backend) => {
                let lcore = topo
                    .one_core_of_mba(domain)
                    .ok_or_else(|| Error::param(format!("{domain} is not a bandwidth domain")))?;
                Ok(MbaCos {
                    mb_max: backend.mba_get(lcore, class_id)?,
                    ctrl: false,
                })
            }
            CpuBackend::Resctrl(_) => self
                .mba
                .get(&domain)
                .and_then(|defs| defs.get(class_id as usize))
                .copied()
                .ok_or_else(|| Error::param(format!("{domain} is not a bandwidth domain"))),
        }
    }

    /// Programs one slow-memory-bandwidth class.
    ///
    /// Targets are absolute MBps values; there is no percentage mode.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `domain` - Slow-memory-bandwidth domain id.
    /// * `class_id` - Class of service to program.
    /// * `mbps` - Bandwidth target in megabytes per second.
    pub fn set_smba(
        &mut self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        domain: u32,
        class_id: u32,
        mbps: u32,
    ) -> Result<()> {
        let cap = caps.smba()?;
        let defs = self
            .smba
            .get_mut(&domain)
            .ok_or_else(|| Error::param(format!("{domain} is not a slow-memory domain")))?;
        if class_id >= cap.num_classes {
            return Err(Error::param(format!(
                "class {class_id} exceeds the {} available classes",
                cap.num_classes
            )));
        }
        if mbps == 0 {
            return Err(Error::param("an MBps target of zero is invalid"));
        }

        match &backends.cpu {
            CpuBackend::Msr(backend) => {
                let lcore = topo.one_core_of_smba(domain).ok_or(Error::Init)?;
                backend.smba_set(lcore, class_id, mbps)?;
            }
            CpuBackend::Resctrl(fs) => {
                let mut sch = fs.read_schemata(class_id).unwrap_or_default();
                sch.smba.insert(domain, u64::from(mbps));
                fs.write_schemata(class_id, &sch)?;
            }
        }
        defs[class_id as usize] = MbaCos {
            mb_max: mbps,
            ctrl: true,
        };
        debug!(domain, class_id, mbps, "slow-memory bandwidth class written");
        Ok(())
    }

    /// Reads back one slow-memory-bandwidth class definition.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `domain` - Slow-memory-bandwidth domain id.
    /// * `class_id` - Class of service to read.
    ///
    /// # Returns
    ///
    /// The MBps target currently programmed for the class.
    pub fn get_smba(
        &self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        domain: u32,
        class_id: u32,
    ) -> Result<MbaCos> {
        let cap = caps.smba()?;
        if class_id >= cap.num_classes {
            return Err(Error::param(format!("class {class_id} out of range")));
        }
        match &backends.cpu {
            CpuBackend::Msr(backend) => {
                let lcore = topo
                    .one_core_of_smba(domain)
                    .ok_or_else(|| Error::param(format!("{domain} is not a slow-memory domain")))?;
                let mbps = backend.smba_get(lcore, class_id)?;
                Ok(MbaCos {
                    mb_max: if mbps == 0 { u32::MAX } else { mbps },
                    ctrl: true,
                })
            }
            CpuBackend::Resctrl(_) => self
                .smba
                .get(&domain)
                .and_then(|defs| defs.get(class_id as usize))
                .copied()
                .ok_or_else(|| Error::param(format!("{domain} is not a slow-memory domain"))),
        }
    }

    /// # Returns
    ///
    /// The highest class count across the present allocation technologies,
    /// bounding entity associations.
    fn class_limit(caps: &Capabilities) -> u32 {
        caps.l3ca
            .map_or(0, |c| c.num_classes)
            .max(caps.l2ca.map_or(0, |c| c.num_classes))
            .max(caps.mba.map_or(0, |c| c.num_classes))
            .max(caps.smba.map_or(0, |c| c.num_classes))
    }

    /// Associates a core with a class, preserving its monitoring ID.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `lcore` - Logical CPU to associate.
    /// * `class_id` - Target class of service.
    pub fn assoc_core(
        &mut self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        lcore: u32,
        class_id: u32,
    ) -> Result<()> {
        if !topo.has_core(lcore) {
            return Err(Error::param(format!("core {lcore} is not present")));
        }
        if class_id >= Self::class_limit(caps) {
            return Err(Error::param(format!("class {class_id} out of range")));
        }
        match &backends.cpu {
            CpuBackend::Msr(backend) => backend.cos_assoc_set(lcore, class_id)?,
            CpuBackend::Resctrl(fs) => {
                // The kernel moves a core listed in one class out of its
                // previous class, so writing the target's full membership
                // is enough.
                self.core_cos.insert(lcore, class_id);
                let members: Vec<u32> = self
                    .core_cos
                    .iter()
                    .filter(|(_, &c)| c == class_id)
                    .map(|(&l, _)| l)
                    .collect();
                fs.write_class_cpus(class_id, &members)?;
            }
        }
        self.core_cos.insert(lcore, class_id);
        Ok(())
    }

    /// Reads back a core's class of service.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `backends` - The active back-ends.
    /// * `lcore` - Logical CPU to query.
    ///
    /// # Returns
    ///
    /// The class of service the core is associated with.
    pub fn assoc_core_get(
        &self,
        topo: &Topology,
        backends: &Backends,
        lcore: u32,
    ) -> Result<u32> {
        if !topo.has_core(lcore) {
            return Err(Error::param(format!("core {lcore} is not present")));
        }
        match &backends.cpu {
            CpuBackend::Msr(backend) => backend.cos_assoc_get(lcore),
            CpuBackend::Resctrl(_) => Ok(self.core_cos.get(&lcore).copied().unwrap_or(0)),
        }
    }

    /// Moves a task into a class. Kernel-filesystem back-end only.
    ///
    /// # Arguments
    ///
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `pid` - Task to move.
    /// * `class_id` - Target class of service.
    pub fn assoc_task(
        &mut self,
        caps: &Capabilities,
        backends: &Backends,
        pid: u32,
        class_id: u32,
    ) -> Result<()> {
        if class_id >= Self::class_limit(caps) {
            return Err(Error::param(format!("class {class_id} out of range")));
        }
        backends.cpu.as_resctrl()?.assoc_task(pid, class_id)
    }

    /// Associates a device channel with a class. Memory-mapped back-end
    /// only.
    ///
    /// # Arguments
    ///
    /// * `backends` - The active back-ends.
    /// * `channel` - Channel to associate.
    /// * `class_id` - Target class of service.
    pub fn assoc_channel(
        &mut self,
        backends: &Backends,
        channel: ChannelId,
        class_id: u32,
    ) -> Result<()> {
        backends.mmio()?.channel_class_set(channel, class_id)?;
        Ok(())
    }

    /// Reads back a channel's class of service.
    ///
    /// # Arguments
    ///
    /// * `backends` - The active back-ends.
    /// * `channel` - Channel to query.
    ///
    /// # Returns
    ///
    /// The class of service the channel is associated with.
    pub fn assoc_channel_get(&self, backends: &Backends, channel: ChannelId) -> Result<u32> {
        backends.mmio()?.channel_class_get(channel)
    }

    /// Associates a device's virtual channel with a class. Memory-mapped
    /// back-end only.
    ///
    /// # Arguments
    ///
    /// * `backends` - The active back-ends.
    /// * `collection` - Device-agent collection id from the firmware table.
    /// * `vc` - Virtual channel within the collection's domain.
    /// * `class_id` - Target class of service.
    pub fn assoc_device(
        &mut self,
        backends: &Backends,
        collection: u16,
        vc: u16,
        class_id: u32,
    ) -> Result<()> {
        let mmio = backends.mmio()?;
        let channel = mmio.channel_for_device(collection, vc)?;
        mmio.channel_class_set(channel, class_id)
    }

    fn cat_is_default(cap: &CacheAllocCap, def: &CatCos) -> bool {
        *def == default_cat(cap)
    }

    /// First-available class assignment.
    ///
    /// Scans classes from the highest index down to 1; a class is free when
    /// no core in the relevant domains is associated with it and its
    /// definition is the permissive default everywhere the request
    /// touches. The chosen class is associated with every core before it
    /// is returned.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `techs` - Technologies the class must be free in.
    /// * `cores` - Cores to cover; constrained to one socket or L2 cluster
    ///   per the selected technologies.
    ///
    /// # Returns
    ///
    /// The assigned class of service.
    pub fn assign(
        &mut self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        techs: Technologies,
        cores: &[u32],
    ) -> Result<u32> {
        if techs.is_empty() || cores.is_empty() {
            return Err(Error::param("no technology or no cores requested"));
        }
        let infos: Vec<_> = cores
            .iter()
            .map(|&c| {
                topo.core(c)
                    .copied()
                    .ok_or_else(|| Error::param(format!("core {c} is not present")))
            })
            .collect::<Result<_>>()?;

        // Technology constraints: L2 within one L2 cluster, L3 and MBA
        // within one socket.
        if techs.contains(Technology::L2Ca) {
            caps.l2ca()?;
            let first = infos[0].l2_id;
            if infos.iter().any(|i| i.l2_id != first) {
                return Err(Error::param(
                    "L2 allocation requires cores of a single L2 cluster",
                ));
            }
        }
        if techs.contains(Technology::L3Ca) || techs.contains(Technology::Mba) {
            if techs.contains(Technology::L3Ca) {
                caps.l3ca()?;
            }
            if techs.contains(Technology::Mba) {
                caps.mba()?;
            }
            let first = infos[0].socket;
            if infos.iter().any(|i| i.socket != first) {
                return Err(Error::param(
                    "L3 and bandwidth allocation require cores of a single socket",
                ));
            }
        }

        let mut num_classes = u32::MAX;
        if techs.contains(Technology::L3Ca) {
            num_classes = num_classes.min(caps.l3ca()?.num_classes);
        }
        if techs.contains(Technology::L2Ca) {
            num_classes = num_classes.min(caps.l2ca()?.num_classes);
        }
        if techs.contains(Technology::Mba) {
            num_classes = num_classes.min(caps.mba()?.num_classes);
        }
        if num_classes == u32::MAX || num_classes < 2 {
            return Err(Error::Resource("no assignable classes".into()));
        }

        let l3_domains: Vec<u32> = infos.iter().map(|i| i.l3cat_id).collect();
        let l2_domains: Vec<u32> = infos.iter().map(|i| i.l2_id).collect();
        let mba_domains: Vec<u32> = infos.iter().map(|i| i.mba_id).collect();

        let class_id = (1..num_classes)
            .rev()
            .find(|&j| self.class_is_free(topo, caps, techs, j, &l3_domains, &l2_domains, &mba_domains))
            .ok_or_else(|| Error::Resource("no unused class of service".into()))?;

        for &lcore in cores {
            self.assoc_core(topo, caps, backends, lcore, class_id)?;
        }
        info!(class_id, cores = cores.len(), "class assigned");
        Ok(class_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn class_is_free(
        &self,
        topo: &Topology,
        caps: &Capabilities,
        techs: Technologies,
        class_id: u32,
        l3_domains: &[u32],
        l2_domains: &[u32],
        mba_domains: &[u32],
    ) -> bool {
        // Any core of the touched domains already on this class makes it
        // used, regardless of technology.
        for core in &topo.cores {
            let relevant = (techs.contains(Technology::L3Ca) && l3_domains.contains(&core.l3cat_id))
                || (techs.contains(Technology::L2Ca) && l2_domains.contains(&core.l2_id))
                || (techs.contains(Technology::Mba) && mba_domains.contains(&core.mba_id));
            if relevant && self.core_cos.get(&core.lcore).copied().unwrap_or(0) == class_id {
                return false;
            }
        }
        if techs.contains(Technology::L3Ca) {
            if let Some(cap) = &caps.l3ca {
                for domain in l3_domains {
                    if let Some(def) = self.l3.get(domain).and_then(|d| d.get(class_id as usize)) {
                        if !Self::cat_is_default(cap, def) {
                            return false;
                        }
                    }
                }
            }
        }
        if techs.contains(Technology::L2Ca) {
            if let Some(cap) = &caps.l2ca {
                for domain in l2_domains {
                    if let Some(def) = self.l2.get(domain).and_then(|d| d.get(class_id as usize)) {
                        if !Self::cat_is_default(cap, def) {
                            return false;
                        }
                    }
                }
            }
        }
        if techs.contains(Technology::Mba) {
            if let Some(cap) = &caps.mba {
                for domain in mba_domains {
                    if let Some(def) = self.mba.get(domain).and_then(|d| d.get(class_id as usize)) {
                        if *def != default_mba(cap) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Returns every listed core to class 0.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `cores` - Cores to release.
    pub fn release(
        &mut self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        cores: &[u32],
    ) -> Result<()> {
        for &lcore in cores {
            self.assoc_core(topo, caps, backends, lcore, 0)?;
        }
        Ok(())
    }

    /// Global allocation reset.
    ///
    /// Writes the permissive default into every class of every domain,
    /// returns every core and channel to class 0, and performs requested
    /// feature toggles in between. Idempotent.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog; enable flags flip on a
    ///   successful toggle.
    /// * `backends` - The active back-ends.
    /// * `cfg` - Feature toggles to apply mid-sequence.
    pub fn reset(
        &mut self,
        topo: &Topology,
        caps: &mut Capabilities,
        backends: &Backends,
        cfg: ResetConfig,
    ) -> Result<()> {
        if !cfg.is_plain() {
            self.check_toggles(caps, backends, cfg)?;
        }

        // Step 1: permissive defaults everywhere, covering every hardware
        // class slot so the state is clean in both partitioning modes.
        self.write_defaults(topo, caps, backends)?;

        // Reconfigure between the definition reset and the re-associations.
        self.apply_toggles(topo, caps, backends, cfg)?;
        self.rebuild_mirror(topo, caps);

        // Steps 2 and 3: everything back to class 0.
        match &backends.cpu {
            CpuBackend::Msr(backend) => {
                for core in &topo.cores {
                    backend.cos_assoc_set(core.lcore, 0)?;
                }
            }
            CpuBackend::Resctrl(fs) => {
                fs.remove_class_dirs()?;
            }
        }
        for cos in self.core_cos.values_mut() {
            *cos = 0;
        }
        if let Some(mmio) = &backends.mmio {
            mmio.reset_associations()?;
        }
        info!("allocation reset complete");
        Ok(())
    }

    fn check_toggles(
        &self,
        caps: &Capabilities,
        backends: &Backends,
        cfg: ResetConfig,
    ) -> Result<()> {
        let check_cdp = |cap: Option<&CacheAllocCap>, toggle: Toggle, what: &str| -> Result<()> {
            match toggle {
                Toggle::Any => Ok(()),
                Toggle::On | Toggle::Off => {
                    let cap = cap.ok_or_else(|| Error::Resource(what.into()))?;
                    if toggle == Toggle::On && !cap.cdp_supported {
                        return Err(Error::Resource(format!(
                            "{what} code/data partitioning not supported"
                        )));
                    }
                    if backends.cpu.is_resctrl() {
                        // Switching partitioning needs a remount of the
                        // kernel filesystem, which the library does not do.
                        return Err(Error::InterfaceUnsupported);
                    }
                    Ok(())
                }
            }
        };
        check_cdp(caps.l3ca.as_ref(), cfg.l3_cdp, "L3 cache allocation")?;
        check_cdp(caps.l2ca.as_ref(), cfg.l2_cdp, "L2 cache allocation")?;

        match cfg.mba_ctrl {
            Toggle::Any => {}
            Toggle::On | Toggle::Off => {
                let cap = caps.mba.as_ref().ok_or_else(|| {
                    Error::Resource("memory-bandwidth allocation".into())
                })?;
                let target = cfg.mba_ctrl == Toggle::On;
                if target && !cap.ctrl_supported {
                    return Err(Error::Resource("bandwidth controller not supported".into()));
                }
                if target != cap.ctrl_enabled {
                    // Same remount restriction as partitioning.
                    return Err(Error::InterfaceUnsupported);
                }
            }
        }
        if cfg.iordt == Toggle::On && backends.mmio.is_none() {
            return Err(Error::Resource(
                "device-channel allocation needs the memory-mapped interface".into(),
            ));
        }
        Ok(())
    }

    fn apply_toggles(
        &mut self,
        topo: &Topology,
        caps: &mut Capabilities,
        backends: &Backends,
        cfg: ResetConfig,
    ) -> Result<()> {
        let flip_cdp = |backend: &crate::backend::msr::MsrBackend,
                        cap: &mut CacheAllocCap,
                        cfg_msr: u32,
                        toggle: Toggle|
         -> Result<()> {
            let target = match toggle {
                Toggle::Any => return Ok(()),
                Toggle::On => true,
                Toggle::Off => false,
            };
            if cap.cdp_enabled == target {
                return Ok(());
            }
            for socket in topo.sockets() {
                let lcore = topo
                    .cores_of_socket(socket)
                    .first()
                    .copied()
                    .ok_or(Error::Init)?;
                backend.cdp_set(lcore, cfg_msr, target)?;
            }
            // A visible class consumes two hardware slots while
            // partitioning is on.
            if target {
                cap.num_classes /= 2;
            } else {
                cap.num_classes *= 2;
            }
            cap.cdp_enabled = target;
            warn!(enabled = target, "code/data partitioning reconfigured");
            Ok(())
        };

        if let CpuBackend::Msr(backend) = &backends.cpu {
            if let Some(cap) = caps.l3ca.as_mut() {
                flip_cdp(backend, cap, msr::MSR_L3_QOS_CFG, cfg.l3_cdp)?;
            }
            if let Some(cap) = caps.l2ca.as_mut() {
                flip_cdp(backend, cap, msr::MSR_L2_QOS_CFG, cfg.l2_cdp)?;
            }
        }

        match cfg.iordt {
            Toggle::Any => {}
            Toggle::On => {
                if let Some(cap) = caps.l3ca.as_mut() {
                    cap.iordt_enabled = true;
                }
                if let Some(mon) = caps.monitor.as_mut() {
                    mon.iordt_enabled = true;
                }
            }
            Toggle::Off => {
                if let Some(cap) = caps.l3ca.as_mut() {
                    cap.iordt_enabled = false;
                }
                if let Some(mon) = caps.monitor.as_mut() {
                    mon.iordt_enabled = false;
                }
            }
        }
        Ok(())
    }

    fn write_defaults(
        &mut self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
    ) -> Result<()> {
        match &backends.cpu {
            CpuBackend::Msr(backend) => {
                if let Some(cap) = &caps.l3ca {
                    let hw_classes = cap.num_classes * if cap.cdp_enabled { 2 } else { 1 };
                    let full = mask::max_mask(cap.num_ways);
                    for domain in topo.l3cat_ids() {
                        let lcore = topo.one_core_of_l3cat(domain).ok_or(Error::Init)?;
                        for hw_class in 0..hw_classes {
                            backend.cat_set(lcore, msr::MSR_L3CA_MASK_START, hw_class, full)?;
                        }
                    }
                }
                if let Some(cap) = &caps.l2ca {
                    let hw_classes = cap.num_classes * if cap.cdp_enabled { 2 } else { 1 };
                    let full = mask::max_mask(cap.num_ways);
                    for domain in topo.l2_ids() {
                        let lcore = topo.one_core_of_l2(domain).ok_or(Error::Init)?;
                        for hw_class in 0..hw_classes {
                            backend.cat_set(lcore, msr::MSR_L2CA_MASK_START, hw_class, full)?;
                        }
                    }
                }
                if let Some(cap) = &caps.mba {
                    for domain in topo.mba_ids() {
                        let lcore = topo.one_core_of_mba(domain).ok_or(Error::Init)?;
                        for class in 0..cap.num_classes {
                            backend.mba_set(lcore, class, cap.throttle_max)?;
                        }
                    }
                }
                if let Some(cap) = &caps.smba {
                    for domain in topo.smba_ids() {
                        let lcore = topo.one_core_of_smba(domain).ok_or(Error::Init)?;
                        for class in 0..cap.num_classes {
                            // Zero lifts the throttle entirely.
                            backend.smba_set(lcore, class, 0)?;
                        }
                    }
                }
            }
            CpuBackend::Resctrl(fs) => {
                let num_classes = Self::class_limit(caps);
                for class in 0..num_classes {
                    let mut sch = Schemata::default();
                    if let Some(cap) = &caps.l3ca {
                        let full = mask::max_mask(cap.num_ways);
                        for domain in topo.l3cat_ids() {
                            if cap.cdp_enabled {
                                sch.l3_code.insert(domain, full);
                                sch.l3_data.insert(domain, full);
                            } else {
                                sch.l3.insert(domain, full);
                            }
                        }
                    }
                    if let Some(cap) = &caps.l2ca {
                        let full = mask::max_mask(cap.num_ways);
                        for domain in topo.l2_ids() {
                            if cap.cdp_enabled {
                                sch.l2_code.insert(domain, full);
                                sch.l2_data.insert(domain, full);
                            } else {
                                sch.l2.insert(domain, full);
                            }
                        }
                    }
                    if let Some(cap) = &caps.mba {
                        let value = u64::from(default_mba(cap).mb_max);
                        for domain in topo.mba_ids() {
                            sch.mb.insert(domain, value);
                        }
                    }
                    if let Some(cap) = &caps.smba {
                        let value = u64::from(default_mba(cap).mb_max);
                        for domain in topo.smba_ids() {
                            sch.smba.insert(domain, value);
                        }
                    }
                    // Only touch class dirs that exist; removed dirs revert
                    // to the kernel defaults anyway.
                    if class == 0 || fs.read_schemata(class).is_ok() {
                        fs.write_schemata(class, &sch)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn read_cat_msr(
    backend: &crate::backend::msr::MsrBackend,
    lcore: u32,
    mask_start: u32,
    cap: &CacheAllocCap,
    class_id: u32,
) -> Result<CatCos> {
    if cap.cdp_enabled {
        // Data occupies the even hardware slot, code the odd one.
        let data = backend.cat_get(lcore, mask_start, 2 * class_id)?;
        let code = backend.cat_get(lcore, mask_start, 2 * class_id + 1)?;
        Ok(CatCos::Cdp { code, data })
    } else {
        Ok(CatCos::Mask(backend.cat_get(lcore, mask_start, class_id)?))
    }
}

fn write_cat_msr(
    backend: &crate::backend::msr::MsrBackend,
    lcore: u32,
    mask_start: u32,
    class_id: u32,
    def: &CatCos,
) -> Result<()> {
    match def {
        CatCos::Mask(m) => backend.cat_set(lcore, mask_start, class_id, *m),
        CatCos::Cdp { code, data } => {
            backend.cat_set(lcore, mask_start, 2 * class_id, *data)?;
            backend.cat_set(lcore, mask_start, 2 * class_id + 1, *code)
        }
    }
}
