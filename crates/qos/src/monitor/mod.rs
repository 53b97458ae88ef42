//! Monitoring manager.
//!
//! The scarce-resource coordinator of the library. It provides:
//! 1. **ID bookkeeping:** One [`rmid::RmidPool`] for CPU clusters and one
//!    for I/O domains; groups consume one ID per cluster they span.
//! 2. **Groups:** Caller-held [`MonGroup`] handles backed by a slab with
//!    generation counters, so a stale handle is rejected instead of
//!    corrupting another group.
//! 3. **Polling:** Batched counter reads with bounded unavailable retries,
//!    wrap-around delta arithmetic and per-group failure isolation.
//!
//! A failed group start rolls back completely: every ID allocated and every
//! association written in that call is undone before the error surfaces.

pub mod perf;
pub mod rmid;

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::backend::mmio::ChannelId;
use crate::backend::{Backends, CpuBackend};
use crate::caps::{Capabilities, MonEvent, MonEvents};
use crate::common::{Error, Result};
use crate::config::{Config, SncMode};
use crate::hw::msr;
use crate::monitor::perf::TaskCounters;
use crate::monitor::rmid::RmidPool;
use crate::topology::Topology;

/// The "unassigned" monitoring ID every idle core is bound to.
pub const RMID_UNASSIGNED: u32 = 0;

/// Counter values of one monitoring group, updated by `poll`.
///
/// Occupancy and bandwidth values are raw counter units; multiply by the
/// event's scale factor from the capability catalog to get bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EventValues {
    /// Last-level cache occupancy.
    pub llc_occupancy: u64,
    /// Local memory-bandwidth counter.
    pub mbm_local: u64,
    /// Local-bandwidth change since the previous poll.
    pub mbm_local_delta: u64,
    /// Total memory-bandwidth counter.
    pub mbm_total: u64,
    /// Total-bandwidth change since the previous poll.
    pub mbm_total_delta: u64,
    /// Remote bandwidth, total minus local, floored at zero.
    pub mbm_remote: u64,
    /// Remote-bandwidth change since the previous poll.
    pub mbm_remote_delta: u64,
    /// Retired-instruction count summed over the group.
    pub ipc_retired: u64,
    /// Retired-instruction change since the previous poll.
    pub ipc_retired_delta: u64,
    /// Unhalted-cycle count summed over the group.
    pub ipc_unhalted: u64,
    /// Unhalted-cycle change since the previous poll.
    pub ipc_unhalted_delta: u64,
    /// Instructions per cycle over the last interval; zero when no cycle
    /// elapsed.
    pub ipc: f64,
    /// Cache-miss count summed over the group.
    pub llc_misses: u64,
    /// Cache-miss change since the previous poll.
    pub llc_misses_delta: u64,
    /// Cache-reference count summed over the group.
    pub llc_references: u64,
    /// Cache-reference change since the previous poll.
    pub llc_references_delta: u64,
}

/// Bandwidth-counter delta tolerating one wrap at `2^width`.
///
/// # Arguments
///
/// * `old` - The value of the previous poll.
/// * `new` - The value of the current poll.
/// * `width` - Counter width in bits.
///
/// # Returns
///
/// `new - old`, or the distance through one wrap when `new` is smaller.
pub fn get_delta(old: u64, new: u64, width: u8) -> u64 {
    if new >= old {
        return new - old;
    }
    let max = 1u64 << u32::from(width).clamp(1, 63);
    (max - old).wrapping_add(new)
}

/// Summary outcome of a batched poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Every group polled cleanly.
    Ok,
    /// At least one counter wrapped; deltas were adjusted and are valid.
    Overflow,
    /// At least one group failed; its handle carries the error.
    Error,
}

/// One `(core, cluster, id)` read context of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCtx {
    /// Representative core the reads are issued on.
    pub lcore: u32,
    /// Cluster the ID was allocated from.
    pub cluster: u32,
    /// The monitoring ID.
    pub rmid: u32,
}

/// What a group monitors.
#[derive(Debug)]
enum GroupEntity {
    /// Core-scoped monitoring.
    Cores {
        cores: Vec<u32>,
        /// One context per cluster spanned (register back-end).
        ctxs: Vec<PollCtx>,
        /// Kernel monitoring-group name (filesystem back-end).
        fs_group: Option<String>,
        /// Per-core perf descriptors (filesystem back-end).
        counters: Option<TaskCounters>,
    },
    /// Task-scoped monitoring (filesystem back-end only).
    Tasks {
        pids: Vec<u32>,
        fs_group: Option<String>,
        counters: Option<TaskCounters>,
    },
    /// Device-channel monitoring (memory-mapped back-end only).
    Channels {
        channels: Vec<ChannelId>,
        /// One ID per I/O domain spanned.
        domain_rmids: Vec<(u16, u32)>,
    },
}

#[derive(Debug)]
struct GroupState {
    gen: u64,
    events: MonEvents,
    entity: GroupEntity,
    perf_on: bool,
}

/// Caller-held handle to a live monitoring group.
///
/// The handle is consumed by `stop`, which makes reuse after stop a
/// compile-time error. The generation word detects handles that outlived a
/// monitoring reset.
#[derive(Debug)]
pub struct MonGroup {
    slot: usize,
    gen: u64,
    events: MonEvents,
    /// Counter values as of the last successful poll.
    pub values: EventValues,
    /// Failure recorded by the last batched poll, if any.
    pub last_error: Option<Error>,
}

impl MonGroup {
    /// # Returns
    ///
    /// The events this group monitors.
    pub fn events(&self) -> MonEvents {
        self.events
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CoreMonState {
    group: Option<usize>,
    /// The ID this core was bound to at init belongs to another process.
    unavailable: bool,
}

/// Reconfiguration requests accepted by the monitoring reset.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonResetConfig {
    /// Device-channel monitoring toggle.
    pub iordt: crate::config::Toggle,
    /// Sub-NUMA-cluster mode change.
    pub snc: SncMode,
}

/// Monitoring-ID manager state.
#[derive(Debug)]
pub(crate) struct MonitorMgr {
    pool: RmidPool,
    channel_pool: Option<RmidPool>,
    core_state: BTreeMap<u32, CoreMonState>,
    groups: Vec<Option<GroupState>>,
    free_slots: Vec<usize>,
    next_gen: u64,
    next_token: u64,
    max_rmid: u32,
    /// Clusters follow NUMA nodes instead of last-level caches.
    snc_local: bool,
    override_in_use: bool,
}

fn cluster_of(topo: &Topology, lcore: u32, snc_local: bool) -> Result<u32> {
    let core = topo
        .core(lcore)
        .ok_or_else(|| Error::param(format!("core {lcore} is not present")))?;
    Ok(if snc_local { core.numa } else { core.l3_id })
}

impl MonitorMgr {
    /// Builds the manager and reconciles hardware state.
    ///
    /// On the register back-end every core's current association is read;
    /// a core bound to a non-zero ID is either reclaimed (rebound to ID 0)
    /// or its ID is marked unavailable, per the one-shot config policy.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `config` - The init configuration carrying the reclaim policy.
    ///
    /// # Returns
    ///
    /// The manager with its ID pools reflecting the hardware state.
    pub fn init(
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        config: &Config,
    ) -> Result<Self> {
        let max_rmid = caps.monitor.as_ref().map_or(0, |m| m.max_rmid);
        let snc_local = matches!(config.snc, SncMode::Local);
        let num_clusters = if snc_local {
            topo.numa_ids().len()
        } else {
            topo.l3_ids().len()
        };
        let mut pool = RmidPool::new(num_clusters, max_rmid);
        let mut core_state: BTreeMap<u32, CoreMonState> = BTreeMap::new();

        if let CpuBackend::Msr(msr_backend) = &backends.cpu {
            if caps.monitor.is_some() {
                for core in &topo.cores {
                    let rmid = msr_backend.mon_assoc_get(core.lcore)?;
                    let mut state = CoreMonState::default();
                    if rmid != RMID_UNASSIGNED {
                        if config.reclaim_in_use_rmid {
                            info!(lcore = core.lcore, rmid, "reclaiming in-use monitoring ID");
                            msr_backend.mon_assoc_set(core.lcore, RMID_UNASSIGNED)?;
                        } else {
                            let cluster = cluster_of(topo, core.lcore, snc_local)?;
                            pool.mark_unavailable(cluster, rmid)?;
                            state.unavailable = true;
                            debug!(
                                lcore = core.lcore,
                                rmid, "monitoring ID held by another process"
                            );
                        }
                    }
                    core_state.insert(core.lcore, state);
                }
            }
        } else {
            for core in &topo.cores {
                core_state.insert(core.lcore, CoreMonState::default());
            }
        }

        let channel_pool = backends.mmio.as_ref().map(|mmio| {
            let domains = mmio.domains();
            let max = domains.iter().map(|d| d.max_rmids).max().unwrap_or(0);
            let mut pool = RmidPool::new(domains.len(), max);
            for (idx, d) in domains.iter().enumerate() {
                for id in d.max_rmids..max {
                    let _ = pool.mark_unavailable(idx as u32, id);
                }
            }
            pool
        });

        if let CpuBackend::Resctrl(fs) = &backends.cpu {
            fs.mon_groups_cleanup();
        }

        Ok(Self {
            pool,
            channel_pool,
            core_state,
            groups: Vec::new(),
            free_slots: Vec::new(),
            next_gen: 1,
            next_token: 1,
            max_rmid,
            snc_local,
            override_in_use: config.reclaim_in_use_rmid,
        })
    }

    fn insert_group(&mut self, events: MonEvents, entity: GroupEntity, perf_on: bool) -> MonGroup {
        let gen = self.next_gen;
        self.next_gen += 1;
        let state = GroupState {
            gen,
            events,
            entity,
            perf_on,
        };
        let slot = if let Some(slot) = self.free_slots.pop() {
            self.groups[slot] = Some(state);
            slot
        } else {
            self.groups.push(Some(state));
            self.groups.len() - 1
        };
        MonGroup {
            slot,
            gen,
            events,
            values: EventValues::default(),
            last_error: None,
        }
    }

    fn state_of(&mut self, group: &MonGroup) -> Result<&mut GroupState> {
        match self.groups.get_mut(group.slot) {
            Some(Some(state)) if state.gen == group.gen => Ok(state),
            _ => Err(Error::param("stale monitoring group handle")),
        }
    }

    fn validate_events(caps: &Capabilities, events: MonEvents) -> Result<()> {
        if events.is_empty() {
            return Err(Error::param("no monitoring events selected"));
        }
        let mon = caps.monitor()?;
        for event in events.iter() {
            if mon.event(event).is_none() {
                return Err(Error::param(format!("event {event:?} is not supported")));
            }
        }
        Ok(())
    }

    fn validate_cores(&self, topo: &Topology, cores: &[u32]) -> Result<()> {
        if cores.is_empty() {
            return Err(Error::param("no cores selected"));
        }
        for &lcore in cores {
            if !topo.has_core(lcore) {
                return Err(Error::param(format!("core {lcore} is not present")));
            }
            let state = self.core_state.get(&lcore).copied().unwrap_or_default();
            if state.unavailable {
                return Err(Error::Resource(format!(
                    "core {lcore} monitoring ID is held by another process"
                )));
            }
            if state.group.is_some() {
                return Err(Error::Busy(lcore));
            }
        }
        Ok(())
    }

    /// Starts core-scoped monitoring.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `cores` - Present cores not already in a live group.
    /// * `events` - Events to monitor.
    ///
    /// # Returns
    ///
    /// The caller-held group handle.
    pub fn start_cores(
        &mut self,
        topo: &Topology,
        caps: &Capabilities,
        backends: &Backends,
        cores: &[u32],
        events: MonEvents,
    ) -> Result<MonGroup> {
        Self::validate_events(caps, events)?;
        self.validate_cores(topo, cores)?;
        let mon = caps.monitor()?;

        let entity = match &backends.cpu {
            CpuBackend::Msr(backend) => {
                // One ID per cluster spanned, ceiling taken over the
                // narrowest selected event. Perf-only groups consume no
                // monitoring IDs.
                let mut ctxs: Vec<PollCtx> = Vec::new();
                if events.needs_rmid() {
                    let mut clusters: Vec<u32> = cores
                        .iter()
                        .map(|&c| cluster_of(topo, c, self.snc_local))
                        .collect::<Result<_>>()?;
                    clusters.sort_unstable();
                    clusters.dedup();

                    let event_max = mon.event_max_rmid(events);
                    for &cluster in &clusters {
                        match self.pool.alloc(cluster, event_max) {
                            Ok(id) => {
                                let snc = self.snc_local;
                                let lcore = cores
                                    .iter()
                                    .copied()
                                    .find(|&c| {
                                        cluster_of(topo, c, snc)
                                            .map_or(false, |cl| cl == cluster)
                                    })
                                    .ok_or(Error::Init)?;
                                ctxs.push(PollCtx {
                                    lcore,
                                    cluster,
                                    rmid: id,
                                });
                            }
                            Err(e) => {
                                for ctx in &ctxs {
                                    let _ = self.pool.free(ctx.cluster, ctx.rmid);
                                }
                                return Err(e);
                            }
                        }
                    }
                }

                if events.needs_perf() {
                    if let Err(e) =
                        perf::setup_core_counters(backend, cores, events, self.override_in_use)
                    {
                        for ctx in &ctxs {
                            let _ = self.pool.free(ctx.cluster, ctx.rmid);
                        }
                        return Err(e);
                    }
                }

                // Bind every core; on a partial failure undo the binds
                // already written, the counters and the IDs.
                if events.needs_rmid() {
                    let mut bound: Vec<u32> = Vec::with_capacity(cores.len());
                    let mut bind_error = None;
                    for &lcore in cores {
                        let cluster = cluster_of(topo, lcore, self.snc_local)?;
                        let rmid = ctxs
                            .iter()
                            .find(|c| c.cluster == cluster)
                            .map(|c| c.rmid)
                            .ok_or(Error::Init)?;
                        if let Err(e) = backend.mon_assoc_set(lcore, rmid) {
                            bind_error = Some(e);
                            break;
                        }
                        bound.push(lcore);
                    }
                    if let Some(e) = bind_error {
                        for &lcore in &bound {
                            let _ = backend.mon_assoc_set(lcore, RMID_UNASSIGNED);
                        }
                        if events.needs_perf() {
                            perf::disable_core_counters(backend, cores);
                        }
                        for ctx in &ctxs {
                            let _ = self.pool.free(ctx.cluster, ctx.rmid);
                        }
                        return Err(e);
                    }
                }

                GroupEntity::Cores {
                    cores: cores.to_vec(),
                    ctxs,
                    fs_group: None,
                    counters: None,
                }
            }
            CpuBackend::Resctrl(fs) => {
                let fs_group = if events.needs_rmid() {
                    let token = self.next_token;
                    self.next_token += 1;
                    Some(fs.mon_group_create(token, cores)?)
                } else {
                    None
                };
                let counters = if events.needs_perf() {
                    match TaskCounters::open_for_cpus(cores, events) {
                        Ok(c) => Some(c),
                        Err(e) => {
                            if let Some(name) = &fs_group {
                                let _ = fs.mon_group_delete(name);
                            }
                            return Err(e);
                        }
                    }
                } else {
                    None
                };
                GroupEntity::Cores {
                    cores: cores.to_vec(),
                    ctxs: Vec::new(),
                    fs_group,
                    counters,
                }
            }
        };

        let perf_on = events.needs_perf() && !backends.cpu.is_resctrl();
        let group = self.insert_group(events, entity, perf_on);
        for &lcore in cores {
            let state = self.core_state.entry(lcore).or_default();
            state.group = Some(group.slot);
        }
        info!(cores = cores.len(), ?events, "monitoring group started");
        Ok(group)
    }

    /// Starts task-scoped monitoring. Kernel-filesystem back-end only.
    ///
    /// # Arguments
    ///
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `pids` - Tasks to monitor.
    /// * `events` - Events to monitor.
    ///
    /// # Returns
    ///
    /// The caller-held group handle.
    pub fn start_tasks(
        &mut self,
        caps: &Capabilities,
        backends: &Backends,
        pids: &[u32],
        events: MonEvents,
    ) -> Result<MonGroup> {
        Self::validate_events(caps, events)?;
        if pids.is_empty() {
            return Err(Error::param("no tasks selected"));
        }
        let fs = backends.cpu.as_resctrl()?;

        let fs_group = if events.needs_rmid() {
            let token = self.next_token;
            self.next_token += 1;
            let name = fs.mon_group_create(token, &[])?;
            for &pid in pids {
                if let Err(e) = fs.mon_group_add_task(&name, pid) {
                    let _ = fs.mon_group_delete(&name);
                    return Err(e);
                }
            }
            Some(name)
        } else {
            None
        };
        let counters = if events.needs_perf() {
            match TaskCounters::open(pids, events) {
                Ok(c) => Some(c),
                Err(e) => {
                    if let Some(name) = &fs_group {
                        let _ = fs.mon_group_delete(name);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        let group = self.insert_group(
            events,
            GroupEntity::Tasks {
                pids: pids.to_vec(),
                fs_group,
                counters,
            },
            false,
        );
        info!(pids = pids.len(), ?events, "task monitoring group started");
        Ok(group)
    }

    /// Starts device-channel monitoring. Memory-mapped back-end only.
    ///
    /// # Arguments
    ///
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `channels` - Channels described by the firmware table.
    /// * `events` - Events to monitor.
    ///
    /// # Returns
    ///
    /// The caller-held group handle.
    pub fn start_channels(
        &mut self,
        caps: &Capabilities,
        backends: &Backends,
        channels: &[ChannelId],
        events: MonEvents,
    ) -> Result<MonGroup> {
        Self::validate_events(caps, events)?;
        if channels.is_empty() {
            return Err(Error::param("no channels selected"));
        }
        let mmio = backends.mmio()?;
        let pool = self.channel_pool.as_mut().ok_or(Error::InterfaceUnsupported)?;
        for &ch in channels {
            if !mmio.has_channel(ch) {
                return Err(Error::param(format!(
                    "channel {}:{} not described by firmware",
                    ch.domain, ch.channel
                )));
            }
        }

        let mut domains: Vec<u16> = channels.iter().map(|c| c.domain).collect();
        domains.sort_unstable();
        domains.dedup();

        let mut domain_rmids: Vec<(u16, u32)> = Vec::with_capacity(domains.len());
        for &domain in &domains {
            match pool.alloc(u32::from(domain), mmio.domain_max_rmids(domain)?) {
                Ok(id) => domain_rmids.push((domain, id)),
                Err(e) => {
                    for &(d, id) in &domain_rmids {
                        let _ = pool.free(u32::from(d), id);
                    }
                    return Err(e);
                }
            }
        }

        let mut written: Vec<ChannelId> = Vec::new();
        let mut write_error = None;
        for &ch in channels {
            let rmid = domain_rmids
                .iter()
                .find(|(d, _)| *d == ch.domain)
                .map(|(_, id)| *id)
                .ok_or(Error::Init)?;
            if let Err(e) = mmio.channel_rmid_set(ch, rmid) {
                write_error = Some(e);
                break;
            }
            written.push(ch);
        }
        if let Some(e) = write_error {
            for &ch in &written {
                let _ = mmio.channel_rmid_set(ch, RMID_UNASSIGNED);
            }
            for &(d, id) in &domain_rmids {
                let _ = pool.free(u32::from(d), id);
            }
            return Err(e);
        }

        let group = self.insert_group(
            events,
            GroupEntity::Channels {
                channels: channels.to_vec(),
                domain_rmids,
            },
            false,
        );
        info!(channels = channels.len(), "channel monitoring group started");
        Ok(group)
    }

    /// Stops a group, undoing its start in reverse order, and consumes the
    /// handle.
    ///
    /// # Arguments
    ///
    /// * `backends` - The active back-ends.
    /// * `group` - The handle returned by a start call.
    pub fn stop(&mut self, backends: &Backends, group: MonGroup) -> Result<()> {
        let (events, perf_on) = {
            let state = self.state_of(&group)?;
            (state.events, state.perf_on)
        };
        let entity = self.groups[group.slot].take().ok_or(Error::Init)?.entity;
        self.free_slots.push(group.slot);

        match entity {
            GroupEntity::Cores {
                cores,
                ctxs,
                fs_group,
                counters,
            } => {
                match &backends.cpu {
                    CpuBackend::Msr(backend) => {
                        if perf_on {
                            perf::disable_core_counters(backend, &cores);
                        }
                        if events.needs_rmid() {
                            for &lcore in &cores {
                                backend.mon_assoc_set(lcore, RMID_UNASSIGNED)?;
                            }
                        }
                        for ctx in &ctxs {
                            self.pool.free(ctx.cluster, ctx.rmid)?;
                        }
                    }
                    CpuBackend::Resctrl(fs) => {
                        drop(counters);
                        if let Some(name) = fs_group {
                            fs.mon_group_delete(&name)?;
                        }
                    }
                }
                for &lcore in &cores {
                    if let Some(state) = self.core_state.get_mut(&lcore) {
                        state.group = None;
                    }
                }
            }
            GroupEntity::Tasks {
                pids,
                fs_group,
                counters,
            } => {
                drop(counters);
                if let Some(name) = fs_group {
                    backends.cpu.as_resctrl()?.mon_group_delete(&name)?;
                }
                debug!(pids = pids.len(), "task monitoring group stopped");
            }
            GroupEntity::Channels {
                channels,
                domain_rmids,
            } => {
                let mmio = backends.mmio()?;
                for &ch in &channels {
                    mmio.channel_rmid_set(ch, RMID_UNASSIGNED)?;
                }
                let pool = self
                    .channel_pool
                    .as_mut()
                    .ok_or(Error::InterfaceUnsupported)?;
                for (domain, id) in domain_rmids {
                    pool.free(u32::from(domain), id)?;
                }
            }
        }
        debug!(slot = group.slot, "monitoring group stopped");
        Ok(())
    }

    /// Polls a batch of groups.
    ///
    /// A failing group records its error on the handle and the batch
    /// continues; the summary is the worst outcome observed.
    ///
    /// # Arguments
    ///
    /// * `caps` - The capability catalog.
    /// * `backends` - The active back-ends.
    /// * `groups` - Handles to poll.
    ///
    /// # Returns
    ///
    /// The summary outcome over the whole batch.
    pub fn poll(
        &mut self,
        caps: &Capabilities,
        backends: &Backends,
        groups: &mut [&mut MonGroup],
    ) -> PollStatus {
        let mut any_error = false;
        let mut any_overflow = false;
        for group in groups {
            group.last_error = None;
            match self.poll_one(caps, backends, &mut **group) {
                Ok(wrapped) => any_overflow |= wrapped,
                Err(e) => {
                    warn!(slot = group.slot, error = %e, "group poll failed");
                    group.last_error = Some(e);
                    any_error = true;
                }
            }
        }
        if any_error {
            PollStatus::Error
        } else if any_overflow {
            PollStatus::Overflow
        } else {
            PollStatus::Ok
        }
    }

    /// Polls one group; returns whether a wrap was handled.
    fn poll_one(
        &mut self,
        caps: &Capabilities,
        backends: &Backends,
        group: &mut MonGroup,
    ) -> Result<bool> {
        let width = caps.monitor.as_ref().map_or(
            crate::config::DEFAULT_MBM_COUNTER_WIDTH,
            crate::caps::MonitorCap::mbm_counter_width,
        );
        let events = group.events;
        let state = self.state_of(group)?;
        let mut wrapped = false;

        match &mut state.entity {
            GroupEntity::Cores {
                cores,
                ctxs,
                fs_group,
                counters,
            } => match &backends.cpu {
                CpuBackend::Msr(backend) => {
                    let v = &mut group.values;
                    if events.contains(MonEvent::LlcOccupancy) {
                        let mut total = 0u64;
                        for ctx in ctxs.iter() {
                            let id = MonEvent::LlcOccupancy.hw_event_id().ok_or(Error::Init)?;
                            total += backend.mon_read(ctx.lcore, ctx.rmid, id)?;
                        }
                        v.llc_occupancy = total;
                    }
                    if events.contains(MonEvent::LocalBw) || events.contains(MonEvent::RemoteBw) {
                        let mut total = 0u64;
                        for ctx in ctxs.iter() {
                            let id = MonEvent::LocalBw.hw_event_id().ok_or(Error::Init)?;
                            total += backend.mon_read(ctx.lcore, ctx.rmid, id)?;
                        }
                        let old = v.mbm_local;
                        v.mbm_local = total;
                        v.mbm_local_delta = get_delta(old, total, width);
                        wrapped |= total < old;
                    }
                    if events.contains(MonEvent::TotalBw) || events.contains(MonEvent::RemoteBw) {
                        let mut total = 0u64;
                        for ctx in ctxs.iter() {
                            let id = MonEvent::TotalBw.hw_event_id().ok_or(Error::Init)?;
                            total += backend.mon_read(ctx.lcore, ctx.rmid, id)?;
                        }
                        let old = v.mbm_total;
                        v.mbm_total = total;
                        v.mbm_total_delta = get_delta(old, total, width);
                        wrapped |= total < old;
                    }
                    derive_remote(v, events);
                    if events.contains(MonEvent::Ipc) {
                        let retired =
                            perf::read_core_counter(backend, cores, msr::MSR_INST_RETIRED_ANY)?;
                        let unhalted =
                            perf::read_core_counter(backend, cores, msr::MSR_CPU_UNHALTED_THREAD)?;
                        update_ipc(v, retired, unhalted);
                    }
                    if events.contains(MonEvent::LlcMisses) {
                        let missed = perf::read_core_counter(backend, cores, msr::MSR_PMC0)?;
                        v.llc_misses_delta = missed.wrapping_sub(v.llc_misses);
                        v.llc_misses = missed;
                    }
                    if events.contains(MonEvent::LlcReferences) {
                        let refs = perf::read_core_counter(backend, cores, perf::PMC1)?;
                        v.llc_references_delta = refs.wrapping_sub(v.llc_references);
                        v.llc_references = refs;
                    }
                }
                CpuBackend::Resctrl(fs) => {
                    let v = &mut group.values;
                    if let Some(name) = fs_group.as_deref() {
                        poll_fs_events(fs, name, events, v)?;
                    }
                    if let Some(ctrs) = counters.as_mut() {
                        poll_perf_counters(ctrs, events, v)?;
                    }
                }
            },
            GroupEntity::Tasks {
                fs_group, counters, ..
            } => {
                let v = &mut group.values;
                if let Some(name) = fs_group.as_deref() {
                    let fs = backends.cpu.as_resctrl()?;
                    poll_fs_events(fs, name, events, v)?;
                }
                if let Some(ctrs) = counters.as_mut() {
                    poll_perf_counters(ctrs, events, v)?;
                }
            }
            GroupEntity::Channels { channels, .. } => {
                let mmio = backends.mmio()?;
                let v = &mut group.values;
                if events.contains(MonEvent::LlcOccupancy) {
                    let mut total = 0u64;
                    for &ch in channels.iter() {
                        total = total.wrapping_add(mmio.channel_occupancy(ch)?);
                    }
                    v.llc_occupancy = total;
                }
                if events.contains(MonEvent::TotalBw)
                    || events.contains(MonEvent::LocalBw)
                    || events.contains(MonEvent::RemoteBw)
                {
                    let mut total = 0u64;
                    let mut miss = 0u64;
                    let mut bw_width = width;
                    for &ch in channels.iter() {
                        let (t, m) = mmio.channel_bandwidth(ch)?;
                        total = total.wrapping_add(t);
                        miss = miss.wrapping_add(m);
                        let w = mmio.bw_counter_width(ch.domain);
                        if w != 0 {
                            bw_width = w;
                        }
                    }
                    let local = total.saturating_sub(miss);
                    let old_total = v.mbm_total;
                    let old_local = v.mbm_local;
                    v.mbm_total = total;
                    v.mbm_local = local;
                    v.mbm_total_delta = get_delta(old_total, total, bw_width);
                    v.mbm_local_delta = get_delta(old_local, local, bw_width);
                    wrapped |= total < old_total || local < old_local;
                    derive_remote(v, events);
                }
            }
        }
        Ok(wrapped)
    }

    /// Rebinds every present core to ID 0 and clears channel associations.
    ///
    /// Live groups become stale: their handles are rejected afterwards.
    /// Optionally switches the cluster mode or the device-channel state
    /// when `cfg` asks for it.
    ///
    /// # Arguments
    ///
    /// * `topo` - The topology snapshot.
    /// * `backends` - The active back-ends.
    /// * `cfg` - Device-channel and cluster-mode changes to apply.
    pub fn reset(
        &mut self,
        topo: &Topology,
        backends: &Backends,
        cfg: MonResetConfig,
    ) -> Result<()> {
        if cfg.iordt != crate::config::Toggle::Any && backends.mmio.is_none() {
            return Err(Error::Resource(
                "device-channel monitoring needs the memory-mapped interface".into(),
            ));
        }
        match &backends.cpu {
            CpuBackend::Msr(backend) => {
                for core in &topo.cores {
                    let state = self.core_state.get(&core.lcore).copied().unwrap_or_default();
                    if state.unavailable {
                        continue;
                    }
                    backend.mon_assoc_set(core.lcore, RMID_UNASSIGNED)?;
                }
            }
            CpuBackend::Resctrl(fs) => fs.mon_groups_cleanup(),
        }
        if let Some(mmio) = &backends.mmio {
            mmio.reset_associations()?;
        }

        let snc_local = match cfg.snc {
            SncMode::Any => self.snc_local,
            SncMode::Local => true,
            SncMode::Total => false,
        };
        let num_clusters = if snc_local {
            topo.numa_ids().len()
        } else {
            topo.l3_ids().len()
        };
        self.snc_local = snc_local;
        self.pool = RmidPool::new(num_clusters, self.max_rmid);
        if let (Some(pool), Some(mmio)) = (self.channel_pool.as_mut(), backends.mmio.as_ref()) {
            let domains = mmio.domains();
            let max = domains.iter().map(|d| d.max_rmids).max().unwrap_or(0);
            let mut fresh = RmidPool::new(domains.len(), max);
            for (idx, d) in domains.iter().enumerate() {
                for id in d.max_rmids..max {
                    let _ = fresh.mark_unavailable(idx as u32, id);
                }
            }
            *pool = fresh;
        }
        for state in self.core_state.values_mut() {
            *state = CoreMonState::default();
        }
        self.groups.clear();
        self.free_slots.clear();
        info!("monitoring reset complete");
        Ok(())
    }

    /// Reads a core's current monitoring ID from its association register.
    ///
    /// # Arguments
    ///
    /// * `backends` - The active back-ends.
    /// * `lcore` - Logical CPU to query.
    ///
    /// # Returns
    ///
    /// The core's monitoring ID; 0 means unassigned.
    pub fn assoc_of(&self, backends: &Backends, lcore: u32) -> Result<u32> {
        match &backends.cpu {
            CpuBackend::Msr(backend) => backend.mon_assoc_get(lcore),
            CpuBackend::Resctrl(_) => Err(Error::InterfaceUnsupported),
        }
    }
}

fn derive_remote(v: &mut EventValues, events: MonEvents) {
    if !events.contains(MonEvent::RemoteBw) {
        return;
    }
    v.mbm_remote = v.mbm_total.saturating_sub(v.mbm_local);
    v.mbm_remote_delta = v.mbm_total_delta.saturating_sub(v.mbm_local_delta);
}

fn update_ipc(v: &mut EventValues, retired: u64, unhalted: u64) {
    v.ipc_retired_delta = retired.wrapping_sub(v.ipc_retired);
    v.ipc_unhalted_delta = unhalted.wrapping_sub(v.ipc_unhalted);
    v.ipc_retired = retired;
    v.ipc_unhalted = unhalted;
    v.ipc = if v.ipc_unhalted_delta == 0 {
        0.0
    } else {
        v.ipc_retired_delta as f64 / v.ipc_unhalted_delta as f64
    };
}

fn poll_fs_events(
    fs: &crate::backend::resctrl::ResctrlBackend,
    name: &str,
    events: MonEvents,
    v: &mut EventValues,
) -> Result<()> {
    if events.contains(MonEvent::LlcOccupancy) {
        v.llc_occupancy = fs.mon_group_read(name, "llc_occupancy")?;
    }
    if events.contains(MonEvent::LocalBw) || events.contains(MonEvent::RemoteBw) {
        let new = fs.mon_group_read(name, "mbm_local_bytes")?;
        // Kernel counters are 64-bit and pre-accumulated; a smaller value
        // only appears after a counter reset.
        v.mbm_local_delta = new.saturating_sub(v.mbm_local);
        v.mbm_local = new;
    }
    if events.contains(MonEvent::TotalBw) || events.contains(MonEvent::RemoteBw) {
        let new = fs.mon_group_read(name, "mbm_total_bytes")?;
        v.mbm_total_delta = new.saturating_sub(v.mbm_total);
        v.mbm_total = new;
    }
    derive_remote(v, events);
    Ok(())
}

fn poll_perf_counters(
    ctrs: &mut TaskCounters,
    events: MonEvents,
    v: &mut EventValues,
) -> Result<()> {
    if events.contains(MonEvent::Ipc) {
        let retired = ctrs.instructions()?;
        let unhalted = ctrs.cycles()?;
        update_ipc(v, retired, unhalted);
    }
    if events.contains(MonEvent::LlcMisses) {
        let missed = ctrs.misses()?;
        v.llc_misses_delta = missed.wrapping_sub(v.llc_misses);
        v.llc_misses = missed;
    }
    if events.contains(MonEvent::LlcReferences) {
        let refs = ctrs.references()?;
        v.llc_references_delta = refs.wrapping_sub(v.llc_references);
        v.llc_references = refs;
    }
    Ok(())
}
