//! Library lifecycle and mutual exclusion.
//!
//! All state lives in one [`Qos`] context value:
//! 1. **Init:** Acquire the inter-process file lock, probe the topology,
//!    open register access, discover capabilities (applying requested
//!    feature toggles), build the allocation and monitoring managers. Any
//!    failure tears down in reverse order.
//! 2. **Serialisation:** A single mutex orders every public operation
//!    inside the process; the advisory file lock extends that across
//!    processes for the duration of each operation.
//! 3. **Fini:** Rebinds monitored cores to ID 0, closes register access
//!    and drops the file lock.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{info, warn};

use crate::alloc::{AllocMgr, BatchError, CatCos, MbaCos, ResetConfig, Technologies};
use crate::backend::mmio::{ChannelId, MmioBackend};
use crate::backend::msr::MsrBackend;
use crate::backend::resctrl::{self, ResctrlBackend};
use crate::backend::{resolve_cpu_interface, Backends, CpuBackend, ResolvedCpuInterface};
use crate::caps::{discover, Capabilities, MonEvents};
use crate::common::{Error, Result};
use crate::config::{Config, Interface, Toggle};
use crate::hw::cpuid::{Cpuid, NativeCpuid};
use crate::hw::msr::{DevMsr, MsrIo};
use crate::monitor::{MonGroup, MonResetConfig, MonitorMgr, PollStatus};
use crate::topology::{probe, Topology};

/// Inter-process lock file path.
#[cfg(not(any(target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
pub const LOCKFILE_PATH: &str = "/var/lock/pqctl";
/// Inter-process lock file path on BSD-like systems.
#[cfg(any(target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
pub const LOCKFILE_PATH: &str = "/var/lib/pqctl.lockfile";

/// The advisory inter-process lock file.
#[derive(Debug)]
struct LockFile {
    file: std::fs::File,
}

/// Holds the exclusive advisory lock until dropped.
struct LockGuard<'a> {
    file: &'a std::fs::File,
}

impl LockFile {
    fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)
            .map_err(|e| Error::transport(format!("open lock file {}", path.display()), e))?;
        Ok(Self { file })
    }

    /// Blocks until the exclusive whole-file lock is held. A stuck peer
    /// holding the lock blocks indefinitely; timeouts are the caller's
    /// concern.
    fn exclusive(&self) -> Result<LockGuard<'_>> {
        // SAFETY: the descriptor is open for the lifetime of self.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(Error::transport(
                "acquire inter-process lock",
                std::io::Error::last_os_error(),
            ));
        }
        Ok(LockGuard { file: &self.file })
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the descriptor is valid; unlock cannot fail meaningfully.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

struct Inner {
    caps: Capabilities,
    backends: Backends,
    mon: MonitorMgr,
    alloc: AllocMgr,
}

/// The library context. One per process is the intended shape; every
/// public operation is a method and is serialised internally.
pub struct Qos {
    topo: Topology,
    lock: LockFile,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Qos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Qos")
            .field("cores", &self.topo.num_cores())
            .finish_non_exhaustive()
    }
}

/// Builds a [`Qos`] context with overridable platform seams.
///
/// Production callers use [`Qos::init`]; tests inject a mock register
/// file, canned CPUID leaves and tempdir filesystem roots.
pub struct QosBuilder {
    config: Config,
    sysfs_root: PathBuf,
    resctrl_root: PathBuf,
    lockfile_path: PathBuf,
    erdt_table_path: PathBuf,
    devmem_path: PathBuf,
    msr_io: Option<Box<dyn MsrIo>>,
    cpuid: Option<Box<dyn Cpuid>>,
}

impl std::fmt::Debug for QosBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QosBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QosBuilder {
    /// Starts a builder from a configuration record.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            sysfs_root: PathBuf::from(probe::SYSFS_CPU_ROOT),
            resctrl_root: PathBuf::from(resctrl::RESCTRL_ROOT),
            lockfile_path: PathBuf::from(LOCKFILE_PATH),
            erdt_table_path: PathBuf::from(crate::backend::mmio::ERDT_TABLE_PATH),
            devmem_path: PathBuf::from(crate::backend::mmio::DEVMEM_PATH),
            msr_io: None,
            cpuid: None,
        }
    }

    /// Overrides the sysfs CPU tree root.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory to probe instead of the system tree.
    ///
    /// # Returns
    ///
    /// The builder, for chaining.
    #[must_use]
    pub fn sysfs_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.sysfs_root = path.into();
        self
    }

    /// Overrides the resctrl mount point.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory to use instead of the default mount point.
    ///
    /// # Returns
    ///
    /// The builder, for chaining.
    #[must_use]
    pub fn resctrl_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.resctrl_root = path.into();
        self
    }

    /// Overrides the inter-process lock file path.
    ///
    /// # Arguments
    ///
    /// * `path` - Lock file to use instead of the well-known path.
    ///
    /// # Returns
    ///
    /// The builder, for chaining.
    #[must_use]
    pub fn lockfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.lockfile_path = path.into();
        self
    }

    /// Injects a register accessor instead of `/dev/cpu/N/msr`.
    ///
    /// # Arguments
    ///
    /// * `io` - The accessor every register read and write goes through.
    ///
    /// # Returns
    ///
    /// The builder, for chaining.
    #[must_use]
    pub fn msr_io(mut self, io: Box<dyn MsrIo>) -> Self {
        self.msr_io = Some(io);
        self
    }

    /// Injects a CPUID source instead of the native instruction.
    ///
    /// # Arguments
    ///
    /// * `cpuid` - The leaf source discovery reads from.
    ///
    /// # Returns
    ///
    /// The builder, for chaining.
    #[must_use]
    pub fn cpuid(mut self, cpuid: Box<dyn Cpuid>) -> Self {
        self.cpuid = Some(cpuid);
        self
    }

    /// Runs the init sequence.
    ///
    /// # Returns
    ///
    /// The ready context, or the first error of the sequence after the
    /// partial state was torn down.
    pub fn build(self) -> Result<Qos> {
        let QosBuilder {
            config,
            sysfs_root,
            resctrl_root,
            lockfile_path,
            erdt_table_path,
            devmem_path,
            msr_io,
            cpuid,
        } = self;

        let lock = LockFile::open(&lockfile_path)?;
        let guard = lock.exclusive()?;

        let cpuid = cpuid.unwrap_or_else(|| Box::new(NativeCpuid));
        let topo = probe::probe(&sysfs_root, cpuid.as_ref())?;

        let resctrl_present = resctrl::detect(&resctrl_root);
        let resolved = resolve_cpu_interface(config.interface, resctrl_present)?;

        let cpu = match resolved {
            ResolvedCpuInterface::Msr => {
                let io = msr_io.unwrap_or_else(|| Box::new(DevMsr::new(topo.num_cores())));
                CpuBackend::Msr(MsrBackend::new(io))
            }
            ResolvedCpuInterface::Resctrl => {
                CpuBackend::Resctrl(ResctrlBackend::open(resctrl_root)?)
            }
        };

        let mmio = if config.interface == Interface::Mmio || config.iordt == Toggle::On {
            match MmioBackend::open(&erdt_table_path, &devmem_path) {
                Ok(b) => Some(b),
                Err(e) if config.interface == Interface::Mmio => return Err(e),
                Err(e) => {
                    warn!(error = %e, "device-channel interface unavailable");
                    None
                }
            }
        } else {
            None
        };
        let backends = Backends { cpu, mmio };

        let msr_for_discovery = match &backends.cpu {
            CpuBackend::Msr(b) => Some(b.io()),
            CpuBackend::Resctrl(_) => None,
        };
        let mut caps = discover::discover(
            &topo,
            cpuid.as_ref(),
            msr_for_discovery,
            resctrl_present,
        )?;
        if let CpuBackend::Resctrl(fs) = &backends.cpu {
            apply_resctrl_limits(&mut caps, fs);
        }

        // Requested feature toggles run the full reconfigure sequence:
        // defaults back in, enable bits flipped, catalog updated.
        let mut alloc = AllocMgr::init(&topo, &caps, &backends)?;
        let toggles = ResetConfig {
            l3_cdp: config.l3_cdp,
            l2_cdp: config.l2_cdp,
            mba_ctrl: config.mba_controller,
            iordt: config.iordt,
        };
        if needs_toggle(&caps, toggles) {
            alloc.reset(&topo, &mut caps, &backends, toggles)?;
        }

        let mon = MonitorMgr::init(&topo, &caps, &backends, &config)?;

        drop(guard);
        info!("library initialized");
        Ok(Qos {
            topo,
            lock,
            inner: Mutex::new(Inner {
                caps,
                backends,
                mon,
                alloc,
            }),
        })
    }
}

/// The kernel's published limits override the CPUID-derived counts when
/// the filesystem owns the hardware.
fn apply_resctrl_limits(caps: &mut Capabilities, fs: &ResctrlBackend) {
    let fs_info = fs.info();
    if let Some(cap) = caps.l3ca.as_mut() {
        if fs_info.l3_num_closids > 0 {
            cap.num_classes = fs_info.l3_num_closids;
        }
        cap.cdp_enabled = fs_info.l3_cdp;
    }
    if let Some(cap) = caps.l2ca.as_mut() {
        if fs_info.l2_num_closids > 0 {
            cap.num_classes = fs_info.l2_num_closids;
        }
        cap.cdp_enabled = fs_info.l2_cdp;
    }
    if let Some(cap) = caps.mba.as_mut() {
        if fs_info.mb_num_closids > 0 {
            cap.num_classes = fs_info.mb_num_closids;
        }
        cap.ctrl_enabled = fs_info.mba_mbps;
    }
    if let Some(cap) = caps.smba.as_mut() {
        if fs_info.smba_num_closids > 0 {
            cap.num_classes = fs_info.smba_num_closids;
        }
    }
    if let Some(mon) = caps.monitor.as_mut() {
        if fs_info.num_rmids > 0 {
            mon.max_rmid = fs_info.num_rmids;
        }
        // Only events the kernel exports are reachable on this interface.
        mon.events.retain(|e| match e.event {
            crate::caps::MonEvent::LlcOccupancy => fs_info.mon_llc_occupancy,
            crate::caps::MonEvent::TotalBw => fs_info.mon_mbm_total,
            crate::caps::MonEvent::LocalBw => fs_info.mon_mbm_local,
            crate::caps::MonEvent::RemoteBw => fs_info.mon_mbm_total && fs_info.mon_mbm_local,
            _ => true,
        });
    }
}

/// Whether any init toggle differs from the latched state.
fn needs_toggle(caps: &Capabilities, cfg: ResetConfig) -> bool {
    let cdp_differs = |enabled: bool, toggle: Toggle| match toggle {
        Toggle::Any => false,
        Toggle::On => !enabled,
        Toggle::Off => enabled,
    };
    caps.l3ca
        .map_or(false, |c| cdp_differs(c.cdp_enabled, cfg.l3_cdp))
        || caps
            .l2ca
            .map_or(false, |c| cdp_differs(c.cdp_enabled, cfg.l2_cdp))
        || caps
            .mba
            .map_or(false, |c| cdp_differs(c.ctrl_enabled, cfg.mba_ctrl))
        || cfg.iordt != Toggle::Any
}

impl Qos {
    /// Initialises the library with production platform sources.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration record; see [`Config`].
    ///
    /// # Returns
    ///
    /// The ready context.
    pub fn init(config: &Config) -> Result<Qos> {
        QosBuilder::new(config.clone()).build()
    }

    /// Starts a builder for callers that need to override platform seams.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration record; see [`Config`].
    ///
    /// # Returns
    ///
    /// A builder with production defaults for every seam.
    pub fn builder(config: Config) -> QosBuilder {
        QosBuilder::new(config)
    }

    /// # Returns
    ///
    /// The immutable topology snapshot built at init.
    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    /// # Returns
    ///
    /// A copy of the capability catalog, reflecting any feature toggles
    /// applied so far.
    pub fn capabilities(&self) -> Result<Capabilities> {
        Ok(self.locked()?.1.caps.clone())
    }

    fn locked(&self) -> Result<(LockGuard<'_>, MutexGuard<'_, Inner>)> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| Error::Other("context mutex poisoned".into()))?;
        let guard = self.lock.exclusive()?;
        Ok((guard, inner))
    }

    /// Starts monitoring the given cores.
    ///
    /// # Arguments
    ///
    /// * `cores` - Present cores not already in a live group.
    /// * `events` - Events to monitor.
    ///
    /// # Returns
    ///
    /// The group handle; pass it to `mon_poll` and consume it with
    /// `mon_stop`.
    pub fn mon_start_cores(&self, cores: &[u32], events: MonEvents) -> Result<MonGroup> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .mon
            .start_cores(&self.topo, &inner.caps, &inner.backends, cores, events)
    }

    /// Starts monitoring the given tasks. Kernel-filesystem back-end only.
    ///
    /// # Arguments
    ///
    /// * `pids` - Tasks to monitor.
    /// * `events` - Events to monitor.
    ///
    /// # Returns
    ///
    /// The group handle.
    pub fn mon_start_tasks(&self, pids: &[u32], events: MonEvents) -> Result<MonGroup> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .mon
            .start_tasks(&inner.caps, &inner.backends, pids, events)
    }

    /// Starts monitoring the given device channels. Memory-mapped back-end
    /// only.
    ///
    /// # Arguments
    ///
    /// * `channels` - Channels described by the firmware table.
    /// * `events` - Events to monitor.
    ///
    /// # Returns
    ///
    /// The group handle.
    pub fn mon_start_channels(&self, channels: &[ChannelId], events: MonEvents) -> Result<MonGroup> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .mon
            .start_channels(&inner.caps, &inner.backends, channels, events)
    }

    /// Stops a monitoring group and consumes its handle.
    ///
    /// # Arguments
    ///
    /// * `group` - The handle returned by a start call.
    pub fn mon_stop(&self, group: MonGroup) -> Result<()> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner.mon.stop(&inner.backends, group)
    }

    /// Polls a batch of groups; per-group failures land on the handles.
    ///
    /// # Arguments
    ///
    /// * `groups` - Handles to poll; each gets fresh values or an error.
    ///
    /// # Returns
    ///
    /// The summary outcome over the whole batch.
    pub fn mon_poll(&self, groups: &mut [&mut MonGroup]) -> Result<PollStatus> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        Ok(inner.mon.poll(&inner.caps, &inner.backends, groups))
    }

    /// Rebinds every core to monitoring ID 0 and clears channel
    /// associations. Live group handles become stale.
    pub fn mon_reset(&self) -> Result<()> {
        self.mon_reset_config(MonResetConfig::default())
    }

    /// Monitoring reset with a reconfiguration request.
    ///
    /// # Arguments
    ///
    /// * `cfg` - Device-channel and cluster-mode changes to apply.
    pub fn mon_reset_config(&self, cfg: MonResetConfig) -> Result<()> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner.mon.reset(&self.topo, &inner.backends, cfg)
    }

    /// Reads back the monitoring ID a core is bound to.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU to query.
    ///
    /// # Returns
    ///
    /// The core's monitoring ID; 0 means unassigned.
    pub fn mon_assoc_get(&self, lcore: u32) -> Result<u32> {
        if !self.topo.has_core(lcore) {
            return Err(Error::param(format!("core {lcore} is not present")));
        }
        let (_file, inner) = self.locked()?;
        inner.mon.assoc_of(&inner.backends, lcore)
    }

    /// Writes one L3 class definition.
    ///
    /// # Arguments
    ///
    /// * `domain` - L3 cache-allocation domain id.
    /// * `class_id` - Class of service to write.
    /// * `def` - The definition, matching the current partitioning mode.
    pub fn l3ca_set(&self, domain: u32, class_id: u32, def: CatCos) -> Result<()> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .alloc
            .set_l3(&self.topo, &inner.caps, &inner.backends, domain, class_id, def)
    }

    /// Writes several L3 classes; prior writes stay applied on failure.
    ///
    /// # Arguments
    ///
    /// * `domain` - L3 cache-allocation domain id.
    /// * `defs` - `(class, definition)` pairs, written in order.
    ///
    /// # Returns
    ///
    /// The number of classes written; a failure carries the count applied
    /// before it.
    pub fn l3ca_set_batch(
        &self,
        domain: u32,
        defs: &[(u32, CatCos)],
    ) -> std::result::Result<usize, BatchError> {
        let (_file, mut inner) = self.locked().map_err(|source| BatchError {
            written: 0,
            source,
        })?;
        let inner = &mut *inner;
        inner
            .alloc
            .set_l3_batch(&self.topo, &inner.caps, &inner.backends, domain, defs)
    }

    /// Reads back one L3 class definition.
    ///
    /// # Arguments
    ///
    /// * `domain` - L3 cache-allocation domain id.
    /// * `class_id` - Class of service to read.
    ///
    /// # Returns
    ///
    /// The class definition in the current partitioning mode.
    pub fn l3ca_get(&self, domain: u32, class_id: u32) -> Result<CatCos> {
        let (_file, inner) = self.locked()?;
        inner
            .alloc
            .get_l3(&self.topo, &inner.caps, &inner.backends, domain, class_id)
    }

    /// Writes one L2 class definition.
    ///
    /// # Arguments
    ///
    /// * `domain` - L2 cluster id.
    /// * `class_id` - Class of service to write.
    /// * `def` - The definition, matching the current partitioning mode.
    pub fn l2ca_set(&self, domain: u32, class_id: u32, def: CatCos) -> Result<()> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .alloc
            .set_l2(&self.topo, &inner.caps, &inner.backends, domain, class_id, def)
    }

    /// Reads back one L2 class definition.
    ///
    /// # Arguments
    ///
    /// * `domain` - L2 cluster id.
    /// * `class_id` - Class of service to read.
    ///
    /// # Returns
    ///
    /// The class definition in the current partitioning mode.
    pub fn l2ca_get(&self, domain: u32, class_id: u32) -> Result<CatCos> {
        let (_file, inner) = self.locked()?;
        inner
            .alloc
            .get_l2(&self.topo, &inner.caps, &inner.backends, domain, class_id)
    }

    /// Programs one bandwidth class.
    ///
    /// # Arguments
    ///
    /// * `domain` - Memory-bandwidth domain id.
    /// * `class_id` - Class of service to program.
    /// * `def` - Percentage or MBps target per the controller flag.
    ///
    /// # Returns
    ///
    /// The value the hardware rounded to.
    pub fn mba_set(&self, domain: u32, class_id: u32, def: MbaCos) -> Result<u32> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .alloc
            .set_mba(&self.topo, &inner.caps, &inner.backends, domain, class_id, def)
    }

    /// Reads back one bandwidth class definition.
    ///
    /// # Arguments
    ///
    /// * `domain` - Memory-bandwidth domain id.
    /// * `class_id` - Class of service to read.
    ///
    /// # Returns
    ///
    /// The bandwidth value currently programmed for the class.
    pub fn mba_get(&self, domain: u32, class_id: u32) -> Result<MbaCos> {
        let (_file, inner) = self.locked()?;
        inner
            .alloc
            .get_mba(&self.topo, &inner.caps, &inner.backends, domain, class_id)
    }

    /// Programs one slow-memory-bandwidth class with an MBps target.
    ///
    /// # Arguments
    ///
    /// * `domain` - Slow-memory-bandwidth domain id.
    /// * `class_id` - Class of service to program.
    /// * `mbps` - Bandwidth target in megabytes per second.
    pub fn smba_set(&self, domain: u32, class_id: u32, mbps: u32) -> Result<()> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .alloc
            .set_smba(&self.topo, &inner.caps, &inner.backends, domain, class_id, mbps)
    }

    /// Reads back one slow-memory-bandwidth class definition.
    ///
    /// # Arguments
    ///
    /// * `domain` - Slow-memory-bandwidth domain id.
    /// * `class_id` - Class of service to read.
    ///
    /// # Returns
    ///
    /// The MBps target currently programmed for the class.
    pub fn smba_get(&self, domain: u32, class_id: u32) -> Result<MbaCos> {
        let (_file, inner) = self.locked()?;
        inner
            .alloc
            .get_smba(&self.topo, &inner.caps, &inner.backends, domain, class_id)
    }

    /// Associates a core with a class of service.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU to associate.
    /// * `class_id` - Target class of service.
    pub fn assoc_core(&self, lcore: u32, class_id: u32) -> Result<()> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .alloc
            .assoc_core(&self.topo, &inner.caps, &inner.backends, lcore, class_id)
    }

    /// Reads back a core's class of service.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU to query.
    ///
    /// # Returns
    ///
    /// The class of service the core is associated with.
    pub fn assoc_core_get(&self, lcore: u32) -> Result<u32> {
        let (_file, inner) = self.locked()?;
        inner.alloc.assoc_core_get(&self.topo, &inner.backends, lcore)
    }

    /// Moves a task into a class. Kernel-filesystem back-end only.
    ///
    /// # Arguments
    ///
    /// * `pid` - Task to move.
    /// * `class_id` - Target class of service.
    pub fn assoc_task(&self, pid: u32, class_id: u32) -> Result<()> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .alloc
            .assoc_task(&inner.caps, &inner.backends, pid, class_id)
    }

    /// Associates a device channel with a class. Memory-mapped back-end
    /// only.
    ///
    /// # Arguments
    ///
    /// * `channel` - Channel to associate.
    /// * `class_id` - Target class of service.
    pub fn assoc_channel(&self, channel: ChannelId, class_id: u32) -> Result<()> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner.alloc.assoc_channel(&inner.backends, channel, class_id)
    }

    /// Reads back a channel's class of service.
    ///
    /// # Arguments
    ///
    /// * `channel` - Channel to query.
    ///
    /// # Returns
    ///
    /// The class of service the channel is associated with.
    pub fn assoc_channel_get(&self, channel: ChannelId) -> Result<u32> {
        let (_file, inner) = self.locked()?;
        inner.alloc.assoc_channel_get(&inner.backends, channel)
    }

    /// Associates a device's virtual channel with a class. Memory-mapped
    /// back-end only.
    ///
    /// # Arguments
    ///
    /// * `collection` - Device-agent collection id from the firmware table.
    /// * `vc` - Virtual channel within the collection's domain.
    /// * `class_id` - Target class of service.
    pub fn assoc_device(&self, collection: u16, vc: u16, class_id: u32) -> Result<()> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .alloc
            .assoc_device(&inner.backends, collection, vc, class_id)
    }

    /// Assigns the highest unused class to the given cores.
    ///
    /// # Arguments
    ///
    /// * `techs` - Technologies the class must be free in.
    /// * `cores` - Cores to cover; constrained to one socket or L2 cluster
    ///   per the selected technologies.
    ///
    /// # Returns
    ///
    /// The assigned class of service.
    pub fn alloc_assign(&self, techs: Technologies, cores: &[u32]) -> Result<u32> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .alloc
            .assign(&self.topo, &inner.caps, &inner.backends, techs, cores)
    }

    /// Returns the given cores to class 0.
    ///
    /// # Arguments
    ///
    /// * `cores` - Cores to release.
    pub fn alloc_release(&self, cores: &[u32]) -> Result<()> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .alloc
            .release(&self.topo, &inner.caps, &inner.backends, cores)
    }

    /// Global allocation reset, optionally reconfiguring features.
    ///
    /// # Arguments
    ///
    /// * `cfg` - Feature toggles to apply mid-sequence.
    pub fn alloc_reset(&self, cfg: ResetConfig) -> Result<()> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .alloc
            .reset(&self.topo, &mut inner.caps, &inner.backends, cfg)
    }

    /// Tears the context down, rebinding monitored cores to ID 0.
    ///
    /// Dropping the context performs the same teardown with errors logged
    /// instead of returned.
    pub fn fini(self) -> Result<()> {
        let (_file, mut inner) = self.locked()?;
        let inner = &mut *inner;
        inner
            .mon
            .reset(&self.topo, &inner.backends, MonResetConfig::default())?;
        info!("library finalized");
        Ok(())
    }
}

impl Drop for Qos {
    fn drop(&mut self) {
        if let Ok((_file, mut inner)) = self.locked() {
            let inner = &mut *inner;
            if let Err(e) = inner
                .mon
                .reset(&self.topo, &inner.backends, MonResetConfig::default())
            {
                warn!(error = %e, "teardown left cores bound");
            }
        }
    }
}
