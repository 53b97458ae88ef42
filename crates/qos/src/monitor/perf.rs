//! Architectural performance counters.
//!
//! Two consumers:
//! 1. **Core groups:** IPC and LLC miss/reference monitoring programs the
//!    fixed counters and the first general-purpose counters directly
//!    through MSRs on each monitored core.
//! 2. **Task groups:** The kernel filesystem back-end opens one perf file
//!    descriptor per task and event instead.
//!
//! The counters are a shared machine resource. Before programming, the
//! global-enable register is inspected on every core; finding any needed
//! counter already enabled fails the start unless the caller's one-shot
//! override was set.

use std::io::Read;
use std::os::unix::io::{FromRawFd, RawFd};

use tracing::{debug, warn};

use crate::backend::msr::MsrBackend;
use crate::caps::{MonEvent, MonEvents};
use crate::common::{Error, Result};
use crate::hw::msr;

/// Second general-purpose performance counter.
const MSR_PMC1: u32 = 0xC2;
/// Second performance event select register.
const MSR_PERFEVTSEL1: u32 = 0x187;

/// Event-select flag: count in user mode.
const EVTSEL_USR: u64 = 1 << 16;
/// Event-select flag: count in kernel mode.
const EVTSEL_OS: u64 = 1 << 17;
/// Event-select flag: counter enabled.
const EVTSEL_EN: u64 = 1 << 22;

/// Fixed-counter control: track user and kernel on fixed counters 0 and 1.
const FIXED_CTRL_USR_OS: u64 = 0x33;

/// Global-enable bits for the fixed counters used by IPC.
const GLOBAL_FIXED_IPC: u64 = 0x3 << 32;
/// Global-enable bit for the first general-purpose counter.
const GLOBAL_PMC0: u64 = 0x1;
/// Global-enable bit for the second general-purpose counter.
const GLOBAL_PMC1: u64 = 0x2;

fn global_ctrl_mask(events: MonEvents) -> u64 {
    let mut mask = 0;
    if events.contains(MonEvent::Ipc) {
        mask |= GLOBAL_FIXED_IPC;
    }
    if events.contains(MonEvent::LlcMisses) {
        mask |= GLOBAL_PMC0;
    }
    if events.contains(MonEvent::LlcReferences) {
        mask |= GLOBAL_PMC1;
    }
    mask
}

/// Programs the counters needed by `events` on every core in `cores`.
///
/// Leaves no counter touched when the in-use check fails; the caller rolls
/// back nothing.
///
/// # Arguments
///
/// * `backend` - The register back-end to program through.
/// * `cores` - Cores the group monitors.
/// * `events` - Events selecting which counters to program.
/// * `override_in_use` - Skip the in-use check and take the counters over.
pub fn setup_core_counters(
    backend: &MsrBackend,
    cores: &[u32],
    events: MonEvents,
    override_in_use: bool,
) -> Result<()> {
    let mask = global_ctrl_mask(events);
    if mask == 0 {
        return Ok(());
    }
    let io = backend.io();

    if override_in_use {
        warn!("performance counters taken over; other software may misbehave");
    } else {
        for &core in cores {
            let ctrl = io.read(core, msr::MSR_PERF_GLOBAL_CTRL)?;
            if ctrl & mask != 0 {
                return Err(Error::PerfInUse);
            }
        }
    }

    for &core in cores {
        io.write(core, msr::MSR_PERF_GLOBAL_CTRL, 0)?;
        if events.contains(MonEvent::Ipc) {
            io.write(core, msr::MSR_INST_RETIRED_ANY, 0)?;
            io.write(core, msr::MSR_CPU_UNHALTED_THREAD, 0)?;
            io.write(core, msr::MSR_FIXED_CTR_CTRL, FIXED_CTRL_USR_OS)?;
        }
        if events.contains(MonEvent::LlcMisses) {
            let evtsel = msr::EVENT_LLC_MISS
                | (msr::EVENT_LLC_MISS_UMASK << 8)
                | EVTSEL_USR
                | EVTSEL_OS
                | EVTSEL_EN;
            io.write(core, msr::MSR_PMC0, 0)?;
            io.write(core, msr::MSR_PERFEVTSEL0, evtsel)?;
        }
        if events.contains(MonEvent::LlcReferences) {
            let evtsel = msr::EVENT_LLC_MISS
                | (msr::EVENT_LLC_REF_UMASK << 8)
                | EVTSEL_USR
                | EVTSEL_OS
                | EVTSEL_EN;
            io.write(core, MSR_PMC1, 0)?;
            io.write(core, MSR_PERFEVTSEL1, evtsel)?;
        }
        io.write(core, msr::MSR_PERF_GLOBAL_CTRL, mask)?;
    }
    debug!(cores = cores.len(), mask, "performance counters enabled");
    Ok(())
}

/// Disables the counters on every core of a stopping group.
///
/// Failures are logged rather than propagated so that the rest of the stop
/// sequence still runs.
///
/// # Arguments
///
/// * `backend` - The register back-end to program through.
/// * `cores` - Cores the group monitored.
pub fn disable_core_counters(backend: &MsrBackend, cores: &[u32]) {
    let io = backend.io();
    for &core in cores {
        if io.write(core, msr::MSR_PERF_GLOBAL_CTRL, 0).is_err() {
            warn!(core, "failed to disable performance counters");
        }
    }
}

/// Reads one counter MSR summed across a group's cores.
///
/// # Arguments
///
/// * `backend` - The register back-end to read through.
/// * `cores` - Cores the group monitors.
/// * `reg` - The counter register to read.
///
/// # Returns
///
/// The counter values summed with wrapping arithmetic.
pub fn read_core_counter(backend: &MsrBackend, cores: &[u32], reg: u32) -> Result<u64> {
    let io = backend.io();
    let mut total = 0u64;
    for &core in cores {
        total = total.wrapping_add(io.read(core, reg)?);
    }
    Ok(total)
}

/// Second general-purpose counter register for reference counts.
pub const PMC1: u32 = MSR_PMC1;

/// perf_event_open hardware event type.
const PERF_TYPE_HARDWARE: u32 = 0;
/// Hardware event ids used for task monitoring.
const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
const PERF_COUNT_HW_CACHE_REFERENCES: u64 = 2;
const PERF_COUNT_HW_CACHE_MISSES: u64 = 3;

/// Subset of `perf_event_attr` large enough for counting events.
#[repr(C)]
#[derive(Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup: u32,
    bp_type: u32,
    config1: u64,
    config2: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    reserved: u16,
}

/// One open perf counter file descriptor.
#[derive(Debug)]
pub struct PerfFd {
    file: std::fs::File,
}

impl PerfFd {
    fn open_scoped(ty: u32, config: u64, pid: i32, cpu: i32) -> Result<Self> {
        let mut attr = PerfEventAttr {
            type_: ty,
            size: std::mem::size_of::<PerfEventAttr>() as u32,
            config,
            ..PerfEventAttr::default()
        };
        // SAFETY: attr is a valid perf_event_attr prefix with its size
        // recorded; the kernel copies it and returns a descriptor or -1.
        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                std::ptr::from_mut(&mut attr),
                pid,
                cpu,
                -1i32,
                0u64,
            )
        };
        if fd < 0 {
            return Err(Error::transport(
                format!("perf_event_open (pid {pid}, cpu {cpu})"),
                std::io::Error::last_os_error(),
            ));
        }
        // SAFETY: fd is a freshly returned, owned descriptor.
        let file = unsafe { std::fs::File::from_raw_fd(fd as RawFd) };
        Ok(Self { file })
    }

    fn open(ty: u32, config: u64, tid: i32) -> Result<Self> {
        Self::open_scoped(ty, config, tid, -1)
    }

    fn open_cpu(ty: u32, config: u64, cpu: i32) -> Result<Self> {
        Self::open_scoped(ty, config, -1, cpu)
    }

    fn read(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.file
            .read_exact(&mut buf)
            .map_err(|e| Error::transport("perf counter read", e))?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// Per-task perf counters backing a task group.
#[derive(Debug, Default)]
pub struct TaskCounters {
    cycles: Vec<PerfFd>,
    instructions: Vec<PerfFd>,
    references: Vec<PerfFd>,
    misses: Vec<PerfFd>,
}

impl TaskCounters {
    /// Opens one descriptor per task and selected event.
    ///
    /// Any failure closes everything already opened and surfaces the
    /// error, leaving no descriptor behind.
    ///
    /// # Arguments
    ///
    /// * `tids` - Tasks to monitor.
    /// * `events` - Events selecting which descriptors to open.
    ///
    /// # Returns
    ///
    /// The open counter set.
    pub fn open(tids: &[u32], events: MonEvents) -> Result<Self> {
        let mut ctrs = TaskCounters::default();
        for &tid in tids {
            let tid = tid as i32;
            if events.contains(MonEvent::Ipc) {
                ctrs.cycles
                    .push(PerfFd::open(PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES, tid)?);
                ctrs.instructions.push(PerfFd::open(
                    PERF_TYPE_HARDWARE,
                    PERF_COUNT_HW_INSTRUCTIONS,
                    tid,
                )?);
            }
            if events.contains(MonEvent::LlcReferences) {
                ctrs.references.push(PerfFd::open(
                    PERF_TYPE_HARDWARE,
                    PERF_COUNT_HW_CACHE_REFERENCES,
                    tid,
                )?);
            }
            if events.contains(MonEvent::LlcMisses) {
                ctrs.misses.push(PerfFd::open(
                    PERF_TYPE_HARDWARE,
                    PERF_COUNT_HW_CACHE_MISSES,
                    tid,
                )?);
            }
        }
        Ok(ctrs)
    }

    /// Opens one descriptor per CPU and selected event, for core groups on
    /// the kernel-filesystem back-end.
    ///
    /// # Arguments
    ///
    /// * `cpus` - Cores to monitor.
    /// * `events` - Events selecting which descriptors to open.
    ///
    /// # Returns
    ///
    /// The open counter set.
    pub fn open_for_cpus(cpus: &[u32], events: MonEvents) -> Result<Self> {
        let mut ctrs = TaskCounters::default();
        for &cpu in cpus {
            let cpu = cpu as i32;
            if events.contains(MonEvent::Ipc) {
                ctrs.cycles.push(PerfFd::open_cpu(
                    PERF_TYPE_HARDWARE,
                    PERF_COUNT_HW_CPU_CYCLES,
                    cpu,
                )?);
                ctrs.instructions.push(PerfFd::open_cpu(
                    PERF_TYPE_HARDWARE,
                    PERF_COUNT_HW_INSTRUCTIONS,
                    cpu,
                )?);
            }
            if events.contains(MonEvent::LlcReferences) {
                ctrs.references.push(PerfFd::open_cpu(
                    PERF_TYPE_HARDWARE,
                    PERF_COUNT_HW_CACHE_REFERENCES,
                    cpu,
                )?);
            }
            if events.contains(MonEvent::LlcMisses) {
                ctrs.misses.push(PerfFd::open_cpu(
                    PERF_TYPE_HARDWARE,
                    PERF_COUNT_HW_CACHE_MISSES,
                    cpu,
                )?);
            }
        }
        Ok(ctrs)
    }

    fn sum(fds: &mut [PerfFd]) -> Result<u64> {
        let mut total = 0u64;
        for fd in fds {
            total = total.wrapping_add(fd.read()?);
        }
        Ok(total)
    }

    /// # Returns
    ///
    /// The sum of unhalted cycles across the set.
    pub fn cycles(&mut self) -> Result<u64> {
        Self::sum(&mut self.cycles)
    }

    /// # Returns
    ///
    /// The sum of retired instructions across the set.
    pub fn instructions(&mut self) -> Result<u64> {
        Self::sum(&mut self.instructions)
    }

    /// # Returns
    ///
    /// The sum of cache references across the set.
    pub fn references(&mut self) -> Result<u64> {
        Self::sum(&mut self.references)
    }

    /// # Returns
    ///
    /// The sum of cache misses across the set.
    pub fn misses(&mut self) -> Result<u64> {
        Self::sum(&mut self.misses)
    }
}
