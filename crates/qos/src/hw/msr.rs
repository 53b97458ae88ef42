//! Model-specific-register access and the fixed register map.
//!
//! Addresses here are platform ABI and do not change between parts. Reads
//! and writes go through [`MsrIo`] so the rest of the library never opens a
//! device file directly.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::sync::Mutex;

use crate::common::{Error, Result};

/// Core association register: monitoring ID in bits 9..0, class of service
/// in bits 63..32. One register per logical CPU.
pub const MSR_ASSOC: u32 = 0xC8F;
/// RMID field mask within [`MSR_ASSOC`].
pub const MSR_ASSOC_RMID_MASK: u64 = (1 << 10) - 1;
/// Class-of-service field shift within [`MSR_ASSOC`].
pub const MSR_ASSOC_COS_SHIFT: u32 = 32;
/// Class-of-service field mask within [`MSR_ASSOC`].
pub const MSR_ASSOC_COS_MASK: u64 = 0xffff_ffff_0000_0000;

/// Monitoring event select register: RMID at bit 32, event id in bits 7..0.
pub const MSR_MON_EVTSEL: u32 = 0xC8D;
/// RMID shift within [`MSR_MON_EVTSEL`].
pub const MSR_MON_EVTSEL_RMID_SHIFT: u32 = 32;
/// Event id mask within [`MSR_MON_EVTSEL`].
pub const MSR_MON_EVTSEL_EVTID_MASK: u64 = (1 << 8) - 1;

/// Monitoring counter read register.
pub const MSR_MON_COUNT: u32 = 0xC8E;
/// Error bit: the selected RMID or event id is not supported.
pub const MSR_MON_COUNT_ERROR: u64 = 1 << 63;
/// Unavailable bit: no sample for the selected RMID yet.
pub const MSR_MON_COUNT_UNAVAILABLE: u64 = 1 << 62;
/// Counter value mask, bits 61..0.
pub const MSR_MON_COUNT_VALUE_MASK: u64 = (1 << 62) - 1;

/// L3 QoS configuration register; bit 0 enables code/data partitioning.
pub const MSR_L3_QOS_CFG: u32 = 0xC81;
/// L2 QoS configuration register; bit 0 enables code/data partitioning.
pub const MSR_L2_QOS_CFG: u32 = 0xC82;
/// CDP enable bit in the QoS configuration registers.
pub const QOS_CFG_CDP_ENABLE: u64 = 1;

/// First L3 class-allocation mask register; one register per hardware class.
pub const MSR_L3CA_MASK_START: u32 = 0xC90;
/// Last L3 class-allocation mask register.
pub const MSR_L3CA_MASK_END: u32 = 0xD8F;
/// First L2 class-allocation mask register.
pub const MSR_L2CA_MASK_START: u32 = 0xC10;
/// Last L2 class-allocation mask register.
pub const MSR_L2CA_MASK_END: u32 = 0xC8C;
/// First memory-bandwidth throttle register; one per hardware class.
pub const MSR_MBA_MASK_START: u32 = 0xD50;
/// First slow-memory-bandwidth target register (AMD); one per hardware
/// class, holding an absolute MBps value.
pub const MSR_SMBA_MASK_START: u32 = 0xC000_0280;

/// Architectural fixed counter: retired instructions.
pub const MSR_INST_RETIRED_ANY: u32 = 0x309;
/// Architectural fixed counter: unhalted core cycles.
pub const MSR_CPU_UNHALTED_THREAD: u32 = 0x30A;
/// Fixed-counter control register.
pub const MSR_FIXED_CTR_CTRL: u32 = 0x38D;
/// Global performance-counter enable register.
pub const MSR_PERF_GLOBAL_CTRL: u32 = 0x38F;
/// First general-purpose performance counter.
pub const MSR_PMC0: u32 = 0xC1;
/// First performance event select register.
pub const MSR_PERFEVTSEL0: u32 = 0x186;

/// LLC-miss architectural event number.
pub const EVENT_LLC_MISS: u64 = 0x2E;
/// LLC-miss architectural event unit mask.
pub const EVENT_LLC_MISS_UMASK: u64 = 0x41;
/// LLC-reference architectural event unit mask.
pub const EVENT_LLC_REF_UMASK: u64 = 0x4F;

/// Per-logical-CPU model-specific-register access.
///
/// A write to an allocation or association register on one CPU of a domain
/// is visible to every CPU of that domain; the implementation only has to
/// deliver the access to the named core.
pub trait MsrIo: Send {
    /// Reads one register.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU the read is issued on.
    /// * `reg` - Register address.
    ///
    /// # Returns
    ///
    /// The 64-bit register value.
    fn read(&self, lcore: u32, reg: u32) -> Result<u64>;

    /// Writes one register.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU the write is issued on.
    /// * `reg` - Register address.
    /// * `value` - The 64-bit value to write.
    fn write(&self, lcore: u32, reg: u32, value: u64) -> Result<()>;
}

/// MSR access through the kernel's `/dev/cpu/<n>/msr` device files.
///
/// File descriptors are opened on first use per core and cached for the
/// lifetime of the value. The register address is the file offset.
pub struct DevMsr {
    fds: Mutex<Vec<Option<File>>>,
}

impl DevMsr {
    /// Creates the accessor.
    ///
    /// # Arguments
    ///
    /// * `num_cores` - Number of descriptor slots to reserve; the table
    ///   grows on demand if a higher core id shows up.
    ///
    /// # Returns
    ///
    /// An accessor with no descriptors opened yet.
    pub fn new(num_cores: usize) -> Self {
        let mut fds = Vec::new();
        fds.resize_with(num_cores, || None);
        Self {
            fds: Mutex::new(fds),
        }
    }

    fn with_fd<T>(&self, lcore: u32, f: impl FnOnce(&File) -> std::io::Result<T>) -> Result<T> {
        let mut fds = self
            .fds
            .lock()
            .map_err(|_| Error::Other("msr descriptor table poisoned".into()))?;
        let idx = lcore as usize;
        if idx >= fds.len() {
            fds.resize_with(idx + 1, || None);
        }
        if fds[idx].is_none() {
            let path = format!("/dev/cpu/{lcore}/msr");
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| Error::transport(format!("open {path}"), e))?;
            fds[idx] = Some(file);
        }
        let file = fds[idx].as_ref().ok_or(Error::Init)?;
        f(file).map_err(|e| Error::transport(format!("msr access on core {lcore}"), e))
    }
}

impl MsrIo for DevMsr {
    fn read(&self, lcore: u32, reg: u32) -> Result<u64> {
        self.with_fd(lcore, |file| {
            let mut buf = [0u8; 8];
            file.read_exact_at(&mut buf, u64::from(reg))?;
            Ok(u64::from_le_bytes(buf))
        })
    }

    fn write(&self, lcore: u32, reg: u32, value: u64) -> Result<()> {
        self.with_fd(lcore, |file| {
            file.write_all_at(&value.to_le_bytes(), u64::from(reg))
        })
    }
}

impl std::fmt::Debug for DevMsr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevMsr").finish_non_exhaustive()
    }
}
