//! Direct model-specific-register back-end.
//!
//! Acts on per-logical-CPU registers. Writes to an allocation or
//! association register on one CPU of a domain are visible to every CPU of
//! that domain, so domain-wide updates target a single representative core.

use tracing::warn;

use crate::common::{Error, Result};
use crate::config::UNAVAILABLE_RETRIES;
use crate::hw::msr::{self, MsrIo};

/// Register back-end state: the MSR accessor.
pub struct MsrBackend {
    io: Box<dyn MsrIo>,
}

impl std::fmt::Debug for MsrBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsrBackend").finish_non_exhaustive()
    }
}

impl MsrBackend {
    /// Wraps an MSR accessor.
    ///
    /// # Arguments
    ///
    /// * `io` - The per-core register accessor to act through.
    pub fn new(io: Box<dyn MsrIo>) -> Self {
        Self { io }
    }

    /// Raw MSR access for helpers that live outside this module
    /// (performance-counter programming).
    ///
    /// # Returns
    ///
    /// The wrapped accessor.
    pub fn io(&self) -> &dyn MsrIo {
        self.io.as_ref()
    }

    /// Reads the monitoring-ID field of a core's association register.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU to read.
    ///
    /// # Returns
    ///
    /// The monitoring ID the core is bound to.
    pub fn mon_assoc_get(&self, lcore: u32) -> Result<u32> {
        let val = self.io.read(lcore, msr::MSR_ASSOC)?;
        Ok((val & msr::MSR_ASSOC_RMID_MASK) as u32)
    }

    /// Writes the monitoring-ID field of a core's association register,
    /// preserving the class-of-service field.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU to bind.
    /// * `rmid` - Monitoring ID to bind it to.
    pub fn mon_assoc_set(&self, lcore: u32, rmid: u32) -> Result<()> {
        let mut val = self.io.read(lcore, msr::MSR_ASSOC)?;
        val &= msr::MSR_ASSOC_COS_MASK;
        val |= u64::from(rmid) & msr::MSR_ASSOC_RMID_MASK;
        self.io.write(lcore, msr::MSR_ASSOC, val)
    }

    /// Reads the class-of-service field of a core's association register.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU to read.
    ///
    /// # Returns
    ///
    /// The class of service the core is associated with.
    pub fn cos_assoc_get(&self, lcore: u32) -> Result<u32> {
        let val = self.io.read(lcore, msr::MSR_ASSOC)?;
        Ok((val >> msr::MSR_ASSOC_COS_SHIFT) as u32)
    }

    /// Writes the class-of-service field of a core's association register,
    /// preserving the monitoring-ID field.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU to associate.
    /// * `class_id` - Class of service to associate it with.
    pub fn cos_assoc_set(&self, lcore: u32, class_id: u32) -> Result<()> {
        let mut val = self.io.read(lcore, msr::MSR_ASSOC)?;
        val &= !msr::MSR_ASSOC_COS_MASK;
        val |= u64::from(class_id) << msr::MSR_ASSOC_COS_SHIFT;
        self.io.write(lcore, msr::MSR_ASSOC, val)
    }

    /// Selects `(rmid, event)` and reads the monitoring counter.
    ///
    /// The read is retried while the hardware reports the sample as not yet
    /// available, up to the bounded retry budget. The error bit means the
    /// RMID or event id is not supported and fails immediately.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU the read is issued on.
    /// * `rmid` - Monitoring ID to select.
    /// * `event_id` - Hardware event id to select.
    ///
    /// # Returns
    ///
    /// The raw counter value, bits 61..0 of the counter register.
    pub fn mon_read(&self, lcore: u32, rmid: u32, event_id: u8) -> Result<u64> {
        let sel = (u64::from(rmid) << msr::MSR_MON_EVTSEL_RMID_SHIFT)
            | (u64::from(event_id) & msr::MSR_MON_EVTSEL_EVTID_MASK);
        self.io.write(lcore, msr::MSR_MON_EVTSEL, sel)?;

        let mut retries = UNAVAILABLE_RETRIES;
        loop {
            let val = self.io.read(lcore, msr::MSR_MON_COUNT)?;
            if val & msr::MSR_MON_COUNT_ERROR != 0 {
                warn!(lcore, rmid, event_id, "monitoring read reported error");
                return Err(Error::Other(format!(
                    "event {event_id} read error on core {lcore} (RMID {rmid})"
                )));
            }
            if val & msr::MSR_MON_COUNT_UNAVAILABLE == 0 {
                return Ok(val & msr::MSR_MON_COUNT_VALUE_MASK);
            }
            if retries == 0 {
                return Err(Error::Unavailable);
            }
            retries -= 1;
        }
    }

    /// Reads one cache-allocation class mask from a domain representative.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Representative core of the domain.
    /// * `mask_start` - First register of the technology's mask block.
    /// * `hw_class` - Hardware class slot to read.
    ///
    /// # Returns
    ///
    /// The way mask held by that slot.
    pub fn cat_get(&self, lcore: u32, mask_start: u32, hw_class: u32) -> Result<u64> {
        self.io.read(lcore, mask_start + hw_class)
    }

    /// Writes one cache-allocation class mask on a domain representative.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Representative core of the domain.
    /// * `mask_start` - First register of the technology's mask block.
    /// * `hw_class` - Hardware class slot to write.
    /// * `mask` - The way mask to program.
    pub fn cat_set(&self, lcore: u32, mask_start: u32, hw_class: u32, mask: u64) -> Result<()> {
        self.io.write(lcore, mask_start + hw_class, mask)
    }

    /// Reads a class's bandwidth throttle and converts the delay value back
    /// to an available-bandwidth percentage.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Representative core of the bandwidth domain.
    /// * `class_id` - Class of service to read.
    ///
    /// # Returns
    ///
    /// The permitted bandwidth percentage.
    pub fn mba_get(&self, lcore: u32, class_id: u32) -> Result<u32> {
        let delay = self.io.read(lcore, msr::MSR_MBA_MASK_START + class_id)?;
        Ok(100u32.saturating_sub(delay as u32))
    }

    /// Programs a class's bandwidth throttle. `mb_max` is the permitted
    /// percentage; the register takes the complementary delay.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Representative core of the bandwidth domain.
    /// * `class_id` - Class of service to program.
    /// * `mb_max` - Permitted bandwidth percentage.
    pub fn mba_set(&self, lcore: u32, class_id: u32, mb_max: u32) -> Result<()> {
        let delay = u64::from(100u32.saturating_sub(mb_max));
        self.io
            .write(lcore, msr::MSR_MBA_MASK_START + class_id, delay)
    }

    /// Reads a class's slow-memory-bandwidth target.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Representative core of the slow-memory domain.
    /// * `class_id` - Class of service to read.
    ///
    /// # Returns
    ///
    /// The absolute MBps target held by the register.
    pub fn smba_get(&self, lcore: u32, class_id: u32) -> Result<u32> {
        let val = self.io.read(lcore, msr::MSR_SMBA_MASK_START + class_id)?;
        Ok(val as u32)
    }

    /// Programs a class's slow-memory-bandwidth target. The register holds
    /// the absolute MBps value, not a delay.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Representative core of the slow-memory domain.
    /// * `class_id` - Class of service to program.
    /// * `mbps` - Bandwidth target in megabytes per second.
    pub fn smba_set(&self, lcore: u32, class_id: u32, mbps: u32) -> Result<()> {
        self.io
            .write(lcore, msr::MSR_SMBA_MASK_START + class_id, u64::from(mbps))
    }

    /// Reads the latched code/data-partitioning bit of `cfg_msr` on a
    /// socket representative.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Representative core of the socket.
    /// * `cfg_msr` - The L3 or L2 QoS configuration register.
    ///
    /// # Returns
    ///
    /// `true` when partitioning is latched on.
    pub fn cdp_get(&self, lcore: u32, cfg_msr: u32) -> Result<bool> {
        Ok(self.io.read(lcore, cfg_msr)? & msr::QOS_CFG_CDP_ENABLE != 0)
    }

    /// Flips the code/data-partitioning bit of `cfg_msr` on a socket
    /// representative, preserving the other configuration bits.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Representative core of the socket.
    /// * `cfg_msr` - The L3 or L2 QoS configuration register.
    /// * `enable` - The partitioning state to latch.
    pub fn cdp_set(&self, lcore: u32, cfg_msr: u32, enable: bool) -> Result<()> {
        let mut val = self.io.read(lcore, cfg_msr)?;
        if enable {
            val |= msr::QOS_CFG_CDP_ENABLE;
        } else {
            val &= !msr::QOS_CFG_CDP_ENABLE;
        }
        self.io.write(lcore, cfg_msr, val)
    }
}
