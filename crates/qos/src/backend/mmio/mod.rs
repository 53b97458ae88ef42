//! Memory-mapped back-end for device-side agents.
//!
//! Walks the firmware's ERDT description, maps each reported register
//! block read-write once, and exposes the device-channel class/ID table
//! plus the channel monitoring counters. Only the I/O extension is served
//! here; CPU-side agents always go through the register or kernel
//! interface.

pub mod erdt;

use std::fs::{self, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use tracing::{debug, info};

use crate::backend::mmio::erdt::{ErdtDomain, ErdtTable};
use crate::common::{Error, Result};

/// Default firmware path of the ERDT table.
pub const ERDT_TABLE_PATH: &str = "/sys/firmware/acpi/tables/ERDT";
/// Physical-memory device used to map register blocks.
pub const DEVMEM_PATH: &str = "/dev/mem";

/// Identifies one device channel: a domain from the firmware table and a
/// channel index within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId {
    /// Index of the resource-management domain in table order.
    pub domain: u16,
    /// Channel index within the domain.
    pub channel: u16,
}

/// One mapped physical register block.
struct Mapping {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: mappings are only dereferenced under the context's global lock,
// which serialises every public operation.
unsafe impl Send for Mapping {}

impl Mapping {
    fn map(fd: i32, base: u64, len: usize) -> Result<Self> {
        // SAFETY: length and base come from the firmware table; base was
        // checked page aligned by the parser. A failed map returns
        // MAP_FAILED which is handled below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                base as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::transport(
                format!("map register block at {base:#x}"),
                std::io::Error::last_os_error(),
            ));
        }
        Ok(Self {
            ptr: ptr.cast(),
            len,
        })
    }

    fn read_u32(&self, off: usize) -> Result<u32> {
        if off + 4 > self.len {
            return Err(Error::param(format!("register offset {off:#x} out of block")));
        }
        // SAFETY: bounds checked above; the block stays mapped for the
        // lifetime of self.
        Ok(unsafe { self.ptr.add(off).cast::<u32>().read_volatile() })
    }

    fn write_u32(&self, off: usize, val: u32) -> Result<()> {
        if off + 4 > self.len {
            return Err(Error::param(format!("register offset {off:#x} out of block")));
        }
        // SAFETY: bounds checked above.
        unsafe { self.ptr.add(off).cast::<u32>().write_volatile(val) };
        Ok(())
    }

    fn read_u64(&self, off: usize) -> Result<u64> {
        if off + 8 > self.len {
            return Err(Error::param(format!("register offset {off:#x} out of block")));
        }
        // SAFETY: bounds checked above.
        Ok(unsafe { self.ptr.add(off).cast::<u64>().read_volatile() })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap.
        unsafe {
            libc::munmap(self.ptr.cast(), self.len);
        }
    }
}

struct MmioDomain {
    meta: ErdtDomain,
    cache_alloc: Option<Mapping>,
    cache_mon: Option<Mapping>,
    io_bw: Option<Mapping>,
}

/// Memory-mapped back-end state.
pub struct MmioBackend {
    table: ErdtTable,
    domains: Vec<MmioDomain>,
}

impl std::fmt::Debug for MmioBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmioBackend")
            .field("domains", &self.domains.len())
            .finish_non_exhaustive()
    }
}

impl MmioBackend {
    /// Reads the firmware table and maps every register block.
    ///
    /// # Arguments
    ///
    /// * `table_path` - File holding the raw firmware table.
    /// * `devmem_path` - Physical-memory device to map through.
    ///
    /// # Returns
    ///
    /// The back-end with every reported block mapped read-write.
    pub fn open(table_path: &Path, devmem_path: &Path) -> Result<Self> {
        let bytes = fs::read(table_path)
            .map_err(|e| Error::transport(format!("read {}", table_path.display()), e))?;
        let table = erdt::parse(&bytes)?;
        Self::from_table(table, devmem_path)
    }

    /// Maps the register blocks of an already-parsed table.
    ///
    /// # Arguments
    ///
    /// * `table` - The parsed firmware description.
    /// * `devmem_path` - Physical-memory device to map through.
    ///
    /// # Returns
    ///
    /// The back-end with every reported block mapped read-write.
    pub fn from_table(table: ErdtTable, devmem_path: &Path) -> Result<Self> {
        let devmem = OpenOptions::new()
            .read(true)
            .write(true)
            .open(devmem_path)
            .map_err(|e| Error::transport(format!("open {}", devmem_path.display()), e))?;
        let fd = devmem.as_raw_fd();

        let mut domains = Vec::with_capacity(table.domains.len());
        for meta in &table.domains {
            let cache_alloc = meta
                .cache_alloc
                .map(|b| Mapping::map(fd, b.base, b.size as usize))
                .transpose()?;
            let cache_mon = meta
                .cache_mon
                .map(|b| Mapping::map(fd, b.base, b.size as usize))
                .transpose()?;
            let io_bw = meta
                .io_bw_mon
                .map(|b| Mapping::map(fd, b.base, b.size as usize))
                .transpose()?;
            debug!(
                domain = meta.domain_id,
                channels = meta.num_channels(),
                "mapped I/O domain"
            );
            domains.push(MmioDomain {
                meta: meta.clone(),
                cache_alloc,
                cache_mon,
                io_bw,
            });
        }
        info!(domains = domains.len(), "memory-mapped back-end ready");
        Ok(Self { table, domains })
    }

    /// # Returns
    ///
    /// The maximum class count the I/O agents accept.
    pub fn max_clos(&self) -> u32 {
        self.table.max_clos
    }

    /// # Returns
    ///
    /// The parsed domain descriptions, in table order.
    pub fn domains(&self) -> &[ErdtDomain] {
        &self.table.domains
    }

    fn domain(&self, id: u16) -> Result<&MmioDomain> {
        self.domains
            .get(id as usize)
            .ok_or_else(|| Error::param(format!("I/O domain {id} out of range")))
    }

    fn check_channel(&self, ch: ChannelId) -> Result<&MmioDomain> {
        let domain = self.domain(ch.domain)?;
        if u32::from(ch.channel) >= domain.meta.num_channels() {
            return Err(Error::param(format!(
                "channel {} out of range for domain {}",
                ch.channel, ch.domain
            )));
        }
        Ok(domain)
    }

    /// Tests whether the firmware described a channel.
    ///
    /// # Arguments
    ///
    /// * `ch` - The channel address to test.
    ///
    /// # Returns
    ///
    /// `true` when the channel exists.
    pub fn has_channel(&self, ch: ChannelId) -> bool {
        self.check_channel(ch).is_ok()
    }

    /// Resolves a device-agent collection and virtual channel to the
    /// channel address in the collection's domain.
    ///
    /// # Arguments
    ///
    /// * `collection` - Device-agent collection id from the firmware table.
    /// * `vc` - Virtual channel within the collection's domain.
    ///
    /// # Returns
    ///
    /// The channel address to use with the channel operations.
    pub fn channel_for_device(&self, collection: u16, vc: u16) -> Result<ChannelId> {
        let domain = self
            .table
            .domains
            .iter()
            .position(|d| d.device_collections.contains(&collection))
            .ok_or_else(|| {
                Error::param(format!("no domain carries device collection {collection}"))
            })?;
        let ch = ChannelId {
            domain: domain as u16,
            channel: vc,
        };
        self.check_channel(ch)?;
        Ok(ch)
    }

    /// Monitoring-ID count of a domain.
    ///
    /// # Arguments
    ///
    /// * `domain` - Domain index in table order.
    ///
    /// # Returns
    ///
    /// The domain's monitoring-ID count.
    pub fn domain_max_rmids(&self, domain: u16) -> Result<u32> {
        Ok(self.domain(domain)?.meta.max_rmids)
    }

    /// Per-channel association entry: class in the upper half, monitoring
    /// ID in the lower half of one 32-bit table slot.
    fn assoc_offset(domain: &MmioDomain, ch: ChannelId) -> Result<(usize, &Mapping)> {
        let card = domain
            .meta
            .cache_alloc
            .ok_or(Error::InterfaceUnsupported)?;
        let mapping = domain.cache_alloc.as_ref().ok_or(Error::InterfaceUnsupported)?;
        let stride = usize::from(card.reg_block_size.max(4));
        Ok((
            usize::from(card.reg_offset) + usize::from(ch.channel) * stride,
            mapping,
        ))
    }

    /// Associates a channel with a class of service, preserving its
    /// monitoring ID.
    ///
    /// # Arguments
    ///
    /// * `ch` - Channel to associate.
    /// * `class_id` - Target class; bounded by the table's maximum.
    pub fn channel_class_set(&self, ch: ChannelId, class_id: u32) -> Result<()> {
        if class_id >= self.table.max_clos {
            return Err(Error::param(format!(
                "class {class_id} exceeds I/O maximum {}",
                self.table.max_clos
            )));
        }
        let domain = self.check_channel(ch)?;
        let (off, mapping) = Self::assoc_offset(domain, ch)?;
        let prev = mapping.read_u32(off)?;
        mapping.write_u32(off, (class_id << 16) | (prev & 0xFFFF))
    }

    /// Reads back a channel's class of service.
    ///
    /// # Arguments
    ///
    /// * `ch` - Channel to query.
    ///
    /// # Returns
    ///
    /// The class of service in the channel's table slot.
    pub fn channel_class_get(&self, ch: ChannelId) -> Result<u32> {
        let domain = self.check_channel(ch)?;
        let (off, mapping) = Self::assoc_offset(domain, ch)?;
        Ok(mapping.read_u32(off)? >> 16)
    }

    /// Associates a channel with a monitoring ID, preserving its class.
    ///
    /// # Arguments
    ///
    /// * `ch` - Channel to bind.
    /// * `rmid` - Monitoring ID to bind it to.
    pub fn channel_rmid_set(&self, ch: ChannelId, rmid: u32) -> Result<()> {
        let domain = self.check_channel(ch)?;
        let (off, mapping) = Self::assoc_offset(domain, ch)?;
        let prev = mapping.read_u32(off)?;
        mapping.write_u32(off, (prev & 0xFFFF_0000) | (rmid & 0xFFFF))
    }

    /// Reads a channel's cache-occupancy counter.
    ///
    /// # Arguments
    ///
    /// * `ch` - Channel to read.
    ///
    /// # Returns
    ///
    /// The occupancy scaled to bytes by the block's factor.
    pub fn channel_occupancy(&self, ch: ChannelId) -> Result<u64> {
        let domain = self.check_channel(ch)?;
        let cmrd = domain.meta.cache_mon.ok_or(Error::InterfaceUnsupported)?;
        let mapping = domain.cache_mon.as_ref().ok_or(Error::InterfaceUnsupported)?;
        let off = usize::from(cmrd.counter_offset)
            + usize::from(ch.channel) * usize::from(cmrd.clump_size.max(8));
        Ok(mapping.read_u64(off)?.wrapping_mul(cmrd.upscale.max(1)))
    }

    /// Reads a channel's bandwidth counters.
    ///
    /// # Arguments
    ///
    /// * `ch` - Channel to read.
    ///
    /// # Returns
    ///
    /// The `(total, miss)` raw counter values.
    pub fn channel_bandwidth(&self, ch: ChannelId) -> Result<(u64, u64)> {
        let domain = self.check_channel(ch)?;
        let ibrd = domain.meta.io_bw_mon.ok_or(Error::InterfaceUnsupported)?;
        let mapping = domain.io_bw.as_ref().ok_or(Error::InterfaceUnsupported)?;
        let idx = usize::from(ch.channel);
        let total = mapping.read_u64(
            usize::from(ibrd.total_offset) + idx * usize::from(ibrd.total_clump.max(8)),
        )?;
        let miss = mapping.read_u64(
            usize::from(ibrd.miss_offset) + idx * usize::from(ibrd.miss_clump.max(8)),
        )?;
        Ok((total, miss))
    }

    /// Bandwidth counter width of a domain.
    ///
    /// # Arguments
    ///
    /// * `domain` - Domain index in table order.
    ///
    /// # Returns
    ///
    /// The width in bits; 0 when unknown.
    pub fn bw_counter_width(&self, domain: u16) -> u8 {
        self.domains
            .get(domain as usize)
            .and_then(|d| d.meta.io_bw_mon)
            .map_or(0, |b| b.counter_width)
    }

    /// Clears every channel association in every domain.
    pub fn reset_associations(&self) -> Result<()> {
        for (domain_idx, domain) in self.domains.iter().enumerate() {
            let channels = domain.meta.num_channels();
            for channel in 0..channels {
                let ch = ChannelId {
                    domain: domain_idx as u16,
                    channel: channel as u16,
                };
                let (off, mapping) = match Self::assoc_offset(domain, ch) {
                    Ok(v) => v,
                    Err(Error::InterfaceUnsupported) => break,
                    Err(e) => return Err(e),
                };
                mapping.write_u32(off, 0)?;
            }
        }
        Ok(())
    }
}
