//! ERDT firmware table parser.
//!
//! The platform describes its I/O-side resource-management domains in an
//! ACPI table with signature `ERDT`: a standard 36-byte ACPI header, a
//! 4-byte maximum class count, 24 reserved bytes, then a sequence of
//! sub-structures each led by a 2-byte type code and a 2-byte length.
//!
//! Type codes form a closed set (0..10). A resource-management-domain
//! description (RMDD) opens a domain; the structures that follow attach to
//! it until the next RMDD. Unknown types are skipped by their length;
//! truncated records and unaligned register bases are rejected.

use tracing::{debug, warn};

use crate::common::{Error, Result};

/// ACPI header length preceding the ERDT body.
const ACPI_HEADER_LEN: usize = 36;
/// Reserved area between `max_clos` and the first sub-structure.
const ERDT_RESERVED_LEN: usize = 24;
/// Table signature.
pub const ERDT_SIGNATURE: &[u8; 4] = b"ERDT";

/// Sub-structure type codes.
const TYPE_RMDD: u16 = 0;
const TYPE_CACD: u16 = 1;
const TYPE_DACD: u16 = 2;
const TYPE_CMRC: u16 = 3;
const TYPE_MMRC: u16 = 4;
const TYPE_MARC: u16 = 5;
const TYPE_CARC: u16 = 6;
const TYPE_CMRD: u16 = 7;
const TYPE_IBRD: u16 = 8;
const TYPE_IBAD: u16 = 9;
const TYPE_CARD: u16 = 10;
/// Highest known type code.
const TYPE_MAX: u16 = TYPE_CARD;

/// Cache-monitoring register block for device agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmrdBlock {
    /// Physical base of the register block; page aligned.
    pub base: u64,
    /// Block size in bytes.
    pub size: u32,
    /// Offset of the first occupancy counter within the block.
    pub counter_offset: u16,
    /// Stride between per-channel counters.
    pub clump_size: u16,
    /// Factor converting raw counts to bytes.
    pub upscale: u64,
}

/// I/O bandwidth-monitoring register block for device agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IbrdBlock {
    /// Physical base of the register block; page aligned.
    pub base: u64,
    /// Block size in bytes.
    pub size: u32,
    /// Offset of the total-bandwidth counters.
    pub total_offset: u16,
    /// Offset of the miss-bandwidth counters.
    pub miss_offset: u16,
    /// Stride between per-channel total counters.
    pub total_clump: u16,
    /// Stride between per-channel miss counters.
    pub miss_clump: u16,
    /// Counter width in bits.
    pub counter_width: u8,
    /// Factor converting raw counts to bytes.
    pub upscale: u64,
}

/// Cache-allocation register block for device agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardBlock {
    /// Block flags.
    pub flags: u32,
    /// Ways shared with other agents.
    pub contention: u32,
    /// Physical base of the register block; page aligned.
    pub base: u64,
    /// Block size in bytes.
    pub size: u32,
    /// Offset of the first per-channel class register.
    pub reg_offset: u16,
    /// Stride between per-channel class registers.
    pub reg_block_size: u16,
}

/// One I/O resource-management domain.
#[derive(Debug, Clone, Default)]
pub struct ErdtDomain {
    /// Domain id referenced by device collections.
    pub domain_id: u16,
    /// Domain flags from the RMDD record.
    pub flags: u16,
    /// Monitoring-ID count for this domain's channels.
    pub max_rmids: u32,
    /// Physical base of the domain control block; page aligned.
    pub control_base: u64,
    /// Control block size in bytes.
    pub control_size: u16,
    /// Device-agent collection ids attached to this domain.
    pub device_collections: Vec<u16>,
    /// Cache-occupancy monitoring block, when offered.
    pub cache_mon: Option<CmrdBlock>,
    /// Bandwidth monitoring block, when offered.
    pub io_bw_mon: Option<IbrdBlock>,
    /// Cache-allocation block, when offered.
    pub cache_alloc: Option<CardBlock>,
}

impl ErdtDomain {
    /// # Returns
    ///
    /// The number of device channels addressable in this domain, derived
    /// from the densest register block present.
    pub fn num_channels(&self) -> u32 {
        if let Some(card) = &self.cache_alloc {
            let stride = u32::from(card.reg_block_size.max(4));
            return (card.size.saturating_sub(u32::from(card.reg_offset))) / stride;
        }
        if let Some(cmrd) = &self.cache_mon {
            let stride = u32::from(cmrd.clump_size.max(8));
            return (cmrd.size.saturating_sub(u32::from(cmrd.counter_offset))) / stride;
        }
        0
    }
}

/// Parsed ERDT table.
#[derive(Debug, Clone, Default)]
pub struct ErdtTable {
    /// Maximum class count supported by the I/O agents.
    pub max_clos: u32,
    /// Resource-management domains in table order.
    pub domains: Vec<ErdtDomain>,
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn get(&self, off: usize, len: usize) -> Result<&'a [u8]> {
        self.buf
            .get(off..off + len)
            .ok_or_else(|| Error::Parse(format!("truncated record at offset {off}")))
    }

    fn u8(&self, off: usize) -> Result<u8> {
        Ok(self.get(off, 1)?[0])
    }

    fn u16(&self, off: usize) -> Result<u16> {
        let b = self.get(off, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, off: usize) -> Result<u32> {
        let b = self.get(off, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&self, off: usize) -> Result<u64> {
        let b = self.get(off, 8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }
}

fn check_aligned(base: u64, what: &str) -> Result<()> {
    if base & 0xFFF != 0 {
        return Err(Error::Parse(format!(
            "{what} register base {base:#x} is not page aligned"
        )));
    }
    Ok(())
}

/// Parses a full ERDT table, ACPI header included.
///
/// # Arguments
///
/// * `bytes` - The raw table as read from firmware.
///
/// # Returns
///
/// The maximum class count and the resource-management domains with their
/// register blocks attached.
pub fn parse(bytes: &[u8]) -> Result<ErdtTable> {
    let c = Cursor { buf: bytes };
    if c.get(0, 4)? != ERDT_SIGNATURE {
        return Err(Error::Parse("bad table signature".into()));
    }
    let table_len = c.u32(4)? as usize;
    if table_len > bytes.len() || table_len < ACPI_HEADER_LEN + 4 + ERDT_RESERVED_LEN {
        return Err(Error::Parse(format!(
            "table length {table_len} out of range for {} bytes",
            bytes.len()
        )));
    }

    let max_clos = c.u32(ACPI_HEADER_LEN)?;
    let mut table = ErdtTable {
        max_clos,
        domains: Vec::new(),
    };

    let mut off = ACPI_HEADER_LEN + 4 + ERDT_RESERVED_LEN;
    while off + 4 <= table_len {
        let stype = c.u16(off)?;
        let len = c.u16(off + 2)? as usize;
        if len < 4 || off + len > table_len {
            return Err(Error::Parse(format!(
                "record type {stype} at offset {off} has bad length {len}"
            )));
        }
        match stype {
            TYPE_RMDD => {
                let control_base = c.u64(off + 24)?;
                check_aligned(control_base, "domain control")?;
                table.domains.push(ErdtDomain {
                    domain_id: c.u16(off + 18)?,
                    flags: c.u16(off + 4)?,
                    max_rmids: c.u32(off + 20)?,
                    control_base,
                    control_size: c.u16(off + 32)?,
                    ..ErdtDomain::default()
                });
            }
            TYPE_DACD => {
                let collection = c.u16(off + 6)?;
                if let Some(domain) = table.domains.last_mut() {
                    domain.device_collections.push(collection);
                } else {
                    warn!(collection, "device collection before any domain");
                }
            }
            TYPE_CMRD => {
                let block = CmrdBlock {
                    base: c.u64(off + 24)?,
                    size: c.u32(off + 32)?,
                    counter_offset: c.u16(off + 36)?,
                    clump_size: c.u16(off + 38)?,
                    upscale: c.u64(off + 40)?,
                };
                check_aligned(block.base, "cache monitoring")?;
                attach(&mut table, off, |d| d.cache_mon = Some(block))?;
            }
            TYPE_IBRD => {
                let block = IbrdBlock {
                    base: c.u64(off + 24)?,
                    size: c.u32(off + 32)?,
                    total_offset: c.u16(off + 36)?,
                    miss_offset: c.u16(off + 38)?,
                    total_clump: c.u16(off + 40)?,
                    miss_clump: c.u16(off + 42)?,
                    counter_width: c.u8(off + 51)?,
                    upscale: c.u64(off + 52)?,
                };
                check_aligned(block.base, "bandwidth monitoring")?;
                attach(&mut table, off, |d| d.io_bw_mon = Some(block))?;
            }
            TYPE_CARD => {
                let block = CardBlock {
                    flags: c.u32(off + 8)?,
                    contention: c.u32(off + 12)?,
                    base: c.u64(off + 28)?,
                    size: c.u32(off + 36)?,
                    reg_offset: c.u16(off + 40)?,
                    reg_block_size: c.u16(off + 42)?,
                };
                check_aligned(block.base, "cache allocation")?;
                attach(&mut table, off, |d| d.cache_alloc = Some(block))?;
            }
            TYPE_CACD | TYPE_CMRC | TYPE_MMRC | TYPE_MARC | TYPE_CARC | TYPE_IBAD => {
                // CPU-agent register blocks are reached through MSRs; the
                // records are recognised but carry nothing we consume.
            }
            other if other <= TYPE_MAX => {}
            other => {
                debug!(stype = other, len, "skipping unknown record type");
            }
        }
        off += len;
    }

    debug!(
        max_clos,
        domains = table.domains.len(),
        "ERDT table parsed"
    );
    Ok(table)
}

fn attach(table: &mut ErdtTable, off: usize, f: impl FnOnce(&mut ErdtDomain)) -> Result<()> {
    let domain = table
        .domains
        .last_mut()
        .ok_or_else(|| Error::Parse(format!("register block at offset {off} before any domain")))?;
    f(domain);
    Ok(())
}
