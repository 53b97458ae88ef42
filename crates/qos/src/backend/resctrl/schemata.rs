//! Resctrl schemata text format.
//!
//! One schemata block describes a single class of service across all
//! domains of each technology:
//!
//! ```text
//! L3:0=ffff;1=ffff
//! L3CODE:0=ff;1=ff      (while code/data partitioning is on)
//! L3DATA:0=ff00;1=ff00
//! L2:0=ff
//! MB:0=100;1=70
//! SMBA:0=2048
//! ```
//!
//! Mask values are hexadecimal, bandwidth values decimal. The parser
//! tolerates leading whitespace and skips unknown labels; range checking
//! against the capability catalog happens in the allocation manager, not
//! here.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::common::{Error, Result};

/// Parsed or to-be-emitted schemata block for one class of service.
///
/// Keys are domain ids. Empty maps are omitted on emit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schemata {
    /// L3 way masks while code/data partitioning is off.
    pub l3: BTreeMap<u32, u64>,
    /// L3 code-side way masks while partitioning is on.
    pub l3_code: BTreeMap<u32, u64>,
    /// L3 data-side way masks while partitioning is on.
    pub l3_data: BTreeMap<u32, u64>,
    /// L2 way masks while code/data partitioning is off.
    pub l2: BTreeMap<u32, u64>,
    /// L2 code-side way masks while partitioning is on.
    pub l2_code: BTreeMap<u32, u64>,
    /// L2 data-side way masks while partitioning is on.
    pub l2_data: BTreeMap<u32, u64>,
    /// Memory-bandwidth values, percent or MBps per the controller mode.
    pub mb: BTreeMap<u32, u64>,
    /// Slow-memory-bandwidth targets in MBps.
    pub smba: BTreeMap<u32, u64>,
}

fn emit_line(out: &mut String, label: &str, entries: &BTreeMap<u32, u64>, hex: bool) {
    if entries.is_empty() {
        return;
    }
    out.push_str(label);
    out.push(':');
    for (i, (id, val)) in entries.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        if hex {
            let _ = write!(out, "{id}={val:x}");
        } else {
            let _ = write!(out, "{id}={val}");
        }
    }
    out.push('\n');
}

impl Schemata {
    /// Renders the block in the kernel's line format.
    ///
    /// # Returns
    ///
    /// The textual block, one line per non-empty technology.
    pub fn emit(&self) -> String {
        let mut out = String::new();
        emit_line(&mut out, "L3", &self.l3, true);
        emit_line(&mut out, "L3CODE", &self.l3_code, true);
        emit_line(&mut out, "L3DATA", &self.l3_data, true);
        emit_line(&mut out, "L2", &self.l2, true);
        emit_line(&mut out, "L2CODE", &self.l2_code, true);
        emit_line(&mut out, "L2DATA", &self.l2_data, true);
        emit_line(&mut out, "MB", &self.mb, false);
        emit_line(&mut out, "SMBA", &self.smba, false);
        out
    }

    /// Parses a schemata block.
    ///
    /// Lines with unrecognised labels are skipped so that a kernel newer
    /// than this library does not break parsing; malformed entries on a
    /// recognised line are structural errors.
    ///
    /// # Arguments
    ///
    /// * `text` - The block as read from a schemata file.
    ///
    /// # Returns
    ///
    /// The parsed per-domain tables.
    pub fn parse(text: &str) -> Result<Schemata> {
        let mut out = Schemata::default();
        for raw in text.lines() {
            let line = raw.trim_start();
            if line.is_empty() {
                continue;
            }
            let (label, rest) = line
                .split_once(':')
                .ok_or_else(|| Error::Parse(format!("missing label separator: {line:?}")))?;
            let (entries, hex) = match label.trim().to_ascii_uppercase().as_str() {
                "L3" => (&mut out.l3, true),
                "L3CODE" => (&mut out.l3_code, true),
                "L3DATA" => (&mut out.l3_data, true),
                "L2" => (&mut out.l2, true),
                "L2CODE" => (&mut out.l2_code, true),
                "L2DATA" => (&mut out.l2_data, true),
                "MB" => (&mut out.mb, false),
                "SMBA" => (&mut out.smba, false),
                _ => continue,
            };
            for entry in rest.trim().split(';') {
                let entry = entry.trim();
                if entry.is_empty() {
                    continue;
                }
                let (id, val) = entry
                    .split_once('=')
                    .ok_or_else(|| Error::Parse(format!("malformed entry: {entry:?}")))?;
                let id: u32 = id
                    .trim()
                    .parse()
                    .map_err(|_| Error::Parse(format!("bad domain id: {entry:?}")))?;
                let val = if hex {
                    u64::from_str_radix(val.trim(), 16)
                } else {
                    val.trim().parse()
                }
                .map_err(|_| Error::Parse(format!("bad value: {entry:?}")))?;
                entries.insert(id, val);
            }
        }
        Ok(out)
    }
}
