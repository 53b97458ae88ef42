//! ERDT firmware table parser tests.

use pqctl_core::backend::mmio::erdt;
use pretty_assertions::assert_eq;

/// Byte-level record builder.
struct Rec {
    bytes: Vec<u8>,
}

impl Rec {
    fn new(ty: u16, len: u16) -> Self {
        let mut bytes = vec![0u8; len as usize];
        bytes[0..2].copy_from_slice(&ty.to_le_bytes());
        bytes[2..4].copy_from_slice(&len.to_le_bytes());
        Self { bytes }
    }

    fn u16_at(mut self, off: usize, val: u16) -> Self {
        self.bytes[off..off + 2].copy_from_slice(&val.to_le_bytes());
        self
    }

    fn u32_at(mut self, off: usize, val: u32) -> Self {
        self.bytes[off..off + 4].copy_from_slice(&val.to_le_bytes());
        self
    }

    fn u64_at(mut self, off: usize, val: u64) -> Self {
        self.bytes[off..off + 8].copy_from_slice(&val.to_le_bytes());
        self
    }

    fn u8_at(mut self, off: usize, val: u8) -> Self {
        self.bytes[off] = val;
        self
    }
}

fn rmdd(domain_id: u16, max_rmids: u32, control_base: u64) -> Rec {
    Rec::new(0, 34)
        .u16_at(18, domain_id)
        .u32_at(20, max_rmids)
        .u64_at(24, control_base)
        .u16_at(32, 0x1000)
}

fn card(base: u64, size: u32) -> Rec {
    Rec::new(10, 44)
        .u32_at(8, 0x1)
        .u32_at(12, 0x3)
        .u64_at(28, base)
        .u32_at(36, size)
        .u16_at(40, 0)
        .u16_at(42, 4)
}

fn cmrd(base: u64, size: u32) -> Rec {
    Rec::new(7, 48)
        .u64_at(24, base)
        .u32_at(32, size)
        .u16_at(36, 0)
        .u16_at(38, 8)
        .u64_at(40, 64)
}

fn ibrd(base: u64, size: u32, width: u8) -> Rec {
    Rec::new(8, 64)
        .u64_at(24, base)
        .u32_at(32, size)
        .u16_at(36, 0)
        .u16_at(38, 0x800)
        .u16_at(40, 8)
        .u16_at(42, 8)
        .u8_at(51, width)
        .u64_at(52, 64)
}

/// Assembles a full table: ACPI header, max_clos, reserved, records.
fn table(max_clos: u32, records: &[Rec]) -> Vec<u8> {
    let mut body = Vec::new();
    for rec in records {
        body.extend_from_slice(&rec.bytes);
    }
    let total = 36 + 4 + 24 + body.len();
    let mut bytes = vec![0u8; 36];
    bytes[0..4].copy_from_slice(b"ERDT");
    bytes[4..8].copy_from_slice(&(total as u32).to_le_bytes());
    bytes.extend_from_slice(&max_clos.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 24]);
    bytes.extend_from_slice(&body);
    bytes
}

#[test]
fn test_parse_header_and_domain() {
    let bytes = table(8, &[rmdd(0, 32, 0xFEC0_0000)]);
    let parsed = erdt::parse(&bytes).unwrap();
    assert_eq!(parsed.max_clos, 8);
    assert_eq!(parsed.domains.len(), 1);
    let d = &parsed.domains[0];
    assert_eq!(d.domain_id, 0);
    assert_eq!(d.max_rmids, 32);
    assert_eq!(d.control_base, 0xFEC0_0000);
    assert_eq!(d.control_size, 0x1000);
}

#[test]
fn test_register_blocks_attach_to_open_domain() {
    let bytes = table(
        8,
        &[
            rmdd(0, 32, 0xFEC0_0000),
            card(0xFEC1_0000, 64),
            cmrd(0xFEC2_0000, 256),
            rmdd(1, 16, 0xFED0_0000),
            ibrd(0xFED1_0000, 512, 32),
        ],
    );
    let parsed = erdt::parse(&bytes).unwrap();
    assert_eq!(parsed.domains.len(), 2);

    let d0 = &parsed.domains[0];
    let alloc = d0.cache_alloc.unwrap();
    assert_eq!(alloc.base, 0xFEC1_0000);
    assert_eq!(alloc.contention, 0x3);
    assert_eq!(d0.cache_mon.unwrap().clump_size, 8);
    assert!(d0.io_bw_mon.is_none());
    // 64-byte block with 4-byte entries addresses 16 channels.
    assert_eq!(d0.num_channels(), 16);

    let d1 = &parsed.domains[1];
    assert!(d1.cache_alloc.is_none());
    assert_eq!(d1.io_bw_mon.unwrap().counter_width, 32);
}

#[test]
fn test_unknown_types_are_skipped() {
    // Type 4 (CPU-agent bandwidth block) is known but not consumed; a
    // type beyond the closed set is skipped by length.
    let mystery = Rec::new(99, 24);
    let bytes = table(4, &[rmdd(0, 8, 0x1000_0000), mystery, card(0x2000_0000, 16)]);
    let parsed = erdt::parse(&bytes).unwrap();
    assert_eq!(parsed.domains.len(), 1);
    assert!(parsed.domains[0].cache_alloc.is_some());
}

#[test]
fn test_bad_signature_rejected() {
    let mut bytes = table(4, &[]);
    bytes[0..4].copy_from_slice(b"XSDT");
    assert!(erdt::parse(&bytes).is_err());
}

#[test]
fn test_truncated_record_rejected() {
    let mut bytes = table(4, &[rmdd(0, 8, 0x1000_0000)]);
    // Claim a record length running past the table end.
    let off = 36 + 4 + 24;
    bytes[off + 2..off + 4].copy_from_slice(&500u16.to_le_bytes());
    assert!(erdt::parse(&bytes).is_err());
}

#[test]
fn test_short_table_rejected() {
    assert!(erdt::parse(b"ERDT").is_err());
    let mut bytes = table(4, &[]);
    bytes[4..8].copy_from_slice(&10_000u32.to_le_bytes());
    assert!(erdt::parse(&bytes).is_err());
}

#[test]
fn test_unaligned_register_base_rejected() {
    let bytes = table(4, &[rmdd(0, 8, 0x1000_0800)]);
    assert!(erdt::parse(&bytes).is_err());
    let bytes = table(4, &[rmdd(0, 8, 0x1000_0000), card(0xFEC1_0004, 64)]);
    assert!(erdt::parse(&bytes).is_err());
}

#[test]
fn test_block_before_domain_rejected() {
    let bytes = table(4, &[card(0xFEC1_0000, 64)]);
    assert!(erdt::parse(&bytes).is_err());
}
