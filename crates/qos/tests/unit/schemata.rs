//! Resctrl schemata encoder/decoder tests.

use std::collections::BTreeMap;

use pqctl_core::backend::resctrl::schemata::Schemata;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn map(entries: &[(u32, u64)]) -> BTreeMap<u32, u64> {
    entries.iter().copied().collect()
}

#[test]
fn test_emit_plain() {
    let sch = Schemata {
        l3: map(&[(0, 0xFFFF), (1, 0xF0)]),
        mb: map(&[(0, 100), (1, 70)]),
        ..Schemata::default()
    };
    assert_eq!(sch.emit(), "L3:0=ffff;1=f0\nMB:0=100;1=70\n");
}

#[test]
fn test_emit_cdp() {
    let sch = Schemata {
        l3_code: map(&[(0, 0xF0)]),
        l3_data: map(&[(0, 0x0F)]),
        ..Schemata::default()
    };
    assert_eq!(sch.emit(), "L3CODE:0=f0\nL3DATA:0=f\n");
}

#[test]
fn test_parse_masks_are_hex_and_mb_decimal() {
    let sch = Schemata::parse("L3:0=ff\nMB:0=70\n").unwrap();
    assert_eq!(sch.l3.get(&0), Some(&0xFF));
    assert_eq!(sch.mb.get(&0), Some(&70));
}

#[test]
fn test_parse_tolerates_whitespace_and_unknown_labels() {
    let text = "  L3:0=ffff;1=ffff\nL4WAYS:0=10\nL2:0=ff\n";
    let sch = Schemata::parse(text).unwrap();
    assert_eq!(sch.l3.len(), 2);
    assert_eq!(sch.l2.get(&0), Some(&0xFF));
}

#[test]
fn test_smba_line_roundtrip() {
    let sch = Schemata {
        smba: map(&[(0, 2048), (1, 1024)]),
        ..Schemata::default()
    };
    assert_eq!(sch.emit(), "SMBA:0=2048;1=1024\n");
    assert_eq!(Schemata::parse(&sch.emit()).unwrap(), sch);
    // Decimal like MB, not hex.
    let parsed = Schemata::parse("SMBA:0=10\n").unwrap();
    assert_eq!(parsed.smba.get(&0), Some(&10));
}

#[test]
fn test_parse_rejects_structural_errors() {
    assert!(Schemata::parse("L3;0=ff\n").is_err());
    assert!(Schemata::parse("L3:0-ff\n").is_err());
    assert!(Schemata::parse("L3:x=ff\n").is_err());
    assert!(Schemata::parse("MB:0=zz\n").is_err());
}

#[test]
fn test_parse_empty_is_empty() {
    let sch = Schemata::parse("").unwrap();
    assert_eq!(sch, Schemata::default());
}

#[test]
fn test_roundtrip_mixed() {
    let sch = Schemata {
        l3: map(&[(0, 0xFFFF), (1, 0x3C)]),
        l2: map(&[(0, 0xFF)]),
        mb: map(&[(0, 100), (1, 30)]),
        ..Schemata::default()
    };
    assert_eq!(Schemata::parse(&sch.emit()).unwrap(), sch);
}

fn domain_map(max_val: u64) -> impl Strategy<Value = BTreeMap<u32, u64>> {
    prop::collection::btree_map(0u32..8, 1u64..=max_val, 0..4)
}

proptest! {
    /// parse(emit(table)) == table for any legal table.
    #[test]
    fn prop_roundtrip(
        l3 in domain_map(0xFFFF),
        l2 in domain_map(0xFF),
        mb in domain_map(4096),
        smba in domain_map(8192),
    ) {
        let sch = Schemata { l3, l2, mb, smba, ..Schemata::default() };
        prop_assert_eq!(Schemata::parse(&sch.emit()).unwrap(), sch);
    }

    /// The code/data form survives as well.
    #[test]
    fn prop_roundtrip_cdp(
        code in domain_map(0xFFFF),
        data in domain_map(0xFFFF),
    ) {
        let sch = Schemata { l3_code: code, l3_data: data, ..Schemata::default() };
        prop_assert_eq!(Schemata::parse(&sch.emit()).unwrap(), sch);
    }
}
