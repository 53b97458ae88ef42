//! Allocation manager tests on the register back-end.

use pqctl_core::config::Toggle;
use pqctl_core::hw::msr::{MSR_ASSOC, MSR_L3_QOS_CFG, MSR_SMBA_MASK_START};
use pqctl_core::{
    CatCos, Config, Error, MbaCos, ResetConfig, Technologies, Technology,
};
use pretty_assertions::assert_eq;

use crate::common::platform::toy_msr;
use crate::common::{amd_cpuid, toy_qos, toy_qos_custom, toy_qos_with, MockMsr};

const L3_MASK_BASE: u32 = 0xC90;
const L2_MASK_BASE: u32 = 0xC10;
const MBA_BASE: u32 = 0xD50;

fn cos_of(msr: &MockMsr, core: u32) -> u64 {
    msr.get(core, MSR_ASSOC) >> 32
}

#[test]
fn test_set_l3_writes_domain_representative() {
    let t = toy_qos();
    t.qos.l3ca_set(0, 1, CatCos::Mask(0xF0)).unwrap();
    assert_eq!(t.msr.get(0, L3_MASK_BASE + 1), 0xF0);
    // Domain 1 is served from its own socket's representative core.
    t.qos.l3ca_set(1, 2, CatCos::Mask(0x3C)).unwrap();
    assert_eq!(t.msr.get(4, L3_MASK_BASE + 2), 0x3C);
    // Read-back equals the last successful write.
    assert_eq!(t.qos.l3ca_get(0, 1).unwrap(), CatCos::Mask(0xF0));
    assert_eq!(t.qos.l3ca_get(1, 2).unwrap(), CatCos::Mask(0x3C));
}

#[test]
fn test_set_l3_parameter_checks() {
    let t = toy_qos();
    // Class out of range.
    assert!(matches!(
        t.qos.l3ca_set(0, 4, CatCos::Mask(0xF)),
        Err(Error::Parameter(_))
    ));
    // Mask wider than 16 ways.
    assert!(matches!(
        t.qos.l3ca_set(0, 0, CatCos::Mask(0x1FFFF)),
        Err(Error::Parameter(_))
    ));
    // Empty mask.
    assert!(matches!(
        t.qos.l3ca_set(0, 0, CatCos::Mask(0)),
        Err(Error::Parameter(_))
    ));
    // Non-contiguous mask on a platform without that support.
    assert!(matches!(
        t.qos.l3ca_set(0, 0, CatCos::Mask(0xF0F)),
        Err(Error::Parameter(_))
    ));
    // Unknown domain.
    assert!(matches!(
        t.qos.l3ca_set(7, 0, CatCos::Mask(0xF)),
        Err(Error::Parameter(_))
    ));
    // Two-mask form while partitioning is off.
    assert!(matches!(
        t.qos.l3ca_set(0, 0, CatCos::Cdp { code: 0xF0, data: 0x0F }),
        Err(Error::Parameter(_))
    ));
}

#[test]
fn test_set_l2_uses_l2_domains() {
    let t = toy_qos();
    // L2 clusters are per-core on the toy platform.
    t.qos.l2ca_set(3, 1, CatCos::Mask(0xF0)).unwrap();
    assert_eq!(t.msr.get(3, L2_MASK_BASE + 1), 0xF0);
    assert_eq!(t.qos.l2ca_get(3, 1).unwrap(), CatCos::Mask(0xF0));
    // 8-way L2 rejects a 9-bit mask.
    assert!(matches!(
        t.qos.l2ca_set(3, 1, CatCos::Mask(0x100)),
        Err(Error::Parameter(_))
    ));
}

#[test]
fn test_mba_rounds_down_to_step() {
    let t = toy_qos();
    // Step is 10: a 33% request lands on 30%.
    let actual = t
        .qos
        .mba_set(0, 1, MbaCos { mb_max: 33, ctrl: false })
        .unwrap();
    assert_eq!(actual, 30);
    // The register holds the complementary delay.
    assert_eq!(t.msr.get(0, MBA_BASE + 1), 70);
    assert_eq!(
        t.qos.mba_get(0, 1).unwrap(),
        MbaCos { mb_max: 30, ctrl: false }
    );
    // Requests below one step clamp up to the step.
    let actual = t
        .qos
        .mba_set(0, 2, MbaCos { mb_max: 7, ctrl: false })
        .unwrap();
    assert_eq!(actual, 10);
}

#[test]
fn test_mba_parameter_checks() {
    let t = toy_qos();
    for bad in [0u32, 101] {
        assert!(matches!(
            t.qos.mba_set(0, 0, MbaCos { mb_max: bad, ctrl: false }),
            Err(Error::Parameter(_))
        ));
    }
    assert!(matches!(
        t.qos.mba_set(0, 4, MbaCos { mb_max: 50, ctrl: false }),
        Err(Error::Parameter(_))
    ));
    // MBps targets need the controller, which the register back-end does
    // not offer.
    assert!(matches!(
        t.qos.mba_set(0, 0, MbaCos { mb_max: 2000, ctrl: true }),
        Err(Error::Resource(_))
    ));
}

#[test]
fn test_smba_absent_without_amd_leaf() {
    let t = toy_qos();
    let caps = t.qos.capabilities().unwrap();
    assert!(caps.smba.is_none());
    assert!(matches!(
        t.qos.smba_set(0, 1, 2048),
        Err(Error::Resource(_))
    ));
}

#[test]
fn test_smba_set_writes_mbps_target() {
    let t = toy_qos_custom(Config::default(), toy_msr(), amd_cpuid());
    let caps = t.qos.capabilities().unwrap();
    let smba = caps.smba.unwrap();
    assert_eq!(smba.num_classes, 4);
    assert_eq!(smba.throttle_max, 4096);
    assert!(smba.ctrl_enabled);

    // The register holds the absolute MBps value; domains follow sockets.
    t.qos.smba_set(0, 1, 2048).unwrap();
    assert_eq!(t.msr.get(0, MSR_SMBA_MASK_START + 1), 2048);
    t.qos.smba_set(1, 2, 1024).unwrap();
    assert_eq!(t.msr.get(4, MSR_SMBA_MASK_START + 2), 1024);

    assert_eq!(
        t.qos.smba_get(0, 1).unwrap(),
        MbaCos { mb_max: 2048, ctrl: true }
    );
}

#[test]
fn test_smba_parameter_checks() {
    let t = toy_qos_custom(Config::default(), toy_msr(), amd_cpuid());
    assert!(matches!(t.qos.smba_set(0, 1, 0), Err(Error::Parameter(_))));
    assert!(matches!(t.qos.smba_set(0, 4, 100), Err(Error::Parameter(_))));
    assert!(matches!(t.qos.smba_set(9, 1, 100), Err(Error::Parameter(_))));
}

#[test]
fn test_smba_reset_lifts_throttle() {
    let t = toy_qos_custom(Config::default(), toy_msr(), amd_cpuid());
    t.qos.smba_set(0, 1, 2048).unwrap();
    t.qos.alloc_reset(ResetConfig::default()).unwrap();
    // Zero in the register means unthrottled.
    assert_eq!(t.msr.get(0, MSR_SMBA_MASK_START + 1), 0);
    assert_eq!(t.qos.smba_get(0, 1).unwrap().mb_max, u32::MAX);
}

#[test]
fn test_assoc_core_preserves_monitoring_id() {
    let t = toy_qos();
    t.msr.set(3, MSR_ASSOC, 7);
    t.qos.assoc_core(3, 2).unwrap();
    assert_eq!(t.msr.get(3, MSR_ASSOC), (2u64 << 32) | 7);
    assert_eq!(t.qos.assoc_core_get(3).unwrap(), 2);
}

#[test]
fn test_assoc_parameter_checks() {
    let t = toy_qos();
    assert!(matches!(
        t.qos.assoc_core(9, 1),
        Err(Error::Parameter(_))
    ));
    assert!(matches!(
        t.qos.assoc_core(0, 4),
        Err(Error::Parameter(_))
    ));
    assert!(matches!(
        t.qos.assoc_task(1234, 1),
        Err(Error::InterfaceUnsupported)
    ));
}

#[test]
fn test_assign_takes_highest_unused_class() {
    let t = toy_qos();
    let l3 = Technologies::of(&[Technology::L3Ca]);
    assert_eq!(t.qos.alloc_assign(l3, &[0, 1]).unwrap(), 3);
    assert_eq!(cos_of(&t.msr, 0), 3);
    assert_eq!(cos_of(&t.msr, 1), 3);
    // The next request on the same socket gets the next class down.
    assert_eq!(t.qos.alloc_assign(l3, &[2]).unwrap(), 2);
    // The other socket has its own free classes.
    assert_eq!(t.qos.alloc_assign(l3, &[4]).unwrap(), 3);
}

#[test]
fn test_release_frees_class_for_reassignment() {
    let t = toy_qos();
    let l3 = Technologies::of(&[Technology::L3Ca]);
    assert_eq!(t.qos.alloc_assign(l3, &[0, 1]).unwrap(), 3);
    t.qos.alloc_release(&[0, 1]).unwrap();
    assert_eq!(cos_of(&t.msr, 0), 0);
    assert_eq!(t.qos.alloc_assign(l3, &[2]).unwrap(), 3);
}

#[test]
fn test_assign_skips_configured_classes() {
    let t = toy_qos();
    // Class 3 carries a custom mask, so it is not the permissive default.
    t.qos.l3ca_set(0, 3, CatCos::Mask(0xF0)).unwrap();
    let l3 = Technologies::of(&[Technology::L3Ca]);
    assert_eq!(t.qos.alloc_assign(l3, &[0]).unwrap(), 2);
}

#[test]
fn test_assign_requires_single_socket_for_l3() {
    let t = toy_qos();
    let l3 = Technologies::of(&[Technology::L3Ca]);
    // Cores 0,1 are on socket 0; cores 4,5 on socket 1.
    assert!(matches!(
        t.qos.alloc_assign(l3, &[0, 1, 4, 5]),
        Err(Error::Parameter(_))
    ));
}

#[test]
fn test_assign_requires_single_cluster_for_l2() {
    let t = toy_qos();
    let l2 = Technologies::of(&[Technology::L2Ca]);
    // Every toy core is its own L2 cluster.
    assert!(matches!(
        t.qos.alloc_assign(l2, &[0, 1]),
        Err(Error::Parameter(_))
    ));
    assert_eq!(t.qos.alloc_assign(l2, &[0]).unwrap(), 3);
}

#[test]
fn test_assign_empty_inputs_rejected() {
    let t = toy_qos();
    assert!(matches!(
        t.qos.alloc_assign(Technologies::default(), &[0]),
        Err(Error::Parameter(_))
    ));
    let l3 = Technologies::of(&[Technology::L3Ca]);
    assert!(matches!(
        t.qos.alloc_assign(l3, &[]),
        Err(Error::Parameter(_))
    ));
}

#[test]
fn test_batch_write_reports_applied_count() {
    let t = toy_qos();
    t.msr.fail_writes_of(L3_MASK_BASE + 2);
    let defs = [
        (0u32, CatCos::Mask(0xF)),
        (1, CatCos::Mask(0xF0)),
        (2, CatCos::Mask(0xF00)),
    ];
    let err = t.qos.l3ca_set_batch(0, &defs).unwrap_err();
    assert_eq!(err.written, 2);
    // The first two writes stayed applied.
    assert_eq!(t.msr.get(0, L3_MASK_BASE), 0xF);
    assert_eq!(t.msr.get(0, L3_MASK_BASE + 1), 0xF0);
}

#[test]
fn test_cdp_enable_at_init() {
    let config = Config {
        l3_cdp: Toggle::On,
        ..Config::default()
    };
    let t = toy_qos_with(config, toy_msr());

    // The enable bit was flipped on both sockets and the visible class
    // count halved.
    assert_eq!(t.msr.get(0, MSR_L3_QOS_CFG) & 1, 1);
    assert_eq!(t.msr.get(4, MSR_L3_QOS_CFG) & 1, 1);
    let caps = t.qos.capabilities().unwrap();
    let l3ca = caps.l3ca.unwrap();
    assert!(l3ca.cdp_enabled);
    assert_eq!(l3ca.num_classes, 2);

    // Code and data land in the odd and even hardware slots.
    t.qos
        .l3ca_set(0, 0, CatCos::Cdp { code: 0xF0, data: 0x0F })
        .unwrap();
    assert_eq!(t.msr.get(0, L3_MASK_BASE), 0x0F);
    assert_eq!(t.msr.get(0, L3_MASK_BASE + 1), 0xF0);

    // The single-mask form is rejected while partitioning is on.
    assert!(matches!(
        t.qos.l3ca_set(0, 0, CatCos::Mask(0xFF)),
        Err(Error::Parameter(_))
    ));
    // Visible class 2 does not exist any more.
    assert!(matches!(
        t.qos.l3ca_set(0, 2, CatCos::Cdp { code: 0xF, data: 0xF }),
        Err(Error::Parameter(_))
    ));
}

#[test]
fn test_reset_disables_cdp_and_restores_defaults() {
    let config = Config {
        l3_cdp: Toggle::On,
        ..Config::default()
    };
    let t = toy_qos_with(config, toy_msr());
    t.qos
        .l3ca_set(0, 0, CatCos::Cdp { code: 0xF0, data: 0x0F })
        .unwrap();
    t.qos.assoc_core(1, 1).unwrap();

    t.qos
        .alloc_reset(ResetConfig {
            l3_cdp: Toggle::Off,
            ..ResetConfig::default()
        })
        .unwrap();

    let caps = t.qos.capabilities().unwrap();
    let l3ca = caps.l3ca.unwrap();
    assert!(!l3ca.cdp_enabled);
    assert_eq!(l3ca.num_classes, 4);
    assert_eq!(t.msr.get(0, MSR_L3_QOS_CFG) & 1, 0);
    // Every class holds the permissive mask, every core is on class 0.
    for class in 0..4 {
        assert_eq!(t.msr.get(0, L3_MASK_BASE + class), 0xFFFF);
        assert_eq!(t.msr.get(4, L3_MASK_BASE + class), 0xFFFF);
    }
    for core in 0..8 {
        assert_eq!(cos_of(&t.msr, core), 0);
    }
}

#[test]
fn test_reset_is_idempotent() {
    let t = toy_qos();
    t.qos.l3ca_set(0, 2, CatCos::Mask(0xF0)).unwrap();
    t.qos.assoc_core(5, 3).unwrap();

    t.qos.alloc_reset(ResetConfig::default()).unwrap();
    t.qos.alloc_reset(ResetConfig::default()).unwrap();

    for class in 0..4 {
        assert_eq!(t.msr.get(0, L3_MASK_BASE + class), 0xFFFF);
    }
    assert_eq!(cos_of(&t.msr, 5), 0);
    assert_eq!(t.msr.get(0, MBA_BASE), 0);
    // A full assignment cycle works after the reset.
    let l3 = Technologies::of(&[Technology::L3Ca]);
    assert_eq!(t.qos.alloc_assign(l3, &[0]).unwrap(), 3);
}

#[test]
fn test_cdp_on_unsupported_platform_fails() {
    let t = toy_qos();
    // The toy L2 has no partitioning support.
    assert!(matches!(
        t.qos.alloc_reset(ResetConfig {
            l2_cdp: Toggle::On,
            ..ResetConfig::default()
        }),
        Err(Error::Resource(_))
    ));
}
