//! Kernel-filesystem back-end tests against a tempdir fixture.

use std::fs;
use std::path::Path;

use pqctl_core::config::Interface;
use pqctl_core::{CatCos, Config, Error, MbaCos, MonEvent, MonEvents, PollStatus, Qos};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::common::{amd_cpuid, toy_cpuid, toy_sysfs};

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Builds a resctrl tree matching the toy platform.
fn toy_resctrl() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(&root.join("info/L3/num_closids"), "4\n");
    write(&root.join("info/L3/cbm_mask"), "ffff\n");
    write(&root.join("info/L2/num_closids"), "4\n");
    write(&root.join("info/MB/num_closids"), "4\n");
    write(&root.join("info/MB/bandwidth_gran"), "10\n");
    write(&root.join("info/L3_MON/num_rmids"), "16\n");
    write(
        &root.join("info/L3_MON/mon_features"),
        "llc_occupancy\nmbm_total_bytes\nmbm_local_bytes\n",
    );
    write(&root.join("schemata"), "L3:0=ffff;1=ffff\nMB:0=100;1=100\n");
    write(&root.join("cpus"), "0-7\n");
    write(&root.join("tasks"), "");
    fs::create_dir_all(root.join("mon_groups")).unwrap();
    dir
}

struct FsQos {
    qos: Qos,
    resctrl: TempDir,
    _sysfs: TempDir,
    _lockdir: TempDir,
}

fn fs_qos() -> FsQos {
    let sysfs = toy_sysfs();
    let resctrl = toy_resctrl();
    let lockdir = TempDir::new().unwrap();
    let qos = Qos::builder(Config {
        interface: Interface::Filesystem,
        ..Config::default()
    })
    .sysfs_root(sysfs.path())
    .resctrl_root(resctrl.path())
    .lockfile(lockdir.path().join("lock"))
    .cpuid(Box::new(toy_cpuid()))
    .build()
    .unwrap();
    FsQos {
        qos,
        resctrl,
        _sysfs: sysfs,
        _lockdir: lockdir,
    }
}

#[test]
fn test_init_takes_limits_from_info_tree() {
    let t = fs_qos();
    let caps = t.qos.capabilities().unwrap();
    assert_eq!(caps.l3ca.unwrap().num_classes, 4);
    assert_eq!(caps.monitor.as_ref().unwrap().max_rmid, 16);
    assert!(caps.mba.unwrap().ctrl_supported);
    assert!(!caps.mba.unwrap().ctrl_enabled);
}

#[test]
fn test_explicit_filesystem_without_mount_fails() {
    let sysfs = toy_sysfs();
    let lockdir = TempDir::new().unwrap();
    let err = Qos::builder(Config {
        interface: Interface::Filesystem,
        ..Config::default()
    })
    .sysfs_root(sysfs.path())
    .resctrl_root(lockdir.path().join("nowhere"))
    .lockfile(lockdir.path().join("lock"))
    .cpuid(Box::new(toy_cpuid()))
    .build()
    .unwrap_err();
    assert!(matches!(err, Error::Resource(_)));
}

#[test]
fn test_set_l3_rewrites_class_schemata() {
    let t = fs_qos();
    t.qos.l3ca_set(0, 1, CatCos::Mask(0xF0)).unwrap();
    let text = fs::read_to_string(t.resctrl.path().join("COS1/schemata")).unwrap();
    assert!(text.contains("L3:0=f0"), "unexpected schemata: {text}");
    assert_eq!(t.qos.l3ca_get(0, 1).unwrap(), CatCos::Mask(0xF0));

    // A second write on the other domain extends the same line.
    t.qos.l3ca_set(1, 1, CatCos::Mask(0x0F)).unwrap();
    let text = fs::read_to_string(t.resctrl.path().join("COS1/schemata")).unwrap();
    assert!(text.contains("L3:0=f0;1=f"), "unexpected schemata: {text}");
}

#[test]
fn test_mba_mbps_needs_controller_mount() {
    let t = fs_qos();
    assert!(matches!(
        t.qos.mba_set(0, 1, MbaCos { mb_max: 2000, ctrl: true }),
        Err(Error::Resource(_))
    ));
    // Percentages work and land in the schemata file.
    let actual = t
        .qos
        .mba_set(0, 1, MbaCos { mb_max: 45, ctrl: false })
        .unwrap();
    assert_eq!(actual, 40);
    let text = fs::read_to_string(t.resctrl.path().join("COS1/schemata")).unwrap();
    assert!(text.contains("MB:0=40"), "unexpected schemata: {text}");
}

#[test]
fn test_smba_writes_schemata_line() {
    let sysfs = toy_sysfs();
    let resctrl = toy_resctrl();
    write(&resctrl.path().join("info/SMBA/num_closids"), "4\n");
    let lockdir = TempDir::new().unwrap();
    let qos = Qos::builder(Config {
        interface: Interface::Filesystem,
        ..Config::default()
    })
    .sysfs_root(sysfs.path())
    .resctrl_root(resctrl.path())
    .lockfile(lockdir.path().join("lock"))
    .cpuid(Box::new(amd_cpuid()))
    .build()
    .unwrap();

    let caps = qos.capabilities().unwrap();
    assert_eq!(caps.smba.unwrap().num_classes, 4);

    qos.smba_set(0, 1, 2048).unwrap();
    let text = fs::read_to_string(resctrl.path().join("COS1/schemata")).unwrap();
    assert!(text.contains("SMBA:0=2048"), "unexpected schemata: {text}");
    assert_eq!(qos.smba_get(0, 1).unwrap().mb_max, 2048);
}

#[test]
fn test_assoc_core_writes_cpu_list() {
    let t = fs_qos();
    t.qos.assoc_core(2, 1).unwrap();
    t.qos.assoc_core(5, 1).unwrap();
    let text = fs::read_to_string(t.resctrl.path().join("COS1/cpus")).unwrap();
    assert_eq!(text, "2,5");
    assert_eq!(t.qos.assoc_core_get(2).unwrap(), 1);
    assert_eq!(t.qos.assoc_core_get(0).unwrap(), 0);
}

#[test]
fn test_assoc_task_writes_tasks_file() {
    let t = fs_qos();
    t.qos.assoc_task(4321, 2).unwrap();
    let text = fs::read_to_string(t.resctrl.path().join("COS2/tasks")).unwrap();
    assert_eq!(text, "4321\n");
}

#[test]
fn test_core_monitoring_via_mon_groups() {
    let t = fs_qos();
    let events = MonEvents::of(&[MonEvent::LlcOccupancy, MonEvent::TotalBw]);
    let mut group = t.qos.mon_start_cores(&[0, 1], events).unwrap();

    let group_dir = t.resctrl.path().join("mon_groups/mon_pqctl_1");
    assert_eq!(
        fs::read_to_string(group_dir.join("cpus")).unwrap(),
        "0,1"
    );

    // The kernel materialises one data dir per L3 domain.
    write(&group_dir.join("mon_data/mon_L3_00/llc_occupancy"), "4096\n");
    write(&group_dir.join("mon_data/mon_L3_01/llc_occupancy"), "1024\n");
    write(&group_dir.join("mon_data/mon_L3_00/mbm_total_bytes"), "800\n");
    write(&group_dir.join("mon_data/mon_L3_01/mbm_total_bytes"), "200\n");

    assert_eq!(t.qos.mon_poll(&mut [&mut group]).unwrap(), PollStatus::Ok);
    assert_eq!(group.values.llc_occupancy, 5120);
    assert_eq!(group.values.mbm_total, 1000);
    assert_eq!(group.values.mbm_total_delta, 1000);

    t.qos.mon_stop(group).unwrap();
    assert!(!group_dir.exists());
}

#[test]
fn test_unavailable_domain_fails_poll() {
    let t = fs_qos();
    let events = MonEvents::of(&[MonEvent::LlcOccupancy]);
    let mut group = t.qos.mon_start_cores(&[0], events).unwrap();
    let group_dir = t.resctrl.path().join("mon_groups/mon_pqctl_1");
    write(
        &group_dir.join("mon_data/mon_L3_00/llc_occupancy"),
        "Unavailable\n",
    );
    assert_eq!(t.qos.mon_poll(&mut [&mut group]).unwrap(), PollStatus::Error);
    assert!(matches!(group.last_error, Some(Error::Unavailable)));
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_task_monitoring_creates_task_group() {
    let t = fs_qos();
    let events = MonEvents::of(&[MonEvent::LlcOccupancy]);
    let mut group = t.qos.mon_start_tasks(&[999], events).unwrap();
    let group_dir = t.resctrl.path().join("mon_groups/mon_pqctl_1");
    assert_eq!(
        fs::read_to_string(group_dir.join("tasks")).unwrap(),
        "999\n"
    );
    write(&group_dir.join("mon_data/mon_L3_00/llc_occupancy"), "2048\n");
    assert_eq!(t.qos.mon_poll(&mut [&mut group]).unwrap(), PollStatus::Ok);
    assert_eq!(group.values.llc_occupancy, 2048);
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_stale_mon_groups_cleared_at_init() {
    let sysfs = toy_sysfs();
    let resctrl = toy_resctrl();
    fs::create_dir_all(resctrl.path().join("mon_groups/mon_pqctl_7")).unwrap();
    let lockdir = TempDir::new().unwrap();
    let _qos = Qos::builder(Config {
        interface: Interface::Filesystem,
        ..Config::default()
    })
    .sysfs_root(sysfs.path())
    .resctrl_root(resctrl.path())
    .lockfile(lockdir.path().join("lock"))
    .cpuid(Box::new(toy_cpuid()))
    .build()
    .unwrap();
    assert!(!resctrl.path().join("mon_groups/mon_pqctl_7").exists());
}

#[test]
fn test_reset_removes_class_dirs() {
    let t = fs_qos();
    t.qos.l3ca_set(0, 1, CatCos::Mask(0xF0)).unwrap();
    t.qos.assoc_core(2, 1).unwrap();
    assert!(t.resctrl.path().join("COS1").is_dir());

    t.qos.alloc_reset(pqctl_core::ResetConfig::default()).unwrap();
    assert!(!t.resctrl.path().join("COS1").exists());
    assert_eq!(t.qos.assoc_core_get(2).unwrap(), 0);
    // The root schemata went back to permissive values.
    let text = fs::read_to_string(t.resctrl.path().join("schemata")).unwrap();
    assert!(text.contains("L3:0=ffff;1=ffff"), "unexpected schemata: {text}");
}

#[test]
fn test_cdp_toggle_unsupported_on_filesystem() {
    let t = fs_qos();
    assert!(matches!(
        t.qos.alloc_reset(pqctl_core::ResetConfig {
            l3_cdp: pqctl_core::config::Toggle::On,
            ..pqctl_core::ResetConfig::default()
        }),
        Err(Error::InterfaceUnsupported)
    ));
}
