//! Capability discovery tests against canned CPUID leaves.

use pqctl_core::caps::{discover, MonEvent, MonEvents};
use pqctl_core::hw::msr::MsrIo;
use pqctl_core::topology::probe;
use pretty_assertions::assert_eq;

use crate::common::{toy_cpuid, toy_msr, toy_sysfs};

fn toy_topo() -> pqctl_core::topology::Topology {
    let sysfs = toy_sysfs();
    probe::probe(sysfs.path(), &toy_cpuid()).unwrap()
}

#[test]
fn test_discover_monitoring() {
    let topo = toy_topo();
    let msr = toy_msr();
    let caps = discover::discover(&topo, &toy_cpuid(), Some(&msr as &dyn MsrIo), false).unwrap();

    let mon = caps.monitor.as_ref().unwrap();
    assert_eq!(mon.max_rmid, 16);
    assert!(mon.event(MonEvent::LlcOccupancy).is_some());
    assert!(mon.event(MonEvent::TotalBw).is_some());
    assert!(mon.event(MonEvent::LocalBw).is_some());
    assert!(mon.event(MonEvent::RemoteBw).is_some());
    assert!(mon.event(MonEvent::Ipc).is_some());
    assert_eq!(mon.event(MonEvent::LlcOccupancy).unwrap().scale_factor, 64);
    // No reported width; the wrap arithmetic falls back to 24 bits.
    assert_eq!(mon.mbm_counter_width(), 24);
}

#[test]
fn test_discover_l3_allocation() {
    let topo = toy_topo();
    let msr = toy_msr();
    let caps = discover::discover(&topo, &toy_cpuid(), Some(&msr as &dyn MsrIo), false).unwrap();

    let l3ca = caps.l3ca.as_ref().unwrap();
    assert_eq!(l3ca.num_classes, 4);
    assert_eq!(l3ca.num_ways, 16);
    assert!(l3ca.cdp_supported);
    assert!(!l3ca.cdp_enabled);
    assert!(!l3ca.non_contiguous_cbm);
    assert_eq!(l3ca.way_size, 64 * 1024);

    let l2ca = caps.l2ca.as_ref().unwrap();
    assert_eq!(l2ca.num_classes, 4);
    assert_eq!(l2ca.num_ways, 8);
    assert!(!l2ca.cdp_supported);
}

#[test]
fn test_discover_mba() {
    let topo = toy_topo();
    let msr = toy_msr();
    let caps = discover::discover(&topo, &toy_cpuid(), Some(&msr as &dyn MsrIo), false).unwrap();

    let mba = caps.mba.as_ref().unwrap();
    assert_eq!(mba.num_classes, 4);
    assert_eq!(mba.throttle_max, 100);
    assert_eq!(mba.throttle_step, 10);
    assert!(mba.is_linear);
    assert!(!mba.ctrl_supported);
}

#[test]
fn test_event_max_rmid_is_minimum() {
    let topo = toy_topo();
    let msr = toy_msr();
    let caps = discover::discover(&topo, &toy_cpuid(), Some(&msr as &dyn MsrIo), false).unwrap();
    let mon = caps.monitor.as_ref().unwrap();

    let events = MonEvents::of(&[MonEvent::LlcOccupancy, MonEvent::TotalBw]);
    assert_eq!(mon.event_max_rmid(events), 16);
    // Perf events do not narrow the ID range.
    let events = MonEvents::of(&[MonEvent::LlcOccupancy, MonEvent::Ipc]);
    assert_eq!(mon.event_max_rmid(events), 16);
}

#[test]
fn test_inconsistent_cdp_across_sockets_is_fatal() {
    let topo = toy_topo();
    let msr = toy_msr();
    // Socket 0 latched on, socket 1 latched off.
    msr.set(0, 0xC81, 1);
    msr.set(4, 0xC81, 0);
    let err = discover::discover(&topo, &toy_cpuid(), Some(&msr as &dyn MsrIo), false)
        .unwrap_err();
    assert!(err.to_string().contains("reboot"));
}

#[test]
fn test_consistent_cdp_latched_on() {
    let topo = toy_topo();
    let msr = toy_msr();
    for core in [0, 4] {
        msr.set(core, 0xC81, 1);
    }
    let caps = discover::discover(&topo, &toy_cpuid(), Some(&msr as &dyn MsrIo), false).unwrap();
    let l3ca = caps.l3ca.as_ref().unwrap();
    assert!(l3ca.cdp_enabled);
    // A visible class consumes two hardware slots.
    assert_eq!(l3ca.num_classes, 2);
}

#[test]
fn test_no_capability_at_all() {
    let topo = toy_topo();
    let msr = toy_msr();
    let empty = crate::common::MockCpuid::new();
    assert!(discover::discover(&topo, &empty, Some(&msr as &dyn MsrIo), false).is_err());
}

#[test]
fn test_resctrl_presence_enables_pid_monitoring() {
    let topo = toy_topo();
    let msr = toy_msr();
    let caps = discover::discover(&topo, &toy_cpuid(), Some(&msr as &dyn MsrIo), true).unwrap();
    let mon = caps.monitor.as_ref().unwrap();
    assert!(mon.event(MonEvent::LlcOccupancy).unwrap().supports_pid);
    assert!(caps.mba.as_ref().unwrap().ctrl_supported);
}
