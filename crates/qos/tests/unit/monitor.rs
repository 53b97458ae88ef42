//! Monitoring manager tests on the register back-end.

use pqctl_core::hw::msr::{
    MSR_ASSOC, MSR_ASSOC_RMID_MASK, MSR_CPU_UNHALTED_THREAD, MSR_FIXED_CTR_CTRL,
    MSR_INST_RETIRED_ANY, MSR_MON_COUNT_ERROR, MSR_MON_COUNT_UNAVAILABLE, MSR_PERFEVTSEL0,
    MSR_PERF_GLOBAL_CTRL, MSR_PMC0,
};
use pqctl_core::monitor::get_delta;
use pqctl_core::{Config, Error, MonEvent, MonEvents, PollStatus};
use pretty_assertions::assert_eq;

use crate::common::platform::toy_msr;
use crate::common::{toy_qos, toy_qos_with, MockMsr};

fn rmid_of(msr: &MockMsr, core: u32) -> u64 {
    msr.get(core, MSR_ASSOC) & MSR_ASSOC_RMID_MASK
}

fn llc() -> MonEvents {
    MonEvents::of(&[MonEvent::LlcOccupancy])
}

#[test]
fn test_start_binds_highest_free_id() {
    let t = toy_qos();
    let group = t.qos.mon_start_cores(&[0, 1, 2], llc()).unwrap();
    for core in [0, 1, 2] {
        assert_eq!(rmid_of(&t.msr, core), 15);
    }
    // A second group on the same cluster takes the next ID down.
    let group2 = t.qos.mon_start_cores(&[3], llc()).unwrap();
    assert_eq!(rmid_of(&t.msr, 3), 14);
    t.qos.mon_stop(group).unwrap();
    t.qos.mon_stop(group2).unwrap();
}

#[test]
fn test_assoc_get_reports_binding() {
    let t = toy_qos();
    let group = t.qos.mon_start_cores(&[1], llc()).unwrap();
    assert_eq!(t.qos.mon_assoc_get(1).unwrap(), 15);
    assert_eq!(t.qos.mon_assoc_get(0).unwrap(), 0);
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_start_rejects_bad_parameters() {
    let t = toy_qos();
    assert!(matches!(
        t.qos.mon_start_cores(&[], llc()),
        Err(Error::Parameter(_))
    ));
    assert!(matches!(
        t.qos.mon_start_cores(&[0], MonEvents::EMPTY),
        Err(Error::Parameter(_))
    ));
    assert!(matches!(
        t.qos.mon_start_cores(&[9], llc()),
        Err(Error::Parameter(_))
    ));
}

#[test]
fn test_core_in_live_group_is_busy() {
    let t = toy_qos();
    let group = t.qos.mon_start_cores(&[0, 1], llc()).unwrap();
    assert!(matches!(
        t.qos.mon_start_cores(&[1, 2], llc()),
        Err(Error::Busy(1))
    ));
    t.qos.mon_stop(group).unwrap();
    // The cores are usable again after the stop.
    let group = t.qos.mon_start_cores(&[1, 2], llc()).unwrap();
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_stop_unbinds_and_recycles_id() {
    let t = toy_qos();
    let group = t.qos.mon_start_cores(&[0, 1], llc()).unwrap();
    t.qos.mon_stop(group).unwrap();
    assert_eq!(rmid_of(&t.msr, 0), 0);
    assert_eq!(rmid_of(&t.msr, 1), 0);
    // The freed ID is the highest again.
    let group = t.qos.mon_start_cores(&[2], llc()).unwrap();
    assert_eq!(rmid_of(&t.msr, 2), 15);
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_group_spanning_sockets_gets_one_id_per_cluster() {
    let t = toy_qos();
    let mut group = t.qos.mon_start_cores(&[0, 4], llc()).unwrap();
    assert_eq!(rmid_of(&t.msr, 0), 15);
    assert_eq!(rmid_of(&t.msr, 4), 15);

    t.msr.script_counter(0, 15, 1, &[300]);
    t.msr.script_counter(4, 15, 1, &[200]);
    let status = t.qos.mon_poll(&mut [&mut group]).unwrap();
    assert_eq!(status, PollStatus::Ok);
    assert_eq!(group.values.llc_occupancy, 500);
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_delta_wraps_at_counter_width() {
    // Width 24: previous 0x00FF_FFF0, current 0x10 is a 0x20 step.
    assert_eq!(get_delta(0x00FF_FFF0, 0x10, 24), 0x20);
    assert_eq!(get_delta(100, 250, 24), 150);
    assert_eq!(get_delta(0, 0, 24), 0);
}

#[test]
fn test_poll_bandwidth_wrap_reports_overflow() {
    let t = toy_qos();
    let events = MonEvents::of(&[MonEvent::TotalBw]);
    let mut group = t.qos.mon_start_cores(&[0], events).unwrap();

    t.msr.script_counter(0, 15, 2, &[0x00FF_FFF0, 0x10]);
    assert_eq!(t.qos.mon_poll(&mut [&mut group]).unwrap(), PollStatus::Ok);
    assert_eq!(group.values.mbm_total, 0x00FF_FFF0);

    let status = t.qos.mon_poll(&mut [&mut group]).unwrap();
    assert_eq!(status, PollStatus::Overflow);
    assert_eq!(group.values.mbm_total_delta, 0x20);
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_remote_bandwidth_is_total_minus_local() {
    let t = toy_qos();
    let events = MonEvents::of(&[MonEvent::RemoteBw]);
    let mut group = t.qos.mon_start_cores(&[0], events).unwrap();

    t.msr.script_counter(0, 15, 2, &[1000]); // total
    t.msr.script_counter(0, 15, 3, &[600]); // local
    assert_eq!(t.qos.mon_poll(&mut [&mut group]).unwrap(), PollStatus::Ok);
    assert_eq!(group.values.mbm_remote, 400);
    assert_eq!(group.values.mbm_remote_delta, 400);
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_unavailable_sample_is_retried() {
    let t = toy_qos();
    let mut group = t.qos.mon_start_cores(&[0], llc()).unwrap();
    t.msr.script_counter(
        0,
        15,
        1,
        &[MSR_MON_COUNT_UNAVAILABLE, MSR_MON_COUNT_UNAVAILABLE, 42],
    );
    assert_eq!(t.qos.mon_poll(&mut [&mut group]).unwrap(), PollStatus::Ok);
    assert_eq!(group.values.llc_occupancy, 42);
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_unavailable_beyond_retry_budget_fails_group() {
    let t = toy_qos();
    let mut group = t.qos.mon_start_cores(&[0], llc()).unwrap();
    t.msr
        .script_counter(0, 15, 1, &[MSR_MON_COUNT_UNAVAILABLE; 4]);
    assert_eq!(t.qos.mon_poll(&mut [&mut group]).unwrap(), PollStatus::Error);
    assert!(matches!(group.last_error, Some(Error::Unavailable)));
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_error_bit_fails_group_but_not_batch() {
    let t = toy_qos();
    let mut bad = t.qos.mon_start_cores(&[0], llc()).unwrap();
    let mut good = t.qos.mon_start_cores(&[3], llc()).unwrap();
    t.msr.script_counter(0, 15, 1, &[MSR_MON_COUNT_ERROR]);
    t.msr.script_counter(3, 14, 1, &[77]);

    let status = t.qos.mon_poll(&mut [&mut bad, &mut good]).unwrap();
    assert_eq!(status, PollStatus::Error);
    assert!(bad.last_error.is_some());
    // The healthy group was still polled.
    assert!(good.last_error.is_none());
    assert_eq!(good.values.llc_occupancy, 77);
    t.qos.mon_stop(bad).unwrap();
    t.qos.mon_stop(good).unwrap();
}

#[test]
fn test_ipc_sums_cores_and_divides_deltas() {
    let t = toy_qos();
    let events = MonEvents::of(&[MonEvent::Ipc]);
    let mut group = t.qos.mon_start_cores(&[0, 1], events).unwrap();

    // Counter programming: fixed counters tracked usr+os, global enable
    // carries the two fixed-counter bits.
    assert_eq!(t.msr.get(0, MSR_FIXED_CTR_CTRL), 0x33);
    assert_eq!(t.msr.get(0, MSR_PERF_GLOBAL_CTRL), 0x3 << 32);

    t.msr.set(0, MSR_INST_RETIRED_ANY, 1000);
    t.msr.set(1, MSR_INST_RETIRED_ANY, 500);
    t.msr.set(0, MSR_CPU_UNHALTED_THREAD, 400);
    t.msr.set(1, MSR_CPU_UNHALTED_THREAD, 350);
    assert_eq!(t.qos.mon_poll(&mut [&mut group]).unwrap(), PollStatus::Ok);
    assert_eq!(group.values.ipc_retired, 1500);
    assert_eq!(group.values.ipc_unhalted, 750);
    assert!((group.values.ipc - 2.0).abs() < f64::EPSILON);

    t.qos.mon_stop(group).unwrap();
    // Counters are disabled on stop.
    assert_eq!(t.msr.get(0, MSR_PERF_GLOBAL_CTRL), 0);
}

#[test]
fn test_llc_miss_counter_programming_and_poll() {
    let t = toy_qos();
    let events = MonEvents::of(&[MonEvent::LlcMisses]);
    let mut group = t.qos.mon_start_cores(&[2], events).unwrap();

    let evtsel = 0x2E | (0x41 << 8) | (1 << 16) | (1 << 17) | (1 << 22);
    assert_eq!(t.msr.get(2, MSR_PERFEVTSEL0), evtsel);
    assert_eq!(t.msr.get(2, MSR_PERF_GLOBAL_CTRL), 0x1);

    t.msr.set(2, MSR_PMC0, 12345);
    assert_eq!(t.qos.mon_poll(&mut [&mut group]).unwrap(), PollStatus::Ok);
    assert_eq!(group.values.llc_misses, 12345);
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_perf_counters_in_use_rejected() {
    let t = toy_qos();
    // Another program owns the fixed counters on core 1.
    t.msr.set(1, MSR_PERF_GLOBAL_CTRL, 0x3 << 32);
    let events = MonEvents::of(&[MonEvent::Ipc]);
    assert!(matches!(
        t.qos.mon_start_cores(&[0, 1], events),
        Err(Error::PerfInUse)
    ));
    // Nothing was left bound.
    assert_eq!(rmid_of(&t.msr, 0), 0);
}

#[test]
fn test_perf_in_use_override() {
    let msr = toy_msr();
    msr.set(1, MSR_PERF_GLOBAL_CTRL, 0x3 << 32);
    let config = Config {
        reclaim_in_use_rmid: true,
        ..Config::default()
    };
    let t = toy_qos_with(config, msr);
    let events = MonEvents::of(&[MonEvent::Ipc]);
    let group = t.qos.mon_start_cores(&[0, 1], events).unwrap();
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_in_use_rmid_reclaimed_at_init() {
    let msr = toy_msr();
    msr.set(2, MSR_ASSOC, 5);
    let config = Config {
        reclaim_in_use_rmid: true,
        ..Config::default()
    };
    let t = toy_qos_with(config, msr);
    assert_eq!(rmid_of(&t.msr, 2), 0);
    let group = t.qos.mon_start_cores(&[2], llc()).unwrap();
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_in_use_rmid_marks_core_unavailable() {
    let msr = toy_msr();
    msr.set(2, MSR_ASSOC, 5);
    let t = toy_qos_with(Config::default(), msr);
    // The foreign binding survives and the core cannot join a group.
    assert_eq!(rmid_of(&t.msr, 2), 5);
    assert!(matches!(
        t.qos.mon_start_cores(&[2], llc()),
        Err(Error::Resource(_))
    ));
    // Other cores on the cluster still work.
    let group = t.qos.mon_start_cores(&[0], llc()).unwrap();
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_reset_rebinds_everything_and_stales_handles() {
    let t = toy_qos();
    let group = t.qos.mon_start_cores(&[0, 1, 4], llc()).unwrap();
    t.qos.mon_reset().unwrap();
    for core in 0..8 {
        assert_eq!(rmid_of(&t.msr, core), 0);
    }
    // The pre-reset handle is stale now.
    assert!(matches!(t.qos.mon_stop(group), Err(Error::Parameter(_))));
    // And the IDs are all free again.
    let group = t.qos.mon_start_cores(&[0], llc()).unwrap();
    assert_eq!(rmid_of(&t.msr, 0), 15);
    t.qos.mon_stop(group).unwrap();
}

#[test]
fn test_task_monitoring_unsupported_on_register_backend() {
    let t = toy_qos();
    assert!(matches!(
        t.qos.mon_start_tasks(&[1234], llc()),
        Err(Error::InterfaceUnsupported)
    ));
}

#[test]
fn test_channel_monitoring_needs_mmio() {
    let t = toy_qos();
    let ch = pqctl_core::ChannelId {
        domain: 0,
        channel: 0,
    };
    assert!(matches!(
        t.qos.mon_start_channels(&[ch], llc()),
        Err(Error::InterfaceUnsupported)
    ));
}
