//! Topology probe tests against a sysfs fixture.

use pqctl_core::topology::probe;
use pqctl_core::topology::Vendor;
use pretty_assertions::assert_eq;

use crate::common::{toy_cpuid, toy_sysfs};

#[test]
fn test_probe_counts_and_vendor() {
    let sysfs = toy_sysfs();
    let topo = probe::probe(sysfs.path(), &toy_cpuid()).unwrap();
    assert_eq!(topo.num_cores(), 8);
    assert_eq!(topo.max_lcore, 7);
    assert_eq!(topo.vendor, Vendor::Intel);
}

#[test]
fn test_probe_sockets_and_clusters() {
    let sysfs = toy_sysfs();
    let topo = probe::probe(sysfs.path(), &toy_cpuid()).unwrap();
    assert_eq!(topo.sockets(), vec![0, 1]);
    assert_eq!(topo.l3_ids(), vec![0, 1]);
    assert_eq!(topo.l2_ids(), (0..8).collect::<Vec<_>>());
    assert_eq!(topo.cores_of_socket(0), vec![0, 1, 2, 3]);
    assert_eq!(topo.cores_of_l3(1), vec![4, 5, 6, 7]);

    let core5 = topo.core(5).unwrap();
    assert_eq!(core5.socket, 1);
    assert_eq!(core5.numa, 1);
    assert_eq!(core5.l3_id, 1);
    assert_eq!(core5.l3cat_id, 1);
    assert_eq!(core5.mba_id, 1);
}

#[test]
fn test_probe_cache_geometry() {
    let sysfs = toy_sysfs();
    let topo = probe::probe(sysfs.path(), &toy_cpuid()).unwrap();
    assert!(topo.l3.detected);
    assert_eq!(topo.l3.num_ways, 16);
    assert_eq!(topo.l3.num_sets, 1024);
    assert_eq!(topo.l3.line_size, 64);
    assert_eq!(topo.l3.total_size, 1024 * 1024);
    assert_eq!(topo.l3.way_size, 64 * 1024);
    assert!(topo.l2.detected);
    assert_eq!(topo.l2.num_ways, 8);
}

#[test]
fn test_probe_domain_representatives() {
    let sysfs = toy_sysfs();
    let topo = probe::probe(sysfs.path(), &toy_cpuid()).unwrap();
    assert_eq!(topo.one_core_of_l3cat(0), Some(0));
    assert_eq!(topo.one_core_of_l3cat(1), Some(4));
    assert_eq!(topo.one_core_of_mba(1), Some(4));
    assert_eq!(topo.one_core_of_l3cat(9), None);
}

#[test]
fn test_probe_core_lookup() {
    let sysfs = toy_sysfs();
    let topo = probe::probe(sysfs.path(), &toy_cpuid()).unwrap();
    assert!(topo.has_core(7));
    assert!(!topo.has_core(8));
    assert!(topo.core(42).is_none());
}

#[test]
fn test_probe_sparse_online_list() {
    let sysfs = toy_sysfs();
    // Take cores 2 and 3 offline; the probe must honour the online list.
    std::fs::write(sysfs.path().join("online"), "0-1,4-7\n").unwrap();
    let topo = probe::probe(sysfs.path(), &toy_cpuid()).unwrap();
    assert_eq!(topo.num_cores(), 6);
    assert_eq!(topo.max_lcore, 7);
    assert!(!topo.has_core(2));
}
