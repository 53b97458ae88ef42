//! Monitoring-ID pool tests.

use pqctl_core::monitor::rmid::{RmidPool, RmidState};
use pretty_assertions::assert_eq;

#[test]
fn test_alloc_is_descending() {
    let mut pool = RmidPool::new(2, 16);
    assert_eq!(pool.alloc(0, 16).unwrap(), 15);
    assert_eq!(pool.alloc(0, 16).unwrap(), 14);
    // Clusters are independent.
    assert_eq!(pool.alloc(1, 16).unwrap(), 15);
}

#[test]
fn test_alloc_respects_event_ceiling() {
    let mut pool = RmidPool::new(1, 16);
    // An event limited to 8 IDs scans from 7 downwards.
    assert_eq!(pool.alloc(0, 8).unwrap(), 7);
    // A wide request afterwards still gets the platform top.
    assert_eq!(pool.alloc(0, 16).unwrap(), 15);
}

#[test]
fn test_id_zero_is_never_allocated() {
    let mut pool = RmidPool::new(1, 2);
    assert_eq!(pool.alloc(0, 2).unwrap(), 1);
    assert!(pool.alloc(0, 2).is_err());
}

#[test]
fn test_free_requires_allocated() {
    let mut pool = RmidPool::new(1, 16);
    let id = pool.alloc(0, 16).unwrap();
    pool.free(0, id).unwrap();
    // Double free and freeing a never-allocated ID are rejected.
    assert!(pool.free(0, id).is_err());
    assert!(pool.free(0, 3).is_err());
    // ID 0 and out-of-range IDs are rejected outright.
    assert!(pool.free(0, 0).is_err());
    assert!(pool.free(0, 16).is_err());
}

#[test]
fn test_unavailable_is_skipped_and_protected() {
    let mut pool = RmidPool::new(1, 16);
    pool.mark_unavailable(0, 15).unwrap();
    pool.mark_unavailable(0, 14).unwrap();
    assert_eq!(pool.alloc(0, 16).unwrap(), 13);
    assert_eq!(pool.state(0, 15), Some(RmidState::Unavailable));
    assert!(pool.free(0, 15).is_err());
}

#[test]
fn test_freed_id_is_reused_first() {
    let mut pool = RmidPool::new(1, 16);
    let a = pool.alloc(0, 16).unwrap();
    let _b = pool.alloc(0, 16).unwrap();
    pool.free(0, a).unwrap();
    // 15 was freed and is the highest free ID again.
    assert_eq!(pool.alloc(0, 16).unwrap(), a);
}

#[test]
fn test_exhaustion() {
    let mut pool = RmidPool::new(1, 4);
    assert_eq!(pool.alloc(0, 4).unwrap(), 3);
    assert_eq!(pool.alloc(0, 4).unwrap(), 2);
    assert_eq!(pool.alloc(0, 4).unwrap(), 1);
    assert!(pool.alloc(0, 4).is_err());
}

#[test]
fn test_bad_cluster_is_rejected() {
    let mut pool = RmidPool::new(2, 16);
    assert!(pool.alloc(2, 16).is_err());
    assert!(pool.free(5, 1).is_err());
}
