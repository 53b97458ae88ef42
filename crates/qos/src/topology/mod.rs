//! CPU topology snapshot.
//!
//! This module defines the process-wide topology built once at init. It
//! provides:
//! 1. **Descriptors:** Per-logical-CPU placement ([`CoreInfo`]) and cache
//!    geometry ([`CacheInfo`]).
//! 2. **Inspectors:** Socket, cluster and domain lookups used by input
//!    validation and register targeting.
//!
//! The snapshot is immutable after the probe returns.

pub mod probe;

/// CPU vendor tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Vendor {
    /// Intel.
    Intel,
    /// AMD.
    Amd,
    /// Hygon.
    Hygon,
    /// Unrecognised vendor string.
    #[default]
    Unknown,
}

/// Placement of one logical CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreInfo {
    /// Stable logical CPU id.
    pub lcore: u32,
    /// Physical package id.
    pub socket: u32,
    /// NUMA node id.
    pub numa: u32,
    /// Cluster of cores sharing the last-level cache.
    pub l3_id: u32,
    /// Cluster of cores sharing the L2 cache.
    pub l2_id: u32,
    /// L3 cache-allocation domain id.
    pub l3cat_id: u32,
    /// Memory-bandwidth-allocation domain id.
    pub mba_id: u32,
    /// Slow-memory-bandwidth-allocation domain id.
    pub smba_id: u32,
}

/// Geometry of one cache level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheInfo {
    /// Whether the level was detected at all.
    pub detected: bool,
    /// Number of ways of associativity.
    pub num_ways: u32,
    /// Number of sets.
    pub num_sets: u32,
    /// Number of physical line partitions.
    pub num_partitions: u32,
    /// Cache line size in bytes.
    pub line_size: u32,
    /// Total size in bytes.
    pub total_size: u32,
    /// Size of one way in bytes.
    pub way_size: u32,
}

/// Immutable topology snapshot built once at init.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    /// CPU vendor.
    pub vendor: Vendor,
    /// Present logical CPUs, ordered by `lcore`.
    pub cores: Vec<CoreInfo>,
    /// Highest logical-core id observed; sizes lookup tables. May exceed
    /// `cores.len() - 1` when core ids are sparse.
    pub max_lcore: u32,
    /// L2 cache geometry.
    pub l2: CacheInfo,
    /// Last-level cache geometry.
    pub l3: CacheInfo,
}

impl Topology {
    /// Looks up a present core.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU id to look up.
    ///
    /// # Returns
    ///
    /// The core's placement record, or `None` when it is not present.
    pub fn core(&self, lcore: u32) -> Option<&CoreInfo> {
        self.cores.iter().find(|c| c.lcore == lcore)
    }

    /// Tests whether a logical id names a present core.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU id to test.
    ///
    /// # Returns
    ///
    /// `true` when the core is present.
    pub fn has_core(&self, lcore: u32) -> bool {
        self.core(lcore).is_some()
    }

    /// Counts the present cores.
    ///
    /// # Returns
    ///
    /// The number of present cores. May be smaller than `max_lcore + 1`
    /// when core ids are sparse.
    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    fn unique_ids(&self, f: impl Fn(&CoreInfo) -> u32) -> Vec<u32> {
        let mut ids: Vec<u32> = self.cores.iter().map(f).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// # Returns
    ///
    /// The sorted list of socket ids.
    pub fn sockets(&self) -> Vec<u32> {
        self.unique_ids(|c| c.socket)
    }

    /// # Returns
    ///
    /// The sorted list of L3 cluster ids.
    pub fn l3_ids(&self) -> Vec<u32> {
        self.unique_ids(|c| c.l3_id)
    }

    /// # Returns
    ///
    /// The sorted list of L2 cluster ids.
    pub fn l2_ids(&self) -> Vec<u32> {
        self.unique_ids(|c| c.l2_id)
    }

    /// # Returns
    ///
    /// The sorted list of NUMA node ids.
    pub fn numa_ids(&self) -> Vec<u32> {
        self.unique_ids(|c| c.numa)
    }

    /// # Returns
    ///
    /// The sorted list of L3 cache-allocation domain ids.
    pub fn l3cat_ids(&self) -> Vec<u32> {
        self.unique_ids(|c| c.l3cat_id)
    }

    /// # Returns
    ///
    /// The sorted list of memory-bandwidth-allocation domain ids.
    pub fn mba_ids(&self) -> Vec<u32> {
        self.unique_ids(|c| c.mba_id)
    }

    /// # Returns
    ///
    /// The sorted list of slow-memory-bandwidth-allocation domain ids.
    pub fn smba_ids(&self) -> Vec<u32> {
        self.unique_ids(|c| c.smba_id)
    }

    /// Lists the cores of one socket.
    ///
    /// # Arguments
    ///
    /// * `socket` - Physical package id.
    ///
    /// # Returns
    ///
    /// Logical ids of the cores on that socket.
    pub fn cores_of_socket(&self, socket: u32) -> Vec<u32> {
        self.cores
            .iter()
            .filter(|c| c.socket == socket)
            .map(|c| c.lcore)
            .collect()
    }

    /// Lists the cores of one L3 cluster.
    ///
    /// # Arguments
    ///
    /// * `l3_id` - Cluster of cores sharing the last-level cache.
    ///
    /// # Returns
    ///
    /// Logical ids of the cores in that cluster.
    pub fn cores_of_l3(&self, l3_id: u32) -> Vec<u32> {
        self.cores
            .iter()
            .filter(|c| c.l3_id == l3_id)
            .map(|c| c.lcore)
            .collect()
    }

    /// Picks a representative core of an L3 allocation domain, for
    /// register targeting.
    ///
    /// # Arguments
    ///
    /// * `l3cat_id` - L3 cache-allocation domain id.
    ///
    /// # Returns
    ///
    /// One core of the domain, or `None` for an unknown domain.
    pub fn one_core_of_l3cat(&self, l3cat_id: u32) -> Option<u32> {
        self.cores
            .iter()
            .find(|c| c.l3cat_id == l3cat_id)
            .map(|c| c.lcore)
    }

    /// Picks a representative core of an L2 cluster, for register
    /// targeting.
    ///
    /// # Arguments
    ///
    /// * `l2_id` - L2 cluster id.
    ///
    /// # Returns
    ///
    /// One core of the cluster, or `None` for an unknown cluster.
    pub fn one_core_of_l2(&self, l2_id: u32) -> Option<u32> {
        self.cores
            .iter()
            .find(|c| c.l2_id == l2_id)
            .map(|c| c.lcore)
    }

    /// Picks a representative core of a memory-bandwidth domain, for
    /// register targeting.
    ///
    /// # Arguments
    ///
    /// * `mba_id` - Memory-bandwidth-allocation domain id.
    ///
    /// # Returns
    ///
    /// One core of the domain, or `None` for an unknown domain.
    pub fn one_core_of_mba(&self, mba_id: u32) -> Option<u32> {
        self.cores
            .iter()
            .find(|c| c.mba_id == mba_id)
            .map(|c| c.lcore)
    }

    /// Picks a representative core of a slow-memory-bandwidth domain, for
    /// register targeting.
    ///
    /// # Arguments
    ///
    /// * `smba_id` - Slow-memory-bandwidth-allocation domain id.
    ///
    /// # Returns
    ///
    /// One core of the domain, or `None` for an unknown domain.
    pub fn one_core_of_smba(&self, smba_id: u32) -> Option<u32> {
        self.cores
            .iter()
            .find(|c| c.smba_id == smba_id)
            .map(|c| c.lcore)
    }
}
