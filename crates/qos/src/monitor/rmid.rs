//! Monitoring-ID bookkeeping.
//!
//! Each monitoring cluster holds `max_rmid` IDs. ID 0 is the "unassigned"
//! sentinel every idle core is bound to, so it is never handed out. IDs
//! found in use by another process at init are marked unavailable and stay
//! that way for the life of the context.

use crate::common::{Error, Result};

/// State of one monitoring ID within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmidState {
    /// Available for allocation.
    Free,
    /// Allocated to a live group by this process.
    Allocated,
    /// In use by another process; never allocated or freed here.
    Unavailable,
}

/// Per-cluster monitoring-ID state vectors.
#[derive(Debug)]
pub struct RmidPool {
    clusters: Vec<Vec<RmidState>>,
    max_rmid: u32,
}

impl RmidPool {
    /// Creates a pool with every ID free.
    ///
    /// # Arguments
    ///
    /// * `num_clusters` - Number of monitoring clusters to track.
    /// * `max_rmid` - Number of IDs per cluster.
    ///
    /// # Returns
    ///
    /// The pool with all IDs in the free state.
    pub fn new(num_clusters: usize, max_rmid: u32) -> Self {
        Self {
            clusters: vec![vec![RmidState::Free; max_rmid as usize]; num_clusters],
            max_rmid,
        }
    }

    /// # Returns
    ///
    /// The number of clusters tracked.
    pub fn num_clusters(&self) -> usize {
        self.clusters.len()
    }

    fn cluster_mut(&mut self, cluster: u32) -> Result<&mut Vec<RmidState>> {
        self.clusters
            .get_mut(cluster as usize)
            .ok_or_else(|| Error::param(format!("cluster {cluster} out of range")))
    }

    /// Allocates an ID in `cluster`, scanning from `event_max_rmid - 1`
    /// down to 1.
    ///
    /// The descending scan preserves low-numbered IDs for events whose ID
    /// range is narrower than the platform maximum. A later wide-range
    /// request can still starve when only low IDs remain; that is a known
    /// limitation inherited from the hardware model.
    ///
    /// # Arguments
    ///
    /// * `cluster` - Cluster to allocate from.
    /// * `event_max_rmid` - ID ceiling of the narrowest selected event.
    ///
    /// # Returns
    ///
    /// The highest free ID below the ceiling.
    pub fn alloc(&mut self, cluster: u32, event_max_rmid: u32) -> Result<u32> {
        let ceiling = event_max_rmid.min(self.max_rmid);
        let table = self.cluster_mut(cluster)?;
        for id in (1..ceiling).rev() {
            if table[id as usize] == RmidState::Free {
                table[id as usize] = RmidState::Allocated;
                return Ok(id);
            }
        }
        Err(Error::Resource(format!(
            "no free monitoring ID in cluster {cluster}"
        )))
    }

    /// Returns an allocated ID to the free state.
    ///
    /// Freeing an ID that is free or unavailable is an error.
    ///
    /// # Arguments
    ///
    /// * `cluster` - Cluster the ID belongs to.
    /// * `rmid` - The ID to free.
    pub fn free(&mut self, cluster: u32, rmid: u32) -> Result<()> {
        if rmid == 0 || rmid >= self.max_rmid {
            return Err(Error::param(format!("monitoring ID {rmid} out of range")));
        }
        let table = self.cluster_mut(cluster)?;
        match table[rmid as usize] {
            RmidState::Allocated => {
                table[rmid as usize] = RmidState::Free;
                Ok(())
            }
            state => Err(Error::param(format!(
                "monitoring ID {rmid} in cluster {cluster} is {state:?}, not allocated"
            ))),
        }
    }

    /// Marks an ID as owned by another process.
    ///
    /// # Arguments
    ///
    /// * `cluster` - Cluster the ID belongs to.
    /// * `rmid` - The ID to mark; 0 and out-of-range IDs are ignored.
    pub fn mark_unavailable(&mut self, cluster: u32, rmid: u32) -> Result<()> {
        if rmid == 0 || rmid >= self.max_rmid {
            return Ok(());
        }
        let table = self.cluster_mut(cluster)?;
        table[rmid as usize] = RmidState::Unavailable;
        Ok(())
    }

    /// Looks up the state of one ID.
    ///
    /// # Arguments
    ///
    /// * `cluster` - Cluster the ID belongs to.
    /// * `rmid` - The ID to look up.
    ///
    /// # Returns
    ///
    /// The ID's state, or `None` when either index is out of range.
    pub fn state(&self, cluster: u32, rmid: u32) -> Option<RmidState> {
        self.clusters
            .get(cluster as usize)?
            .get(rmid as usize)
            .copied()
    }
}
