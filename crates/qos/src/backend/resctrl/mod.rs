//! Kernel resctrl pseudo-filesystem back-end.
//!
//! The kernel exposes one directory per class of service (the filesystem
//! root doubles as class 0), each holding a `schemata`/`tasks`/`cpus`
//! triple, a capability subtree under `info/`, and monitoring groups under
//! `mon_groups/`. Single-file writes are atomic in the kernel; multi-file
//! updates are serialised by the caller under the global lock.

pub mod schemata;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::backend::resctrl::schemata::Schemata;
use crate::common::{Error, Result};
use crate::topology::probe::parse_cpu_list;

/// Default mount point of the resctrl filesystem.
pub const RESCTRL_ROOT: &str = "/sys/fs/resctrl";

/// Prefix for class-of-service directories.
const COS_DIR_PREFIX: &str = "COS";
/// Prefix for monitoring-group directories created by this library.
const MON_GROUP_PREFIX: &str = "mon_pqctl_";

/// Capability limits published by the kernel under `info/`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResctrlInfo {
    /// Class count for L3 allocation; 0 when the resource is absent.
    pub l3_num_closids: u32,
    /// Class count for L2 allocation.
    pub l2_num_closids: u32,
    /// Class count for bandwidth allocation.
    pub mb_num_closids: u32,
    /// Class count for slow-memory-bandwidth allocation.
    pub smba_num_closids: u32,
    /// L3 code/data partitioning mounted on.
    pub l3_cdp: bool,
    /// L2 code/data partitioning mounted on.
    pub l2_cdp: bool,
    /// Monitoring-ID count; 0 when monitoring is absent.
    pub num_rmids: u32,
    /// Occupancy monitoring offered.
    pub mon_llc_occupancy: bool,
    /// Total-bandwidth monitoring offered.
    pub mon_mbm_total: bool,
    /// Local-bandwidth monitoring offered.
    pub mon_mbm_local: bool,
    /// Bandwidth values are MBps targets rather than percentages.
    pub mba_mbps: bool,
}

/// Kernel-filesystem back-end state.
#[derive(Debug)]
pub struct ResctrlBackend {
    root: PathBuf,
    info: ResctrlInfo,
}

/// Tests for a mounted resctrl filesystem.
///
/// # Arguments
///
/// * `root` - Candidate mount point.
///
/// # Returns
///
/// `true` when a resctrl filesystem is mounted there.
pub fn detect(root: &Path) -> bool {
    root.join("schemata").is_file() || root.join("info").is_dir()
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::transport(format!("read {}", path.display()), e))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).map_err(|e| Error::transport(format!("write {}", path.display()), e))
}

fn read_u32_file(path: &Path) -> Result<u32> {
    read_file(path)?
        .trim()
        .parse()
        .map_err(|_| Error::Parse(format!("expected integer in {}", path.display())))
}

impl ResctrlBackend {
    /// Opens the back-end and parses the `info/` capability subtree.
    ///
    /// # Arguments
    ///
    /// * `root` - Mount point of the resctrl filesystem.
    ///
    /// # Returns
    ///
    /// The back-end with the kernel's published limits cached.
    pub fn open(root: PathBuf) -> Result<Self> {
        if !detect(&root) {
            return Err(Error::Resource(format!(
                "no resctrl filesystem at {}",
                root.display()
            )));
        }
        let info = Self::parse_info(&root)?;
        debug!(?info, root = %root.display(), "resctrl opened");
        Ok(Self { root, info })
    }

    /// # Returns
    ///
    /// The kernel-published limits parsed at open.
    pub fn info(&self) -> &ResctrlInfo {
        &self.info
    }

    /// `num_closids` of the first resource directory that exists; the
    /// code/data variants appear instead of the plain name while
    /// partitioning is mounted on.
    fn closids(dir: &Path, names: &[&str]) -> Result<u32> {
        for name in names {
            let path = dir.join(name).join("num_closids");
            if path.is_file() {
                return read_u32_file(&path);
            }
        }
        Ok(0)
    }

    fn parse_info(root: &Path) -> Result<ResctrlInfo> {
        let mut info = ResctrlInfo::default();
        let dir = root.join("info");
        info.l3_num_closids = Self::closids(&dir, &["L3", "L3CODE"])?;
        info.l2_num_closids = Self::closids(&dir, &["L2", "L2CODE"])?;
        info.mb_num_closids = Self::closids(&dir, &["MB"])?;
        info.smba_num_closids = Self::closids(&dir, &["SMBA"])?;
        info.l3_cdp = dir.join("L3CODE").is_dir();
        info.l2_cdp = dir.join("L2CODE").is_dir();
        let mon = dir.join("L3_MON");
        if mon.is_dir() {
            info.num_rmids = read_u32_file(&mon.join("num_rmids")).unwrap_or(0);
            if let Ok(features) = read_file(&mon.join("mon_features")) {
                for feature in features.lines() {
                    match feature.trim() {
                        "llc_occupancy" => info.mon_llc_occupancy = true,
                        "mbm_total_bytes" => info.mon_mbm_total = true,
                        "mbm_local_bytes" => info.mon_mbm_local = true,
                        other => debug!(feature = other, "unknown monitoring feature"),
                    }
                }
            }
        }
        // Present only when the filesystem was mounted with MBps targets.
        info.mba_mbps = dir.join("MB").join("mba_MBps").is_file();
        Ok(info)
    }

    /// Directory of a class of service; the root for class 0.
    fn class_dir(&self, class_id: u32) -> PathBuf {
        if class_id == 0 {
            self.root.clone()
        } else {
            self.root.join(format!("{COS_DIR_PREFIX}{class_id}"))
        }
    }

    fn ensure_class_dir(&self, class_id: u32) -> Result<PathBuf> {
        let dir = self.class_dir(class_id);
        if !dir.is_dir() {
            fs::create_dir(&dir)
                .map_err(|e| Error::transport(format!("create {}", dir.display()), e))?;
        }
        Ok(dir)
    }

    /// Reads and parses a class's schemata file.
    ///
    /// # Arguments
    ///
    /// * `class_id` - Class of service; 0 is the filesystem root.
    ///
    /// # Returns
    ///
    /// The class's per-domain definitions.
    pub fn read_schemata(&self, class_id: u32) -> Result<Schemata> {
        let path = self.class_dir(class_id).join("schemata");
        Schemata::parse(&read_file(&path)?)
    }

    /// Writes a class's schemata file.
    ///
    /// The kernel applies a single write atomically; read-modify-write
    /// cycles happen under the global lock.
    ///
    /// # Arguments
    ///
    /// * `class_id` - Class of service; 0 is the filesystem root.
    /// * `schemata` - The definitions to write.
    pub fn write_schemata(&self, class_id: u32, schemata: &Schemata) -> Result<()> {
        let dir = self.ensure_class_dir(class_id)?;
        write_file(&dir.join("schemata"), &schemata.emit())
    }

    /// Writes a class's CPU membership as a comma-separated list.
    ///
    /// # Arguments
    ///
    /// * `class_id` - Target class of service.
    /// * `cpus` - The class's complete core membership.
    pub fn write_class_cpus(&self, class_id: u32, cpus: &[u32]) -> Result<()> {
        let dir = self.ensure_class_dir(class_id)?;
        let list = cpus
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        write_file(&dir.join("cpus"), &list)
    }

    /// Reads a class's CPU membership.
    ///
    /// # Arguments
    ///
    /// * `class_id` - Class of service to read.
    ///
    /// # Returns
    ///
    /// Logical ids of the cores currently in the class.
    pub fn read_class_cpus(&self, class_id: u32) -> Result<Vec<u32>> {
        let path = self.class_dir(class_id).join("cpus");
        parse_cpu_list(&read_file(&path)?)
    }

    /// Moves a task into a class by appending its pid to the class's tasks
    /// file.
    ///
    /// # Arguments
    ///
    /// * `pid` - Task to move.
    /// * `class_id` - Target class of service.
    pub fn assoc_task(&self, pid: u32, class_id: u32) -> Result<()> {
        let dir = self.ensure_class_dir(class_id)?;
        write_file(&dir.join("tasks"), &format!("{pid}\n"))
    }

    /// Finds the class a core belongs to by scanning membership lists.
    ///
    /// # Arguments
    ///
    /// * `lcore` - Logical CPU to look for.
    /// * `num_classes` - Number of class directories to scan.
    ///
    /// # Returns
    ///
    /// The class listing the core, or 0 when no class directory does.
    pub fn core_class(&self, lcore: u32, num_classes: u32) -> Result<u32> {
        for class_id in 1..num_classes {
            let dir = self.class_dir(class_id);
            if !dir.is_dir() {
                continue;
            }
            if self.read_class_cpus(class_id)?.contains(&lcore) {
                return Ok(class_id);
            }
        }
        Ok(0)
    }

    /// Removes every class directory this library may have created,
    /// returning cores and tasks to class 0.
    pub fn remove_class_dirs(&self) -> Result<()> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| Error::transport(format!("read {}", self.root.display()), e))?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(COS_DIR_PREFIX)
                && fs::remove_dir(entry.path()).is_err()
            {
                if let Err(e) = fs::remove_dir_all(entry.path()) {
                    warn!(dir = %entry.path().display(), error = %e, "class dir not removed");
                }
            }
        }
        Ok(())
    }

    /// Creates a monitoring group.
    ///
    /// # Arguments
    ///
    /// * `token` - Uniquifier embedded in the group name.
    /// * `cores` - Cores to cover; empty for a task-scoped group.
    ///
    /// # Returns
    ///
    /// The created group's directory name.
    pub fn mon_group_create(&self, token: u64, cores: &[u32]) -> Result<String> {
        let name = format!("{MON_GROUP_PREFIX}{token}");
        let dir = self.root.join("mon_groups").join(&name);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::transport(format!("create {}", dir.display()), e))?;
        if !cores.is_empty() {
            let list = cores
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            write_file(&dir.join("cpus"), &list)?;
        }
        Ok(name)
    }

    /// Adds a task to a monitoring group.
    ///
    /// # Arguments
    ///
    /// * `name` - Group directory name from `mon_group_create`.
    /// * `pid` - Task to add.
    pub fn mon_group_add_task(&self, name: &str, pid: u32) -> Result<()> {
        let path = self.root.join("mon_groups").join(name).join("tasks");
        write_file(&path, &format!("{pid}\n"))
    }

    /// Deletes a monitoring group; the kernel rebinds its cores.
    ///
    /// The kernel removes a group's virtual files with the directory; a
    /// recursive fallback covers plain-filesystem test fixtures.
    ///
    /// # Arguments
    ///
    /// * `name` - Group directory name from `mon_group_create`.
    pub fn mon_group_delete(&self, name: &str) -> Result<()> {
        let dir = self.root.join("mon_groups").join(name);
        if fs::remove_dir(&dir).is_ok() {
            return Ok(());
        }
        fs::remove_dir_all(&dir)
            .map_err(|e| Error::transport(format!("remove {}", dir.display()), e))
    }

    /// Sums one event file across a monitoring group's domain directories.
    ///
    /// A domain reporting `Unavailable` surfaces as the corresponding
    /// error so that polling can apply its retry policy.
    ///
    /// # Arguments
    ///
    /// * `name` - Group directory name from `mon_group_create`.
    /// * `event_file` - Kernel event file name, e.g. `llc_occupancy`.
    ///
    /// # Returns
    ///
    /// The event value summed over every domain directory.
    pub fn mon_group_read(&self, name: &str, event_file: &str) -> Result<u64> {
        let data = self.root.join("mon_groups").join(name).join("mon_data");
        let entries = fs::read_dir(&data)
            .map_err(|e| Error::transport(format!("read {}", data.display()), e))?;
        let mut total = 0u64;
        let mut seen = false;
        for entry in entries.flatten() {
            if !entry.file_name().to_string_lossy().starts_with("mon_L3_") {
                continue;
            }
            let path = entry.path().join(event_file);
            if !path.is_file() {
                continue;
            }
            let text = read_file(&path)?;
            let text = text.trim();
            if text == "Unavailable" {
                return Err(Error::Unavailable);
            }
            if text == "Error" {
                return Err(Error::Other(format!("{event_file} read error in {name}")));
            }
            total = total.wrapping_add(
                text.parse::<u64>()
                    .map_err(|_| Error::Parse(format!("bad counter in {}", path.display())))?,
            );
            seen = true;
        }
        if !seen {
            return Err(Error::Resource(format!(
                "monitoring group {name} has no domain data"
            )));
        }
        Ok(total)
    }

    /// Deletes any monitoring groups left behind by a previous run.
    pub fn mon_groups_cleanup(&self) {
        let dir = self.root.join("mon_groups");
        let Ok(entries) = fs::read_dir(&dir) else {
            return;
        };
        for entry in entries.flatten() {
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(MON_GROUP_PREFIX)
            {
                if fs::remove_dir(entry.path()).is_err() {
                    let _ = fs::remove_dir_all(entry.path());
                }
            }
        }
    }
}
