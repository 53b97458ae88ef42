//! Topology probe.
//!
//! Two sources, tried in order:
//! 1. **Sysfs:** The kernel's per-CPU topology tree. Preferred because it
//!    covers offline cores and non-uniform core ids.
//! 2. **CPUID:** Executed on each logical CPU in turn under scheduler
//!    affinity, decoding the extended-topology and cache-parameter leaves.
//!
//! The probe records the maximum logical-core id observed and the count of
//! present cores, which may be smaller.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::common::{Error, Result};
use crate::hw::cpuid::{vendor_string, Cpuid};
use crate::topology::{CacheInfo, CoreInfo, Topology, Vendor};

/// Default sysfs CPU tree root.
pub const SYSFS_CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Builds the topology snapshot.
///
/// Uses the sysfs tree rooted at `sysfs_root` when present, otherwise falls
/// back to CPUID enumeration.
///
/// # Arguments
///
/// * `sysfs_root` - Root of the kernel's per-CPU topology tree.
/// * `cpuid` - Leaf source for the vendor tag and the fallback path.
///
/// # Returns
///
/// The immutable snapshot; an error when no CPU can be found at all.
pub fn probe(sysfs_root: &Path, cpuid: &dyn Cpuid) -> Result<Topology> {
    let vendor = detect_vendor(cpuid);
    if sysfs_root.is_dir() {
        let mut topo = probe_sysfs(sysfs_root)?;
        topo.vendor = vendor;
        return Ok(topo);
    }
    info!("sysfs topology unavailable, falling back to CPUID enumeration");
    probe_cpuid(cpuid, vendor)
}

fn detect_vendor(cpuid: &dyn Cpuid) -> Vendor {
    let Ok(leaf0) = cpuid.leaf(0, 0) else {
        return Vendor::Unknown;
    };
    match &vendor_string(leaf0) {
        b"GenuineIntel" => Vendor::Intel,
        b"AuthenticAMD" => Vendor::Amd,
        b"HygonGenuine" => Vendor::Hygon,
        _ => Vendor::Unknown,
    }
}

/// Parses `0-3,8,10-11` style CPU list files.
pub(crate) fn parse_cpu_list(text: &str) -> Result<Vec<u32>> {
    let mut cpus = Vec::new();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(cpus);
    }
    for part in trimmed.split(',') {
        let part = part.trim();
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo
                .trim()
                .parse()
                .map_err(|_| Error::Parse(format!("bad cpu range: {part}")))?;
            let hi: u32 = hi
                .trim()
                .parse()
                .map_err(|_| Error::Parse(format!("bad cpu range: {part}")))?;
            if hi < lo {
                return Err(Error::Parse(format!("inverted cpu range: {part}")));
            }
            cpus.extend(lo..=hi);
        } else {
            cpus.push(
                part.parse()
                    .map_err(|_| Error::Parse(format!("bad cpu id: {part}")))?,
            );
        }
    }
    Ok(cpus)
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
}

fn read_u32(path: &Path) -> Option<u32> {
    read_trimmed(path)?.parse().ok()
}

/// Parses sizes like `16384K` or `512` (bytes).
fn parse_size(text: &str) -> Option<u32> {
    let t = text.trim();
    if let Some(kb) = t.strip_suffix(['K', 'k']) {
        kb.parse::<u32>().ok().map(|v| v * 1024)
    } else if let Some(mb) = t.strip_suffix(['M', 'm']) {
        mb.parse::<u32>().ok().map(|v| v * 1024 * 1024)
    } else {
        t.parse().ok()
    }
}

/// Enumerates present cores from the sysfs `online` file, falling back to
/// the `cpu<N>` directory names when it is absent.
fn sysfs_present_cpus(root: &Path) -> Result<Vec<u32>> {
    if let Some(text) = read_trimmed(&root.join("online")) {
        let cpus = parse_cpu_list(&text)?;
        if !cpus.is_empty() {
            return Ok(cpus);
        }
    }
    let mut cpus = Vec::new();
    let entries = fs::read_dir(root)
        .map_err(|e| Error::transport(format!("read {}", root.display()), e))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(idx) = name.strip_prefix("cpu") {
            if let Ok(n) = idx.parse::<u32>() {
                cpus.push(n);
            }
        }
    }
    cpus.sort_unstable();
    if cpus.is_empty() {
        return Err(Error::Resource("no CPUs found in sysfs tree".into()));
    }
    Ok(cpus)
}

struct SysfsCache {
    level: u32,
    id: Option<u32>,
    shared: Vec<u32>,
    info: CacheInfo,
}

fn sysfs_cpu_caches(cpu_dir: &Path) -> Vec<SysfsCache> {
    let mut out = Vec::new();
    let cache_dir = cpu_dir.join("cache");
    let Ok(entries) = fs::read_dir(&cache_dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with("index") {
            continue;
        }
        let dir = entry.path();
        let Some(level) = read_u32(&dir.join("level")) else {
            continue;
        };
        // Instruction-only caches do not carry allocation state.
        if read_trimmed(&dir.join("type")).as_deref() == Some("Instruction") {
            continue;
        }
        let shared = read_trimmed(&dir.join("shared_cpu_list"))
            .and_then(|s| parse_cpu_list(&s).ok())
            .unwrap_or_default();
        let num_ways = read_u32(&dir.join("ways_of_associativity")).unwrap_or(0);
        let num_sets = read_u32(&dir.join("number_of_sets")).unwrap_or(0);
        let num_partitions = read_u32(&dir.join("physical_line_partition")).unwrap_or(1);
        let line_size = read_u32(&dir.join("coherency_line_size")).unwrap_or(0);
        let total_size = read_trimmed(&dir.join("size"))
            .and_then(|s| parse_size(&s))
            .unwrap_or(num_ways * num_sets * line_size * num_partitions);
        out.push(SysfsCache {
            level,
            id: read_u32(&dir.join("id")),
            shared,
            info: CacheInfo {
                detected: true,
                num_ways,
                num_sets,
                num_partitions,
                line_size,
                total_size,
                way_size: if num_ways > 0 { total_size / num_ways } else { 0 },
            },
        });
    }
    out
}

/// NUMA node of a CPU, from the `node<k>` entry in its sysfs directory.
fn sysfs_numa_node(cpu_dir: &Path) -> Option<u32> {
    let entries = fs::read_dir(cpu_dir).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(n) = name.strip_prefix("node") {
            if let Ok(id) = n.parse::<u32>() {
                return Some(id);
            }
        }
    }
    None
}

fn probe_sysfs(root: &Path) -> Result<Topology> {
    let cpus = sysfs_present_cpus(root)?;
    let mut cores = Vec::with_capacity(cpus.len());
    let mut l2_info = CacheInfo::default();
    let mut l3_info = CacheInfo::default();

    for &lcore in &cpus {
        let cpu_dir: PathBuf = root.join(format!("cpu{lcore}"));
        let socket = read_u32(&cpu_dir.join("topology/physical_package_id")).ok_or_else(|| {
            Error::Parse(format!("cpu{lcore}: missing topology/physical_package_id"))
        })?;
        let numa = sysfs_numa_node(&cpu_dir).unwrap_or(socket);

        let mut l2_id = None;
        let mut l3_id = None;
        for cache in sysfs_cpu_caches(&cpu_dir) {
            // Cluster id: the kernel's cache id when exported, else the
            // lowest CPU sharing the cache.
            let cluster = cache.id.or_else(|| cache.shared.first().copied());
            match cache.level {
                2 => {
                    l2_id = cluster;
                    if !l2_info.detected {
                        l2_info = cache.info;
                    }
                }
                3 => {
                    l3_id = cluster;
                    if !l3_info.detected {
                        l3_info = cache.info;
                    }
                }
                _ => {}
            }
        }
        let l3_id = l3_id.unwrap_or(socket);
        let l2_id = l2_id.unwrap_or(lcore);
        cores.push(CoreInfo {
            lcore,
            socket,
            numa,
            l3_id,
            l2_id,
            l3cat_id: l3_id,
            mba_id: l3_id,
            smba_id: socket,
        });
        debug!(lcore, socket, numa, l3_id, l2_id, "probed core");
    }

    if cores.is_empty() {
        return Err(Error::Resource("no present CPUs".into()));
    }
    let max_lcore = cores.iter().map(|c| c.lcore).max().unwrap_or(0);
    info!(
        cores = cores.len(),
        max_lcore,
        sockets = ?cores.iter().map(|c| c.socket).max(),
        "topology probed from sysfs"
    );
    Ok(Topology {
        vendor: Vendor::Unknown,
        cores,
        max_lcore,
        l2: l2_info,
        l3: l3_info,
    })
}

/// Pins the current thread to `lcore` for the duration of `f`.
#[cfg(target_os = "linux")]
fn with_affinity<T>(lcore: u32, f: impl FnOnce() -> T) -> Result<T> {
    // SAFETY: cpu_set_t is plain data; zeroed is a valid empty set.
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe { libc::CPU_SET(lcore as usize, &mut set) };
    // SAFETY: set points to a live cpu_set_t of the size passed.
    let rc = unsafe {
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        return Err(Error::transport(
            format!("pin to core {lcore}"),
            std::io::Error::last_os_error(),
        ));
    }
    Ok(f())
}

#[cfg(not(target_os = "linux"))]
fn with_affinity<T>(_lcore: u32, f: impl FnOnce() -> T) -> Result<T> {
    Ok(f())
}

/// Decodes socket and SMT/core shifts from the extended-topology leaf 0xB.
fn apic_package_shift(cpuid: &dyn Cpuid) -> Result<u32> {
    let mut shift = 0;
    for subleaf in 0..8 {
        let r = cpuid.leaf(0xB, subleaf)?;
        let level_type = (r.ecx >> 8) & 0xFF;
        if level_type == 0 {
            break;
        }
        shift = r.eax & 0x1F;
    }
    Ok(shift)
}

/// Cache cluster id for the given APIC id, from cache-parameter leaf 4.
fn cache_cluster(apic: u32, sharing: u32) -> u32 {
    let span = (sharing + 1).next_power_of_two();
    apic / span
}

fn probe_cpuid(cpuid: &dyn Cpuid, vendor: Vendor) -> Result<Topology> {
    // SAFETY: sysconf is always safe to call.
    let ncpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if ncpus <= 0 {
        return Err(Error::Resource("cannot count configured CPUs".into()));
    }
    let pkg_shift = apic_package_shift(cpuid)?;

    let mut cores = Vec::new();
    let mut l2_info = CacheInfo::default();
    let mut l3_info = CacheInfo::default();

    for lcore in 0..ncpus as u32 {
        let probed = with_affinity(lcore, || -> Result<(u32, Vec<CpuCache>)> {
            let apic = cpuid.leaf(0xB, 0)?.edx;
            let caches = cache_params(cpuid)?;
            Ok((apic, caches))
        });
        let Ok(Ok((apic, caches))) = probed else {
            warn!(lcore, "skipping core that could not be probed");
            continue;
        };
        let socket = apic >> pkg_shift;
        let mut l2_id = lcore;
        let mut l3_id = socket;
        for c in caches {
            match c.level {
                2 => {
                    l2_id = cache_cluster(apic, c.sharing);
                    l2_info = c.info;
                }
                3 => {
                    l3_id = cache_cluster(apic, c.sharing);
                    l3_info = c.info;
                }
                _ => {}
            }
        }
        cores.push(CoreInfo {
            lcore,
            socket,
            numa: socket,
            l3_id,
            l2_id,
            l3cat_id: l3_id,
            mba_id: l3_id,
            smba_id: socket,
        });
    }

    if cores.is_empty() {
        return Err(Error::Resource("no CPUs enumerable via CPUID".into()));
    }
    let max_lcore = cores.iter().map(|c| c.lcore).max().unwrap_or(0);
    Ok(Topology {
        vendor,
        cores,
        max_lcore,
        l2: l2_info,
        l3: l3_info,
    })
}

struct CpuCache {
    level: u32,
    sharing: u32,
    info: CacheInfo,
}

/// Walks the deterministic cache-parameter leaf (leaf 4) subleaves.
fn cache_params(cpuid: &dyn Cpuid) -> Result<Vec<CpuCache>> {
    let mut out = Vec::new();
    for subleaf in 0..16 {
        let r = cpuid.leaf(4, subleaf)?;
        let cache_type = r.eax & 0x1F;
        if cache_type == 0 {
            break;
        }
        // Skip instruction caches; type 1 = data, 3 = unified.
        if cache_type == 2 {
            continue;
        }
        let level = (r.eax >> 5) & 0x7;
        let sharing = (r.eax >> 14) & 0xFFF;
        let ways = ((r.ebx >> 22) & 0x3FF) + 1;
        let partitions = ((r.ebx >> 12) & 0x3FF) + 1;
        let line = (r.ebx & 0xFFF) + 1;
        let sets = r.ecx + 1;
        let total = ways * partitions * line * sets;
        out.push(CpuCache {
            level,
            sharing,
            info: CacheInfo {
                detected: true,
                num_ways: ways,
                num_sets: sets,
                num_partitions: partitions,
                line_size: line,
                total_size: total,
                way_size: total / ways,
            },
        });
    }
    Ok(out)
}
