//! Toy platform: 2 sockets x 4 cores, 16-way L3 with 4 classes,
//! 8-way L2 with 4 classes, linear bandwidth throttling in steps of 10,
//! and 16 monitoring IDs per cluster.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use pqctl_core::hw::cpuid::CpuidRegs;
use pqctl_core::{Config, Qos};

use crate::common::mock_hw::{MockCpuid, MockMsr};

/// Cores per socket in the toy platform.
pub const CORES_PER_SOCKET: u32 = 4;
/// Total cores.
pub const NUM_CORES: u32 = 8;
/// L3 ways.
pub const L3_WAYS: u32 = 16;
/// L3 classes.
pub const L3_CLASSES: u32 = 4;
/// Monitoring IDs per cluster.
pub const MAX_RMID: u32 = 16;

fn write(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Builds a sysfs CPU tree for the toy platform in a tempdir.
pub fn toy_sysfs() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    write(&root.join("online"), "0-7\n");
    for cpu in 0..NUM_CORES {
        let socket = cpu / CORES_PER_SOCKET;
        let cpu_dir = root.join(format!("cpu{cpu}"));
        write(
            &cpu_dir.join("topology/physical_package_id"),
            &format!("{socket}\n"),
        );
        fs::create_dir_all(cpu_dir.join(format!("node{socket}"))).unwrap();

        let l2 = cpu_dir.join("cache/index2");
        write(&l2.join("level"), "2\n");
        write(&l2.join("type"), "Unified\n");
        write(&l2.join("id"), &format!("{cpu}\n"));
        write(&l2.join("shared_cpu_list"), &format!("{cpu}\n"));
        write(&l2.join("ways_of_associativity"), "8\n");
        write(&l2.join("number_of_sets"), "512\n");
        write(&l2.join("physical_line_partition"), "1\n");
        write(&l2.join("coherency_line_size"), "64\n");
        write(&l2.join("size"), "256K\n");

        let l3 = cpu_dir.join("cache/index3");
        let shared = if socket == 0 { "0-3" } else { "4-7" };
        write(&l3.join("level"), "3\n");
        write(&l3.join("type"), "Unified\n");
        write(&l3.join("id"), &format!("{socket}\n"));
        write(&l3.join("shared_cpu_list"), &format!("{shared}\n"));
        write(&l3.join("ways_of_associativity"), "16\n");
        write(&l3.join("number_of_sets"), "1024\n");
        write(&l3.join("physical_line_partition"), "1\n");
        write(&l3.join("coherency_line_size"), "64\n");
        write(&l3.join("size"), "1024K\n");
    }
    dir
}

/// Canned CPUID leaves matching the toy platform.
pub fn toy_cpuid() -> MockCpuid {
    let mut cpuid = MockCpuid::new();
    cpuid
        .set(
            0,
            0,
            CpuidRegs {
                eax: 0x10,
                ebx: 0x756e_6547, // "Genu"
                ecx: 0x6c65_746e, // "ntel"
                edx: 0x4965_6e69, // "ineI"
            },
        )
        .set(
            0x7,
            0,
            CpuidRegs {
                ebx: (1 << 12) | (1 << 15),
                ..CpuidRegs::default()
            },
        )
        // Monitoring: 16 IDs, L3 resource present.
        .set(
            0xF,
            0,
            CpuidRegs {
                ebx: MAX_RMID - 1,
                edx: 1 << 1,
                ..CpuidRegs::default()
            },
        )
        // Occupancy + total + local bandwidth, scale 64 bytes per unit.
        .set(
            0xF,
            1,
            CpuidRegs {
                eax: 0,
                ebx: 64,
                ecx: MAX_RMID - 1,
                edx: 0b111,
            },
        )
        // Allocation resources: L3, L2, MBA.
        .set(
            0x10,
            0,
            CpuidRegs {
                ebx: (1 << 1) | (1 << 2) | (1 << 3),
                ..CpuidRegs::default()
            },
        )
        // L3: 16 ways, partitioning capable, 4 classes.
        .set(
            0x10,
            1,
            CpuidRegs {
                eax: L3_WAYS - 1,
                ebx: 0,
                ecx: 1 << 2,
                edx: L3_CLASSES - 1,
            },
        )
        // L2: 8 ways, 4 classes.
        .set(
            0x10,
            2,
            CpuidRegs {
                eax: 7,
                ebx: 0,
                ecx: 0,
                edx: 3,
            },
        )
        // Bandwidth: max delay 90 so the step is 10, linear, 4 classes.
        .set(
            0x10,
            3,
            CpuidRegs {
                eax: 89,
                ebx: 0,
                ecx: 1 << 2,
                edx: 3,
            },
        );
    cpuid
}

/// A register file pre-loaded with the hardware's power-on defaults:
/// permissive masks everywhere, every core on class 0 and ID 0.
pub fn toy_msr() -> MockMsr {
    let msr = MockMsr::new();
    for core in 0..NUM_CORES {
        for class in 0..L3_CLASSES {
            msr.set(core, 0xC90 + class, 0xFFFF);
            msr.set(core, 0xC10 + class, 0xFF);
        }
    }
    msr
}

/// The toy platform with an AMD vendor tag and the slow-memory extended
/// leaf: 4 slow-memory classes, targets up to 4096 MBps.
pub fn amd_cpuid() -> MockCpuid {
    let mut cpuid = toy_cpuid();
    cpuid
        .set(
            0,
            0,
            CpuidRegs {
                eax: 0x10,
                ebx: 0x6874_7541, // "Auth"
                ecx: 0x444d_4163, // "cAMD"
                edx: 0x6974_6e65, // "enti"
            },
        )
        .set(
            0x8000_0020,
            0,
            CpuidRegs {
                ebx: 1 << 2,
                ..CpuidRegs::default()
            },
        )
        .set(
            0x8000_0020,
            2,
            CpuidRegs {
                eax: 4096,
                edx: 3,
                ..CpuidRegs::default()
            },
        );
    cpuid
}

/// A built context plus the handles tests poke at.
pub struct ToyQos {
    /// The library context on the register back-end.
    pub qos: Qos,
    /// Shared handle to the mock register file.
    pub msr: MockMsr,
    _sysfs: TempDir,
    _lockdir: TempDir,
}

/// Builds a toy context on the register back-end with the given
/// configuration, register file and CPUID leaves.
pub fn toy_qos_custom(mut config: Config, msr: MockMsr, cpuid: MockCpuid) -> ToyQos {
    config.interface = pqctl_core::config::Interface::Register;
    let sysfs = toy_sysfs();
    let lockdir = TempDir::new().unwrap();
    let qos = Qos::builder(config)
        .sysfs_root(sysfs.path())
        .resctrl_root(lockdir.path().join("no-resctrl"))
        .lockfile(lockdir.path().join("lock"))
        .msr_io(Box::new(msr.clone()))
        .cpuid(Box::new(cpuid))
        .build()
        .unwrap();
    ToyQos {
        qos,
        msr,
        _sysfs: sysfs,
        _lockdir: lockdir,
    }
}

/// Builds a toy context with the given configuration.
pub fn toy_qos_with(config: Config, msr: MockMsr) -> ToyQos {
    toy_qos_custom(config, msr, toy_cpuid())
}

/// Builds a toy context with the default configuration.
pub fn toy_qos() -> ToyQos {
    toy_qos_with(Config::default(), toy_msr())
}
