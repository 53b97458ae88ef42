//! Platform quality-of-service CLI.
//!
//! This binary is a thin shell over the library surface. It performs:
//! 1. **Show:** Print the capability catalog and topology.
//! 2. **Monitor:** Start a core group and poll it on an interval.
//! 3. **Allocation:** Write class definitions, associate entities, assign
//!    and release classes, reset.

use std::collections::BTreeMap;
use std::process;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use pqctl_core::caps::MonitorCap;
use pqctl_core::config::{Interface, Toggle, Verbosity};
use pqctl_core::{
    CatCos, Config, MbaCos, MonEvent, MonEvents, PollStatus, Qos, ResetConfig, Technologies,
    Technology,
};

#[derive(Parser, Debug)]
#[command(
    name = "pqctl",
    author,
    version,
    about = "CPU cache monitoring, cache allocation and memory-bandwidth throttling",
    long_about = "Inspect and program the platform's quality-of-service hardware.\n\n\
Examples:\n  pqctl show\n  pqctl monitor --cores 0-3 --events llc,mbl,mbt\n  \
pqctl set-l3 --domain 0 --class 1 --mask 0xf0\n  pqctl assign --cores 0,1 --tech l3"
)]
struct Cli {
    /// Configuration file (JSON); flags below override its fields.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Back-end interface.
    #[arg(long, global = true, value_enum)]
    interface: Option<IfaceArg>,

    /// Verbose output (repeat for more).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum IfaceArg {
    Auto,
    Msr,
    Os,
    Mmio,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ToggleArg {
    Any,
    On,
    Off,
}

impl From<ToggleArg> for Toggle {
    fn from(value: ToggleArg) -> Self {
        match value {
            ToggleArg::Any => Toggle::Any,
            ToggleArg::On => Toggle::On,
            ToggleArg::Off => Toggle::Off,
        }
    }
}

impl std::fmt::Display for ToggleArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToggleArg::Any => "any",
            ToggleArg::On => "on",
            ToggleArg::Off => "off",
        };
        f.write_str(s)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print detected capabilities and topology.
    Show,

    /// Monitor cores and print counters on an interval.
    Monitor {
        /// Cores to monitor (e.g. 0,2,4-7).
        #[arg(long)]
        cores: String,

        /// Events: llc, mbl, mbt, mbr, ipc, miss, ref.
        #[arg(long, default_value = "llc,mbl,mbt")]
        events: String,

        /// Polling interval in milliseconds.
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,

        /// Number of polls; 0 runs until interrupted.
        #[arg(long, default_value_t = 0)]
        count: u64,
    },

    /// Write one L3 class definition.
    SetL3 {
        /// Allocation domain id.
        #[arg(long)]
        domain: u32,
        /// Class of service.
        #[arg(long)]
        class: u32,
        /// Way mask (partitioning off), e.g. 0xf0.
        #[arg(long, value_parser = parse_mask)]
        mask: Option<u64>,
        /// Code way mask (partitioning on).
        #[arg(long, value_parser = parse_mask)]
        code: Option<u64>,
        /// Data way mask (partitioning on).
        #[arg(long, value_parser = parse_mask)]
        data: Option<u64>,
    },

    /// Write one L2 class definition.
    SetL2 {
        /// Allocation domain id.
        #[arg(long)]
        domain: u32,
        /// Class of service.
        #[arg(long)]
        class: u32,
        /// Way mask (partitioning off).
        #[arg(long, value_parser = parse_mask)]
        mask: Option<u64>,
        /// Code way mask (partitioning on).
        #[arg(long, value_parser = parse_mask)]
        code: Option<u64>,
        /// Data way mask (partitioning on).
        #[arg(long, value_parser = parse_mask)]
        data: Option<u64>,
    },

    /// Program one memory-bandwidth class.
    SetMba {
        /// Bandwidth domain id.
        #[arg(long)]
        domain: u32,
        /// Class of service.
        #[arg(long)]
        class: u32,
        /// Available-bandwidth percentage.
        #[arg(long, conflicts_with = "mbps")]
        percent: Option<u32>,
        /// MBps target (controller mode).
        #[arg(long)]
        mbps: Option<u32>,
    },

    /// Program one slow-memory-bandwidth class.
    SetSmba {
        /// Slow-memory-bandwidth domain id.
        #[arg(long)]
        domain: u32,
        /// Class of service.
        #[arg(long)]
        class: u32,
        /// MBps target.
        #[arg(long)]
        mbps: u32,
    },

    /// Associate cores or a task with a class of service.
    Assoc {
        /// Cores to associate (e.g. 0,1).
        #[arg(long)]
        cores: Option<String>,
        /// Task pid to associate.
        #[arg(long)]
        pid: Option<u32>,
        /// Target class of service.
        #[arg(long)]
        class: u32,
    },

    /// Assign the highest unused class to cores.
    Assign {
        /// Cores to cover.
        #[arg(long)]
        cores: String,
        /// Technologies: l3, l2, mba (comma separated).
        #[arg(long, default_value = "l3")]
        tech: String,
    },

    /// Return cores to class 0.
    Release {
        /// Cores to release.
        #[arg(long)]
        cores: String,
    },

    /// Reset allocation state, optionally reconfiguring features.
    Reset {
        /// L3 code/data partitioning.
        #[arg(long, value_enum, default_value_t = ToggleArg::Any)]
        l3_cdp: ToggleArg,
        /// L2 code/data partitioning.
        #[arg(long, value_enum, default_value_t = ToggleArg::Any)]
        l2_cdp: ToggleArg,
        /// Bandwidth controller mode.
        #[arg(long, value_enum, default_value_t = ToggleArg::Any)]
        mba_ctrl: ToggleArg,
        /// Device-channel support.
        #[arg(long, value_enum, default_value_t = ToggleArg::Any)]
        iordt: ToggleArg,
    },
}

/// Parses a way mask.
///
/// # Arguments
///
/// * `s` - Hexadecimal with `0x` prefix, or plain decimal.
///
/// # Returns
///
/// The mask value, or a message naming the bad input.
fn parse_mask(s: &str) -> Result<u64, String> {
    let t = s.trim();
    let (digits, radix) = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (t, 10),
    };
    u64::from_str_radix(digits, radix).map_err(|e| format!("bad mask {s:?}: {e}"))
}

/// Parses a core list.
///
/// # Arguments
///
/// * `s` - Comma-separated ids and ranges, e.g. `0,2,4-7`.
///
/// # Returns
///
/// The expanded core ids.
fn parse_core_list(s: &str) -> Result<Vec<u32>, String> {
    let mut cores = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo.parse().map_err(|_| format!("bad core range {part:?}"))?;
            let hi: u32 = hi.parse().map_err(|_| format!("bad core range {part:?}"))?;
            cores.extend(lo..=hi);
        } else {
            cores.push(part.parse().map_err(|_| format!("bad core id {part:?}"))?);
        }
    }
    Ok(cores)
}

/// Parses an event list.
///
/// # Arguments
///
/// * `s` - Comma-separated names: llc, mbl, mbt, mbr, ipc, miss, ref.
///
/// # Returns
///
/// The event set.
fn parse_events(s: &str) -> Result<MonEvents, String> {
    let mut events = MonEvents::EMPTY;
    for name in s.split(',') {
        events = match name.trim() {
            "llc" => events.with(MonEvent::LlcOccupancy),
            "mbl" => events.with(MonEvent::LocalBw),
            "mbt" => events.with(MonEvent::TotalBw),
            "mbr" => events.with(MonEvent::RemoteBw),
            "ipc" => events.with(MonEvent::Ipc),
            "miss" => events.with(MonEvent::LlcMisses),
            "ref" => events.with(MonEvent::LlcReferences),
            other => return Err(format!("unknown event {other:?}")),
        };
    }
    Ok(events)
}

fn parse_techs(s: &str) -> Result<Technologies, String> {
    let mut techs = Vec::new();
    for name in s.split(',') {
        techs.push(match name.trim() {
            "l3" => Technology::L3Ca,
            "l2" => Technology::L2Ca,
            "mba" => Technology::Mba,
            other => return Err(format!("unknown technology {other:?}")),
        });
    }
    Ok(Technologies::of(&techs))
}

fn load_config(cli: &Cli) -> Result<Config, String> {
    let mut config: Config = match &cli.config {
        Some(path) => {
            let text =
                std::fs::read_to_string(path).map_err(|e| format!("read {path}: {e}"))?;
            serde_json::from_str(&text).map_err(|e| format!("parse {path}: {e}"))?
        }
        None => Config::default(),
    };
    if let Some(iface) = cli.interface {
        config.interface = match iface {
            IfaceArg::Auto => Interface::Auto,
            IfaceArg::Msr => Interface::Register,
            IfaceArg::Os => Interface::Filesystem,
            IfaceArg::Mmio => Interface::Mmio,
        };
    }
    config.verbose = match cli.verbose {
        0 => config.verbose,
        1 => Verbosity::Verbose,
        _ => Verbosity::SuperVerbose,
    };
    Ok(config)
}

fn install_tracing(verbosity: Verbosity) {
    let filter = match verbosity {
        Verbosity::Silent => "off",
        Verbosity::Default => "warn",
        Verbosity::Verbose => "info",
        Verbosity::SuperVerbose => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("pqctl: {e}");
            process::exit(2);
        }
    };
    install_tracing(config.verbose);

    let qos = match Qos::init(&config) {
        Ok(q) => q,
        Err(e) => {
            eprintln!("pqctl: init failed: {e}");
            process::exit(1);
        }
    };

    let outcome = run(&qos, &cli.command);
    if let Err(e) = qos.fini() {
        eprintln!("pqctl: teardown: {e}");
    }
    if let Err(e) = outcome {
        eprintln!("pqctl: {e}");
        process::exit(1);
    }
}

fn run(qos: &Qos, command: &Commands) -> Result<(), String> {
    match command {
        Commands::Show => cmd_show(qos),
        Commands::Monitor {
            cores,
            events,
            interval_ms,
            count,
        } => cmd_monitor(qos, cores, events, *interval_ms, *count),
        Commands::SetL3 {
            domain,
            class,
            mask,
            code,
            data,
        } => {
            let def = cat_def(*mask, *code, *data)?;
            qos.l3ca_set(*domain, *class, def).map_err(stringify)
        }
        Commands::SetL2 {
            domain,
            class,
            mask,
            code,
            data,
        } => {
            let def = cat_def(*mask, *code, *data)?;
            qos.l2ca_set(*domain, *class, def).map_err(stringify)
        }
        Commands::SetMba {
            domain,
            class,
            percent,
            mbps,
        } => {
            let def = match (percent, mbps) {
                (Some(p), None) => MbaCos {
                    mb_max: *p,
                    ctrl: false,
                },
                (None, Some(m)) => MbaCos {
                    mb_max: *m,
                    ctrl: true,
                },
                _ => return Err("pass exactly one of --percent or --mbps".into()),
            };
            let actual = qos.mba_set(*domain, *class, def).map_err(stringify)?;
            println!("domain {domain} class {class}: set to {actual}");
            Ok(())
        }
        Commands::SetSmba {
            domain,
            class,
            mbps,
        } => qos.smba_set(*domain, *class, *mbps).map_err(stringify),
        Commands::Assoc { cores, pid, class } => {
            if let Some(cores) = cores {
                for core in parse_core_list(cores)? {
                    qos.assoc_core(core, *class).map_err(stringify)?;
                }
            }
            if let Some(pid) = pid {
                qos.assoc_task(*pid, *class).map_err(stringify)?;
            }
            Ok(())
        }
        Commands::Assign { cores, tech } => {
            let cores = parse_core_list(cores)?;
            let techs = parse_techs(tech)?;
            let class = qos.alloc_assign(techs, &cores).map_err(stringify)?;
            println!("assigned class {class}");
            Ok(())
        }
        Commands::Release { cores } => {
            let cores = parse_core_list(cores)?;
            qos.alloc_release(&cores).map_err(stringify)
        }
        Commands::Reset {
            l3_cdp,
            l2_cdp,
            mba_ctrl,
            iordt,
        } => qos
            .alloc_reset(ResetConfig {
                l3_cdp: (*l3_cdp).into(),
                l2_cdp: (*l2_cdp).into(),
                mba_ctrl: (*mba_ctrl).into(),
                iordt: (*iordt).into(),
            })
            .map_err(stringify),
    }
}

fn stringify(e: pqctl_core::Error) -> String {
    e.to_string()
}

/// Builds a cache-class definition from the mutually exclusive flag forms.
///
/// # Arguments
///
/// * `mask` - The single-mask form.
/// * `code` - Code side of the two-mask form.
/// * `data` - Data side of the two-mask form.
///
/// # Returns
///
/// The definition, or a usage message when the combination is wrong.
fn cat_def(mask: Option<u64>, code: Option<u64>, data: Option<u64>) -> Result<CatCos, String> {
    match (mask, code, data) {
        (Some(m), None, None) => Ok(CatCos::Mask(m)),
        (None, Some(code), Some(data)) => Ok(CatCos::Cdp { code, data }),
        _ => Err("pass --mask, or --code together with --data".into()),
    }
}

fn cmd_show(qos: &Qos) -> Result<(), String> {
    let caps = qos.capabilities().map_err(stringify)?;
    let topo = qos.topology();

    println!("vendor: {:?}", topo.vendor);
    println!(
        "cores: {} (max lcore {}), sockets {:?}",
        topo.num_cores(),
        topo.max_lcore,
        topo.sockets()
    );
    if topo.l3.detected {
        println!(
            "l3: {} ways x {} sets, {} B lines, {} B total",
            topo.l3.num_ways, topo.l3.num_sets, topo.l3.line_size, topo.l3.total_size
        );
    }

    if let Some(mon) = &caps.monitor {
        println!("monitoring: max_rmid {}", mon.max_rmid);
        for ev in &mon.events {
            println!(
                "  {:?}: max_rmid {}, scale {}, width {}",
                ev.event, ev.max_rmid, ev.scale_factor, ev.counter_width
            );
        }
    }
    if let Some(cap) = &caps.l3ca {
        println!(
            "l3ca: {} classes, {} ways, cdp {} ({}), contention {:#x}",
            cap.num_classes,
            cap.num_ways,
            if cap.cdp_supported { "supported" } else { "unsupported" },
            if cap.cdp_enabled { "on" } else { "off" },
            cap.way_contention
        );
    }
    if let Some(cap) = &caps.l2ca {
        println!(
            "l2ca: {} classes, {} ways, cdp {} ({})",
            cap.num_classes,
            cap.num_ways,
            if cap.cdp_supported { "supported" } else { "unsupported" },
            if cap.cdp_enabled { "on" } else { "off" }
        );
    }
    if let Some(cap) = &caps.mba {
        println!(
            "mba: {} classes, max {}%, step {}%, {}",
            cap.num_classes,
            cap.throttle_max,
            cap.throttle_step,
            if cap.ctrl_enabled {
                "controller on"
            } else {
                "throttle mode"
            }
        );
    }
    if let Some(cap) = &caps.smba {
        println!(
            "smba: {} classes, MBps targets up to {}",
            cap.num_classes, cap.throttle_max
        );
    }
    Ok(())
}

fn cmd_monitor(
    qos: &Qos,
    cores: &str,
    events: &str,
    interval_ms: u64,
    count: u64,
) -> Result<(), String> {
    let cores = parse_core_list(cores)?;
    let events = parse_events(events)?;
    let caps = qos.capabilities().map_err(stringify)?;
    let scales: BTreeMap<_, _> = caps
        .monitor
        .as_ref()
        .map(MonitorCap::scales)
        .unwrap_or_default();

    let mut group = qos.mon_start_cores(&cores, events).map_err(stringify)?;
    let mut polls = 0u64;
    loop {
        std::thread::sleep(Duration::from_millis(interval_ms));
        let status = qos.mon_poll(&mut [&mut group]).map_err(stringify)?;
        if status == PollStatus::Error {
            if let Some(e) = &group.last_error {
                eprintln!("pqctl: poll: {e}");
            }
        } else {
            print_values(&group, &scales, events);
        }
        polls += 1;
        if count != 0 && polls >= count {
            break;
        }
    }
    qos.mon_stop(group).map_err(stringify)
}

fn print_values(group: &pqctl_core::MonGroup, scales: &BTreeMap<u32, u64>, events: MonEvents) {
    let scaled = |event: MonEvent, raw: u64| -> u64 {
        raw * scales.get(&event.bit()).copied().unwrap_or(1)
    };
    let v = &group.values;
    let mut line = String::new();
    if events.contains(MonEvent::LlcOccupancy) {
        line.push_str(&format!(
            "llc[B] {} ",
            scaled(MonEvent::LlcOccupancy, v.llc_occupancy)
        ));
    }
    if events.contains(MonEvent::LocalBw) {
        line.push_str(&format!(
            "mbl[B/itv] {} ",
            scaled(MonEvent::LocalBw, v.mbm_local_delta)
        ));
    }
    if events.contains(MonEvent::TotalBw) {
        line.push_str(&format!(
            "mbt[B/itv] {} ",
            scaled(MonEvent::TotalBw, v.mbm_total_delta)
        ));
    }
    if events.contains(MonEvent::RemoteBw) {
        line.push_str(&format!(
            "mbr[B/itv] {} ",
            scaled(MonEvent::RemoteBw, v.mbm_remote_delta)
        ));
    }
    if events.contains(MonEvent::Ipc) {
        line.push_str(&format!("ipc {:.2} ", v.ipc));
    }
    if events.contains(MonEvent::LlcMisses) {
        line.push_str(&format!("miss/itv {} ", v.llc_misses_delta));
    }
    if events.contains(MonEvent::LlcReferences) {
        line.push_str(&format!("ref/itv {} ", v.llc_references_delta));
    }
    println!("{}", line.trim_end());
}
