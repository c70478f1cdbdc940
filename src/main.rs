use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;

use semistatic::{
    BranchChanger, BranchResult, FlushMode, HostInfo, PatchConfig, PermissionMode, Signature,
    Switch,
};
use tracing_subscriber::EnvFilter;

// Wrapper types for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PermissionModeArg {
    Persistent,
    Conserve,
}

impl From<PermissionModeArg> for PermissionMode {
    fn from(arg: PermissionModeArg) -> Self {
        match arg {
            PermissionModeArg::Persistent => PermissionMode::Persistent,
            PermissionModeArg::Conserve => PermissionMode::Conserve,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FlushModeArg {
    Off,
    Serialize,
}

impl From<FlushModeArg> for FlushMode {
    fn from(arg: FlushModeArg) -> Self {
        match arg {
            FlushModeArg::Off => FlushMode::Off,
            FlushModeArg::Serialize => FlushMode::Serialize,
        }
    }
}

#[derive(Parser)]
#[command(name = "semistatic")]
#[command(about = "Branchless dispatch by patching a trampoline's jump", long_about = None)]
struct Cli {
    /// Log patch activity to stderr (overridden by SEMISTATIC_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Patch behavior flags shared by the subcommands that install dispatchers.
#[derive(clap::Args, Debug, Clone)]
struct PatchArgs {
    /// TOML file with a [patch] table
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Page protection between patches (persistent, conserve)
    #[arg(long, value_enum)]
    permissions: Option<PermissionModeArg>,

    /// Serializing flush after each patch (off, serialize)
    #[arg(long, value_enum)]
    flush: Option<FlushModeArg>,
}

impl PatchArgs {
    fn resolve(&self) -> Result<PatchConfig, String> {
        let mut config = match &self.config {
            Some(path) => PatchConfig::load(path).map_err(|e| e.to_string())?,
            None => PatchConfig::default(),
        };
        if let Some(permissions) = self.permissions {
            config.permissions = permissions.into();
        }
        if let Some(flush) = self.flush {
            config.flush = flush.into();
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch add/sub/mul/div through one trampoline
    Demo {
        /// Only run this direction (0 = add, 1 = sub, 2 = mul, 3 = div)
        #[arg(short, long)]
        direction: Option<usize>,

        /// Left operand
        #[arg(long, default_value = "6")]
        lhs: i64,

        /// Right operand
        #[arg(long, default_value = "3")]
        rhs: i64,

        #[command(flatten)]
        patch: PatchArgs,
    },
    /// Show how this host would be patched
    Inspect {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        patch: PatchArgs,
    },
    /// Verify that trampolines can be patched on this host
    Check {
        #[command(flatten)]
        patch: PatchArgs,
    },
}

fn add(a: i64, b: i64) -> i64 {
    a + b
}

fn sub(a: i64, b: i64) -> i64 {
    a - b
}

fn mul(a: i64, b: i64) -> i64 {
    a * b
}

fn div(a: i64, b: i64) -> i64 {
    a.checked_div(b).unwrap_or_default()
}

const OPERATIONS: [&str; 4] = ["add", "sub", "mul", "div"];

fn identity(x: u32) -> u32 {
    x
}

fn successor(x: u32) -> u32 {
    x.wrapping_add(1)
}

type Probe = Switch<fn(u32) -> u32>;

fn probe(config: PatchConfig) -> BranchResult<Probe> {
    Probe::with_config(identity, successor, config)
}

#[derive(Serialize)]
struct ProbeReport {
    trampoline: String,
    leading_bytes: String,
    current_target: Option<String>,
    identity: String,
    successor: String,
}

#[derive(Serialize)]
struct InspectReport {
    host: HostInfo,
    config: ConfigReport,
    probe: Result<ProbeReport, String>,
}

#[derive(Serialize)]
struct ConfigReport {
    conserve_permissions: bool,
    flush_pipeline: bool,
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn run_demo(direction: Option<usize>, lhs: i64, rhs: i64, config: PatchConfig) -> Result<(), String> {
    let mut changer = BranchChanger::<fn(i64, i64) -> i64>::with_config(&[add, sub, mul, div], config)
        .map_err(|e| e.to_string())?;

    let directions = match direction {
        Some(index) => vec![index],
        None => (0..changer.len()).collect(),
    };

    for index in directions {
        changer.set_direction(index).map_err(|e| e.to_string())?;
        println!(
            "{:<4} {} {} = {}",
            OPERATIONS.get(index).copied().unwrap_or("?"),
            lhs,
            rhs,
            changer.branch(lhs, rhs)
        );
    }
    tracing::debug!(patches = changer.patch_count(), "demo finished");
    Ok(())
}

fn run_inspect(json: bool, config: PatchConfig) -> Result<(), String> {
    let host = HostInfo::detect();
    let probe = probe(config)
        .map(|switch| ProbeReport {
            trampoline: format!("{:#x}", switch.trampoline_address()),
            leading_bytes: hex(&switch.leading_bytes()),
            current_target: switch.current_target().map(|t| format!("{t:#x}")),
            identity: format!("{:#x}", <fn(u32) -> u32 as Signature>::address(identity)),
            successor: format!("{:#x}", <fn(u32) -> u32 as Signature>::address(successor)),
        })
        .map_err(|e| e.to_string());

    let report = InspectReport {
        host,
        config: ConfigReport {
            conserve_permissions: config.conserve_permissions(),
            flush_pipeline: config.flush_pipeline(),
        },
        probe,
    };

    if json {
        let output = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{}", output);
        return Ok(());
    }

    let host = &report.host;
    println!("arch:        {} ({})", host.arch, host.os);
    match host.family {
        Some(family) => println!("family:      {}", family.name()),
        None => println!("family:      unsupported"),
    }
    println!("page size:   {}", host.page_size);
    println!("data endian: {:?}", host.data_endian);
    println!(
        "config:      conserve_permissions={} flush_pipeline={}",
        report.config.conserve_permissions, report.config.flush_pipeline
    );
    match &report.probe {
        Ok(probe) => {
            println!("trampoline:  {}", probe.trampoline);
            println!("jump:        {}", probe.leading_bytes);
            println!(
                "target:      {} (identity {}, successor {})",
                probe.current_target.as_deref().unwrap_or("?"),
                probe.identity,
                probe.successor
            );
        }
        Err(e) => println!("probe:       failed: {}", e),
    }
    Ok(())
}

fn run_check(config: PatchConfig) -> Result<(), String> {
    let mut switch = probe(config).map_err(|e| format!("{} ({})", e, e.kind().describe()))?;

    let mut failures = Vec::new();
    for (direction, expected) in [(true, 41), (false, 42), (true, 41)] {
        switch.set_direction(direction).map_err(|e| e.to_string())?;
        let got = switch.branch(41);
        if got != expected {
            failures.push(format!("direction {direction}: expected {expected}, got {got}"));
        }
    }

    if !failures.is_empty() {
        return Err(failures.join("\n"));
    }
    println!(
        "Patching works: {} patches at {:#x}.",
        switch.patch_count(),
        switch.trampoline_address()
    );
    Ok(())
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("SEMISTATIC_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "semistatic=trace" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Demo {
            direction,
            lhs,
            rhs,
            patch,
        } => patch
            .resolve()
            .and_then(|config| run_demo(direction, lhs, rhs, config)),
        Commands::Inspect { json, patch } => {
            patch.resolve().and_then(|config| run_inspect(json, config))
        }
        Commands::Check { patch } => patch.resolve().and_then(run_check),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
