//! Command-line interface definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Build, boot and test the UEFI loader and kernel under QEMU.
#[derive(Parser)]
#[command(name = "bootrun", version, about)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Boot volume directory (default: `volume` from workspace metadata).
    #[arg(long, global = true, value_name = "DIR")]
    pub volume: Option<PathBuf>,

    /// Build the loader and kernel in release mode (tests always build debug).
    #[arg(long, short = 'r', global = true)]
    pub release: bool,

    /// Only print errors and the final verdict.
    #[arg(long, short = 'q', global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Print QEMU command lines, artifact selection and stage timings.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Build the loader and the kernel.
    Build,
    /// Build, stage the boot volume and boot it interactively.
    Run(LaunchArgs),
    /// Build the kernel tests, boot them headless and report the verdict.
    Test(TestArgs),
    /// Boot with the CPU halted behind a gdb stub and return immediately.
    Debug(LaunchArgs),
    /// Remove the boot volume and the loader/kernel build outputs.
    Clean(CleanArgs),
}

/// Arguments for `run` and `debug`.
#[derive(Args)]
pub struct LaunchArgs {
    /// Use existing build outputs instead of running cargo first.
    #[arg(long)]
    pub no_build: bool,

    /// Extra arguments passed to QEMU after `--`.
    #[arg(last = true)]
    pub extra_args: Vec<String>,
}

/// Arguments for the `test` subcommand.
#[derive(Args)]
pub struct TestArgs {
    /// Kill the guest after this many seconds (0 = never; default from config).
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    #[command(flatten)]
    pub launch: LaunchArgs,
}

/// Arguments for the `clean` subcommand.
#[derive(Args)]
pub struct CleanArgs {
    /// Only remove the boot volume, keep cargo build outputs.
    #[arg(long)]
    pub volume_only: bool,
}
