//! Build, boot and test harness for the UEFI loader and kernel.
//!
//! Usage:
//!   cargo xtask build    - Build loader and kernel
//!   cargo xtask run      - Build, stage the boot volume, boot in QEMU
//!   cargo xtask test     - Build the kernel tests and boot them headless;
//!                          the guest's `isa-debug-exit` status becomes the
//!                          exit code
//!   cargo xtask debug    - Boot halted behind a gdb stub and return
//!   cargo xtask clean    - Remove the boot volume and build outputs
//!
//! Exit codes: 0 on success, the guest's status for a failed test, 124 when
//! a test timed out, 125 when QEMU stopped without a guest status, and 126
//! when the run was aborted before QEMU started.

mod artifact;
mod build;
mod cargo;
mod cli;
mod config;
mod error;
mod exit;
mod launch;
mod qemu;
mod run;
mod verbose;
mod volume;

use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use crate::cargo::CargoCommand;
use crate::config::Config;
use crate::launch::Emulator;
use crate::run::{Mode, Session};
use crate::verbose::{Stage, Verbosity, dprintln, vprintln};

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    verbose::init(Verbosity::from_flags(cli.quiet, cli.verbose));

    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(error::exit_code_for(&e))
        }
    }
}

fn dispatch(cli: cli::Cli) -> Result<ExitCode> {
    let config = Config::load()?;
    vprintln!("workspace: {}", config.workspace_root.display());
    let volume = match cli.volume {
        Some(ref dir) => std::path::absolute(dir)
            .with_context(|| format!("invalid volume path {}", dir.display()))?,
        None => config.volume.clone(),
    };
    let emulator = Emulator::from_config(&config.qemu);

    match cli.command {
        cli::Command::Build => {
            let _stage = Stage::enter("Building loader and kernel");
            build::build(
                &config,
                Mode::Run.loader_profile(cli.release),
                Mode::Run.kernel_profile(cli.release),
            )?;
            Ok(ExitCode::SUCCESS)
        }

        cli::Command::Run(args) => {
            let session = session(&config, Mode::Run, &volume, cli.release, &args);
            run::run(&session, &emulator)
        }

        cli::Command::Test(args) => {
            let timeout = test::timeout_from_secs(args.timeout.unwrap_or(config.qemu.test.timeout));
            let session = session(&config, Mode::Test, &volume, cli.release, &args.launch);
            test::test(&session, &emulator, timeout)
        }

        cli::Command::Debug(args) => {
            let session = session(&config, Mode::Debug, &volume, cli.release, &args);
            run::debug(&session, &emulator)
        }

        cli::Command::Clean(args) => {
            clean(&config, &volume, args.volume_only)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn session<'a>(
    config: &'a Config,
    mode: Mode,
    volume: &'a Path,
    release: bool,
    args: &'a cli::LaunchArgs,
) -> Session<'a> {
    Session {
        config,
        mode,
        volume,
        release,
        no_build: args.no_build,
        extra_args: &args.extra_args,
    }
}

/// Remove the boot volume, its lock file, and (unless `volume_only`) the
/// cargo outputs of both crates.
fn clean(config: &Config, volume: &Path, volume_only: bool) -> Result<()> {
    let _stage = Stage::enter("Cleaning");

    {
        // Refuses while a run is using the volume.
        let _lock = volume::VolumeLock::acquire(volume)?;
        if volume.exists() {
            volume::clear(volume)?;
            dprintln!("    removed {}", volume.display());
        }
        let lock = volume::VolumeLock::lock_path(volume);
        std::fs::remove_file(&lock).with_context(|| format!("failed to remove {}", lock.display()))?;
    }

    if !volume_only {
        for krate in [&config.loader, &config.kernel] {
            if krate.dir.is_dir() {
                CargoCommand::clean(krate).run()?;
            }
        }
    }
    Ok(())
}
