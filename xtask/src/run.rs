//! Launch modes and the shared locate → assemble → launch pipeline.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;

use crate::artifact::{self, BuildProfile, BuildTarget};
use crate::build;
use crate::config::Config;
use crate::exit::{EXIT_UNSIGNALED, Outcome};
use crate::launch::{Emulator, Termination};
use crate::qemu::HardwareProfile;
use crate::verbose::{Stage, dprintln, vprintln};
use crate::volume::{self, BootVolume, VolumeLock};

/// How the guest is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Interactive session, blocks until QEMU exits.
    Run,
    /// Unattended test run of the kernel's test harness.
    Test,
    /// CPU halted behind a gdb stub; returns once QEMU is up.
    Debug,
}

impl Mode {
    pub fn loader_profile(self, release: bool) -> BuildProfile {
        BuildProfile::Normal { release }
    }

    /// Test mode boots the kernel's test binary instead of the kernel.
    pub fn kernel_profile(self, release: bool) -> BuildProfile {
        match self {
            Self::Test => BuildProfile::Test,
            Self::Run | Self::Debug => BuildProfile::Normal { release },
        }
    }

    pub fn hardware(self, config: &Config, volume: &Path, extra_args: &[String]) -> HardwareProfile {
        let profile = match self {
            Self::Run => HardwareProfile::run(&config.qemu, volume),
            Self::Test => HardwareProfile::test(&config.qemu, volume),
            Self::Debug => HardwareProfile::debug(&config.qemu, volume),
        };
        profile.with_extra_args(extra_args)
    }
}

/// Options shared by every launching command.
#[derive(Debug, Clone)]
pub struct Session<'a> {
    pub config: &'a Config,
    pub mode: Mode,
    /// Boot volume directory for this invocation.
    pub volume: &'a Path,
    pub release: bool,
    /// Skip the cargo builds and use whatever outputs already exist.
    pub no_build: bool,
    /// Arguments appended to the QEMU command line.
    pub extra_args: &'a [String],
}

impl Session<'_> {
    /// Build (unless disabled), locate both artifacts and stage the volume.
    ///
    /// Every error here happens before QEMU is started.
    pub fn prepare(&self) -> Result<BootVolume> {
        let loader_profile = self.mode.loader_profile(self.release);
        let kernel_profile = self.mode.kernel_profile(self.release);

        if !self.no_build {
            let _stage = Stage::enter("Building loader and kernel");
            build::build(self.config, loader_profile, kernel_profile)?;
        }

        let _stage = Stage::enter("Assembling boot volume");
        let loader = artifact::locate(BuildTarget::Loader, &self.config.loader, loader_profile)?;
        let kernel = artifact::locate(BuildTarget::Kernel, &self.config.kernel, kernel_profile)?;
        vprintln!("    loader: {}", loader.path.display());
        vprintln!("    kernel: {}", kernel.path.display());

        volume::assemble(self.volume, &loader, &kernel)
    }

    pub fn hardware(&self, volume: &BootVolume) -> HardwareProfile {
        self.mode.hardware(self.config, volume.root(), self.extra_args)
    }

    /// Run the emulator in the foreground. Test mode arms `timeout`.
    pub fn launch(&self, emulator: &Emulator, timeout: Option<Duration>) -> Result<Termination> {
        let _lock = VolumeLock::acquire(self.volume)?;
        let volume = self.prepare()?;

        let _stage = Stage::enter("Launching QEMU");
        emulator.run(&self.hardware(&volume), timeout)
    }
}

/// `run`: boot interactively and pass QEMU's exit code through.
///
/// There is no status device in this profile, so the code is QEMU's own
/// (0 when the window is closed or the guest powers off).
pub fn run(session: &Session<'_>, emulator: &Emulator) -> Result<ExitCode> {
    let termination = session.launch(emulator, None)?;
    let code = match termination {
        Termination::Exited { code: Some(code) } => u8::try_from(code & 0xff).unwrap_or(1),
        Termination::Exited { code: None } | Termination::TimedOut => EXIT_UNSIGNALED,
    };
    vprintln!("    {}", Outcome::decode(termination));
    Ok(ExitCode::from(code))
}

/// `debug`: stage the volume, start QEMU halted, and return.
pub fn debug(session: &Session<'_>, emulator: &Emulator) -> Result<ExitCode> {
    let hardware = {
        // The lock covers staging only; QEMU outlives this process.
        let _lock = VolumeLock::acquire(session.volume)?;
        let volume = session.prepare()?;
        session.hardware(&volume)
    };

    let _stage = Stage::enter("Launching QEMU (halted)");
    let child = emulator.spawn_detached(&hardware)?;
    dprintln!("QEMU running as pid {}, CPU halted at reset.", child.id());
    if let Some(stub) = hardware.debug_stub() {
        dprintln!("Attach with: gdb -ex 'target remote {}'", gdb_address(&stub.endpoint));
    }
    Ok(ExitCode::SUCCESS)
}

/// Turn a QEMU chardev endpoint (`tcp::1234`) into a gdb remote address.
fn gdb_address(endpoint: &str) -> String {
    match endpoint.strip_prefix("tcp:") {
        Some(rest) if rest.starts_with(':') => format!("localhost{rest}"),
        Some(rest) => rest.to_string(),
        None => endpoint.to_string(),
    }
}
