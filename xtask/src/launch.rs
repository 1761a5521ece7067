//! QEMU process management.
//!
//! QEMU is spawned with `std::process::Command` rather than through
//! `xshell`: the test path needs the `Child` to enforce a timeout and the
//! debug path hands the running process over to an external debugger.
//! Stdio is inherited in every mode, so guest serial output reaches the
//! terminal (or CI log) untouched; the harness only looks at how the process
//! ends.

use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::config::QemuConfig;
use crate::error::HarnessError;
use crate::qemu::HardwareProfile;
use crate::verbose::vprintln;

/// Interval between liveness checks while a timeout is armed.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How the emulator process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited; `code` is `None` when a signal ended it.
    Exited { code: Option<i32> },
    /// The harness killed the process after the timeout expired.
    TimedOut,
}

/// The emulator executable plus any fixed leading arguments.
#[derive(Debug, Clone)]
pub struct Emulator {
    program: String,
    leading_args: Vec<String>,
}

impl Emulator {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn from_config(qemu: &QemuConfig) -> Self {
        Self::new(qemu.binary.clone()).with_leading_args(qemu.binary_args.iter().cloned())
    }

    /// Arguments placed before the profile's own.
    #[must_use]
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, profile: &HardwareProfile) -> Result<Command> {
        if !profile.firmware().is_file() {
            return Err(HarnessError::FirmwareNotFound(profile.firmware().to_path_buf()).into());
        }

        let args = profile.args();
        vprintln!("    {} {} {}", self.program, self.leading_args.join(" "), args.join(" "));

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args).args(args);
        Ok(cmd)
    }

    fn spawn(&self, profile: &HardwareProfile) -> Result<Child> {
        self.command(profile)?
            .spawn()
            .with_context(|| format!("failed to start {} (is it installed?)", self.program))
    }

    /// Run the emulator in the foreground until it exits.
    ///
    /// With a `timeout`, a guest that is still running when it expires is
    /// killed and reported as [`Termination::TimedOut`].
    pub fn run(&self, profile: &HardwareProfile, timeout: Option<Duration>) -> Result<Termination> {
        let mut child = self.spawn(profile)?;

        let Some(timeout) = timeout else {
            let status = child.wait().context("failed to wait for the emulator")?;
            return Ok(Termination::Exited { code: status.code() });
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().context("failed to poll the emulator")? {
                return Ok(Termination::Exited { code: status.code() });
            }
            if Instant::now() >= deadline {
                // The child may exit between the poll and the kill; that
                // still counts as a timeout.
                let _ = child.kill();
                child.wait().context("failed to reap the emulator after timeout")?;
                return Ok(Termination::TimedOut);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Start the emulator and return without waiting for it.
    ///
    /// Used for debug sessions: the caller hands the process to a debugger
    /// and never collects its exit status.
    pub fn spawn_detached(&self, profile: &HardwareProfile) -> Result<Child> {
        self.spawn(profile)
    }
}
