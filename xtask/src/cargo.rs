//! Cargo invocations for the cross-compiled crates.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use xshell::{Shell, cmd};

use crate::config::CrateConfig;

/// One `cargo` call inside the loader or kernel crate.
pub struct CargoCommand {
    /// Cargo subcommand: "build", "test", "clean".
    pub subcommand: String,
    /// Crate directory cargo runs in.
    pub dir: PathBuf,
    /// Target triple. `None` for commands that take no `--target`.
    pub target: Option<String>,
    /// Whether to pass --release.
    pub release: bool,
    /// Extra cargo arguments, appended last.
    pub extra_args: Vec<String>,
}

impl CargoCommand {
    /// `cargo build --target <triple>` for a crate.
    pub fn build(krate: &CrateConfig, release: bool) -> Self {
        Self {
            subcommand: "build".into(),
            dir: krate.dir.clone(),
            target: Some(krate.target.clone()),
            release,
            extra_args: Vec::new(),
        }
    }

    /// `cargo test --no-run` with artifact messages on stdout.
    pub fn build_tests(krate: &CrateConfig) -> Self {
        Self {
            subcommand: "test".into(),
            dir: krate.dir.clone(),
            target: Some(krate.target.clone()),
            release: false,
            extra_args: vec![
                "--no-run".into(),
                "--message-format=json-render-diagnostics".into(),
            ],
        }
    }

    /// `cargo clean` for a crate.
    pub fn clean(krate: &CrateConfig) -> Self {
        Self {
            subcommand: "clean".into(),
            dir: krate.dir.clone(),
            target: None,
            release: false,
            extra_args: Vec::new(),
        }
    }

    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![self.subcommand.clone()];

        if let Some(ref target) = self.target {
            args.push("--target".into());
            args.push(target.clone());
        }
        if self.release {
            args.push("--release".into());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn shell(&self) -> Result<Shell> {
        if !self.dir.is_dir() {
            anyhow::bail!("crate directory not found: {}", self.dir.display());
        }
        let sh = Shell::new()?;
        sh.change_dir(&self.dir);
        Ok(sh)
    }

    /// Run with output passed through to the terminal.
    pub fn run(&self) -> Result<()> {
        let sh = self.shell()?;
        let args = self.args();
        cmd!(sh, "cargo {args...}")
            .run()
            .with_context(|| format!("cargo {} failed in {}", self.subcommand, self.dir.display()))
    }

    /// Run and return stdout. Stderr (cargo progress, diagnostics) still
    /// goes to the terminal.
    pub fn read(&self) -> Result<String> {
        let sh = self.shell()?;
        let args = self.args();
        cmd!(sh, "cargo {args...}")
            .read()
            .with_context(|| format!("cargo {} failed in {}", self.subcommand, self.dir.display()))
    }
}

/// The fields of a cargo JSON message needed to find test executables.
#[derive(Debug, Deserialize)]
struct Message {
    reason: String,
    #[serde(default)]
    target: Option<MessageTarget>,
    #[serde(default)]
    profile: Option<MessageProfile>,
    #[serde(default)]
    executable: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct MessageTarget {
    name: String,
}

#[derive(Debug, Deserialize)]
struct MessageProfile {
    test: bool,
}

/// Pick the test executable of the target `prefix` out of
/// `--message-format=json` output.
///
/// When a crate has several test targets the last one reported wins, which
/// for a kernel crate is the main binary's harness.
pub fn test_executable(messages: &str, prefix: &str) -> Option<PathBuf> {
    messages
        .lines()
        .filter_map(|line| serde_json::from_str::<Message>(line).ok())
        .filter(|msg| msg.reason == "compiler-artifact")
        .filter(|msg| msg.profile.as_ref().is_some_and(|p| p.test))
        .filter(|msg| {
            msg.target
                .as_ref()
                .is_some_and(|t| t.name.replace('-', "_") == prefix)
        })
        .filter_map(|msg| msg.executable)
        .last()
}

/// Write the manifest the artifact locator reads before falling back to
/// timestamps.
pub fn write_manifest(manifest: &Path, executable: &Path) -> Result<()> {
    if let Some(parent) = manifest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(manifest, format!("{}\n", executable.display()))
        .with_context(|| format!("failed to write {}", manifest.display()))
}
