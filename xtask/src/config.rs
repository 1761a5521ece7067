//! Configuration loading from workspace metadata.
//!
//! Everything lives under `[workspace.metadata.bootrun]` in the workspace
//! `Cargo.toml`. Every key is optional; missing keys fall back to the layout
//! of this repository (`loader/` and `kernel/` next to the workspace root).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Workspace configuration.
#[derive(Debug, Deserialize)]
struct WorkspaceConfig {
    workspace: WorkspaceSection,
}

#[derive(Debug, Deserialize)]
struct WorkspaceSection {
    metadata: Option<MetadataSection>,
}

#[derive(Debug, Deserialize)]
struct MetadataSection {
    bootrun: Option<BootrunMetadata>,
}

/// Raw `[workspace.metadata.bootrun]` table.
#[derive(Debug, Default, Deserialize)]
struct BootrunMetadata {
    volume: Option<PathBuf>,
    #[serde(default)]
    loader: CrateSection,
    #[serde(default)]
    kernel: CrateSection,
    #[serde(default)]
    qemu: QemuConfig,
}

/// Raw `[loader]` / `[kernel]` table; unset keys take per-target defaults.
#[derive(Debug, Default, Deserialize)]
struct CrateSection {
    dir: Option<PathBuf>,
    target: Option<String>,
    binary: Option<String>,
}

/// A cross-compiled crate the harness builds and stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrateConfig {
    /// Crate directory (absolute).
    pub dir: PathBuf,
    /// Target triple passed to `cargo --target`.
    pub target: String,
    /// Output file name of a normal build, e.g. `loader.efi`.
    pub binary: String,
}

impl CrateConfig {
    fn resolve(section: CrateSection, root: &Path, dir: &str, target: &str, binary: &str) -> Self {
        Self {
            dir: root.join(section.dir.unwrap_or_else(|| PathBuf::from(dir))),
            target: section.target.unwrap_or_else(|| target.to_string()),
            binary: section.binary.unwrap_or_else(|| binary.to_string()),
        }
    }

    /// Directory cargo writes this crate's outputs to for a build profile.
    pub fn output_dir(&self, release: bool) -> PathBuf {
        let profile = if release { "release" } else { "debug" };
        self.dir.join("target").join(&self.target).join(profile)
    }

    /// Prefix of the test binaries `cargo test --no-run` emits into `deps/`.
    ///
    /// Cargo names them after the crate with dashes replaced by underscores,
    /// followed by `-<hash>`.
    pub fn test_prefix(&self) -> String {
        let stem = self.binary.split('.').next().unwrap_or(&self.binary);
        stem.replace('-', "_")
    }
}

/// `[qemu]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QemuConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Arguments placed right after `binary`, ahead of the machine
    /// description (e.g. `["-accel", "kvm"]`).
    #[serde(default)]
    pub binary_args: Vec<String>,
    #[serde(default = "default_machine")]
    pub machine: String,
    /// Guest memory for run and debug sessions, in MiB.
    #[serde(default = "default_memory")]
    pub memory: u32,
    /// UEFI firmware image (OVMF), mapped as read-only pflash.
    #[serde(default = "default_firmware")]
    pub firmware: PathBuf,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub test: QemuTestConfig,
    #[serde(default)]
    pub debug: QemuDebugConfig,
}

impl Default for QemuConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            binary_args: Vec::new(),
            machine: default_machine(),
            memory: default_memory(),
            firmware: default_firmware(),
            extra_args: Vec::new(),
            test: QemuTestConfig::default(),
            debug: QemuDebugConfig::default(),
        }
    }
}

fn default_binary() -> String {
    "qemu-system-x86_64".into()
}
fn default_machine() -> String {
    "q35".into()
}
fn default_memory() -> u32 {
    512
}
fn default_firmware() -> PathBuf {
    PathBuf::from("/usr/share/OVMF/OVMF_CODE.fd")
}

/// `[qemu.test]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QemuTestConfig {
    #[serde(default = "default_test_memory")]
    pub memory: u32,
    /// Seconds before a hung guest is killed. `0` waits forever.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Guest status that counts as a passing run.
    #[serde(default = "default_success_status")]
    pub success_status: u32,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for QemuTestConfig {
    fn default() -> Self {
        Self {
            memory: default_test_memory(),
            timeout: default_timeout(),
            success_status: default_success_status(),
            extra_args: Vec::new(),
        }
    }
}

fn default_test_memory() -> u32 {
    128
}
fn default_timeout() -> u64 {
    30
}
fn default_success_status() -> u32 {
    1
}

/// `[qemu.debug]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct QemuDebugConfig {
    /// gdbstub endpoint handed to `-gdb`.
    #[serde(default = "default_gdb")]
    pub gdb: String,
}

impl Default for QemuDebugConfig {
    fn default() -> Self {
        Self { gdb: default_gdb() }
    }
}

fn default_gdb() -> String {
    "tcp::1234".into()
}

/// Build configuration for harness commands.
#[derive(Debug, Clone)]
pub struct Config {
    /// Workspace root directory.
    pub workspace_root: PathBuf,
    /// Default boot volume directory (absolute).
    pub volume: PathBuf,
    pub loader: CrateConfig,
    pub kernel: CrateConfig,
    pub qemu: QemuConfig,
}

impl Config {
    /// Load configuration from the workspace containing the current directory.
    pub fn load() -> Result<Self> {
        let workspace_root = find_workspace_root()?;
        let cargo_toml = workspace_root.join("Cargo.toml");
        let content = std::fs::read_to_string(&cargo_toml)
            .with_context(|| format!("Failed to read {}", cargo_toml.display()))?;
        Self::parse(workspace_root, &content)
    }

    /// Resolve configuration from the text of a workspace `Cargo.toml`.
    pub fn parse(workspace_root: PathBuf, content: &str) -> Result<Self> {
        let config: WorkspaceConfig =
            toml::from_str(content).context("Failed to parse Cargo.toml")?;

        let meta = config
            .workspace
            .metadata
            .and_then(|m| m.bootrun)
            .unwrap_or_default();

        let volume = workspace_root.join(meta.volume.unwrap_or_else(|| PathBuf::from("target/esp")));
        let loader =
            CrateConfig::resolve(meta.loader, &workspace_root, "loader", "x86_64-unknown-uefi", "loader.efi");
        let kernel =
            CrateConfig::resolve(meta.kernel, &workspace_root, "kernel", "x86_64-unknown-none", "kernel");

        let mut qemu = meta.qemu;
        qemu.firmware = workspace_root.join(&qemu.firmware);

        Ok(Self {
            workspace_root,
            volume,
            loader,
            kernel,
            qemu,
        })
    }
}

/// Find the workspace root by looking for Cargo.toml with [workspace].
fn find_workspace_root() -> Result<PathBuf> {
    let mut dir = std::env::current_dir().context("Failed to get current directory")?;

    loop {
        let cargo_toml = dir.join("Cargo.toml");
        if cargo_toml.exists() {
            let content = std::fs::read_to_string(&cargo_toml)?;
            if content.contains("[workspace]") {
                return Ok(dir);
            }
        }

        if !dir.pop() {
            anyhow::bail!("Could not find workspace root (no Cargo.toml with [workspace] found)");
        }
    }
}
