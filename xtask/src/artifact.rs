//! Build output selection.
//!
//! A normal build leaves exactly one binary at a fixed path. A kernel test
//! build (`cargo test --no-run`) leaves one binary per compilation in
//! `deps/`, named `<crate>-<hash>`, and older ones are never cleaned up, so
//! the right one has to be picked:
//!
//! 1. the manifest written by the build step from cargo's JSON output, if it
//!    names an existing file;
//! 2. otherwise the candidate with the newest modification time. A tie at
//!    the newest time, or no candidate at all, is reported as ambiguous
//!    rather than guessed.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};

use crate::config::CrateConfig;
use crate::error::HarnessError;
use crate::verbose::vprintln;

/// The two binaries that end up on the boot volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTarget {
    Loader,
    Kernel,
}

impl BuildTarget {
    pub fn name(self) -> &'static str {
        match self {
            Self::Loader => "loader",
            Self::Kernel => "kernel",
        }
    }
}

/// How the artifact was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildProfile {
    /// `cargo build`, optionally `--release`.
    Normal { release: bool },
    /// `cargo test --no-run`, always unoptimized.
    Test,
}

/// A located build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl Artifact {
    fn stat(path: PathBuf) -> Result<Self> {
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .with_context(|| format!("failed to stat {}", path.display()))?;
        Ok(Self { path, modified })
    }
}

/// Path of the manifest naming the canonical test binary of a crate.
pub fn test_manifest_path(krate: &CrateConfig) -> PathBuf {
    krate
        .output_dir(false)
        .join("deps")
        .join(format!("{}.test-artifact", krate.test_prefix()))
}

/// Find the build output of `target` for `profile`.
pub fn locate(target: BuildTarget, krate: &CrateConfig, profile: BuildProfile) -> Result<Artifact> {
    match profile {
        BuildProfile::Normal { release } => {
            let path = krate.output_dir(release).join(&krate.binary);
            if !path.is_file() {
                return Err(HarnessError::ArtifactNotFound {
                    what: target.name(),
                    path,
                }
                .into());
            }
            Artifact::stat(path)
        }
        BuildProfile::Test => {
            if let Some(artifact) = from_manifest(&test_manifest_path(krate))? {
                vprintln!("    {} test binary (manifest): {}", target.name(), artifact.path.display());
                return Ok(artifact);
            }
            let deps = krate.output_dir(false).join("deps");
            let artifact = newest_candidate(target, &deps, &krate.test_prefix())?;
            vprintln!("    {} test binary (newest): {}", target.name(), artifact.path.display());
            Ok(artifact)
        }
    }
}

/// Read the manifest, ignoring it when absent or stale.
fn from_manifest(manifest: &Path) -> Result<Option<Artifact>> {
    let Ok(content) = std::fs::read_to_string(manifest) else {
        return Ok(None);
    };
    let path = PathBuf::from(content.trim());
    if content.trim().is_empty() || !path.is_file() {
        vprintln!("    ignoring stale manifest {}", manifest.display());
        return Ok(None);
    }
    Artifact::stat(path).map(Some)
}

/// Whether a `deps/` entry is a test executable of the crate `prefix`.
///
/// Executables are `<prefix>-<hash>` with no extension; `.d` files, rlibs
/// and the like share the prefix and are skipped.
fn is_candidate(file_name: &str, prefix: &str) -> bool {
    file_name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .is_some_and(|hash| !hash.is_empty() && hash.chars().all(|c| c.is_ascii_alphanumeric()))
}

fn newest_candidate(target: BuildTarget, deps: &Path, prefix: &str) -> Result<Artifact> {
    let ambiguous = |reason: String| HarnessError::AmbiguousArtifact {
        what: target.name(),
        dir: deps.to_path_buf(),
        reason,
    };

    let entries = match std::fs::read_dir(deps) {
        Ok(entries) => entries,
        // No test build has ever run.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HarnessError::ArtifactNotFound {
                what: target.name(),
                path: deps.to_path_buf(),
            }
            .into());
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", deps.display())),
    };

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_candidate(name, prefix) && entry.file_type()?.is_file() {
            candidates.push(Artifact::stat(entry.path())?);
        }
    }

    let Some(newest) = candidates.iter().map(|a| a.modified).max() else {
        return Err(ambiguous(format!("no `{prefix}-*` binaries")).into());
    };

    let mut newest: Vec<Artifact> = candidates.into_iter().filter(|a| a.modified == newest).collect();
    if newest.len() > 1 {
        newest.sort_by(|a, b| a.path.cmp(&b.path));
        let names: Vec<String> = newest.iter().map(|a| a.path.display().to_string()).collect();
        return Err(ambiguous(format!("{} binaries share the newest timestamp: {}", names.len(), names.join(", "))).into());
    }

    Ok(newest.remove(0))
}
