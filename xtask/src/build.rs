//! Loader and kernel builds.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::thread;

use anyhow::{Context, Result};

use crate::artifact::{self, BuildProfile, BuildTarget};
use crate::cargo::{self, CargoCommand};
use crate::config::{Config, CrateConfig};
use crate::error::HarnessError;
use crate::verbose::{dprintln, vprintln};

/// Build the loader and the kernel.
///
/// The two builds are independent cargo processes in separate crates, so
/// they run side by side; both must finish before anything is located.
pub fn build(config: &Config, loader: BuildProfile, kernel: BuildProfile) -> Result<()> {
    let (loader_result, kernel_result) = thread::scope(|s| {
        let loader_job = s.spawn(|| build_one(BuildTarget::Loader, &config.loader, loader));
        let kernel_job = s.spawn(|| build_one(BuildTarget::Kernel, &config.kernel, kernel));
        (join(loader_job), join(kernel_job))
    });

    loader_result?;
    kernel_result?;
    Ok(())
}

fn join(handle: thread::ScopedJoinHandle<'_, Result<()>>) -> Result<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(anyhow::anyhow!("build thread panicked")))
}

fn build_one(target: BuildTarget, krate: &CrateConfig, profile: BuildProfile) -> Result<()> {
    dprintln!("    building {} ({})", target.name(), krate.target);
    let wrap = |source| HarnessError::BuildFailed {
        what: target.name(),
        source,
    };

    match profile {
        BuildProfile::Normal { release } => CargoCommand::build(krate, release).run().map_err(wrap)?,
        BuildProfile::Test => {
            let messages = CargoCommand::build_tests(krate).read().map_err(wrap)?;
            if let Some(executable) = record_test_executable(krate, &messages)? {
                vprintln!("    {} test binary reported by cargo: {}", target.name(), executable.display());
            }
        }
    }
    Ok(())
}

/// Point the test manifest at the executable cargo reported in `messages`.
///
/// When cargo reported none, any existing manifest is removed so that it
/// cannot name an older build.
fn record_test_executable(krate: &CrateConfig, messages: &str) -> Result<Option<PathBuf>> {
    let manifest = artifact::test_manifest_path(krate);
    let Some(executable) = cargo::test_executable(messages, &krate.test_prefix()) else {
        match std::fs::remove_file(&manifest) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove stale {}", manifest.display()));
            }
        }
        return Ok(None);
    };
    cargo::write_manifest(&manifest, &executable)?;
    Ok(Some(executable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{BuildProfile, locate};

    fn kernel_crate(root: &std::path::Path) -> CrateConfig {
        CrateConfig {
            dir: root.join("kernel"),
            target: "x86_64-unknown-none".into(),
            binary: "kernel".into(),
        }
    }

    fn artifact_message(executable: &std::path::Path) -> String {
        format!(
            r#"{{"reason":"compiler-artifact","target":{{"name":"kernel"}},"profile":{{"test":true}},"executable":"{}"}}"#,
            executable.display()
        )
    }

    #[test]
    fn reported_executable_is_recorded_and_selected() {
        let tmp = tempfile::tempdir().unwrap();
        let krate = kernel_crate(tmp.path());
        let deps = krate.output_dir(false).join("deps");
        std::fs::create_dir_all(&deps).unwrap();
        std::fs::write(deps.join("kernel-aaaa"), b"reported").unwrap();
        std::fs::write(deps.join("kernel-bbbb"), b"other").unwrap();

        let recorded = record_test_executable(&krate, &artifact_message(&deps.join("kernel-aaaa"))).unwrap();
        assert_eq!(recorded, Some(deps.join("kernel-aaaa")));
        let selected = locate(BuildTarget::Kernel, &krate, BuildProfile::Test).unwrap();
        assert_eq!(selected.path, deps.join("kernel-aaaa"));
    }

    #[test]
    fn silent_build_drops_the_previous_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let krate = kernel_crate(tmp.path());
        let deps = krate.output_dir(false).join("deps");
        std::fs::create_dir_all(&deps).unwrap();
        std::fs::write(deps.join("kernel-old"), b"old").unwrap();
        record_test_executable(&krate, &artifact_message(&deps.join("kernel-old"))).unwrap();
        assert!(artifact::test_manifest_path(&krate).is_file());

        let recorded = record_test_executable(&krate, r#"{"reason":"build-finished","success":true}"#).unwrap();
        assert_eq!(recorded, None);
        assert!(!artifact::test_manifest_path(&krate).exists());

        // Nothing to remove the second time.
        assert_eq!(record_test_executable(&krate, "").unwrap(), None);
    }

    #[test]
    fn unremovable_manifest_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let krate = kernel_crate(tmp.path());
        // A directory in the manifest's place cannot be removed as a file.
        std::fs::create_dir_all(artifact::test_manifest_path(&krate)).unwrap();

        assert!(record_test_executable(&krate, "").is_err());
    }
}
