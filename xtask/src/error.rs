//! Fatal pre-launch conditions.
//!
//! These travel inside `anyhow::Error` like every other failure, but `main`
//! recovers them with `downcast_ref` so that they map to a dedicated process
//! exit code instead of a generic one.

use std::path::PathBuf;

use thiserror::Error;

/// Process exit code for any condition that stopped the run before QEMU was
/// spawned.
pub const EXIT_PRELAUNCH: u8 = 126;

/// A condition that aborts the run before any emulator is started.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A required build output is missing.
    #[error("{what} not found at {}", path.display())]
    ArtifactNotFound { what: &'static str, path: PathBuf },

    /// Test-build candidate selection could not single out one binary.
    #[error("cannot select a {what} test binary in {}: {reason}", dir.display())]
    AmbiguousArtifact {
        what: &'static str,
        dir: PathBuf,
        reason: String,
    },

    /// The boot volume could not be staged, or its path is unsafe to wipe.
    #[error("cannot assemble boot volume {}: {reason}", volume.display())]
    VolumeAssemblyFailed {
        volume: PathBuf,
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Another invocation holds the boot volume.
    #[error("boot volume {} is in use by another run (lock {} is held)", volume.display(), lock.display())]
    VolumeLocked { volume: PathBuf, lock: PathBuf },

    /// The UEFI firmware image configured for QEMU does not exist.
    #[error("firmware image not found at {}", .0.display())]
    FirmwareNotFound(PathBuf),

    /// `cargo` failed to build the loader or the kernel.
    #[error("building the {what} failed")]
    BuildFailed {
        what: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

/// Exit code for an error that escaped to `main`.
///
/// Every typed [`HarnessError`] happens before launch. Anything else (a QEMU
/// spawn failure, a bad config file) is reported as a plain failure.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    if err.chain().any(|cause| cause.downcast_ref::<HarnessError>().is_some()) {
        EXIT_PRELAUNCH
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn typed_errors_map_to_prelaunch_code_through_context() {
        let err: anyhow::Result<()> = Err(HarnessError::FirmwareNotFound("/nope.fd".into()).into());
        let err = err.context("launching qemu").unwrap_err();
        assert_eq!(exit_code_for(&err), EXIT_PRELAUNCH);
    }

    #[test]
    fn untyped_errors_are_plain_failures() {
        let err = anyhow::anyhow!("spawn failed");
        assert_eq!(exit_code_for(&err), 1);
    }

    #[test]
    fn messages_name_the_paths() {
        let err = HarnessError::ArtifactNotFound {
            what: "loader",
            path: "/ws/loader/target/x86_64-unknown-uefi/debug/loader.efi".into(),
        };
        assert_eq!(
            err.to_string(),
            "loader not found at /ws/loader/target/x86_64-unknown-uefi/debug/loader.efi"
        );
    }
}
