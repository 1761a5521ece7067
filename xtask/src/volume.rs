//! Boot volume staging.
//!
//! QEMU presents the volume directory to the firmware as a FAT disk
//! (`-drive format=raw,file=fat:rw:<dir>`). The layout is:
//!
//! ```text
//! <volume>/
//!   EFI/BOOT/BOOTX64.EFI   loader, found by the firmware's removable-media path
//!   kernel.elf             kernel, opened by the loader from the volume root
//! ```
//!
//! The volume is wiped and rebuilt on every run. Only directories this module
//! created (tagged with [`VOLUME_MARKER`]) or empty ones are ever wiped, and a
//! root that contains either build output is refused outright.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::artifact::Artifact;
use crate::error::HarnessError;
use crate::verbose::vprintln;

/// Directory the firmware searches for a removable-media boot entry.
pub const FIRMWARE_BOOT_DIR: &str = "EFI/BOOT";

/// Default boot entry name for x86_64 UEFI firmware.
pub const FIRMWARE_BOOT_ENTRY: &str = "BOOTX64.EFI";

/// File the loader opens from the volume root. Must match the name the loader
/// passes to `EFI_FILE_PROTOCOL.Open`.
pub const KERNEL_IMAGE: &str = "kernel.elf";

/// Empty file tagging a directory as a volume assembled by this harness.
pub const VOLUME_MARKER: &str = ".bootrun-volume";

/// A fully staged boot volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootVolume {
    root: PathBuf,
}

impl BootVolume {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the firmware-visible bootstrap entry.
    pub fn boot_entry(&self) -> PathBuf {
        self.root.join(FIRMWARE_BOOT_DIR).join(FIRMWARE_BOOT_ENTRY)
    }

    /// Path of the loader-visible kernel image.
    pub fn kernel_image(&self) -> PathBuf {
        self.root.join(KERNEL_IMAGE)
    }
}

/// Stage `loader` and `kernel` into a fresh volume at `root`.
///
/// A previous volume at `root` is removed first. On error the volume must
/// not be booted.
pub fn assemble(root: &Path, loader: &Artifact, kernel: &Artifact) -> Result<BootVolume> {
    let volume = BootVolume {
        root: root.to_path_buf(),
    };

    for artifact in [loader, kernel] {
        if contains(root, &artifact.path) {
            return Err(refuse(
                root,
                format!("it contains the build output {}", artifact.path.display()),
            ));
        }
    }
    clear(root)?;

    let boot_dir = root.join(FIRMWARE_BOOT_DIR);
    std::fs::create_dir_all(&boot_dir)
        .with_context(|| format!("failed to create {}", boot_dir.display()))?;
    let marker = root.join(VOLUME_MARKER);
    std::fs::write(&marker, b"").with_context(|| format!("failed to write {}", marker.display()))?;

    stage(root, &loader.path, &volume.boot_entry())?;
    stage(root, &kernel.path, &volume.kernel_image())?;

    Ok(volume)
}

/// Remove a previous volume at `root`.
///
/// A missing or empty directory is fine. A non-empty directory without
/// [`VOLUME_MARKER`] was not made by this harness and is left untouched.
pub fn clear(root: &Path) -> Result<()> {
    let mut entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", root.display())),
    };
    if entries.next().is_some() && !root.join(VOLUME_MARKER).is_file() {
        return Err(refuse(
            root,
            format!("it is not empty and has no {VOLUME_MARKER} marker, refusing to wipe it"),
        ));
    }

    std::fs::remove_dir_all(root).with_context(|| format!("failed to clear {}", root.display()))?;
    vprintln!("    cleared {}", root.display());
    Ok(())
}

fn refuse(root: &Path, reason: String) -> anyhow::Error {
    HarnessError::VolumeAssemblyFailed {
        volume: root.to_path_buf(),
        reason,
        source: None,
    }
    .into()
}

/// Whether `path` lies inside `dir`, symlinks and `..` resolved. A path that
/// does not exist yet contains nothing.
fn contains(dir: &Path, path: &Path) -> bool {
    match (dir.canonicalize(), path.canonicalize()) {
        (Ok(dir), Ok(path)) => path.starts_with(dir),
        _ => false,
    }
}

fn stage(root: &Path, from: &Path, to: &Path) -> Result<()> {
    let bytes = std::fs::copy(from, to).map_err(|source| HarnessError::VolumeAssemblyFailed {
        volume: root.to_path_buf(),
        reason: format!("failed to copy {} to {}", from.display(), to.display()),
        source: Some(source),
    })?;
    vprintln!("    {} -> {} ({bytes} bytes)", from.display(), to.display());
    Ok(())
}

/// Advisory lock on a volume path, held for the duration of one run.
///
/// An exclusive OS file lock on the sibling file `<volume>.lock`. The kernel
/// drops it when the holder exits, so a killed run never blocks the next
/// one. The file itself stays behind with the pid of the last holder.
#[derive(Debug)]
pub struct VolumeLock {
    _file: File,
}

impl VolumeLock {
    pub fn lock_path(volume: &Path) -> PathBuf {
        let mut name = volume.file_name().map(ToOwned::to_owned).unwrap_or_default();
        name.push(".lock");
        volume.with_file_name(name)
    }

    pub fn acquire(volume: &Path) -> Result<Self> {
        let path = Self::lock_path(volume);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(HarnessError::VolumeLocked {
                    volume: volume.to_path_buf(),
                    lock: path,
                }
                .into());
            }
            Err(TryLockError::Error(e)) => {
                return Err(e).with_context(|| format!("failed to lock {}", path.display()));
            }
        }

        // Owner pid, for whoever wonders who holds the volume.
        file.set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .with_context(|| format!("failed to write {}", path.display()))?;

        Ok(Self { _file: file })
    }
}
