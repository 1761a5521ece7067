//! End-to-end tests for the bootrun binary.
//!
//! Each test builds a throwaway workspace in a temp directory: a `Cargo.toml`
//! whose `[workspace.metadata.bootrun]` points QEMU at `sh -c <script>`, a
//! dummy firmware file, and pre-built loader/kernel outputs. Commands run
//! with `--no-build`, so no cross toolchain is needed.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    /// A workspace whose "emulator" runs `script` and ignores its arguments.
    fn new(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let manifest = format!(
            r#"
[workspace]
members = []

[workspace.metadata.bootrun.qemu]
binary = "sh"
binary-args = ["-c", {script:?}, "qemu"]
firmware = "OVMF_CODE.fd"

[workspace.metadata.bootrun.qemu.test]
timeout = 5
"#
        );
        std::fs::write(dir.path().join("Cargo.toml"), manifest).unwrap();
        std::fs::write(dir.path().join("OVMF_CODE.fd"), b"firmware").unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn file(&self, rel: &str, content: &[u8]) -> PathBuf {
        let path = self.root().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    fn with_loader(self) -> Self {
        self.file("loader/target/x86_64-unknown-uefi/debug/loader.efi", b"LOADER");
        self
    }

    fn with_kernel_tests(self) -> Self {
        self.file("kernel/target/x86_64-unknown-none/debug/deps/kernel-5eed", b"KTEST");
        self
    }

    fn bootrun(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_bootrun"))
            .args(args)
            .current_dir(self.root())
            .output()
            .expect("failed to execute bootrun")
    }
}

fn describe(output: &Output) -> String {
    format!(
        "exit={:?}\nstdout:\n{}\nstderr:\n{}",
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    )
}

#[test]
fn passing_kernel_tests_exit_zero() {
    let ws = Workspace::new("exit 3").with_loader().with_kernel_tests();

    let output = ws.bootrun(&["test", "--no-build"]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert_eq!(
        std::fs::read(ws.root().join("target/esp/EFI/BOOT/BOOTX64.EFI")).unwrap(),
        b"LOADER"
    );
    assert_eq!(std::fs::read(ws.root().join("target/esp/kernel.elf")).unwrap(), b"KTEST");
}

#[test]
fn failing_kernel_tests_exit_with_guest_status() {
    let ws = Workspace::new("exit 5").with_loader().with_kernel_tests();

    let output = ws.bootrun(&["test", "--no-build"]);
    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stdout).contains("FAILED"));
}

#[test]
fn emulator_exit_without_status_is_unsignaled() {
    let ws = Workspace::new("exit 0").with_loader().with_kernel_tests();

    let output = ws.bootrun(&["-q", "test", "--no-build"]);
    assert_eq!(output.status.code(), Some(125), "{}", describe(&output));
}

#[test]
fn hung_guest_times_out() {
    let ws = Workspace::new("while :; do sleep 1; done").with_loader().with_kernel_tests();

    let output = ws.bootrun(&["test", "--no-build", "--timeout", "1"]);
    assert_eq!(output.status.code(), Some(124), "{}", describe(&output));
}

#[test]
fn missing_kernel_is_a_prelaunch_failure() {
    let ws = Workspace::new("touch qemu-was-started; exit 3").with_loader();

    let output = ws.bootrun(&["test", "--no-build"]);
    assert_eq!(output.status.code(), Some(126), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("kernel not found"));
    assert!(!ws.root().join("qemu-was-started").exists());
}

#[test]
fn run_passes_emulator_code_through() {
    let ws = Workspace::new("exit 0").with_loader();
    ws.file("kernel/target/x86_64-unknown-none/debug/kernel", b"KERNEL");

    let output = ws.bootrun(&["run", "--no-build", "--volume", "custom-esp"]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
    assert_eq!(std::fs::read(ws.root().join("custom-esp/kernel.elf")).unwrap(), b"KERNEL");
}

#[test]
fn clean_volume_only_removes_staging() {
    let ws = Workspace::new("exit 3");
    ws.file("target/esp/.bootrun-volume", b"");
    ws.file("target/esp/kernel.elf", b"stale");
    ws.file("target/esp.lock", b"1234\n");

    let output = ws.bootrun(&["clean", "--volume-only"]);
    assert!(output.status.success(), "{}", describe(&output));
    assert!(!ws.root().join("target/esp").exists());
    assert!(!ws.root().join("target/esp.lock").exists());
}

#[test]
fn volume_over_a_source_tree_is_refused() {
    let ws = Workspace::new("exit 3").with_loader().with_kernel_tests();
    let source = ws.file("loader/src/main.rs", b"#![no_main]");

    let output = ws.bootrun(&["test", "--no-build", "--volume", "loader"]);
    assert_eq!(output.status.code(), Some(126), "{}", describe(&output));
    assert!(source.is_file());
    assert!(ws.root().join("loader/target/x86_64-unknown-uefi/debug/loader.efi").is_file());
}

#[test]
fn clean_leaves_foreign_directories_alone() {
    let ws = Workspace::new("exit 3");
    let notes = ws.file("notes/todo.md", b"keep");

    let output = ws.bootrun(&["clean", "--volume-only", "--volume", "notes"]);
    assert_eq!(output.status.code(), Some(126), "{}", describe(&output));
    assert!(notes.is_file());
}

#[test]
fn killed_run_does_not_block_the_next_one() {
    // The first boot hangs; every later one passes.
    let ws = Workspace::new("[ -e booted ] && exit 3; touch booted; sleep 5")
        .with_loader()
        .with_kernel_tests();

    let mut first = Command::new(env!("CARGO_BIN_EXE_bootrun"))
        .args(["test", "--no-build"])
        .current_dir(ws.root())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(20);
    while !ws.root().join("booted").exists() {
        assert!(Instant::now() < deadline, "first run never booted");
        std::thread::sleep(Duration::from_millis(20));
    }
    first.kill().unwrap();
    first.wait().unwrap();
    assert!(ws.root().join("target/esp.lock").exists());

    let output = ws.bootrun(&["test", "--no-build"]);
    assert_eq!(output.status.code(), Some(0), "{}", describe(&output));
}
