//! Emulated machine description.
//!
//! A [`HardwareProfile`] is built once per invocation from the `[qemu]`
//! config and rendered into a QEMU argument vector. The three launch modes
//! share one base profile and differ only in the fields listed below.
//!
//! | Mode  | Memory            | gdbstub         | isa-debug-exit | Reboot policy                |
//! |-------|-------------------|-----------------|----------------|------------------------------|
//! | Run   | `qemu.memory`     | off             | no             | `-no-reboot -no-shutdown`    |
//! | Test  | `qemu.test.memory`| off             | yes, headless  | `-no-reboot -no-shutdown`    |
//! | Debug | `qemu.memory`     | on, halted (-S) | no             | `-no-reboot`                 |

use std::path::{Path, PathBuf};

use crate::config::QemuConfig;

/// The `isa-debug-exit` device the guest writes its status to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusDevice {
    pub iobase: u16,
    pub iosize: u8,
}

/// Port and width the kernel's exit routine writes to.
pub const STATUS_DEVICE: StatusDevice = StatusDevice {
    iobase: 0xf4,
    iosize: 0x04,
};

impl StatusDevice {
    fn device_arg(self) -> String {
        format!(
            "isa-debug-exit,iobase={:#x},iosize={:#04x}",
            self.iobase, self.iosize
        )
    }
}

/// Remote gdb stub settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugStub {
    /// Endpoint for `-gdb`, e.g. `tcp::1234`.
    pub endpoint: String,
    /// Freeze the CPU at reset until the debugger continues (`-S`).
    pub halt_at_entry: bool,
}

/// An immutable description of the machine QEMU emulates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareProfile {
    machine: String,
    memory_mib: u32,
    firmware: PathBuf,
    volume: PathBuf,
    headless: bool,
    no_reboot: bool,
    no_shutdown: bool,
    debug_stub: Option<DebugStub>,
    status_device: Option<StatusDevice>,
    extra_args: Vec<String>,
}

impl HardwareProfile {
    fn base(qemu: &QemuConfig, volume: &Path) -> Self {
        Self {
            machine: qemu.machine.clone(),
            memory_mib: qemu.memory,
            firmware: qemu.firmware.clone(),
            volume: volume.to_path_buf(),
            headless: false,
            no_reboot: true,
            no_shutdown: true,
            debug_stub: None,
            status_device: None,
            extra_args: qemu.extra_args.clone(),
        }
    }

    /// Interactive session.
    pub fn run(qemu: &QemuConfig, volume: &Path) -> Self {
        Self::base(qemu, volume)
    }

    /// Unattended test session: smaller, headless, with the status device.
    pub fn test(qemu: &QemuConfig, volume: &Path) -> Self {
        let mut extra_args = qemu.extra_args.clone();
        extra_args.extend(qemu.test.extra_args.iter().cloned());
        Self {
            memory_mib: qemu.test.memory,
            headless: true,
            status_device: Some(STATUS_DEVICE),
            extra_args,
            ..Self::base(qemu, volume)
        }
    }

    /// Debug session: CPU frozen at reset behind a gdb stub.
    ///
    /// `-no-shutdown` is left off so that a guest power-off ends the session
    /// instead of leaving the debugger attached to a stopped VM.
    pub fn debug(qemu: &QemuConfig, volume: &Path) -> Self {
        Self {
            no_shutdown: false,
            debug_stub: Some(DebugStub {
                endpoint: qemu.debug.gdb.clone(),
                halt_at_entry: true,
            }),
            ..Self::base(qemu, volume)
        }
    }

    /// Append caller-supplied QEMU arguments (after `--` on the command line).
    #[must_use]
    pub fn with_extra_args(mut self, args: &[String]) -> Self {
        self.extra_args.extend(args.iter().cloned());
        self
    }

    pub fn firmware(&self) -> &Path {
        &self.firmware
    }

    pub fn memory_mib(&self) -> u32 {
        self.memory_mib
    }

    pub fn status_device(&self) -> Option<StatusDevice> {
        self.status_device
    }

    pub fn debug_stub(&self) -> Option<&DebugStub> {
        self.debug_stub.as_ref()
    }

    /// Render the profile into QEMU arguments. Same profile, same vector.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-machine".into(),
            self.machine.clone(),
            "-m".into(),
            format!("{}M", self.memory_mib),
            "-drive".into(),
            format!(
                "if=pflash,format=raw,readonly=on,file={}",
                option_value(&self.firmware)
            ),
            "-drive".into(),
            format!("format=raw,file=fat:rw:{}", option_value(&self.volume)),
            // Guest serial and host stdio share one channel.
            "-serial".into(),
            "stdio".into(),
        ];

        if self.headless {
            args.push("-display".into());
            args.push("none".into());
        }
        if self.no_reboot {
            args.push("-no-reboot".into());
        }
        if self.no_shutdown {
            args.push("-no-shutdown".into());
        }
        if let Some(device) = self.status_device {
            args.push("-device".into());
            args.push(device.device_arg());
        }
        if let Some(ref stub) = self.debug_stub {
            args.push("-gdb".into());
            args.push(stub.endpoint.clone());
            if stub.halt_at_entry {
                args.push("-S".into());
            }
        }

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// A path as a QEMU option value, where `,` separates options and a literal
/// comma is written `,,`.
fn option_value(path: &Path) -> String {
    path.display().to_string().replace(',', ",,")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qemu_config() -> QemuConfig {
        QemuConfig {
            firmware: PathBuf::from("/fw/OVMF_CODE.fd"),
            extra_args: vec!["-smp".into(), "2".into()],
            ..QemuConfig::default()
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn run_profile_is_interactive() {
        let profile = HardwareProfile::run(&qemu_config(), Path::new("/ws/target/esp"));
        let args = profile.args();

        assert!(has_pair(&args, "-machine", "q35"));
        assert!(has_pair(&args, "-m", "512M"));
        assert!(has_pair(&args, "-drive", "if=pflash,format=raw,readonly=on,file=/fw/OVMF_CODE.fd"));
        assert!(has_pair(&args, "-drive", "format=raw,file=fat:rw:/ws/target/esp"));
        assert!(has_pair(&args, "-serial", "stdio"));
        assert!(args.contains(&"-no-reboot".to_string()));
        assert!(args.contains(&"-no-shutdown".to_string()));
        assert!(!args.contains(&"-display".to_string()));
        assert!(!args.contains(&"-S".to_string()));
        assert!(profile.status_device().is_none());
        assert!(args.ends_with(&["-smp".to_string(), "2".to_string()]));
    }

    #[test]
    fn test_profile_adds_status_device_and_shrinks_memory() {
        let mut qemu = qemu_config();
        qemu.test.extra_args = vec!["-d".into(), "int".into()];
        let profile = HardwareProfile::test(&qemu, Path::new("/esp"));
        let args = profile.args();

        assert_eq!(profile.memory_mib(), 128);
        assert!(has_pair(&args, "-m", "128M"));
        assert!(has_pair(&args, "-device", "isa-debug-exit,iobase=0xf4,iosize=0x04"));
        assert!(has_pair(&args, "-display", "none"));
        assert!(args.contains(&"-no-reboot".to_string()));
        assert!(args.contains(&"-no-shutdown".to_string()));
        assert!(args.ends_with(&["-smp".to_string(), "2".to_string(), "-d".to_string(), "int".to_string()]));
    }

    #[test]
    fn debug_profile_halts_behind_gdb_stub() {
        let profile = HardwareProfile::debug(&qemu_config(), Path::new("/esp"));
        let args = profile.args();

        assert_eq!(profile.memory_mib(), 512);
        assert!(has_pair(&args, "-gdb", "tcp::1234"));
        assert!(args.contains(&"-S".to_string()));
        assert!(args.contains(&"-no-reboot".to_string()));
        assert!(!args.contains(&"-no-shutdown".to_string()));
        assert!(profile.status_device().is_none());
    }

    #[test]
    fn rendering_is_deterministic_and_extra_args_come_last() {
        let extra = vec!["-trace".to_string(), "pci*".to_string()];
        let profile = HardwareProfile::test(&qemu_config(), Path::new("/esp")).with_extra_args(&extra);
        assert_eq!(profile.args(), profile.clone().args());
        assert!(profile.args().ends_with(&extra));
    }

    #[test]
    fn commas_in_paths_are_escaped() {
        let qemu = QemuConfig {
            firmware: PathBuf::from("/fw/a,b/OVMF_CODE.fd"),
            ..QemuConfig::default()
        };
        let args = HardwareProfile::run(&qemu, Path::new("/ws/esp,readonly=on")).args();

        assert!(has_pair(&args, "-drive", "if=pflash,format=raw,readonly=on,file=/fw/a,,b/OVMF_CODE.fd"));
        assert!(has_pair(&args, "-drive", "format=raw,file=fat:rw:/ws/esp,,readonly=on"));
    }
}
