//! Guest exit signalling.
//!
//! The kernel ends a test run by writing a status `s` to the `isa-debug-exit`
//! port. QEMU then exits immediately with process code `(s << 1) | 1`, so any
//! status the guest can write yields an odd code. A code of `0` means QEMU
//! shut down on its own (guest powered off, or the window was closed) and an
//! even code is QEMU reporting its own failure; neither carries a guest
//! status.

use std::fmt;

use crate::launch::Termination;

/// Process exit code when the emulator was killed by the test timeout.
pub const EXIT_TIMED_OUT: u8 = 124;

/// Process exit code for any other run without a guest status.
pub const EXIT_UNSIGNALED: u8 = 125;

/// A status written by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExitStatus(pub u32);

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Why a run ended without a guest status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsignaled {
    /// QEMU exited with code 0: the guest halted, looped or powered off
    /// without touching the status device.
    NoStatusWrite,
    /// QEMU was terminated by a signal.
    Killed,
    /// The harness killed QEMU after the test timeout.
    TimedOut,
    /// QEMU exited with a code no guest write can produce.
    EmulatorFailure(i32),
}

/// Terminal classification of one emulator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Signaled(ExitStatus),
    Unsignaled(Unsignaled),
}

impl Outcome {
    /// Classify how the emulator process ended.
    pub fn decode(termination: Termination) -> Self {
        match termination {
            Termination::TimedOut => Self::Unsignaled(Unsignaled::TimedOut),
            Termination::Exited { code: None } => Self::Unsignaled(Unsignaled::Killed),
            Termination::Exited { code: Some(code) } => Self::from_exit_code(code),
        }
    }

    /// Classify a QEMU process exit code.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Self::Unsignaled(Unsignaled::NoStatusWrite),
            // `code > 0` and odd, so `code - 1` cannot overflow or go negative.
            code if code > 0 && code % 2 == 1 => {
                Self::Signaled(ExitStatus(((code - 1) / 2).unsigned_abs()))
            }
            code => Self::Unsignaled(Unsignaled::EmulatorFailure(code)),
        }
    }

    /// Whether a test run passed.
    ///
    /// Only an explicit write of `success_status` passes. Status 0 never does:
    /// it is what a bare `(0 << 1) | 1` write looks like, which no test
    /// routine is expected to send.
    pub fn passed(self, success_status: u32) -> bool {
        matches!(self, Self::Signaled(ExitStatus(s)) if s == success_status && s != 0)
    }

    /// Process exit code for a test run with this outcome.
    pub fn exit_code(self, success_status: u32) -> u8 {
        match self {
            _ if self.passed(success_status) => 0,
            Self::Signaled(ExitStatus(status)) => u8::try_from(status).unwrap_or(u8::MAX).max(1),
            Self::Unsignaled(Unsignaled::TimedOut) => EXIT_TIMED_OUT,
            Self::Unsignaled(_) => EXIT_UNSIGNALED,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signaled(status) => write!(f, "guest exited with status {status}"),
            Self::Unsignaled(Unsignaled::NoStatusWrite) => {
                f.write_str("emulator stopped without a guest status")
            }
            Self::Unsignaled(Unsignaled::Killed) => f.write_str("emulator was killed"),
            Self::Unsignaled(Unsignaled::TimedOut) => f.write_str("guest timed out"),
            Self::Unsignaled(Unsignaled::EmulatorFailure(code)) => {
                write!(f, "emulator failed (exit code {code})")
            }
        }
    }
}
