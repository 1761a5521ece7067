//! Console output levels for harness diagnostics.
//!
//! Three output levels controlled by CLI flags:
//! - **Quiet** (`-q`): errors and the final verdict only
//! - **Default** (no flag): stage banners (build, stage, launch)
//! - **Verbose** (`-v`): also the full QEMU command line, artifact selection
//!   details and stage timings
//!
//! Guest serial output never passes through here; QEMU writes it straight to
//! the inherited stdout.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// Output verbosity level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet = 0,
    Default = 1,
    Verbose = 2,
}

impl Verbosity {
    /// Map the `-q` / `-v` flags to a level. Quiet wins.
    pub fn from_flags(quiet: bool, verbose: bool) -> Self {
        if quiet {
            Self::Quiet
        } else if verbose {
            Self::Verbose
        } else {
            Self::Default
        }
    }
}

static VERBOSITY: AtomicU8 = AtomicU8::new(Verbosity::Default as u8);

/// Set the level for the rest of the process.
pub fn init(level: Verbosity) {
    VERBOSITY.store(level as u8, Ordering::Relaxed);
}

pub fn verbosity() -> Verbosity {
    match VERBOSITY.load(Ordering::Relaxed) {
        0 => Verbosity::Quiet,
        2 => Verbosity::Verbose,
        _ => Verbosity::Default,
    }
}

pub fn is_verbose() -> bool {
    verbosity() == Verbosity::Verbose
}

pub fn is_quiet() -> bool {
    verbosity() == Verbosity::Quiet
}

/// Print a message only when verbose mode is enabled.
macro_rules! vprintln {
    ($($arg:tt)*) => {
        if $crate::verbose::is_verbose() {
            println!($($arg)*);
        }
    };
}

pub(crate) use vprintln;

/// Print a message unless quiet mode is enabled.
macro_rules! dprintln {
    ($($arg:tt)*) => {
        if !$crate::verbose::is_quiet() {
            println!($($arg)*);
        }
    };
}

pub(crate) use dprintln;

/// One orchestration stage: prints a `==>` banner when entered and, in
/// verbose mode, the elapsed time when dropped.
///
/// ```ignore
/// let _stage = Stage::enter("Assembling boot volume");
/// ```
pub struct Stage {
    label: &'static str,
    start: Instant,
}

impl Stage {
    pub fn enter(label: &'static str) -> Self {
        dprintln!("==> {label}");
        Self {
            label,
            start: Instant::now(),
        }
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        vprintln!("    {} took {:.1?}", self.label, self.start.elapsed());
    }
}
