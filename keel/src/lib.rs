//! # keel: a uniprocessor teaching kernel
//!
//! keel is the thread and process core of a small teaching operating system.
//! It covers two tightly coupled subsystems:
//!
//! - **Threads** ([`thread`]): thread control blocks, the ready queue and the
//!   sleep set, strict-priority round-robin and multi-level feedback queue
//!   scheduling, and the synchronization primitives built on blocking
//!   ([`sync`]).
//! - **The user boundary** ([`syscall`], [`task`], [`mm`]): trap frames,
//!   validation of untrusted user pointers, and the [`task::Task`] hook through
//!   which a user process receives its system calls.
//!
//! The file-descriptor table and the system-call table themselves live in the
//! `keel-userprog` crate, which implements [`task::Task`] for its processes.
//!
//! ## The machine
//!
//! keel runs on a hosted machine provided by the `abyss` crate. Every kernel
//! thread is backed by a host thread, but exactly one of them owns the CPU at
//! any time; a context switch hands the CPU to the next thread and parks the
//! previous one. Timer interrupts are delivered at well-defined points
//! ([`timer::interrupt`], [`timer::busy_wait`], and the idle loop), so a test
//! decides exactly when preemption may happen.
//!
//! ```no_run
//! use keel::{SystemConfigurationBuilder, thread::ThreadBuilder};
//!
//! let shutdown = SystemConfigurationBuilder::new()
//!     .cmdline("-o mlfqs")
//!     .boot(|| {
//!         let handle = ThreadBuilder::new("worker")
//!             .spawn(|| keel::println!("hello from worker"))
//!             .expect("out of thread pages");
//!         assert_eq!(handle.join(), 0);
//!     });
//! println!("{} ticks elapsed", shutdown.ticks);
//! ```
#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

mod boot;

pub mod fs;
pub mod mm;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod teletype;
pub mod thread;
pub mod timer;

pub use abyss::{addressing, print, println};
pub use boot::{Shutdown, power_off};

use std::sync::Arc;

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// during the handling of a kernel operation. The numeric values follow the
/// errno convention so that they can be handed back to user programs.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum KernelError {
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// Exec format error. (ENOEXEC)
    NoExec,
    /// BAD file descriptor. (EBADF)
    BadFileDescriptor,
    /// No child process. (ECHILD)
    NoChild,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Bad address. (EFAULT)
    BadAddress,
    /// File exists. (EEXIST)
    FileExist,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// Too many open files. (EMFILE)
    TooManyOpenFile,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// File name too long. (ENAMETOOLONG)
    NameTooLong,
    /// Invalid system call number. (ENOSYS)
    NoSuchSyscall,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::NoSuchEntry => -2isize,
            KernelError::NoExec => -8,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoChild => -10,
            KernelError::NoMemory => -12,
            KernelError::BadAddress => -14,
            KernelError::FileExist => -17,
            KernelError::InvalidArgument => -22,
            KernelError::TooManyOpenFile => -24,
            KernelError::NoSpace => -28,
            KernelError::NameTooLong => -36,
            KernelError::NoSuchSyscall => -38,
        }) as usize
    }
}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -2 => Ok(Self::NoSuchEntry),
            -8 => Ok(Self::NoExec),
            -9 => Ok(Self::BadFileDescriptor),
            -10 => Ok(Self::NoChild),
            -12 => Ok(Self::NoMemory),
            -14 => Ok(Self::BadAddress),
            -17 => Ok(Self::FileExist),
            -22 => Ok(Self::InvalidArgument),
            -24 => Ok(Self::TooManyOpenFile),
            -28 => Ok(Self::NoSpace),
            -36 => Ok(Self::NameTooLong),
            -38 => Ok(Self::NoSuchSyscall),
            e => Err(TryFromError { e }),
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?} ({})", self.into_usize() as isize)
    }
}

impl std::error::Error for KernelError {}

/// Scheduling discipline, fixed at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingPolicy {
    /// Strict priority, round-robin among equal priorities.
    #[default]
    RoundRobin,
    /// Multi-level feedback queue (4.4BSD).
    Mlfqs,
}

/// Default number of thread pages, idle and main included.
pub const DEFAULT_MAX_THREADS: usize = 64;

/// Immutable machine configuration produced by [`SystemConfigurationBuilder`].
#[derive(Clone)]
pub struct SystemConfiguration {
    pub(crate) policy: SchedulingPolicy,
    pub(crate) max_threads: usize,
    pub(crate) filesystem: Option<Arc<dyn fs::traits::FileSystem>>,
    pub(crate) stdin: Vec<u8>,
    pub(crate) log_level: log::LevelFilter,
    pub(crate) quiet: bool,
    pub(crate) cmdline: String,
}

/// A builder for system configuration settings.
///
/// The [`SystemConfigurationBuilder`] struct provides an interface for
/// configuring system-wide settings before boot: the scheduling policy, the
/// number of thread pages, the root filesystem and the console input.
pub struct SystemConfigurationBuilder {
    config: SystemConfiguration,
}

impl Default for SystemConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemConfigurationBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: SystemConfiguration {
                policy: SchedulingPolicy::RoundRobin,
                max_threads: DEFAULT_MAX_THREADS,
                filesystem: None,
                stdin: Vec::new(),
                log_level: log::LevelFilter::Warn,
                quiet: false,
                cmdline: String::new(),
            },
        }
    }

    /// Applies a kernel command line.
    ///
    /// Recognized options are `-o mlfqs` (multi-level feedback queue
    /// scheduling) and `-q` (silence the kernel log).
    pub fn cmdline(mut self, cmdline: &str) -> Self {
        let mut options = cmdline.split_whitespace();
        while let Some(option) = options.next() {
            match option {
                "-o" => match options.next() {
                    Some("mlfqs") => self.config.policy = SchedulingPolicy::Mlfqs,
                    other => log::warn!("unknown option `-o {}`", other.unwrap_or("")),
                },
                "-q" => self.config.quiet = true,
                other => log::warn!("unknown option `{other}`"),
            }
        }
        self.config.cmdline = cmdline.to_string();
        self
    }

    /// Sets the system-wide scheduling policy.
    pub fn scheduling(mut self, policy: SchedulingPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Sets the number of thread pages available to the kernel.
    ///
    /// # Panics
    /// If fewer than two pages are given: the initial thread and the idle
    /// thread always need one each.
    pub fn max_threads(mut self, max_threads: usize) -> Self {
        assert!(
            max_threads >= 2,
            "max_threads must leave room for the main and idle threads."
        );
        self.config.max_threads = max_threads;
        self
    }

    /// Registers the root filesystem.
    pub fn filesystem(mut self, fs: Arc<dyn fs::traits::FileSystem>) -> Self {
        self.config.filesystem = Some(fs);
        self
    }

    /// Queues bytes on the console input device.
    pub fn stdin(mut self, input: &[u8]) -> Self {
        self.config.stdin.extend_from_slice(input);
        self
    }

    /// Sets the maximum level of the kernel log.
    pub fn log_level(mut self, level: log::LevelFilter) -> Self {
        self.config.log_level = level;
        self
    }

    /// Silences the kernel log.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.config.quiet = quiet;
        self
    }

    /// Returns the configuration being built.
    pub fn build(self) -> SystemConfiguration {
        self.config
    }

    /// Boots the machine and runs `main` on its initial thread.
    ///
    /// See [`boot`] for the exact semantics.
    pub fn boot(self, main: impl FnOnce()) -> Shutdown {
        boot(self.config, main)
    }
}

/// Boots a machine on the calling host thread and runs `main` as the initial
/// kernel thread.
///
/// When `main` returns, the machine powers off: every other kernel thread is
/// stopped wherever it is. A panic in any kernel thread is a kernel panic and
/// is re-raised by this function after the machine stopped.
pub fn boot(config: SystemConfiguration, main: impl FnOnce()) -> Shutdown {
    boot::boot(config, main)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmdline_selects_mlfqs() {
        let config = SystemConfigurationBuilder::new()
            .cmdline("-o mlfqs")
            .build();
        assert_eq!(config.policy, SchedulingPolicy::Mlfqs);
        let config = SystemConfigurationBuilder::new().cmdline("").build();
        assert_eq!(config.policy, SchedulingPolicy::RoundRobin);
    }

    #[test]
    fn error_codes_round_trip_through_isize() {
        for e in [
            KernelError::NoSuchEntry,
            KernelError::BadAddress,
            KernelError::TooManyOpenFile,
            KernelError::NoSuchSyscall,
        ] {
            assert_eq!(KernelError::try_from(e.into_usize() as isize), Ok(e));
        }
        assert!(KernelError::try_from(-1).is_err());
    }

    #[test]
    #[should_panic(expected = "max_threads must leave room")]
    fn thread_budget_covers_main_and_idle() {
        SystemConfigurationBuilder::new().max_threads(1);
    }

    #[test]
    fn smallest_thread_budget_boots() {
        let shutdown = SystemConfigurationBuilder::new()
            .quiet(true)
            .max_threads(2)
            .boot(|| {
                assert_eq!(
                    thread::ThreadBuilder::new("extra").spawn(|| ()).err(),
                    Some(KernelError::NoMemory)
                );
            });
        assert_eq!(shutdown.output, "");
    }
}
