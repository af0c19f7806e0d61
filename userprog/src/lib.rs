//! # User programs on keel
//!
//! This crate turns keel threads into **user processes**. A process is a
//! thread with a [`Process`] attached as its [`keel::task::Task`]: every
//! `syscall` trap of the thread is decoded with [`syscall::SyscallAbi`] and
//! dispatched by the process, and every user pointer the kernel receives is
//! resolved through the process's page table.
//!
//! ## Outline
//! - [`System Call Infrastructure`]: the register calling convention and the
//!   system call numbers.
//! - [`File Descriptors`]: the per-process descriptor table behind `open`,
//!   `read`, `write`, `dup2` and friends.
//! - [`Loader`]: programs, command lines and the initial user stack.
//! - [`Processes`]: `fork`, `exec`, `wait` and `exit`.
//! - [`User Library`]: the stubs user programs call.
//!
//! ## Example
//!
//! ```no_run
//! use keel::SystemConfigurationBuilder;
//! use keel_userprog::{loader::{Program, ProgramTable}, process_execute, usys};
//! use std::sync::Arc;
//!
//! fn hello(_argc: usize, _argv: usize) -> i32 {
//!     usys::write_str(1, "hello, world\n");
//!     0
//! }
//!
//! let programs = Arc::new(ProgramTable::new().with(Program::new("hello", hello)));
//! let shutdown = SystemConfigurationBuilder::new().boot(|| {
//!     let status = process_execute(&programs, "hello").unwrap().wait();
//!     assert_eq!(status, 0);
//! });
//! assert_eq!(shutdown.output, "hello, world\nhello: exit(0)\n");
//! ```
//!
//! [`System Call Infrastructure`]: syscall
//! [`File Descriptors`]: file_struct
//! [`Loader`]: loader
//! [`Processes`]: process
//! [`User Library`]: usys

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(unsafe_code)]

pub mod file_struct;
pub mod loader;
pub mod process;
pub mod syscall;
pub mod usys;

pub use process::{ExitWaiter, Process, process_execute};
pub use syscall::SyscallNumber;
