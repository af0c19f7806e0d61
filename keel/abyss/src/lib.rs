//! Machine layer of the keel kernel.
//!
//! `abyss` hides everything the kernel would otherwise ask from the hardware:
//! the interrupt flag and its RAII guard, the trap frame layout, the serial
//! console and the address-space geometry. The kernel proper (`keel`) never
//! touches the host directly; it goes through this crate.
//!
//! The machine is hosted: every kernel thread is backed by a host thread, and
//! the "interrupt flag" is a per-host-thread bit. Only one host thread owns the
//! CPU at a time, so disabling interrupts still means "no other kernel code
//! runs until the guard is dropped".

use core::sync::atomic::AtomicBool;

#[doc(hidden)]
#[macro_use]
pub mod kprint;
pub mod addressing;
pub mod interrupt;
pub mod spinlock;

pub use addressing::Va;
pub use interrupt::{GeneralPurposeRegisters, Registers};
pub use spinlock::SpinLock;

/// Suppresses the serial logger when set.
#[doc(hidden)]
pub static QUITE: AtomicBool = AtomicBool::new(false);
