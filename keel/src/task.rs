//! Task trait for interact with user process.

use crate::{KernelError, addressing::Va, mm::MappedRegion};
use abyss::interrupt::Registers;

/// Represents a **task** executed by a thread.
///
/// This trait defines core functionalities required for handling event
/// triggered by user process, such as **system calls**. A thread created with
/// [`ThreadBuilder::attach_task`] runs in user mode and routes every trap to
/// its task.
///
/// [`ThreadBuilder::attach_task`]: crate::thread::ThreadBuilder::attach_task
pub trait Task: Send + Sync {
    /// Handles a **system call** triggered by the user program.
    ///
    /// - The `registers` parameter contains the state of the CPU registers at
    ///   the time of the system call.
    /// - Implementations of this function should parse the system call
    ///   arguments, execute the corresponding operation, and store the result
    ///   back in `registers`.
    fn syscall(&self, registers: &mut Registers);

    /// Translates a user virtual address into the page backing it.
    ///
    /// Returns [`KernelError::BadAddress`] if `va` is null, lies in the
    /// kernel half, is not mapped, or is read-only while `is_write` is set.
    #[allow(unused_variables)]
    fn translate(&self, va: Va, is_write: bool) -> Result<MappedRegion, KernelError> {
        Err(KernelError::BadAddress)
    }

    /// Called on the task's thread when it exits with `exit_code`, before
    /// joiners are released.
    #[allow(unused_variables)]
    fn exit(&self, exit_code: i32) {}
}
