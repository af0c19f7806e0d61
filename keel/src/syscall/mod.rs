//! System call infrastructure.
use crate::thread::with_current;
pub use abyss::interrupt::Registers;

pub mod uaccess;

/// Entry of the `syscall` instruction.
///
/// Routes the trap frame to the task of the running thread, which decodes the
/// call, performs it and writes the result back into `frame`. A thread without
/// a task never executes user code, so a trap on it is a kernel bug.
pub fn do_handle_syscall(frame: &mut Registers) {
    match with_current(|th| th.task().cloned()) {
        Some(task) => task.syscall(frame),
        None => panic!("Unexpected `syscall` instruction."),
    }
}
