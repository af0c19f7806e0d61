//! # System call ABI for x86_64.
//!
//! A user program requests a kernel service with the `syscall` instruction.
//! Before trapping it places:
//!
//! 1. the **system call number** in `%rax`;
//! 2. up to six **arguments** in `%rdi`, `%rsi`, `%rdx`, `%r10`, `%r8` and
//!    `%r9`, in that order.
//!
//! The kernel stores the **return value** in `%rax`. A failed call returns
//! `-1`; calls with a boolean result return `1` or `0`.
//!
//! [`SyscallAbi`] decodes a trapped [`Registers`] frame according to this
//! convention, and [`SyscallNumber`] names the services.

use keel::{KernelError, syscall::Registers};
use num_enum::TryFromPrimitive;

/// System call numbers.
///
/// The numbering follows the classic teaching-kernel system call table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(usize)]
pub enum SyscallNumber {
    /// Powers off the machine.
    Halt = 0,
    /// Terminates the calling process with a status.
    Exit = 1,
    /// Duplicates the calling process.
    Fork = 2,
    /// Replaces the calling process's program.
    Exec = 3,
    /// Waits for a child process to exit.
    Wait = 4,
    /// Creates a file.
    Create = 5,
    /// Removes a file.
    Remove = 6,
    /// Opens a file and returns a file descriptor.
    Open = 7,
    /// Size of an open file.
    Filesize = 8,
    /// Reads data from a file descriptor.
    Read = 9,
    /// Writes data to a file descriptor.
    Write = 10,
    /// Moves the position of an open file.
    Seek = 11,
    /// Retrieves the position of an open file.
    Tell = 12,
    /// Closes a file descriptor.
    Close = 13,
    /// Duplicates a file descriptor onto another.
    Dup2 = 22,
}

/// A struct representing the system call ABI (Application Binary Interface).
///
/// It holds the system call number and the six argument registers of a
/// trapped frame, together with the frame itself so that the result can be
/// written back.
pub struct SyscallAbi<'a> {
    /// The system call number that identifies the requested system service.
    pub sysno: usize,
    /// First argument for the system call.
    pub arg1: usize,
    /// Second argument for the system call.
    pub arg2: usize,
    /// Third argument for the system call.
    pub arg3: usize,
    /// Fourth argument for the system call.
    pub arg4: usize,
    /// Fifth argument for the system call.
    pub arg5: usize,
    /// Sixth argument for the system call.
    pub arg6: usize,
    /// The trapped frame.
    pub regs: &'a mut Registers,
}

impl<'a> SyscallAbi<'a> {
    /// Constructs a [`SyscallAbi`] instance from the provided registers.
    pub fn from_registers(regs: &'a mut Registers) -> Self {
        let gprs = regs.gprs;
        Self {
            sysno: gprs.rax,
            arg1: gprs.rdi,
            arg2: gprs.rsi,
            arg3: gprs.rdx,
            arg4: gprs.r10,
            arg5: gprs.r8,
            arg6: gprs.r9,
            regs,
        }
    }

    /// Sets the return value for the system call.
    ///
    /// `Ok(value)` is stored as is. Every error is reported to the user as
    /// `-1`.
    pub fn set_return_value(self, return_val: Result<usize, KernelError>) {
        self.regs.gprs.rax = match return_val {
            Ok(value) => value,
            Err(e) => {
                log::debug!("syscall {:#x} failed: {e}", self.sysno);
                -1isize as usize
            }
        };
    }

    /// First argument as a signed 32-bit integer.
    pub fn arg1_i32(&self) -> i32 {
        self.arg1 as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_follow_the_calling_convention() {
        let mut regs = Registers::new();
        regs.gprs.rax = 0x1234;
        regs.gprs.rdi = 0x31331;
        regs.gprs.rsi = 0x31332;
        regs.gprs.rdx = 0x31333;
        regs.gprs.r10 = 0x31334;
        regs.gprs.r8 = 0x31335;
        regs.gprs.r9 = 0x31336;
        regs.gprs.rcx = 0xdead;
        let abi = SyscallAbi::from_registers(&mut regs);
        assert_eq!(abi.sysno, 0x1234, "sysno != 0x1234.");
        assert_eq!(
            [abi.arg1, abi.arg2, abi.arg3, abi.arg4, abi.arg5, abi.arg6],
            [0x31331, 0x31332, 0x31333, 0x31334, 0x31335, 0x31336],
            "rcx must not be used as an argument."
        );
        abi.set_return_value(Ok(7));
        assert_eq!(regs.gprs.rax, 7);
    }

    #[test]
    fn errors_become_minus_one() {
        let mut regs = Registers::new();
        SyscallAbi::from_registers(&mut regs)
            .set_return_value(Err(KernelError::BadFileDescriptor));
        assert_eq!(regs.gprs.rax as isize, -1);
    }

    #[test]
    fn numbers() {
        assert_eq!(SyscallNumber::try_from(22).ok(), Some(SyscallNumber::Dup2));
        assert_eq!(SyscallNumber::try_from(9).ok(), Some(SyscallNumber::Read));
        assert!(SyscallNumber::try_from(14).is_err());
    }
}
