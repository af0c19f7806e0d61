//! User-side system call library.
//!
//! User programs are ordinary functions running on a process thread. They
//! reach the kernel only through [`syscall!`], which loads the number and the
//! arguments into a register frame and traps, and through the wrappers below.
//! Pointers handed to the kernel are user addresses; [`stage`] and [`alloc`]
//! obtain them from the process heap.
//!
//! A fault while the program touches its own memory ([`fetch`], [`store`])
//! terminates the process with `-1`, as a segmentation fault would.

use crate::{
    process::{self, Process},
    syscall::SyscallNumber,
};
use keel::{
    syscall::{
        Registers,
        do_handle_syscall,
        uaccess::{UserCString, UserPtrRO, copy_from_user, copy_to_user},
    },
    thread::Current,
};
use std::sync::Arc;

/// Issues a system call with up to six arguments and returns `rax`.
///
/// ```ignore
/// let fd = syscall!(SyscallNumber::Open, usys::stage_str("a.txt"));
/// ```
#[macro_export]
macro_rules! syscall {
    ($nr:expr $(, $arg:expr)* $(,)?) => {
        $crate::usys::invoke($nr as usize, &[$($arg as usize),*])
    };
}

/// Traps into the kernel with `sysno` and `args`.
///
/// # Panics
/// If more than six arguments are given.
pub fn invoke(sysno: usize, args: &[usize]) -> isize {
    assert!(
        args.len() <= 6,
        "A system call takes at most six arguments."
    );
    let mut regs = Registers::new();
    regs.gprs.rax = sysno;
    let gprs = &mut regs.gprs;
    let slots = [
        &mut gprs.rdi,
        &mut gprs.rsi,
        &mut gprs.rdx,
        &mut gprs.r10,
        &mut gprs.r8,
        &mut gprs.r9,
    ];
    for (slot, arg) in slots.into_iter().zip(args) {
        *slot = *arg;
    }
    do_handle_syscall(&mut regs);
    regs.gprs.rax as isize
}

fn this() -> Arc<Process> {
    process::current()
        .unwrap_or_else(|| panic!("Not running in a user process."))
}

/// Reserves `len` zeroed bytes on the heap and returns their address.
pub fn alloc(len: usize) -> usize {
    this().alloc(len).unwrap_or_else(|_| exit(-1))
}

/// Copies `bytes` to the heap and returns their address.
pub fn stage(bytes: &[u8]) -> usize {
    let addr = alloc(bytes.len());
    store(addr, bytes);
    addr
}

/// Copies `s` to the heap as a null-terminated string.
pub fn stage_str(s: &str) -> usize {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    stage(&bytes)
}

/// Reads `len` bytes at `addr`.
pub fn fetch(addr: usize, len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    if copy_from_user(addr, &mut buf).is_err() {
        exit(-1);
    }
    buf
}

/// Writes `bytes` at `addr`.
pub fn store(addr: usize, bytes: &[u8]) {
    if copy_to_user(addr, bytes).is_err() {
        exit(-1);
    }
}

/// Decodes the argument vector a routine was started with.
pub fn args(argc: usize, argv: usize) -> Vec<String> {
    (0..argc)
        .map(|i| {
            UserPtrRO::<usize>::new(argv + i * size_of::<usize>())
                .get()
                .and_then(|ptr| UserCString::new(ptr).read())
                .unwrap_or_else(|_| exit(-1))
        })
        .collect()
}

/// Address of the routine `name` of the running program, or 0.
pub fn symbol(name: &str) -> usize {
    this().program().symbol(name).unwrap_or(0)
}

/// Powers off the machine.
pub fn halt() -> ! {
    syscall!(SyscallNumber::Halt);
    unreachable!("halt returned")
}

/// Terminates the process with `status`.
pub fn exit(status: i32) -> ! {
    syscall!(SyscallNumber::Exit, status);
    // Unreachable unless the task is not a process.
    Current::exit(status)
}

/// Forks the process. The child continues in the routine `resume`.
///
/// Returns the child's thread id, or `-1`.
pub fn fork(resume: &str) -> isize {
    syscall!(SyscallNumber::Fork, symbol(resume))
}

/// Replaces the running program with `cmdline`.
///
/// Never returns: an unknown program terminates the process with `-1`.
pub fn exec(cmdline: &str) -> ! {
    syscall!(SyscallNumber::Exec, stage_str(cmdline));
    unreachable!("exec returned")
}

/// Waits for the child `pid` and returns its exit status, or `-1`.
pub fn wait(pid: isize) -> i32 {
    syscall!(SyscallNumber::Wait, pid) as i32
}

/// Creates a file of `initial_size` bytes.
pub fn create(name: &str, initial_size: usize) -> bool {
    syscall!(SyscallNumber::Create, stage_str(name), initial_size) == 1
}

/// Removes a file.
pub fn remove(name: &str) -> bool {
    syscall!(SyscallNumber::Remove, stage_str(name)) == 1
}

/// Opens a file and returns its descriptor, or `-1`.
pub fn open(name: &str) -> i32 {
    syscall!(SyscallNumber::Open, stage_str(name)) as i32
}

/// Closes `fd`.
pub fn close(fd: i32) {
    syscall!(SyscallNumber::Close, fd);
}

/// Reads up to `size` bytes from `fd` into `buf`.
pub fn read(fd: i32, buf: usize, size: usize) -> isize {
    syscall!(SyscallNumber::Read, fd, buf, size)
}

/// Writes `size` bytes at `buf` to `fd`.
pub fn write(fd: i32, buf: usize, size: usize) -> isize {
    syscall!(SyscallNumber::Write, fd, buf, size)
}

/// Writes `s` to `fd`.
pub fn write_str(fd: i32, s: &str) -> isize {
    write(fd, stage(s.as_bytes()), s.len())
}

/// Size of the file behind `fd`, or `-1`.
pub fn filesize(fd: i32) -> isize {
    syscall!(SyscallNumber::Filesize, fd)
}

/// Moves the position of `fd`.
pub fn seek(fd: i32, position: usize) -> isize {
    syscall!(SyscallNumber::Seek, fd, position)
}

/// Position of `fd`, or `-1`.
pub fn tell(fd: i32) -> isize {
    syscall!(SyscallNumber::Tell, fd)
}

/// Makes `newfd` refer to the file of `oldfd`. Returns `newfd`, or `-1`.
pub fn dup2(oldfd: i32, newfd: i32) -> i32 {
    syscall!(SyscallNumber::Dup2, oldfd, newfd) as i32
}
