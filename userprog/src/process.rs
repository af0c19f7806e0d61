//! # User processes.
//!
//! A [`Process`] is the [`Task`] of a user thread. It owns the memory
//! [`Image`] of the running program, the [`FileStruct`] and the bookkeeping
//! needed to report its exit status to its parent.
//!
//! ## Running user code
//!
//! The process thread enters [`run`] with a trap frame. The routine that
//! starts at the frame's `rip` is looked up in the program and called with
//! `rdi` and `rsi` as its `(argc, argv)`; its return value becomes the exit
//! status. A successful `exec` replaces the image and unwinds back into
//! [`run`] with a fresh frame, so the new program starts from its entry point
//! on the same thread.
//!
//! ## Lifetime
//!
//! ```text
//!   parent                         child
//!   fork(resume) ──spawn──────────▶ run(resume, rax = 0)
//!   wait(tid) ──down─┐                 ...
//!                    │             exit(status)
//!                    │               "<name>: exit(<status>)"
//!                    │               close every descriptor
//!                    │               drop the address space
//!                    └──────────────up(exited)
//!   <- status
//! ```
//!
//! A parent waits on each child at most once; waiting again, or on a thread
//! that is not a child, fails.

use crate::{
    file_struct::{FileDescriptor, FileStruct, STDIN, STDOUT},
    loader::{Image, Program, ProgramTable},
    syscall::{SyscallAbi, SyscallNumber},
};
use keel::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    fs::FileSystem,
    mm::MappedRegion,
    sync::{Mutex, Semaphore, SpinLock},
    syscall::{
        Registers,
        uaccess::{check_valid_address, check_valid_string, copy_from_user, copy_to_user},
    },
    task::Task,
    teletype,
    thread::{self, Current, ThreadBuilder, Tid},
};
use std::{
    cell::RefCell,
    collections::BTreeMap,
    panic::{AssertUnwindSafe, catch_unwind, resume_unwind},
    sync::{
        Arc,
        atomic::{AtomicI32, Ordering},
    },
};

/// Unwinding payload that restarts [`run`] with a new frame after `exec`.
struct Restart(Registers);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Process>>> = const { RefCell::new(None) };
}

/// The process running on the calling thread, if any.
pub fn current() -> Option<Arc<Process>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Exit status of a process, published to whoever waits for it.
struct ExitStatus {
    status: AtomicI32,
    exited: Semaphore,
}

impl ExitStatus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            status: AtomicI32::new(0),
            exited: Semaphore::new(0),
        })
    }

    fn wait(&self) -> i32 {
        self.exited.down();
        self.status.load(Ordering::SeqCst)
    }
}

/// A user process.
pub struct Process {
    programs: Arc<ProgramTable>,
    image: SpinLock<Image>,
    file_struct: Mutex<FileStruct>,
    children: SpinLock<BTreeMap<Tid, Arc<ExitStatus>>>,
    exit_status: Arc<ExitStatus>,
}

impl Process {
    fn new(programs: Arc<ProgramTable>, image: Image, file_struct: FileStruct) -> Arc<Self> {
        Arc::new(Self {
            programs,
            image: SpinLock::new(image),
            file_struct: Mutex::new(file_struct),
            children: SpinLock::new(BTreeMap::new()),
            exit_status: ExitStatus::new(),
        })
    }

    /// Name of the running program.
    pub fn name(&self) -> String {
        self.program().name().to_string()
    }

    /// The running program.
    pub fn program(&self) -> Arc<Program> {
        let image = self.image.lock();
        let program = image.program.clone();
        image.unlock();
        program
    }

    /// Reserves `len` bytes on the heap of the image.
    pub fn alloc(&self, len: usize) -> Result<usize, KernelError> {
        let mut image = self.image.lock();
        let addr = image.alloc(len);
        image.unlock();
        addr
    }

    /// Runs `f` with the descriptor table locked.
    pub fn with_file_struct<R>(&self, f: impl FnOnce(&mut FileStruct) -> R) -> R {
        let mut file_struct = self.file_struct.lock();
        let result = f(&mut file_struct);
        file_struct.unlock();
        result
    }

    /// Children that have not been waited for.
    pub fn children(&self) -> Vec<Tid> {
        let children = self.children.lock();
        let tids = children.keys().copied().collect();
        children.unlock();
        tids
    }

    fn fork(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let resume = abi.arg1;
        let image = self.image.lock();
        let child_image = image
            .program
            .routine_at(resume)
            .map(|_| image.duplicate());
        image.unlock();
        let child_image = child_image.ok_or(KernelError::InvalidArgument)?;
        let child_files = self.with_file_struct(|file_struct| file_struct.clone());

        let mut frame = *abi.regs;
        *frame.rip() = resume;
        frame.gprs.rax = 0;
        frame.gprs.rdi = child_image.argc;
        frame.gprs.rsi = child_image.argv;

        let name = child_image.program.name().to_string();
        let child = Process::new(self.programs.clone(), child_image, child_files);
        let exit_status = child.exit_status.clone();
        let handle = ThreadBuilder::new(name)
            .priority(thread::get_priority())
            .attach_task(child.clone())
            .spawn(move || run(child, frame))?;

        let mut children = self.children.lock();
        children.insert(handle.tid, exit_status);
        children.unlock();
        log::debug!("fork: {} -> {}", thread::tid(), handle.tid);
        Ok(handle.tid as usize)
    }

    fn exec(&self, abi: &SyscallAbi) -> ! {
        let cmdline = check_valid_string(abi.arg1);
        let image = match Image::load(&self.programs, &cmdline) {
            Ok(image) => image,
            Err(e) => {
                log::debug!("exec({cmdline:?}) failed: {e}");
                Current::exit(-1)
            }
        };
        let frame = initial_frame(&image);
        let mut current = self.image.lock();
        *current = image;
        current.unlock();
        resume_unwind(Box::new(Restart(frame)))
    }

    fn wait(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let tid = abi.arg1 as Tid;
        let mut children = self.children.lock();
        let child = children.remove(&tid);
        children.unlock();
        let status = child.ok_or(KernelError::NoChild)?.wait();
        Ok(status as isize as usize)
    }

    fn create(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let name = check_valid_string(abi.arg1);
        Ok(FileSystem::create(&name, abi.arg2).is_ok() as usize)
    }

    fn remove(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let name = check_valid_string(abi.arg1);
        Ok(FileSystem::remove(&name).is_ok() as usize)
    }

    fn open(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let name = check_valid_string(abi.arg1);
        self.with_file_struct(|file_struct| file_struct.open(&name))
            .map(|fd| fd.0 as usize)
    }

    fn close(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor::from(abi.arg1);
        self.with_file_struct(|file_struct| file_struct.close(fd));
        Ok(0)
    }

    fn read(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let (fd, buf, size) = (FileDescriptor::from(abi.arg1), abi.arg2, abi.arg3);
        // Standard output is never readable.
        if !fd.is_valid() || fd == STDOUT {
            Current::exit(-1);
        }
        if size > 0 {
            check_valid_address(buf);
            let last = buf
                .checked_add(size - 1)
                .unwrap_or_else(|| Current::exit(-1));
            check_valid_address(last);
        }
        let file_struct = self.file_struct.lock();
        if fd != STDIN && file_struct.get(fd).is_none() {
            file_struct.unlock();
            Current::exit(-1);
        }
        let result = read_to_user(&file_struct, fd, buf, size);
        file_struct.unlock();
        match result {
            Err(KernelError::BadAddress) => Current::exit(-1),
            result => result,
        }
    }

    fn write(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let (fd, buf, size) = (FileDescriptor::from(abi.arg1), abi.arg2, abi.arg3);
        if size > 0 {
            check_valid_address(buf);
        }
        let file_struct = self.file_struct.lock();
        let result = write_from_user(&file_struct, fd, buf, size);
        file_struct.unlock();
        match result {
            Err(KernelError::BadAddress) => Current::exit(-1),
            result => result,
        }
    }

    fn filesize(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor::from(abi.arg1);
        self.with_file_struct(|file_struct| file_struct.filesize(fd))
    }

    fn seek(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor::from(abi.arg1);
        self.with_file_struct(|file_struct| file_struct.seek(fd, abi.arg2))
            .map(|_| 0)
    }

    fn tell(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let fd = FileDescriptor::from(abi.arg1);
        self.with_file_struct(|file_struct| file_struct.tell(fd))
    }

    fn dup2(&self, abi: &SyscallAbi) -> Result<usize, KernelError> {
        let oldfd = FileDescriptor::from(abi.arg1);
        let newfd = FileDescriptor::from(abi.arg2);
        self.with_file_struct(|file_struct| file_struct.dup2(oldfd, newfd))
            .map(|fd| fd.0 as usize)
    }
}

fn read_to_user(
    file_struct: &FileStruct,
    fd: FileDescriptor,
    buf: usize,
    size: usize,
) -> Result<usize, KernelError> {
    let mut chunk = vec![0; size.min(PAGE_SIZE)];
    let mut done = 0;
    while done < size {
        let want = (size - done).min(chunk.len());
        let read = file_struct.read(fd, &mut chunk[..want])?;
        copy_to_user(buf + done, &chunk[..read])?;
        done += read;
        if read < want {
            break;
        }
    }
    Ok(done)
}

fn write_from_user(
    file_struct: &FileStruct,
    fd: FileDescriptor,
    buf: usize,
    size: usize,
) -> Result<usize, KernelError> {
    if size == 0 {
        return file_struct.write(fd, &[]);
    }
    let mut chunk = vec![0; size.min(PAGE_SIZE)];
    let mut done = 0;
    while done < size {
        let len = (size - done).min(chunk.len());
        let at = buf.checked_add(done).ok_or(KernelError::BadAddress)?;
        copy_from_user(at, &mut chunk[..len])?;
        let written = file_struct.write(fd, &chunk[..len])?;
        done += written;
        if written < len {
            break;
        }
    }
    Ok(done)
}

impl Task for Process {
    fn syscall(&self, registers: &mut Registers) {
        let abi = SyscallAbi::from_registers(registers);
        let sysno = SyscallNumber::try_from(abi.sysno)
            .map_err(|_| KernelError::NoSuchSyscall);
        let return_val = match sysno {
            Ok(SyscallNumber::Halt) => keel::power_off(),
            Ok(SyscallNumber::Exit) => Current::exit(abi.arg1_i32()),
            Ok(SyscallNumber::Fork) => self.fork(&abi),
            Ok(SyscallNumber::Exec) => self.exec(&abi),
            Ok(SyscallNumber::Wait) => self.wait(&abi),
            Ok(SyscallNumber::Create) => self.create(&abi),
            Ok(SyscallNumber::Remove) => self.remove(&abi),
            Ok(SyscallNumber::Open) => self.open(&abi),
            Ok(SyscallNumber::Filesize) => self.filesize(&abi),
            Ok(SyscallNumber::Read) => self.read(&abi),
            Ok(SyscallNumber::Write) => self.write(&abi),
            Ok(SyscallNumber::Seek) => self.seek(&abi),
            Ok(SyscallNumber::Tell) => self.tell(&abi),
            Ok(SyscallNumber::Close) => self.close(&abi),
            Ok(SyscallNumber::Dup2) => self.dup2(&abi),
            Err(e) => {
                log::warn!("{}: {e} ({:#x})", self.name(), abi.sysno);
                Current::exit(-1)
            }
        };
        abi.set_return_value(return_val);
    }

    fn translate(&self, va: Va, is_write: bool) -> Result<MappedRegion, KernelError> {
        let image = self.image.lock();
        let region = image.page_table.translate(va, is_write);
        image.unlock();
        region
    }

    fn exit(&self, exit_code: i32) {
        teletype::putbuf(format!("{}: exit({exit_code})\n", self.name()).as_bytes());
        self.with_file_struct(|file_struct| file_struct.close_all());
        let mut image = self.image.lock();
        image.page_table.clear();
        image.unlock();
        let mut children = self.children.lock();
        children.clear();
        children.unlock();
        CURRENT.with(|c| c.borrow_mut().take());

        self.exit_status.status.store(exit_code, Ordering::SeqCst);
        self.exit_status.exited.up();
    }
}

fn initial_frame(image: &Image) -> Registers {
    let mut frame = Registers::new();
    *frame.rip() = image.program.entry_point();
    *frame.rsp() = image.rsp;
    frame.gprs.rdi = image.argc;
    frame.gprs.rsi = image.argv;
    frame
}

/// Body of every process thread.
///
/// Calls the routine at `frame.rip` until it returns, restarting with the
/// new program's frame after each `exec`.
fn run(process: Arc<Process>, mut frame: Registers) {
    CURRENT.with(|c| *c.borrow_mut() = Some(process.clone()));
    loop {
        let rip = *frame.rip();
        let Some(entry) = process.program().routine_at(rip) else {
            log::warn!("{}: no routine at {rip:#x}", process.name());
            Current::exit(-1)
        };
        let (argc, argv) = (frame.gprs.rdi, frame.gprs.rsi);
        match catch_unwind(AssertUnwindSafe(|| entry(argc, argv))) {
            Ok(exit_code) => Current::exit(exit_code),
            Err(payload) => match payload.downcast::<Restart>() {
                Ok(restart) => frame = restart.0,
                Err(payload) => resume_unwind(payload),
            },
        }
    }
}

/// Waits for a process started with [`process_execute`].
pub struct ExitWaiter {
    /// Thread id of the process.
    pub tid: Tid,
    exit_status: Arc<ExitStatus>,
}

impl ExitWaiter {
    /// Blocks until the process exits and returns its exit status.
    pub fn wait(self) -> i32 {
        self.exit_status.wait()
    }
}

/// Starts the program named by the first word of `cmdline` in a new process.
///
/// # Errors
/// - [`KernelError::NoExec`] if no such program exists.
/// - [`KernelError::InvalidArgument`] if the command line is empty or too
///   long.
/// - [`KernelError::NoMemory`] if no thread can be created.
pub fn process_execute(
    programs: &Arc<ProgramTable>,
    cmdline: &str,
) -> Result<ExitWaiter, KernelError> {
    let image = Image::load(programs, cmdline)?;
    let frame = initial_frame(&image);
    let name = image.program.name().to_string();
    let process = Process::new(programs.clone(), image, FileStruct::new());
    let exit_status = process.exit_status.clone();
    let handle = ThreadBuilder::new(name)
        .attach_task(process.clone())
        .spawn(move || run(process, frame))?;
    log::info!("Started {cmdline:?} as thread {}.", handle.tid);
    Ok(ExitWaiter {
        tid: handle.tid,
        exit_status,
    })
}
