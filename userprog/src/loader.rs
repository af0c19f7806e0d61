//! # Program loader.
//!
//! User programs are plain Rust functions registered in a [`ProgramTable`].
//! A [`Program`] has a `main` routine and any number of additional named
//! routines; each routine is given an address in the program's text segment
//! so that user code can name a resume point (for example the routine a
//! forked child continues in) by address, exactly as it would with a
//! function pointer.
//!
//! Loading a command line builds a fresh [`Image`]:
//!
//! ```text
//!  USER_STACK  0x4748_0000 +-------------------------+
//!                          | argument strings        |
//!                          | padding to 8 bytes      |
//!                          | argv[argc] = NULL       |
//!                          | argv[argc - 1] .. [0]   | <- rsi (argv)
//!                          | fake return address     | <- rsp
//!                          +-------------------------+
//!                                     ...
//!                          +-------------------------+
//!                          | heap (grows up)         |
//!  DATA_BASE   0x60_0000   +-------------------------+
//!                          | text (read-only)        |
//!  TEXT_BASE   0x40_0000   +-------------------------+
//! ```
//!
//! `rdi` holds `argc` when `main` starts.

use keel::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    mm::page_table::{PageTable, PteFlags},
};
use std::{collections::BTreeMap, sync::Arc};

/// Entry of a user routine: `(argc, argv) -> exit status`.
pub type Entry = fn(usize, usize) -> i32;

/// Base of the text segment.
pub const TEXT_BASE: usize = 0x40_0000;
/// Base of the heap.
pub const DATA_BASE: usize = 0x60_0000;
/// Upper bound of the heap.
pub const DATA_LIMIT: usize = DATA_BASE + 0x10_0000;
/// Top of the user stack.
pub const USER_STACK: usize = 0x4748_0000;
/// Distance between two routine addresses.
pub const ROUTINE_ALIGN: usize = 0x10;

/// A user program.
pub struct Program {
    name: String,
    routines: Vec<(String, Entry)>,
}

impl Program {
    /// A program named `name` whose entry point is `main`.
    pub fn new(name: &str, main: Entry) -> Self {
        Self {
            name: name.to_string(),
            routines: vec![("main".to_string(), main)],
        }
    }

    /// Adds the routine `name`.
    ///
    /// # Panics
    /// If the text segment is full.
    pub fn routine(mut self, name: &str, entry: Entry) -> Self {
        assert!(
            (self.routines.len() + 1) * ROUTINE_ALIGN <= PAGE_SIZE,
            "Too many routines in {}.",
            self.name
        );
        self.routines.push((name.to_string(), entry));
        self
    }

    /// Name of the program.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the routine `name`.
    pub fn symbol(&self, name: &str) -> Option<usize> {
        self.routines
            .iter()
            .position(|(n, _)| n == name)
            .map(|idx| TEXT_BASE + idx * ROUTINE_ALIGN)
    }

    /// Address of `main`.
    pub fn entry_point(&self) -> usize {
        TEXT_BASE
    }

    /// The routine starting at `rip`.
    pub fn routine_at(&self, rip: usize) -> Option<Entry> {
        let offset = rip.checked_sub(TEXT_BASE)?;
        if offset % ROUTINE_ALIGN != 0 {
            return None;
        }
        self.routines
            .get(offset / ROUTINE_ALIGN)
            .map(|(_, entry)| *entry)
    }

    fn text_size(&self) -> usize {
        self.routines.len() * ROUTINE_ALIGN
    }
}

/// Programs that can be executed, by name.
#[derive(Default)]
pub struct ProgramTable {
    programs: BTreeMap<String, Arc<Program>>,
}

impl ProgramTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `program`, replacing one with the same name.
    pub fn with(mut self, program: Program) -> Self {
        self.programs
            .insert(program.name.clone(), Arc::new(program));
        self
    }

    /// Looks up `name`.
    pub fn get(&self, name: &str) -> Option<Arc<Program>> {
        self.programs.get(name).cloned()
    }
}

/// A utility for constructing the initial user stack.
///
/// The stack is a single page right below [`USER_STACK`] and grows downward.
pub struct StackBuilder<'a> {
    sp: Va,
    page_table: &'a mut PageTable,
}

impl<'a> StackBuilder<'a> {
    /// Maps the stack page into `page_table`.
    pub fn new(page_table: &'a mut PageTable) -> Result<Self, KernelError> {
        let top = Va::new(USER_STACK).ok_or(KernelError::InvalidArgument)?;
        page_table.map_zeroed(top - PAGE_SIZE, PAGE_SIZE, PteFlags::RW)?;
        Ok(Self { sp: top, page_table })
    }

    /// Consumes the builder and returns the stack pointer.
    pub fn finish(self) -> Va {
        self.sp
    }

    /// The current stack pointer.
    #[inline]
    pub fn sp(&self) -> Va {
        self.sp
    }

    /// Aligns the stack pointer down to `align`.
    #[inline]
    pub fn align(&mut self, align: usize) {
        let misalign = self.sp.into_usize() % align;
        self.sp = self.sp - misalign;
    }

    /// Pushes `bytes` and returns the new stack pointer.
    ///
    /// Fails with [`KernelError::InvalidArgument`] when the stack page
    /// overflows.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Va, KernelError> {
        let room = self.sp.into_usize() - (USER_STACK - PAGE_SIZE);
        if bytes.len() > room {
            return Err(KernelError::InvalidArgument);
        }
        self.sp = self.sp - bytes.len();
        self.page_table.write(self.sp, bytes)?;
        Ok(self.sp)
    }

    /// Pushes a `usize` value and returns the new stack pointer.
    pub fn push_usize(&mut self, v: usize) -> Result<Va, KernelError> {
        self.push_bytes(&v.to_ne_bytes())
    }

    /// Pushes a null-terminated copy of `s` and returns its address.
    pub fn push_str(&mut self, s: &str) -> Result<Va, KernelError> {
        self.push_bytes(&[0])?;
        self.push_bytes(s.as_bytes())
    }
}

/// The memory image of a running program.
pub struct Image {
    /// Program the image was loaded from.
    pub program: Arc<Program>,
    /// Address space.
    pub page_table: PageTable,
    /// Number of arguments, including the program name.
    pub argc: usize,
    /// User address of the argument vector.
    pub argv: usize,
    /// Initial stack pointer.
    pub rsp: usize,
    brk: usize,
}

impl Image {
    /// Loads `cmdline` from `programs`.
    ///
    /// The first word of `cmdline` names the program; the remaining words are
    /// its arguments.
    ///
    /// # Errors
    /// - [`KernelError::InvalidArgument`] for an empty command line or
    ///   arguments that do not fit on the stack.
    /// - [`KernelError::NoExec`] if no such program exists.
    pub fn load(programs: &ProgramTable, cmdline: &str) -> Result<Self, KernelError> {
        let args = cmdline.split_whitespace().collect::<Vec<_>>();
        let name = args.first().ok_or(KernelError::InvalidArgument)?;
        let program = programs.get(name).ok_or(KernelError::NoExec)?;

        let mut page_table = PageTable::new();
        page_table.map_zeroed(
            Va::new(TEXT_BASE).ok_or(KernelError::InvalidArgument)?,
            program.text_size(),
            PteFlags::empty(),
        )?;

        let mut stack = StackBuilder::new(&mut page_table)?;
        let mut addrs = Vec::with_capacity(args.len());
        for arg in args.iter().rev() {
            addrs.push(stack.push_str(arg)?.into_usize());
        }
        stack.align(8);
        stack.push_usize(0)?;
        for addr in addrs {
            stack.push_usize(addr)?;
        }
        let argv = stack.sp().into_usize();
        stack.push_usize(0)?;
        let rsp = stack.finish().into_usize();

        log::debug!("Loaded {cmdline:?}: argc={}, rsp={rsp:#x}", args.len());
        Ok(Self {
            program,
            page_table,
            argc: args.len(),
            argv,
            rsp,
            brk: DATA_BASE,
        })
    }

    /// A copy of this image with its own pages.
    pub fn duplicate(&self) -> Self {
        Self {
            program: self.program.clone(),
            page_table: self.page_table.duplicate(),
            argc: self.argc,
            argv: self.argv,
            rsp: self.rsp,
            brk: self.brk,
        }
    }

    /// Reserves `len` bytes of zeroed, 8-byte aligned heap memory.
    pub fn alloc(&mut self, len: usize) -> Result<usize, KernelError> {
        let addr = self.brk.next_multiple_of(8);
        let end = addr.checked_add(len.max(1)).ok_or(KernelError::NoMemory)?;
        if end > DATA_LIMIT {
            return Err(KernelError::NoMemory);
        }
        let va = Va::new(addr).ok_or(KernelError::NoMemory)?;
        self.page_table.map_zeroed(va, end - addr, PteFlags::RW)?;
        self.brk = end;
        Ok(addr)
    }
}
