//! Interrupt flag and trap frame.
//!
//! Each CPU context (a host thread backing a kernel thread) carries its own
//! interrupt flag. The timer only fires on a context whose flag is set, so an
//! [`InterruptGuard`] is the kernel's way of saying "do not preempt me here".
use core::{cell::Cell, marker::PhantomData};

bitflags::bitflags! {
    /// The RFLAGS register.
    pub struct Rflags: u64 {
        /// Carry flag.
        const CF = 1 << 0;
        /// Always set.
        const _1 = 1 << 1;
        /// Zero flag.
        const ZF = 1 << 6;
        /// Sign flag.
        const SF = 1 << 7;
        /// Trap flag.
        const TF = 1 << 8;
        /// Interrupt enable flag.
        const IF = 1 << 9;
        /// Direction flag.
        const DF = 1 << 10;
        /// Overflow flag.
        const OF = 1 << 11;
    }
}

struct InterruptGuardInner {
    enabled: Cell<bool>,
    initial_state: Cell<bool>,
    cnt: Cell<isize>,
}

impl InterruptGuardInner {
    const fn new() -> Self {
        Self {
            enabled: Cell::new(true),
            initial_state: Cell::new(true),
            cnt: Cell::new(0),
        }
    }

    fn save_nested_interrupt_state(&self, state: InterruptState) {
        let prev = self.cnt.get();
        self.cnt.set(prev + 1);
        if prev == 0 {
            self.initial_state.set(state == InterruptState::On);
        }
    }

    fn load_nested_interrupt_state(&self) {
        let prev = self.cnt.get();
        assert!(prev > 0, "Mismatched InterruptGuard drop calls: {prev}");
        self.cnt.set(prev - 1);

        if prev == 1 && self.initial_state.get() {
            self.enabled.set(true);
        }
    }
}

thread_local! {
    static PER_CONTEXT_STATE: InterruptGuardInner = const { InterruptGuardInner::new() };
}

/// Enumeration representing the interrupt state.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

impl InterruptState {
    /// Reads the current interrupt state.
    pub fn current() -> Self {
        if PER_CONTEXT_STATE.with(|s| s.enabled.get()) {
            Self::On
        } else {
            Self::Off
        }
    }

    /// Enables interrupts on the current context.
    ///
    /// # Safety
    /// Must not be called while an [`InterruptGuard`] is alive.
    pub unsafe fn enable() {
        PER_CONTEXT_STATE.with(|s| s.enabled.set(true));
    }

    /// Disables interrupts on the current context.
    ///
    /// # Safety
    /// The caller is responsible for re-enabling them.
    pub unsafe fn disable() {
        PER_CONTEXT_STATE.with(|s| s.enabled.set(false));
    }
}

/// An RAII-based guard for managing interrupt disabling.
///
/// When an `InterruptGuard` is created, interrupts are disabled. When it is
/// dropped, the interrupt state is restored to what it was before the guard was
/// created.
///
/// [`InterruptGuard`] instances **must be dropped in reverse order of their
/// creation** to prevent unintended interrupt state changes.
pub struct InterruptGuard {
    _not_send: PhantomData<*const ()>,
}

impl InterruptGuard {
    /// Creates a new `InterruptGuard`, disabling interrupts.
    ///
    /// # Example
    /// ```rust
    /// use abyss::interrupt::{InterruptGuard, InterruptState};
    ///
    /// let guard = InterruptGuard::new();
    /// assert_eq!(InterruptState::current(), InterruptState::Off);
    /// drop(guard);
    /// assert_eq!(InterruptState::current(), InterruptState::On);
    /// ```
    pub fn new() -> Self {
        let state = InterruptState::current();
        unsafe { InterruptState::disable() };
        PER_CONTEXT_STATE.with(|s| s.save_nested_interrupt_state(state));
        Self {
            _not_send: PhantomData,
        }
    }

    /// Returns true if at least one guard is alive on this context.
    pub fn is_guarded() -> bool {
        PER_CONTEXT_STATE.with(|s| s.cnt.get() > 0)
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        PER_CONTEXT_STATE.with(|s| s.load_nested_interrupt_state());
    }
}

/// X86_64's general purpose registers.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneralPurposeRegisters {
    /// R15 register.
    pub r15: usize,
    /// R14 register.
    pub r14: usize,
    /// R13 register.
    pub r13: usize,
    /// R12 register.
    pub r12: usize,
    /// R11 register.
    pub r11: usize,
    /// R10 register.
    pub r10: usize,
    /// R9 register.
    pub r9: usize,
    /// R8 register.
    pub r8: usize,
    /// RSI register.
    pub rsi: usize,
    /// RDI register.
    pub rdi: usize,
    /// RBP register.
    pub rbp: usize,
    /// RDX register.
    pub rdx: usize,
    /// RCX register.
    pub rcx: usize,
    /// RBX register.
    pub rbx: usize,
    /// RAX register.
    pub rax: usize,
}

/// Trap frame saved on a user-to-kernel transition.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    /// General purpose registers.
    pub gprs: GeneralPurposeRegisters,
    rip: usize,
    rsp: usize,
    rflags: Rflags,
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl Registers {
    /// Creates a new register frame for a user thread.
    ///
    /// The instruction and stack pointers are zero and must be set before the
    /// frame is launched.
    #[inline]
    pub fn new() -> Self {
        Self {
            gprs: GeneralPurposeRegisters::default(),
            rip: 0,
            rsp: 0,
            rflags: Rflags::IF | Rflags::_1,
        }
    }

    /// Returns a mutable reference to the instruction pointer (`RIP`).
    pub fn rip(&mut self) -> &mut usize {
        &mut self.rip
    }

    /// Returns a mutable reference to the stack pointer (`RSP`).
    pub fn rsp(&mut self) -> &mut usize {
        &mut self.rsp
    }

    /// Returns the saved flags.
    pub fn rflags(&self) -> Rflags {
        self.rflags
    }
}

impl core::fmt::Debug for Registers {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> Result<(), core::fmt::Error> {
        write!(
            f,
            "RAX: {:016x} | RBX: {:016x}  | RCX: {:016x} | RDX: {:016x}\n\
             RSI: {:016x} | RDI: {:016x}  | RBP: {:016x} | RSP: {:016x}\n\
             R8 : {:016x} | R9 : {:016x}  | R10: {:016x} | R11: {:016x}\n\
             R12: {:016x} | R13: {:016x}  | R14: {:016x} | R15: {:016x}\n\
             RIP: {:016x} | RFLAGS: {:016x} [{:?}]",
            self.gprs.rax,
            self.gprs.rbx,
            self.gprs.rcx,
            self.gprs.rdx,
            self.gprs.rsi,
            self.gprs.rdi,
            self.gprs.rbp,
            self.rsp,
            self.gprs.r8,
            self.gprs.r9,
            self.gprs.r10,
            self.gprs.r11,
            self.gprs.r12,
            self.gprs.r13,
            self.gprs.r14,
            self.gprs.r15,
            self.rip,
            self.rflags.bits(),
            self.rflags
        )
    }
}
