//! Kernel bring-up, the CPU baton and power control.
//!
//! A [`Kernel`] is one simulated uniprocessor machine. Every kernel thread is
//! backed by a host thread, but only the thread recorded as `current` in the
//! [`Cpu`] may execute; all others are parked on their own
//! [`Parker`](crossbeam_utils::sync::Parker). A context switch writes the next
//! thread into the cpu slot, unparks it, and parks the outgoing thread.
//!
//! Each host thread keeps a [`Local`] record in thread-local storage that
//! names its kernel and its control block, which is how [`kernel`] and
//! [`crate::thread::with_current`] find them.
use crate::{
    KernelError,
    SchedulingPolicy,
    SystemConfiguration,
    fs::traits::FileSystem,
    sync::SpinLock,
    teletype::Console,
    thread::{
        self, Current, ParkHandle, Thread, ThreadState, Tid, mlfqs::Mlfqs, round_robin::RoundRobin,
        scheduler::Scheduler,
    },
};
use crossbeam_utils::sync::Parker;
use std::{
    any::Any,
    cell::RefCell,
    collections::BTreeMap,
    panic::{AssertUnwindSafe, catch_unwind, resume_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
};

/// Unwinding payload used to stop every thread once the machine powers off.
pub(crate) struct PowerOff;

/// Unwinding payload used by [`Current::exit`].
pub(crate) struct ExitCode(pub(crate) i32);

/// Tick accounting, reported by [`crate::thread::stats`].
#[derive(Default)]
pub(crate) struct TickCounters {
    pub(crate) idle: AtomicI64,
    pub(crate) kernel: AtomicI64,
    pub(crate) user: AtomicI64,
}

struct Cpu {
    current: Option<Arc<Thread>>,
    idle: Option<Arc<Thread>>,
}

/// State of one simulated machine.
pub(crate) struct Kernel {
    pub(crate) policy: SchedulingPolicy,
    pub(crate) scheduler: Box<dyn Scheduler>,
    cpu: SpinLock<Cpu>,
    /// Every thread that has not been reaped yet, idle included.
    pub(crate) threads: SpinLock<BTreeMap<Tid, Arc<Thread>>>,
    /// Threads blocked until a tick, ordered by wakeup tick.
    pub(crate) sleepers: SpinLock<Vec<ParkHandle>>,
    dying: SpinLock<Vec<Arc<Thread>>>,
    /// Host threads backing the live kernel threads.
    hosts: SpinLock<BTreeMap<Tid, std::thread::JoinHandle<()>>>,
    pub(crate) ticks: AtomicI64,
    /// Ticks consumed by the running thread since it was switched in.
    pub(crate) thread_ticks: AtomicU32,
    pub(crate) stats: TickCounters,
    next_tid: AtomicU64,
    pages: AtomicUsize,
    max_pages: usize,
    halted: AtomicBool,
    panic_message: SpinLock<Option<String>>,
    pub(crate) console: Console,
    pub(crate) filesystem: Option<Arc<dyn FileSystem>>,
    pub(crate) cmdline: String,
}

struct Local {
    kernel: Arc<Kernel>,
    thread: Arc<Thread>,
    parker: Parker,
}

thread_local! {
    static LOCAL: RefCell<Option<Local>> = const { RefCell::new(None) };
}

/// Returns the kernel the calling host thread belongs to.
pub(crate) fn kernel() -> Arc<Kernel> {
    try_kernel()
        .unwrap_or_else(|| panic!("Not running on a kernel thread."))
}

pub(crate) fn try_kernel() -> Option<Arc<Kernel>> {
    LOCAL.with(|l| l.borrow().as_ref().map(|l| l.kernel.clone()))
}

/// Returns the control block bound to the calling host thread.
pub(crate) fn local_thread() -> Option<Arc<Thread>> {
    LOCAL.with(|l| l.borrow().as_ref().map(|l| l.thread.clone()))
}

fn bind(kernel: Arc<Kernel>, thread: Arc<Thread>, parker: Parker) {
    LOCAL.with(|l| {
        *l.borrow_mut() = Some(Local {
            kernel,
            thread,
            parker,
        })
    });
}

fn unbind() {
    LOCAL.with(|l| l.borrow_mut().take());
}

fn park() {
    LOCAL.with(|l| {
        if let Some(local) = l.borrow().as_ref() {
            local.parker.park();
        }
    });
}

impl Kernel {
    fn new(config: &SystemConfiguration) -> Self {
        let scheduler: Box<dyn Scheduler> = match config.policy {
            SchedulingPolicy::RoundRobin => Box::new(RoundRobin::new()),
            SchedulingPolicy::Mlfqs => Box::new(Mlfqs::new()),
        };
        Self {
            policy: config.policy,
            scheduler,
            cpu: SpinLock::new(Cpu {
                current: None,
                idle: None,
            }),
            threads: SpinLock::new(BTreeMap::new()),
            sleepers: SpinLock::new(Vec::new()),
            dying: SpinLock::new(Vec::new()),
            hosts: SpinLock::new(BTreeMap::new()),
            ticks: AtomicI64::new(0),
            thread_ticks: AtomicU32::new(0),
            stats: TickCounters::default(),
            next_tid: AtomicU64::new(1),
            pages: AtomicUsize::new(0),
            max_pages: config.max_threads,
            halted: AtomicBool::new(false),
            panic_message: SpinLock::new(None),
            console: Console::new(&config.stdin),
            filesystem: config.filesystem.clone(),
            cmdline: config.cmdline.clone(),
        }
    }

    pub(crate) fn allocate_tid(&self) -> Tid {
        self.next_tid.fetch_add(1, Ordering::SeqCst)
    }

    /// Reserves the page holding a new control block and its stack.
    pub(crate) fn allocate_page(&self) -> Result<(), KernelError> {
        self.pages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.max_pages).then_some(used + 1)
            })
            .map(|_| ())
            .map_err(|_| KernelError::NoMemory)
    }

    pub(crate) fn free_page(&self) {
        self.pages.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn register(&self, th: &Arc<Thread>, host: std::thread::JoinHandle<()>) {
        let mut threads = self.threads.lock();
        threads.insert(th.tid, th.clone());
        threads.unlock();
        let mut hosts = self.hosts.lock();
        hosts.insert(th.tid, host);
        hosts.unlock();
    }

    pub(crate) fn current(&self) -> Option<Arc<Thread>> {
        let cpu = self.cpu.lock();
        let current = cpu.current.clone();
        cpu.unlock();
        current
    }

    pub(crate) fn idle(&self) -> Option<Arc<Thread>> {
        let cpu = self.cpu.lock();
        let idle = cpu.idle.clone();
        cpu.unlock();
        idle
    }

    pub(crate) fn is_idle(&self, th: &Thread) -> bool {
        let cpu = self.cpu.lock();
        let result = cpu.idle.as_ref().is_some_and(|idle| idle.tid == th.tid);
        cpu.unlock();
        result
    }

    pub(crate) fn set_idle(&self, th: Arc<Thread>) {
        let mut cpu = self.cpu.lock();
        cpu.idle = Some(th);
        cpu.unlock();
    }

    fn is_current(&self, th: &Thread) -> bool {
        let cpu = self.cpu.lock();
        let result = cpu.current.as_ref().is_some_and(|cur| cur.tid == th.tid);
        cpu.unlock();
        result
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Unwinds the calling thread if the machine has been powered off.
    ///
    /// Returns true when halted but already unwinding, in which case the
    /// caller must return instead of touching the scheduler.
    pub(crate) fn check_halted(&self) -> bool {
        if self.is_halted() {
            if !std::thread::panicking() {
                resume_unwind(Box::new(PowerOff));
            }
            return true;
        }
        false
    }

    /// Hands the CPU from `prev` to `next`.
    ///
    /// Returns once `prev` owns the CPU again, or immediately if `prev` is
    /// dying.
    pub(crate) fn switch_to(&self, prev: &Arc<Thread>, next: Arc<Thread>) {
        if Arc::ptr_eq(prev, &next) {
            prev.set_state(ThreadState::Running);
            self.thread_ticks.store(0, Ordering::SeqCst);
            return;
        }
        next.set_state(ThreadState::Running);
        let unparker = next.unparker().clone();
        let mut cpu = self.cpu.lock();
        cpu.current = Some(next);
        cpu.unlock();
        self.thread_ticks.store(0, Ordering::SeqCst);
        unparker.unpark();

        if matches!(prev.state(), ThreadState::Dying(_)) {
            return;
        }
        self.wait_for_cpu(prev);
        self.reap();
    }

    /// Parks the calling host thread until `th` is dispatched.
    pub(crate) fn wait_for_cpu(&self, th: &Thread) {
        loop {
            if self.check_halted() {
                return;
            }
            if self.is_current(th) {
                return;
            }
            park();
        }
    }

    pub(crate) fn mark_dying(&self, th: &Arc<Thread>) {
        let mut dying = self.dying.lock();
        dying.push(th.clone());
        dying.unlock();
    }

    /// Releases the pages and host threads of threads that died before the
    /// running one was switched in.
    pub(crate) fn reap(&self) {
        let mut dying = self.dying.lock();
        let reaped = std::mem::take(&mut *dying);
        dying.unlock();
        for th in reaped {
            let mut threads = self.threads.lock();
            threads.remove(&th.tid);
            threads.unlock();
            let mut hosts = self.hosts.lock();
            let host = hosts.remove(&th.tid);
            hosts.unlock();
            // A dying host only unbinds itself after its last switch.
            if let Some(host) = host
                && host.thread().id() != std::thread::current().id()
            {
                let _ = host.join();
            }
            self.free_page();
            log::trace!("Reaped thread {} ({}).", th.tid, th.name);
        }
    }

    #[cfg(test)]
    pub(crate) fn host_threads(&self) -> usize {
        let hosts = self.hosts.lock();
        let count = hosts.len();
        hosts.unlock();
        count
    }

    /// Stops the machine: every parked thread wakes up and unwinds.
    pub(crate) fn halt(&self) {
        if self.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        let threads = self.threads.lock();
        let unparkers = threads
            .values()
            .map(|th| th.unparker().clone())
            .collect::<Vec<_>>();
        threads.unlock();
        for unparker in unparkers {
            unparker.unpark();
        }
    }

    pub(crate) fn kernel_panic(&self, message: String) {
        let mut slot = self.panic_message.lock();
        if slot.is_none() {
            *slot = Some(message);
        }
        slot.unlock();
        self.halt();
    }

    fn join_hosts(&self) {
        loop {
            let mut hosts = self.hosts.lock();
            let host = hosts.pop_first();
            hosts.unlock();
            match host {
                Some((_, host)) => {
                    let _ = host.join();
                }
                None => break,
            }
        }
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// How a kernel thread body ended.
pub(crate) enum Outcome {
    /// Returned or called [`Current::exit`].
    Exited(i32),
    /// The machine was powered off underneath it.
    PoweredOff,
    /// A genuine panic.
    Panicked(Box<dyn Any + Send>),
}

pub(crate) fn classify(result: Result<(), Box<dyn Any + Send>>) -> Outcome {
    match result {
        Ok(()) => Outcome::Exited(0),
        Err(payload) => match payload.downcast::<ExitCode>() {
            Ok(code) => Outcome::Exited(code.0),
            Err(payload) if payload.is::<PowerOff>() => Outcome::PoweredOff,
            Err(payload) => Outcome::Panicked(payload),
        },
    }
}

/// Entry of every host thread backing a kernel thread.
pub(crate) fn thread_start(
    kernel: Arc<Kernel>,
    th: Arc<Thread>,
    parker: Parker,
    thread_fn: Box<dyn FnOnce() + Send>,
) {
    bind(kernel.clone(), th.clone(), parker);
    let dispatched = catch_unwind(AssertUnwindSafe(|| kernel.wait_for_cpu(&th)));
    if dispatched.is_ok() && !kernel.is_halted() {
        kernel.reap();
        let outcome = classify(catch_unwind(AssertUnwindSafe(thread_fn)));
        match outcome {
            Outcome::Exited(code) => {
                let finished = classify(catch_unwind(AssertUnwindSafe(|| {
                    thread::finish(&kernel, &th, code)
                })));
                if let Outcome::Panicked(payload) = finished {
                    kernel.kernel_panic(panic_message(payload.as_ref()));
                }
            }
            Outcome::PoweredOff => (),
            Outcome::Panicked(payload) => {
                kernel.kernel_panic(format!(
                    "thread {} ({}) panicked: {}",
                    th.tid,
                    th.name,
                    panic_message(payload.as_ref())
                ));
            }
        }
    }
    unbind();
}

/// Report returned by [`boot`] once the machine powers off.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// Everything written to the console.
    pub output: String,
    /// Timer ticks since boot.
    pub ticks: i64,
    /// Tick accounting at power-off.
    pub stats: thread::ThreadStats,
}

/// Boots a machine described by `config` on the calling host thread.
///
/// The calling thread becomes the initial kernel thread, named `main`, and
/// runs `main`. When `main` returns (or the machine is halted) every kernel
/// thread is stopped and a [`Shutdown`] report is returned. A panic in any
/// kernel thread is a kernel panic: it is re-raised here after the machine
/// powered off.
pub(crate) fn boot(config: SystemConfiguration, main: impl FnOnce()) -> Shutdown {
    abyss::kprint::init_logger(config.log_level);
    if config.quiet {
        abyss::QUITE.store(true, Ordering::SeqCst);
    }
    let kernel = Arc::new(Kernel::new(&config));
    log::info!(
        "Boot: scheduler={:?}, cmdline={:?}",
        kernel.policy,
        kernel.cmdline
    );

    // init(): the running host thread becomes the bootstrap thread.
    let parker = Parker::new();
    let initial = thread::Thread::bootstrap(&kernel, parker.unparker().clone());
    {
        let mut cpu = kernel.cpu.lock();
        cpu.current = Some(initial.clone());
        cpu.unlock();
        let mut threads = kernel.threads.lock();
        threads.insert(initial.tid, initial.clone());
        threads.unlock();
    }
    bind(kernel.clone(), initial, parker);

    let outcome = classify(catch_unwind(AssertUnwindSafe(|| {
        thread::start();
        main();
    })));

    let stats = thread::stats();
    kernel.halt();
    kernel.join_hosts();
    unbind();

    log::info!(
        "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
        stats.idle_ticks,
        stats.kernel_ticks,
        stats.user_ticks
    );

    if let Outcome::Panicked(payload) = outcome {
        resume_unwind(payload);
    }
    let panicked = {
        let mut slot = kernel.panic_message.lock();
        let message = slot.take();
        slot.unlock();
        message
    };
    if let Some(message) = panicked {
        panic!("Kernel panic: {message}");
    }

    Shutdown {
        output: kernel.console.output(),
        ticks: kernel.ticks.load(Ordering::SeqCst),
        stats,
    }
}

/// Powers off the machine. Never returns.
pub fn power_off() -> ! {
    log::info!("Powering off...");
    kernel().halt();
    resume_unwind(Box::new(PowerOff))
}

impl Current {
    /// Exit the current thread with `exit_code`.
    ///
    /// The thread body is unwound up to its entry point, the task's exit hook
    /// runs, joiners are released, and the thread is switched away for good.
    pub fn exit(exit_code: i32) -> ! {
        assert!(
            !abyss::interrupt::InterruptGuard::is_guarded(),
            "Try to exit a thread while holding a lock."
        );
        resume_unwind(Box::new(ExitCode(exit_code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        SystemConfigurationBuilder,
        thread::{PRI_MIN, ThreadBuilder, scheduler::TIME_SLICE},
        timer,
    };

    fn machine() -> SystemConfigurationBuilder {
        SystemConfigurationBuilder::new().quiet(true)
    }

    #[test]
    fn exited_threads_release_their_host() {
        machine().max_threads(3).boot(|| {
            for i in 0..32 {
                let handle = ThreadBuilder::new(format!("worker{i}"))
                    .spawn(move || Current::exit(i))
                    .unwrap();
                assert_eq!(handle.join(), i);
            }
            assert_eq!(
                kernel().host_threads(),
                1,
                "Only the idle thread may still own a host thread."
            );
        });
    }

    #[test]
    fn slice_restarts_when_the_same_thread_is_picked_again() {
        machine().boot(|| {
            let _low = ThreadBuilder::new("low")
                .priority(PRI_MIN)
                .spawn(|| ())
                .unwrap();
            timer::busy_wait(TIME_SLICE as i64);
            assert_eq!(kernel().thread_ticks.load(Ordering::SeqCst), 0);
            timer::interrupt();
            assert_eq!(kernel().thread_ticks.load(Ordering::SeqCst), 1);
        });
    }
}
