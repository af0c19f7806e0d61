//! Thread abstration, an abstraction of a cpu core.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with their
//! own stack and local state. At any instant exactly one thread is
//! [`ThreadState::Running`]; the others are either [`ThreadState::Ready`]
//! (waiting in the ready queue), [`ThreadState::Blocked`] (waiting in the
//! sleep set or on a synchronization primitive) or [`ThreadState::Dying`]
//! (switched away for the last time, waiting to be reaped).
//!
//! A thread is on at most one container at a time. Each control block carries
//! a [`Link`] tag naming the container holding it, and every container checks
//! the tag before inserting.
//!
//! When nothing is ready, the CPU runs the idle thread, which is never on the
//! ready queue.
pub mod fixed_point;
pub mod mlfqs;
pub mod round_robin;
pub mod scheduler;

use crate::{
    KernelError,
    boot::{self, Kernel},
    sync::{Semaphore, SpinLock},
    task::Task,
};
use abyss::interrupt::InterruptGuard;
use arrayvec::ArrayString;
use crossbeam_utils::sync::{Parker, Unparker};
use fixed_point::FixedPoint;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicI32, AtomicI64, Ordering},
    },
};

/// Thread identifier.
pub type Tid = u64;

/// Lowest priority.
pub const PRI_MIN: i32 = 0;
/// Default priority.
pub const PRI_DEFAULT: i32 = 31;
/// Highest priority.
pub const PRI_MAX: i32 = 63;

/// Lowest niceness.
pub const NICE_MIN: i32 = -20;
/// Highest niceness.
pub const NICE_MAX: i32 = 20;

/// Size of each thread's stack.
pub const STACK_SIZE: usize = 0x20_0000;
/// Thread magic to detect stack overflow.
pub const THREAD_MAGIC: usize = 0xdeadbeefcafebabe;

/// A possible state of the thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is running.
    Running,
    /// Thread is on the ready queue.
    Ready,
    /// Thread waits for an explicit unblock.
    Blocked,
    /// Thread exited with exitcode.
    Dying(i32),
}

/// The container a thread currently sits on.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Link {
    /// Not on any container.
    Detached,
    /// On the ready queue.
    ReadyQueue,
    /// On the sleep set.
    SleepSet,
    /// On the wait list of the synchronization primitive with this id.
    WaitList(u64),
}

/// An thread abstraction.
pub struct Thread {
    /// Thread id
    pub tid: Tid,
    /// Thread name
    pub name: ArrayString<16>,
    magic: usize,
    state: SpinLock<ThreadState>,
    priority: AtomicI32,
    nice: AtomicI32,
    recent_cpu: AtomicI32,
    wakeup_tick: AtomicI64,
    exit_status: AtomicI32,
    link: SpinLock<Link>,
    task: Option<Arc<dyn Task>>,
    unparker: Unparker,
    exited: Semaphore,
}

fn truncate_name(name: &str) -> ArrayString<16> {
    let mut result = ArrayString::new();
    for ch in name.chars() {
        if result.try_push(ch).is_err() {
            break;
        }
    }
    result
}

impl Thread {
    fn new(
        tid: Tid,
        name: &str,
        priority: i32,
        task: Option<Arc<dyn Task>>,
        unparker: Unparker,
    ) -> Self {
        Self {
            tid,
            name: truncate_name(name),
            magic: THREAD_MAGIC,
            state: SpinLock::new(ThreadState::Blocked),
            priority: AtomicI32::new(priority.clamp(PRI_MIN, PRI_MAX)),
            nice: AtomicI32::new(0),
            recent_cpu: AtomicI32::new(0),
            wakeup_tick: AtomicI64::new(0),
            exit_status: AtomicI32::new(0),
            link: SpinLock::new(Link::Detached),
            task,
            unparker,
            exited: Semaphore::new(0),
        }
    }

    /// Builds the control block of the thread that called `boot`.
    pub(crate) fn bootstrap(kernel: &Kernel, unparker: Unparker) -> Arc<Self> {
        kernel
            .allocate_page()
            .unwrap_or_else(|e| panic!("No page for the bootstrap thread: {e}"));
        let th = Arc::new(Self::new(
            kernel.allocate_tid(),
            "main",
            PRI_DEFAULT,
            None,
            unparker,
        ));
        kernel.scheduler.init_thread(&th, None);
        th.set_state(ThreadState::Running);
        th
    }

    /// Panics if the control block has been corrupted.
    pub fn check_magic(&self) {
        if self.magic != THREAD_MAGIC {
            panic!(
                "Stack overflow detected! Thread {} has a corrupted magic: {:x}",
                self.tid, self.magic
            );
        }
    }

    /// Returns the state of the thread.
    pub fn state(&self) -> ThreadState {
        let guard = self.state.lock();
        let state = *guard;
        guard.unlock();
        state
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        let mut guard = self.state.lock();
        *guard = state;
        guard.unlock();
    }

    /// Returns the effective priority.
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }

    /// Overwrites the priority without rescheduling.
    pub fn store_priority(&self, priority: i32) {
        self.priority
            .store(priority.clamp(PRI_MIN, PRI_MAX), Ordering::SeqCst);
    }

    /// Returns the niceness.
    pub fn nice(&self) -> i32 {
        self.nice.load(Ordering::SeqCst)
    }

    /// Overwrites the niceness without rescheduling.
    pub fn store_nice(&self, nice: i32) {
        self.nice
            .store(nice.clamp(NICE_MIN, NICE_MAX), Ordering::SeqCst);
    }

    /// Returns the recent cpu usage.
    pub fn recent_cpu(&self) -> FixedPoint {
        FixedPoint::from_raw(self.recent_cpu.load(Ordering::SeqCst))
    }

    /// Overwrites the recent cpu usage.
    pub fn store_recent_cpu(&self, recent_cpu: FixedPoint) {
        self.recent_cpu
            .store(recent_cpu.into_raw(), Ordering::SeqCst);
    }

    /// Tick at which a sleeping thread wakes up.
    pub fn wakeup_tick(&self) -> i64 {
        self.wakeup_tick.load(Ordering::SeqCst)
    }

    pub(crate) fn set_wakeup_tick(&self, tick: i64) {
        self.wakeup_tick.store(tick, Ordering::SeqCst);
    }

    /// Exit status, meaningful once the thread is dying.
    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::SeqCst)
    }

    /// Returns the container currently holding this thread.
    pub fn link(&self) -> Link {
        let guard = self.link.lock();
        let link = *guard;
        guard.unlock();
        link
    }

    /// Records that the thread was put on `link`.
    ///
    /// Panics if it already sits on another container.
    pub(crate) fn enter(&self, link: Link) {
        let mut guard = self.link.lock();
        let prev = *guard;
        *guard = link;
        guard.unlock();
        assert_eq!(
            prev,
            Link::Detached,
            "Thread {} is inserted into {:?} while on {:?}.",
            self.tid,
            link,
            prev
        );
    }

    /// Records that the thread was taken off `link`.
    pub(crate) fn leave(&self, link: Link) {
        let mut guard = self.link.lock();
        let prev = *guard;
        *guard = Link::Detached;
        guard.unlock();
        assert_eq!(
            prev, link,
            "Thread {} is removed from {:?} while on {:?}.",
            self.tid, link, prev
        );
    }

    /// Returns the user task attached to this thread, if any.
    pub fn task(&self) -> Option<&Arc<dyn Task>> {
        self.task.as_ref()
    }

    pub(crate) fn unparker(&self) -> &Unparker {
        &self.unparker
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name.as_str())
            .field("state", &self.state())
            .field("priority", &self.priority())
            .field("link", &self.link())
            .finish()
    }
}

/// A handle to join thread.
pub struct JoinHandle {
    /// Thread id of this handle.
    pub tid: Tid,
    th: Arc<Thread>,
}

impl JoinHandle {
    /// Join this handle and returns exit code.
    pub fn join(self) -> i32 {
        self.th.exited.down();
        self.th.exit_status()
    }

    /// The control block of the thread.
    pub fn thread(&self) -> &Arc<Thread> {
        &self.th
    }
}

/// A handle that represent the blocked thread.
///
/// The handle is created while the thread is put on a wait container and is
/// consumed by [`ParkHandle::unpark`] when it is taken off.
pub struct ParkHandle {
    th: Arc<Thread>,
    link: Link,
}

impl ParkHandle {
    /// Creates a handle for the current thread and tags it with `link`.
    pub(crate) fn new_for_current(link: Link) -> Self {
        let th = current();
        th.enter(link);
        Self { th, link }
    }

    /// The thread this handle refers to.
    pub fn thread(&self) -> &Arc<Thread> {
        &self.th
    }

    /// Consume the handle and unblock the underlying thread.
    pub fn unpark(self) {
        self.th.leave(self.link);
        unblock(&self.th);
    }
}

/// The opaque structure indicating the running thread on the current cpu.
pub struct Current {
    _p: (),
}

impl Current {
    /// Run a function `f` with [`ParkHandle`] for current thread, and then
    /// block the current thread.
    ///
    /// `f` must store the handle in the container named by `link`; whoever
    /// takes it out later calls [`ParkHandle::unpark`].
    pub fn park_with(link: Link, f: impl FnOnce(ParkHandle)) {
        f(ParkHandle::new_for_current(link));
        block();
    }

    /// Get the current thread's id.
    pub fn get_tid() -> Tid {
        with_current(|th| th.tid)
    }
}

/// Run a function `f` with current thread as an argument.
#[inline]
pub fn with_current<R>(f: impl FnOnce(&Arc<Thread>) -> R) -> R {
    let th = boot::local_thread()
        .unwrap_or_else(|| panic!("Not running on a kernel thread."));
    th.check_magic();
    f(&th)
}

/// Returns the running thread.
pub fn current() -> Arc<Thread> {
    with_current(|th| th.clone())
}

/// Returns the running thread's id.
pub fn tid() -> Tid {
    Current::get_tid()
}

/// Returns the running thread's name.
pub fn name() -> String {
    with_current(|th| th.name.to_string())
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    name: String,
    priority: i32,
    task: Option<Arc<dyn Task>>,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        Self {
            name: String::from(name),
            priority: PRI_DEFAULT,
            task: None,
        }
    }

    /// Sets the initial priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a task to the thread.
    pub fn attach_task(mut self, task: Arc<dyn Task>) -> Self {
        self.task = Some(task);
        self
    }

    /// Spawn the thread.
    ///
    /// The new thread is put on the ready queue, and the caller yields if it
    /// has a higher priority.
    ///
    /// # Errors
    /// [`KernelError::NoMemory`] when every thread page is in use.
    pub fn spawn<F: FnOnce() + Send + 'static>(
        self,
        thread_fn: F,
    ) -> Result<JoinHandle, KernelError> {
        let kernel = boot::kernel();
        let th = self.into_thread(&kernel, Box::new(thread_fn))?;
        let handle = JoinHandle {
            tid: th.tid,
            th: th.clone(),
        };
        log::debug!("Thread {} ({}) created.", th.tid, th.name);
        th.set_state(ThreadState::Ready);
        kernel.scheduler.push_to_queue(th);
        preempt_check();
        Ok(handle)
    }

    fn into_thread(
        self,
        kernel: &Arc<Kernel>,
        thread_fn: Box<dyn FnOnce() + Send>,
    ) -> Result<Arc<Thread>, KernelError> {
        kernel.allocate_page()?;
        let parker = Parker::new();
        let th = Arc::new(Thread::new(
            kernel.allocate_tid(),
            &self.name,
            self.priority,
            self.task,
            parker.unparker().clone(),
        ));
        let parent = boot::local_thread();
        kernel.scheduler.init_thread(&th, parent.as_deref());

        let host = {
            let kernel = kernel.clone();
            let th = th.clone();
            std::thread::Builder::new()
                .name(self.name)
                .stack_size(STACK_SIZE)
                .spawn(move || boot::thread_start(kernel, th, parker, thread_fn))
        };
        match host {
            Ok(host) => {
                kernel.register(&th, host);
                Ok(th)
            }
            Err(e) => {
                log::warn!("Failed to spawn a host thread: {e}");
                kernel.free_page();
                Err(KernelError::NoMemory)
            }
        }
    }
}

/// Creates a kernel thread named `name` with `priority` running `thread_fn`.
///
/// Returns the new thread's identifier.
pub fn create<F: FnOnce() + Send + 'static>(
    name: &str,
    priority: i32,
    thread_fn: F,
) -> Result<Tid, KernelError> {
    ThreadBuilder::new(name)
        .priority(priority)
        .spawn(thread_fn)
        .map(|handle| handle.tid)
}

/// Creates the idle thread. Called once by `boot`.
pub(crate) fn start() {
    let kernel = boot::kernel();
    let idle = ThreadBuilder::new("idle")
        .priority(PRI_MIN)
        .into_thread(&kernel, Box::new(idle))
        .unwrap_or_else(|e| panic!("Failed to create the idle thread: {e}"));
    kernel.set_idle(idle);
}

/// Body of the idle thread.
///
/// Runs whenever the ready queue is empty. While threads sleep it advances
/// time; when nothing can ever become ready, the machine is deadlocked.
fn idle() {
    let kernel = boot::kernel();
    loop {
        if kernel.scheduler.highest_priority().is_some() {
            block();
        } else if has_sleepers(&kernel) {
            crate::timer::interrupt();
        } else {
            panic!("All threads are blocked: the kernel is deadlocked.");
        }
    }
}

fn has_sleepers(kernel: &Kernel) -> bool {
    let sleepers = kernel.sleepers.lock();
    let result = !sleepers.is_empty();
    sleepers.unlock();
    result
}

/// Switches away from the running thread, leaving it in `next_state`.
fn do_schedule(next_state: ThreadState) {
    assert!(
        !InterruptGuard::is_guarded(),
        "Try to reschedule a thread while holding a lock."
    );
    let kernel = boot::kernel();
    if kernel.check_halted() {
        return;
    }
    let me = current();
    me.set_state(next_state);
    match next_state {
        ThreadState::Ready if !kernel.is_idle(&me) => kernel.scheduler.push_to_queue(me.clone()),
        ThreadState::Dying(_) => kernel.mark_dying(&me),
        _ => (),
    }
    let next = kernel
        .scheduler
        .next_to_run()
        .or_else(|| kernel.idle())
        .unwrap_or_else(|| panic!("No thread to run before the idle thread exists."));
    kernel.switch_to(&me, next);
}

/// Blocks the running thread until [`unblock`] is called on it.
///
/// The caller must have put itself on the container that will unblock it.
pub fn block() {
    do_schedule(ThreadState::Blocked);
}

/// Moves a blocked thread to the ready queue.
///
/// Does not preempt the running thread.
///
/// # Panics
/// If `th` is not [`ThreadState::Blocked`].
pub fn unblock(th: &Arc<Thread>) {
    let kernel = boot::kernel();
    let mut state = th.state.lock();
    let prev = *state;
    if prev == ThreadState::Blocked {
        *state = ThreadState::Ready;
    }
    state.unlock();
    assert_eq!(
        prev,
        ThreadState::Blocked,
        "Try to unblock thread {} which is not blocked.",
        th.tid
    );
    kernel.scheduler.push_to_queue(th.clone());
}

/// Yields the CPU. The running thread stays ready and may be picked again
/// immediately.
pub fn yield_now() {
    do_schedule(ThreadState::Ready);
}

/// Yields if a thread with a strictly higher priority is ready.
pub(crate) fn preempt_check() {
    if std::thread::panicking() || InterruptGuard::is_guarded() {
        return;
    }
    let Some(kernel) = boot::try_kernel() else {
        return;
    };
    if kernel.is_halted() {
        return;
    }
    let Some(me) = boot::local_thread() else {
        return;
    };
    if kernel.is_idle(&me) {
        return;
    }
    if kernel
        .scheduler
        .highest_priority()
        .is_some_and(|p| p > me.priority())
    {
        yield_now();
    }
}

/// Ends the life of `th`. Called on its own host thread after its body
/// returned or exited.
pub(crate) fn finish(kernel: &Arc<Kernel>, th: &Arc<Thread>, exit_code: i32) {
    if let Some(task) = th.task() {
        task.exit(exit_code);
    }
    th.exit_status.store(exit_code, Ordering::SeqCst);
    log::debug!("Thread {} ({}) exited with {}.", th.tid, th.name, exit_code);
    th.exited.up();
    if kernel.check_halted() {
        return;
    }
    do_schedule(ThreadState::Dying(exit_code));
}

/// Returns the current thread's priority.
pub fn get_priority() -> i32 {
    with_current(|th| th.priority())
}

/// Sets the current thread's priority and yields if it is no longer the
/// highest.
///
/// Ignored under the multi-level feedback queue scheduler.
pub fn set_priority(priority: i32) {
    let kernel = boot::kernel();
    with_current(|th| kernel.scheduler.set_priority(th, priority));
    preempt_check();
}

/// Returns the current thread's niceness.
pub fn get_nice() -> i32 {
    with_current(|th| th.nice())
}

/// Sets the current thread's niceness and yields if it is no longer the
/// highest priority.
pub fn set_nice(nice: i32) {
    let kernel = boot::kernel();
    with_current(|th| kernel.scheduler.set_nice(th, nice));
    preempt_check();
}

/// Returns 100 times the current thread's recent cpu, rounded.
pub fn get_recent_cpu() -> i32 {
    with_current(|th| th.recent_cpu().round_scaled(100))
}

/// Returns 100 times the system load average, rounded.
pub fn get_load_avg() -> i32 {
    boot::kernel().scheduler.load_avg().round_scaled(100)
}

/// Tick accounting since boot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Ticks spent in the idle thread.
    pub idle_ticks: i64,
    /// Ticks spent in kernel threads.
    pub kernel_ticks: i64,
    /// Ticks spent in threads running a user task.
    pub user_ticks: i64,
}

/// Returns the tick accounting since boot.
pub fn stats() -> ThreadStats {
    let kernel = boot::kernel();
    ThreadStats {
        idle_ticks: kernel.stats.idle.load(Ordering::SeqCst),
        kernel_ticks: kernel.stats.kernel.load(Ordering::SeqCst),
        user_ticks: kernel.stats.user.load(Ordering::SeqCst),
    }
}

/// Prints the tick accounting.
pub fn print_stats() {
    let stats = stats();
    crate::println!(
        "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
        stats.idle_ticks,
        stats.kernel_ticks,
        stats.user_ticks
    );
}

/// Identifiers of the threads on the ready queue, in queue order.
pub fn ready_threads() -> Vec<Tid> {
    boot::kernel().scheduler.queued()
}

/// Where every live thread sits at one instant.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    /// The running thread.
    pub running: Option<Tid>,
    /// Threads on the ready queue, in queue order.
    pub ready: Vec<Tid>,
    /// Threads on the sleep set, earliest wakeup first.
    pub sleeping: Vec<Tid>,
    /// The container tag of every live thread.
    pub links: BTreeMap<Tid, Link>,
}

impl Membership {
    /// Threads whose tag names the wait list `id`.
    pub fn waiting_on(&self, id: u64) -> Vec<Tid> {
        self.links
            .iter()
            .filter(|(_, link)| **link == Link::WaitList(id))
            .map(|(tid, _)| *tid)
            .collect()
    }
}

/// Takes a [`Membership`] snapshot.
pub fn membership() -> Membership {
    let kernel = boot::kernel();
    let links = {
        let threads = kernel.threads.lock();
        let links = threads
            .values()
            .map(|th| (th.tid, th.link()))
            .collect::<BTreeMap<_, _>>();
        threads.unlock();
        links
    };
    Membership {
        running: kernel.current().map(|th| th.tid),
        ready: kernel.scheduler.queued(),
        sleeping: crate::timer::sleeping_threads(),
        links,
    }
}

/// Number of live thread control blocks, idle and main included.
pub fn live_threads() -> usize {
    let kernel = boot::kernel();
    let threads = kernel.threads.lock();
    let count = threads.len();
    threads.unlock();
    count
}
