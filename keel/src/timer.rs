//! Timer interrupt and the alarm clock.
//!
//! The machine timer fires [`TIMER_FREQ`] times per second. Ticks are
//! delivered synchronously: a thread that wants to be interrupted calls
//! [`interrupt`] (or burns ticks with [`busy_wait`]), and the idle thread
//! advances time while threads sleep.
use crate::{
    boot,
    thread::{self, Current, Link, scheduler::TickContext},
};
use abyss::interrupt::InterruptState;
use std::sync::atomic::Ordering;

/// Number of timer interrupts per second.
pub const TIMER_FREQ: i64 = 100;

/// Ticks since boot.
pub fn ticks() -> i64 {
    boot::kernel().ticks.load(Ordering::SeqCst)
}

/// Ticks elapsed since `then`, a value once returned by [`ticks`].
pub fn elapsed(then: i64) -> i64 {
    ticks() - then
}

/// Sleeps for approximately `ticks` timer ticks.
///
/// The thread is blocked, not spinning: it is put on the sleep set and the
/// timer interrupt wakes it once the wakeup tick has passed. Returns at once
/// if `ticks` is not positive.
pub fn sleep(ticks: i64) {
    if ticks <= 0 {
        return;
    }
    let kernel = boot::kernel();
    let wakeup = kernel.ticks.load(Ordering::SeqCst) + ticks;
    thread::with_current(|th| th.set_wakeup_tick(wakeup));
    Current::park_with(Link::SleepSet, |handle| {
        let mut sleepers = kernel.sleepers.lock();
        let at = sleepers.partition_point(|h| h.thread().wakeup_tick() <= wakeup);
        sleepers.insert(at, handle);
        sleepers.unlock();
    });
}

/// Keeps the CPU busy for `ticks` timer interrupts.
///
/// The running thread may be preempted in between.
pub fn busy_wait(ticks: i64) {
    for _ in 0..ticks {
        interrupt();
    }
}

/// Delivers one timer interrupt to the running thread.
///
/// Accounts the tick, lets the scheduler update its state, wakes the sleepers
/// whose time has come, and yields if the running thread must give up the CPU.
/// Does nothing while interrupts are disabled.
pub fn interrupt() {
    if InterruptState::current() == InterruptState::Off {
        return;
    }
    let kernel = boot::kernel();
    let Some(current) = kernel.current() else {
        return;
    };
    let ticks = kernel.ticks.fetch_add(1, Ordering::SeqCst) + 1;
    let is_idle = kernel.is_idle(&current);
    let counter = if is_idle {
        &kernel.stats.idle
    } else if current.task().is_some() {
        &kernel.stats.user
    } else {
        &kernel.stats.kernel
    };
    counter.fetch_add(1, Ordering::SeqCst);
    let slice = kernel.thread_ticks.fetch_add(1, Ordering::SeqCst) + 1;

    let idle = kernel.idle();
    let threads = {
        let threads = kernel.threads.lock();
        let snapshot = threads
            .values()
            .filter(|th| idle.as_ref().is_none_or(|idle| idle.tid != th.tid))
            .cloned()
            .collect::<Vec<_>>();
        threads.unlock();
        snapshot
    };
    let expired = kernel.scheduler.timer_tick(&TickContext {
        ticks,
        current: &current,
        is_idle,
        slice,
        threads: &threads,
    });
    drop(threads);

    let woken = {
        let mut sleepers = kernel.sleepers.lock();
        let due = sleepers.partition_point(|h| h.thread().wakeup_tick() <= ticks);
        let woken = sleepers.drain(..due).collect::<Vec<_>>();
        sleepers.unlock();
        woken
    };
    for handle in woken {
        handle.unpark();
    }

    let preempt = match kernel.scheduler.highest_priority() {
        Some(_) if is_idle => true,
        Some(p) => expired || p > current.priority(),
        None => false,
    };
    if preempt {
        thread::yield_now();
    }
}

/// Identifiers of the sleeping threads, earliest wakeup first.
pub fn sleeping_threads() -> Vec<thread::Tid> {
    let kernel = boot::kernel();
    let sleepers = kernel.sleepers.lock();
    let tids = sleepers.iter().map(|h| h.thread().tid).collect();
    sleepers.unlock();
    tids
}
