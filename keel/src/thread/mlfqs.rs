//! Multi-level feedback queue scheduling (4.4BSD).
//!
//! Priorities are not set by threads. Each thread's priority is recomputed
//! from its niceness and its recent CPU usage:
//!
//! ```text
//! priority   = PRI_MAX - recent_cpu / 4 - nice * 2
//! recent_cpu = (2 * load_avg) / (2 * load_avg + 1) * recent_cpu + nice
//! load_avg   = (59 / 60) * load_avg + (1 / 60) * ready_threads
//! ```
//!
//! `recent_cpu` of the running thread grows by one on every tick. `load_avg`
//! and every `recent_cpu` are decayed once per second ([`TIMER_FREQ`] ticks),
//! and every priority is recomputed every fourth tick.

use super::{
    NICE_MAX,
    NICE_MIN,
    PRI_MAX,
    PRI_MIN,
    Thread,
    Tid,
    fixed_point::FixedPoint,
    scheduler::{ReadyQueue, Scheduler, TIME_SLICE, TickContext},
};
use crate::timer::TIMER_FREQ;
use std::sync::{
    Arc,
    atomic::{AtomicI32, Ordering},
};

/// A multi-level feedback queue scheduler.
#[derive(Default)]
pub struct Mlfqs {
    run_queue: ReadyQueue,
    load_avg: AtomicI32,
}

impl Mlfqs {
    /// Create a new [`Mlfqs`] scheduler.
    pub fn new() -> Self {
        Self {
            run_queue: ReadyQueue::new(),
            load_avg: AtomicI32::new(0),
        }
    }

    fn update_priority(th: &Thread) {
        let priority = FixedPoint::from_int(PRI_MAX) - th.recent_cpu() / 4 - th.nice() * 2;
        th.store_priority(priority.trunc().clamp(PRI_MIN, PRI_MAX));
    }

    fn update_load_avg(&self, ready_threads: i32) -> FixedPoint {
        let load_avg = FixedPoint::from_int(59) / 60 * self.load_avg()
            + FixedPoint::from_int(1) / 60 * ready_threads;
        self.load_avg.store(load_avg.into_raw(), Ordering::SeqCst);
        load_avg
    }

    fn decay_recent_cpu(th: &Thread, load_avg: FixedPoint) {
        let twice = load_avg * 2;
        let coefficient = twice / (twice + 1);
        th.store_recent_cpu(coefficient * th.recent_cpu() + th.nice());
    }
}

impl Scheduler for Mlfqs {
    fn next_to_run(&self) -> Option<Arc<Thread>> {
        self.run_queue.pop_highest()
    }

    fn push_to_queue(&self, th: Arc<Thread>) {
        self.run_queue.push(th);
    }

    fn timer_tick(&self, cx: &TickContext<'_>) -> bool {
        if !cx.is_idle {
            cx.current.store_recent_cpu(cx.current.recent_cpu() + 1);
        }

        if cx.ticks % TIMER_FREQ == 0 {
            let ready_threads = self.run_queue.len() as i32 + if cx.is_idle { 0 } else { 1 };
            let load_avg = self.update_load_avg(ready_threads);
            for th in cx.threads {
                Self::decay_recent_cpu(th, load_avg);
            }
        }

        if cx.ticks % 4 == 0 {
            for th in cx.threads {
                Self::update_priority(th);
            }
        }

        !cx.is_idle && cx.slice >= TIME_SLICE
    }

    fn highest_priority(&self) -> Option<i32> {
        self.run_queue.highest_priority()
    }

    fn queued(&self) -> Vec<Tid> {
        self.run_queue.tids()
    }

    fn init_thread(&self, th: &Thread, parent: Option<&Thread>) {
        if let Some(parent) = parent {
            th.store_nice(parent.nice());
            th.store_recent_cpu(parent.recent_cpu());
        }
        Self::update_priority(th);
    }

    fn set_priority(&self, _th: &Thread, _priority: i32) {}

    fn set_nice(&self, th: &Thread, nice: i32) {
        th.store_nice(nice.clamp(NICE_MIN, NICE_MAX));
        Self::update_priority(th);
    }

    fn load_avg(&self) -> FixedPoint {
        FixedPoint::from_raw(self.load_avg.load(Ordering::SeqCst))
    }
}
