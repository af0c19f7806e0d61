use keel::{
    KernelError,
    SystemConfigurationBuilder,
    sync::{Semaphore, SpinLock},
    thread::{self, Current, Link, ThreadBuilder, ThreadState, scheduler::TIME_SLICE},
    timer,
};
use std::sync::Arc;

type Log = Arc<SpinLock<Vec<&'static str>>>;

fn machine() -> SystemConfigurationBuilder {
    SystemConfigurationBuilder::new().quiet(true)
}

fn record(log: &Log, what: &'static str) {
    let mut guard = log.lock();
    guard.push(what);
    guard.unlock();
}

fn snapshot(log: &Log) -> Vec<&'static str> {
    let guard = log.lock();
    let result = guard.clone();
    guard.unlock();
    result
}

#[test]
fn join_returns_exit_code() {
    machine().boot(|| {
        let normal = ThreadBuilder::new("normal").spawn(|| ()).unwrap();
        assert_eq!(normal.join(), 0, "A returning thread must exit with 0.");

        let exiting = ThreadBuilder::new("exiting")
            .spawn(|| {
                Current::exit(7);
            })
            .unwrap();
        assert_eq!(
            exiting.join(),
            7,
            "Exit code must be published to the joiner."
        );
    });
}

#[test]
fn thread_identity() {
    machine().boot(|| {
        assert_eq!(thread::name(), "main");
        assert_eq!(
            thread::tid(),
            1,
            "The bootstrap thread is the first thread."
        );
        assert_eq!(thread::current().state(), ThreadState::Running);

        let handle = ThreadBuilder::new("child")
            .spawn(|| {
                assert_eq!(thread::name(), "child");
                assert_eq!(Current::get_tid(), 3, "The idle thread takes tid 2.");
            })
            .unwrap();
        assert_eq!(handle.tid, 3);
        assert_eq!(handle.thread().state(), ThreadState::Ready);
        assert_eq!(handle.join(), 0);
    });
}

#[test]
fn higher_priority_preempts_on_creation() {
    let log: Log = Arc::default();
    machine().boot(|| {
        let l = log.clone();
        let handle = ThreadBuilder::new("high")
            .priority(thread::PRI_DEFAULT + 1)
            .spawn(move || record(&l, "high"))
            .unwrap();
        record(&log, "main");
        handle.join();

        let l = log.clone();
        let handle = ThreadBuilder::new("low")
            .priority(thread::PRI_DEFAULT - 1)
            .spawn(move || record(&l, "low"))
            .unwrap();
        record(&log, "main");
        handle.join();
    });
    assert_eq!(snapshot(&log), ["high", "main", "main", "low"]);
}

#[test]
fn equal_priority_threads_alternate_on_yield() {
    let log: Log = Arc::default();
    machine().boot(|| {
        let mut handles = Vec::new();
        for name in ["a", "b"] {
            let l = log.clone();
            handles.push(
                ThreadBuilder::new(name)
                    .spawn(move || {
                        for _ in 0..3 {
                            record(&l, name);
                            thread::yield_now();
                        }
                    })
                    .unwrap(),
            );
        }
        for handle in handles {
            assert_eq!(handle.join(), 0);
        }
    });
    assert_eq!(snapshot(&log), ["a", "b", "a", "b", "a", "b"]);
}

#[test]
fn time_slice_expiry_preempts() {
    let log: Log = Arc::default();
    let shutdown = machine().boot(|| {
        let mut handles = Vec::new();
        for name in ["a", "b"] {
            let l = log.clone();
            handles.push(
                ThreadBuilder::new(name)
                    .spawn(move || {
                        for _ in 0..2 {
                            record(&l, name);
                            timer::busy_wait(TIME_SLICE as i64);
                        }
                    })
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.join();
        }
    });
    assert_eq!(snapshot(&log), ["a", "b", "a", "b"]);
    assert_eq!(shutdown.ticks, 4 * TIME_SLICE as i64);
    assert_eq!(shutdown.stats.kernel_ticks, 4 * TIME_SLICE as i64);
    assert_eq!(shutdown.stats.idle_ticks, 0);
}

#[test]
fn lowering_priority_yields() {
    let log: Log = Arc::default();
    machine().boot(|| {
        let l = log.clone();
        let handle = ThreadBuilder::new("other")
            .spawn(move || record(&l, "other"))
            .unwrap();
        thread::set_priority(thread::PRI_DEFAULT - 1);
        record(&log, "main");
        assert_eq!(thread::get_priority(), thread::PRI_DEFAULT - 1);
        handle.join();
    });
    assert_eq!(snapshot(&log), ["other", "main"]);
}

#[test]
fn create_returns_tid() {
    machine().boot(|| {
        let tid = thread::create("worker", thread::PRI_MIN, || ()).unwrap();
        assert!(thread::ready_threads().contains(&tid));
    });
}

#[test]
fn spawn_fails_when_thread_pages_run_out() {
    machine().max_threads(3).boot(|| {
        let first = ThreadBuilder::new("first").spawn(|| ()).unwrap();
        assert_eq!(
            ThreadBuilder::new("second").spawn(|| ()).err(),
            Some(KernelError::NoMemory),
            "Creating a thread without a free page must fail."
        );
        assert_eq!(first.join(), 0);
        assert_eq!(thread::live_threads(), 2, "Dead threads must be reaped.");
        let second = ThreadBuilder::new("second").spawn(|| ()).unwrap();
        assert_eq!(second.join(), 0);
    });
}

#[test]
fn containers_are_disjoint() {
    machine().boot(|| {
        let sema = Arc::new(Semaphore::new(0));
        let sleeper = ThreadBuilder::new("sleeper")
            .spawn(|| timer::sleep(50))
            .unwrap();
        let s = sema.clone();
        let waiter = ThreadBuilder::new("waiter")
            .spawn(move || s.down())
            .unwrap();
        let ready = ThreadBuilder::new("ready")
            .priority(thread::PRI_DEFAULT - 10)
            .spawn(|| ())
            .unwrap();

        // Let the sleeper and the waiter block.
        thread::yield_now();

        let m = thread::membership();
        assert_eq!(m.running, Some(thread::tid()));
        assert_eq!(m.ready, [ready.tid]);
        assert_eq!(m.sleeping, [sleeper.tid]);
        assert_eq!(m.waiting_on(sema.wait_list()), [waiter.tid]);
        assert_eq!(m.links[&thread::tid()], Link::Detached);
        assert_eq!(m.links[&ready.tid], Link::ReadyQueue);
        assert_eq!(m.links[&sleeper.tid], Link::SleepSet);
        assert_eq!(m.links[&waiter.tid], Link::WaitList(sema.wait_list()));
        for tid in &m.ready {
            assert!(!m.sleeping.contains(tid));
            assert!(!m.waiting_on(sema.wait_list()).contains(tid));
        }

        sema.up();
        assert_eq!(waiter.join(), 0);
        assert_eq!(ready.join(), 0);
        // The sleeper is stopped by the power-off.
    });
}

#[test]
#[should_panic(expected = "which is not blocked")]
fn unblocking_a_running_thread_is_fatal() {
    machine().boot(|| {
        let me = thread::current();
        thread::unblock(&me);
    });
}

#[test]
#[should_panic(expected = "Kernel panic")]
fn panic_in_a_kernel_thread_is_a_kernel_panic() {
    machine().boot(|| {
        let handle = ThreadBuilder::new("faulty")
            .spawn(|| panic!("faulty thread"))
            .unwrap();
        handle.join();
        unreachable!("The machine must be powered off by the kernel panic.");
    });
}

#[test]
#[should_panic(expected = "deadlocked")]
fn blocking_every_thread_is_a_deadlock() {
    machine().boot(|| {
        Semaphore::new(0).down();
    });
}

#[test]
fn power_off_stops_the_machine() {
    let shutdown = machine().boot(|| {
        ThreadBuilder::new("forever")
            .spawn(|| {
                loop {
                    thread::yield_now();
                }
            })
            .unwrap();
        keel::teletype::putbuf(b"bye\n");
        keel::power_off();
    });
    assert_eq!(shutdown.output, "bye\n");
}
