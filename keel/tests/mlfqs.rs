use keel::{
    SchedulingPolicy,
    SystemConfigurationBuilder,
    thread::{self, NICE_MAX, NICE_MIN, PRI_MAX, ThreadBuilder, fixed_point::FixedPoint},
    timer::{self, TIMER_FREQ},
};

fn machine() -> SystemConfigurationBuilder {
    SystemConfigurationBuilder::new()
        .quiet(true)
        .cmdline("-o mlfqs")
}

#[test]
fn priority_follows_nice() {
    machine().boot(|| {
        assert_eq!(thread::get_nice(), 0);
        assert_eq!(thread::get_priority(), PRI_MAX);

        thread::set_nice(5);
        assert_eq!(thread::get_nice(), 5);
        assert_eq!(thread::get_priority(), PRI_MAX - 10);

        thread::set_nice(100);
        assert_eq!(thread::get_nice(), NICE_MAX, "nice must be clamped.");
        assert_eq!(thread::get_priority(), PRI_MAX - 2 * NICE_MAX);

        thread::set_priority(PRI_MAX);
        assert_eq!(
            thread::get_priority(),
            PRI_MAX - 2 * NICE_MAX,
            "set_priority is ignored under mlfqs."
        );

        thread::set_nice(-100);
        assert_eq!(thread::get_nice(), NICE_MIN);
        assert_eq!(thread::get_priority(), PRI_MAX);
    });
}

#[test]
fn load_avg_and_recent_cpu_after_one_second() {
    machine().boot(|| {
        assert_eq!(thread::get_load_avg(), 0);
        assert_eq!(thread::get_recent_cpu(), 0);
        timer::busy_wait(TIMER_FREQ - 1);
        assert_eq!(thread::get_recent_cpu(), 99 * 100);
        timer::busy_wait(1);
        // One ready thread for one second: 1/60.
        assert_eq!(thread::get_load_avg(), 2);
        // 100 ticks decayed by (2/60) / (2/60 + 1).
        let recent_cpu = thread::get_recent_cpu();
        assert!(
            (300..=340).contains(&recent_cpu),
            "recent_cpu*100 = {recent_cpu}"
        );
    });
}

#[test]
fn children_inherit_nice() {
    machine().boot(|| {
        thread::set_nice(3);
        let handle = ThreadBuilder::new("child")
            .spawn(|| assert_eq!(thread::get_nice(), 3))
            .unwrap();
        assert_eq!(handle.thread().nice(), 3);
        assert_eq!(handle.thread().priority(), thread::get_priority());
        assert_eq!(handle.join(), 0);
    });
}

#[test]
fn busy_thread_loses_priority() {
    machine().boot(|| {
        let worker = ThreadBuilder::new("worker")
            .spawn(|| timer::busy_wait(40))
            .unwrap();
        let th = worker.thread().clone();
        assert_eq!(worker.join(), 0);
        assert!(
            thread::get_priority() > th.priority(),
            "The thread that burned the CPU must end up with a lower priority."
        );
    });
}

#[test]
fn policy_can_be_set_directly() {
    SystemConfigurationBuilder::new()
        .quiet(true)
        .scheduling(SchedulingPolicy::Mlfqs)
        .boot(|| {
            thread::set_priority(0);
            assert_eq!(thread::get_priority(), PRI_MAX);
        });
}

#[test]
fn recent_cpu_reports_large_values() {
    machine().boot(|| {
        thread::current()
            .store_recent_cpu(FixedPoint::from_int(5000));
        assert_eq!(
            thread::get_recent_cpu(),
            500_000,
            "recent_cpu * 100 must not overflow under heavy load."
        );
        thread::set_nice(NICE_MAX);
        assert_eq!(thread::get_priority(), 0);
    });
}
