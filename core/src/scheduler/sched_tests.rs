//! Scheduler and context lifecycle tests.
//!
//! Bodies run on a freshly booted machine and mostly execute inside a
//! `main` context so that scheduling decisions are made the way real
//! callers make them.

use std::sync::{Arc, mpsc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use lwkt_abi::error::Errno;
use lwkt_abi::task::{PRI_INT, PRI_KERN, PRI_USER_NORMAL, QueueState, ThreadFlags};
use lwkt_lib::preempt::PreemptGuard;
use lwkt_lib::{BootConfig, KlogLevel};
use lwkt_lib::testing::TestResult;
use lwkt_lib::{assert_eq_test, assert_err, assert_ok, assert_test, define_test_suite};
use spin::Mutex;

use super::kthread::{JoinError, ThreadBuilder, exit, set_exit_handler};
use super::scheduler::{
    current, current_cpu, curthread, deschedule_self, in_context, migrate_self, request_preempt,
    need_resched, preempt_point, schedule, set_priority, switch, yield_now,
};
use super::waitqueue::WaitQueue;
use crate::machine::Machine;
use crate::test_fixture::{MachineFixture, wait_until};

// =============================================================================
// Spawn and join
// =============================================================================

pub fn test_spawn_join_returns_value() -> TestResult {
    let m = MachineFixture::new(1);
    let handle = assert_ok!(ThreadBuilder::new("worker").spawn(&m, || 6 * 7));
    assert_eq_test!(handle.join(), Ok(42));
    TestResult::Pass
}

pub fn test_spawn_rejects_bad_arguments() -> TestResult {
    let m = MachineFixture::new(2);
    assert_err!(ThreadBuilder::new("").spawn(&m, || ()), Errno::Invalid);
    let long = "x".repeat(64);
    assert_err!(ThreadBuilder::new(&long).spawn(&m, || ()), Errno::Invalid);
    assert_err!(ThreadBuilder::new("cpu").cpu(2).spawn(&m, || ()), Errno::Invalid);
    assert_err!(
        ThreadBuilder::new("pri").priority(200).spawn(&m, || ()),
        Errno::Invalid
    );
    TestResult::Pass
}

pub fn test_spawn_after_shutdown_refused() -> TestResult {
    let m = MachineFixture::new(1);
    m.shutdown();
    assert_err!(ThreadBuilder::new("late").spawn(&m, || ()), Errno::NotConnected);
    TestResult::Pass
}

pub fn test_context_identity() -> TestResult {
    let m = MachineFixture::new(2);
    assert_test!(!in_context(), "test thread is not a context");
    assert_test!(current().is_none());
    let seen = m.run(|| {
        let td = curthread();
        (in_context(), current_cpu(), td.name().to_string(), td.queue_state())
    });
    let Some((inside, cpu, name, state)) = seen else {
        return TestResult::Fail;
    };
    assert_test!(inside);
    assert_eq_test!(cpu, Some(0));
    assert_eq_test!(name.as_str(), "main");
    assert_eq_test!(state, QueueState::NotQueued, "running context is off the ready queue");
    TestResult::Pass
}

pub fn test_panicking_context_is_confined() -> TestResult {
    let m = MachineFixture::new(1);
    let handle = assert_ok!(ThreadBuilder::new("boom").spawn(&m, || -> u32 {
        panic!("context body failed")
    }));
    assert_eq_test!(handle.join(), Err(JoinError::Panicked));
    // The CPU keeps scheduling after the failure.
    assert_eq_test!(m.run(|| 7), Some(7));
    TestResult::Pass
}

pub fn test_exit_runs_handler() -> TestResult {
    let m = MachineFixture::new(1);
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let handle = assert_ok!(ThreadBuilder::new("leaver").spawn(&m, move || -> u32 {
        set_exit_handler(move || flag.store(true, Ordering::SeqCst));
        fn deep() -> ! {
            exit()
        }
        deep()
    }));
    let td = handle.thread().clone();
    assert_eq_test!(handle.join(), Err(JoinError::Exited));
    assert_test!(ran.load(Ordering::SeqCst), "exit handler did not run");
    assert_eq_test!(td.queue_state(), QueueState::Dead);
    assert_test!(td.flags().contains(ThreadFlags::EXITED));
    assert_test!(td.port().is_closed(), "exited context port still open");
    TestResult::Pass
}

pub fn test_join_from_context() -> TestResult {
    let m = MachineFixture::new(2);
    let machine = m.machine().clone();
    let total = m.run(move || {
        let a = ThreadBuilder::new("a").cpu(0).spawn(&machine, || 1u32).ok()?;
        let b = ThreadBuilder::new("b").cpu(1).spawn(&machine, || 2u32).ok()?;
        Some(a.join().ok()? + b.join().ok()?)
    });
    assert_eq_test!(total, Some(Some(3)));
    TestResult::Pass
}

// =============================================================================
// Ordering
// =============================================================================

pub fn test_priority_order_on_one_cpu() -> TestResult {
    let m = MachineFixture::new(1);
    let machine = m.machine().clone();
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = order.clone();
    let ok = m.run(move || {
        let mut handles = Vec::new();
        for (name, pri) in [("user", PRI_USER_NORMAL), ("kern", PRI_KERN), ("int", PRI_INT)] {
            let log = log.clone();
            let h = ThreadBuilder::new(name)
                .priority(pri)
                .spawn(&machine, move || log.lock().push(pri))
                .ok()?;
            handles.push(h);
        }
        // Nothing runs until the spawner gives up the CPU.
        let before = log.lock().len();
        for h in handles {
            h.join().ok()?;
        }
        Some(before)
    });
    assert_eq_test!(ok, Some(Some(0)));
    assert_eq_test!(order.lock().clone(), vec![PRI_INT, PRI_KERN, PRI_USER_NORMAL]);
    TestResult::Pass
}

pub fn test_yield_round_robin() -> TestResult {
    let m = MachineFixture::new(1);
    let machine = m.machine().clone();
    let trace = Arc::new(Mutex::new(Vec::new()));
    let log = trace.clone();
    let done = m.run(move || {
        let mut handles = Vec::new();
        for tag in ['a', 'b'] {
            let log = log.clone();
            handles.push(
                ThreadBuilder::new(&tag.to_string())
                    .priority(PRI_USER_NORMAL)
                    .spawn(&machine, move || {
                        for _ in 0..3 {
                            log.lock().push(tag);
                            yield_now();
                        }
                    })
                    .ok()?,
            );
        }
        for h in handles {
            h.join().ok()?;
        }
        Some(())
    });
    assert_eq_test!(done, Some(Some(())));
    assert_eq_test!(trace.lock().clone(), vec!['a', 'b', 'a', 'b', 'a', 'b']);
    TestResult::Pass
}

pub fn test_schedule_is_idempotent() -> TestResult {
    let m = MachineFixture::new(1);
    let machine = m.machine().clone();
    let ready = m.run(move || {
        let h = ThreadBuilder::new("peer").spawn(&machine, || ()).ok()?;
        schedule(h.thread());
        schedule(h.thread());
        let count = h.thread().percpu().ready_count();
        h.join().ok()?;
        Some(count)
    });
    assert_eq_test!(ready, Some(Some(1)));
    TestResult::Pass
}

// =============================================================================
// Cross-CPU operations
// =============================================================================

pub fn test_cross_cpu_schedule_wakes_parked_context() -> TestResult {
    let m = MachineFixture::new(2);
    let parked = Arc::new(AtomicUsize::new(0));
    let flag = parked.clone();
    let sleeper = assert_ok!(ThreadBuilder::new("sleeper").cpu(1).spawn(&m, move || {
        flag.store(1, Ordering::SeqCst);
        deschedule_self();
        switch();
        flag.store(2, Ordering::SeqCst);
        current_cpu()
    }));
    let td = sleeper.thread().clone();
    assert_test!(wait_until(|| parked.load(Ordering::SeqCst) == 1 && !td.is_executing()));
    assert_test!(m.run(move || schedule(&td)).is_some());
    assert_eq_test!(sleeper.join(), Ok(Some(1)));
    assert_eq_test!(parked.load(Ordering::SeqCst), 2);
    TestResult::Pass
}

pub fn test_migrate_self() -> TestResult {
    let m = MachineFixture::new(3);
    let path = m.run(|| {
        let start = current_cpu();
        migrate_self(2).ok()?;
        let mid = current_cpu();
        migrate_self(1).ok()?;
        Some((start, mid, current_cpu(), curthread().cpu()))
    });
    assert_eq_test!(path, Some(Some((Some(0), Some(2), Some(1), 1))));
    let bad = m.run(|| migrate_self(9));
    assert_eq_test!(bad, Some(Err(Errno::Invalid)));
    TestResult::Pass
}

pub fn test_set_priority_validates() -> TestResult {
    let m = MachineFixture::new(1);
    let result = m.run(|| {
        let td = curthread();
        let bad = set_priority(&td, 99);
        let good = set_priority(&td, PRI_USER_NORMAL);
        (bad, good, td.priority())
    });
    assert_eq_test!(result, Some((Err(Errno::Invalid), Ok(()), PRI_USER_NORMAL)));
    TestResult::Pass
}

// =============================================================================
// Preemption requests
// =============================================================================

pub fn test_preempt_request_honored_at_safe_point() -> TestResult {
    let m = MachineFixture::new(1);
    let machine = m.machine().clone();
    let result = m.run(move || {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let peer = ThreadBuilder::new("peer")
            .spawn(&machine, move || flag.store(true, Ordering::SeqCst))
            .ok()?;
        request_preempt(&machine, 0);
        let pending = need_resched(&machine, 0);
        let before = ran.load(Ordering::SeqCst);
        preempt_point();
        let after = ran.load(Ordering::SeqCst);
        peer.join().ok()?;
        Some((pending, before, after))
    });
    assert_eq_test!(result, Some(Some((true, false, true))));
    assert_test!(m.stats().total_preemptions() >= 1);
    TestResult::Pass
}

pub fn test_preempt_deferred_by_guard() -> TestResult {
    let m = MachineFixture::new(1);
    let machine = m.machine().clone();
    let result = m.run(move || {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let peer = ThreadBuilder::new("peer")
            .spawn(&machine, move || flag.store(true, Ordering::SeqCst))
            .ok()?;
        let guard = PreemptGuard::new();
        request_preempt(&machine, 0);
        preempt_point();
        let ran_under_guard = ran.load(Ordering::SeqCst);
        let deferred = PreemptGuard::is_reschedule_pending();
        let before = machine.stats().total_preemptions();
        drop(guard);
        let ran_after_drop = ran.load(Ordering::SeqCst);
        let after = machine.stats().total_preemptions();
        peer.join().ok()?;
        Some((ran_under_guard, deferred, ran_after_drop, after > before))
    });
    assert_eq_test!(result, Some(Some((false, true, true, true))));
    TestResult::Pass
}

pub fn test_preempt_disabled_by_config() -> TestResult {
    let m = MachineFixture::with_config(BootConfig {
        preempt: false,
        klog: KlogLevel::Warn,
        ..BootConfig::with_cpus(1)
    });
    let machine = m.machine().clone();
    let result = m.run(move || {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let peer = ThreadBuilder::new("peer")
            .spawn(&machine, move || flag.store(true, Ordering::SeqCst))
            .ok()?;
        request_preempt(&machine, 0);
        preempt_point();
        let ran_early = ran.load(Ordering::SeqCst);
        peer.join().ok()?;
        Some(ran_early)
    });
    assert_eq_test!(result, Some(Some(false)));
    TestResult::Pass
}

// =============================================================================
// Wait queues
// =============================================================================

pub fn test_waitqueue_wake_all_rechecks() -> TestResult {
    let m = MachineFixture::new(1);
    let machine = m.machine().clone();
    let order = m.run(move || {
        let wq = Arc::new(WaitQueue::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let go = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for i in 0..3usize {
            let (wq, log, go) = (wq.clone(), log.clone(), go.clone());
            handles.push(
                ThreadBuilder::new("waiter")
                    .spawn(&machine, move || {
                        wq.wait_event(|| go.load(Ordering::SeqCst) > i);
                        log.lock().push(i);
                    })
                    .ok()?,
            );
        }
        // Let all three park.
        yield_now();
        let parked = wq.waiter_count();
        for n in 1..=3 {
            go.store(n, Ordering::SeqCst);
            wq.wake_all();
            yield_now();
        }
        for h in handles {
            h.join().ok()?;
        }
        let seen = log.lock().clone();
        Some((parked, seen, wq.has_waiters()))
    });
    assert_eq_test!(order, Some(Some((3, vec![0, 1, 2], false))));
    TestResult::Pass
}

pub fn test_waitqueue_block_generation() -> TestResult {
    let m = MachineFixture::new(2);
    let wq = Arc::new(WaitQueue::new());
    let waker = wq.clone();
    let h = assert_ok!(ThreadBuilder::new("blocker").cpu(1).spawn(&m, move || {
        let mut seen = waker.generation();
        waker.block(&mut seen);
        seen
    }));
    assert_test!(wait_until(|| wq.has_waiters()));
    assert_test!(wq.wake_one());
    assert_eq_test!(h.join(), Ok(1));
    assert_test!(!wq.wake_one(), "queue should be empty");
    TestResult::Pass
}

// =============================================================================
// Machine
// =============================================================================

pub fn test_machine_stats_count_switches() -> TestResult {
    let m = MachineFixture::new(2);
    assert_eq_test!(m.run(|| yield_now()), Some(()));
    let stats = m.stats();
    assert_eq_test!(stats.cpus.len(), 2);
    assert_test!(stats.total_switches() >= 1);
    assert_test!(stats.total_yields() >= 1);
    TestResult::Pass
}

pub fn test_boot_shutdown_cycles() -> TestResult {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for round in 0..8 {
            let ncpus = 1 + round % 2;
            let config = BootConfig {
                klog: KlogLevel::Warn,
                ..BootConfig::with_cpus(ncpus)
            };
            let Ok(machine) = Machine::boot(config) else {
                let _ = tx.send(false);
                return;
            };
            if round % 4 == 3 {
                let _ = machine.run(|| yield_now());
            }
            machine.shutdown();
        }
        let _ = tx.send(true);
    });
    assert_eq_test!(
        rx.recv_timeout(Duration::from_secs(10)),
        Ok(true),
        "boot/shutdown cycle stalled"
    );
    TestResult::Pass
}

define_test_suite!(
    sched,
    [
        test_spawn_join_returns_value,
        test_spawn_rejects_bad_arguments,
        test_spawn_after_shutdown_refused,
        test_context_identity,
        test_panicking_context_is_confined,
        test_exit_runs_handler,
        test_join_from_context,
        test_priority_order_on_one_cpu,
        test_yield_round_robin,
        test_schedule_is_idempotent,
        test_cross_cpu_schedule_wakes_parked_context,
        test_migrate_self,
        test_set_priority_validates,
        test_preempt_request_honored_at_safe_point,
        test_preempt_deferred_by_guard,
        test_preempt_disabled_by_config,
        test_waitqueue_wake_all_rechecks,
        test_waitqueue_block_generation,
        test_machine_stats_count_switches,
        test_boot_shutdown_cycles,
    ]
);
