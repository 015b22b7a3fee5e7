//! Per-CPU cooperative scheduling.
//!
//! Every blocking API in the crate funnels through [`switch`]. A context
//! that wants to sleep first parks itself on some wait structure with
//! [`sleep_prepare`] while that structure's lock is held, drops the lock and
//! calls [`switch`]; the waker removes it from the structure under the same
//! lock and calls [`wakeup`], which hands it back to its owning CPU.
//!
//! Only the owning CPU touches its ready queue. Requests from elsewhere
//! travel as closures on the owner's IPI queue and run at its next safe
//! point.

use core::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use lwkt_abi::error::{Errno, KResult};
use lwkt_abi::task::{QueueState, ThreadFlags, priority_is_valid};
use lwkt_lib::preempt::PreemptGuard;
use lwkt_lib::{klog_debug, klog_trace};

use super::ipiq::IpiFn;
use super::per_cpu::PendingFlags;
use super::thread::ThreadRef;
use crate::machine::Machine;
use crate::platform::SavedState;
use crate::sync::token;

std::thread_local! {
    static CURRENT: RefCell<Option<ThreadRef>> = const { RefCell::new(None) };
}

pub(crate) fn set_current_context(td: Option<ThreadRef>) {
    let _ = CURRENT.try_with(|cur| *cur.borrow_mut() = td);
}

/// The context bound to the calling host thread, if any.
pub fn current() -> Option<ThreadRef> {
    CURRENT.try_with(|cur| cur.borrow().clone()).ok().flatten()
}

/// The calling context. Calling this from outside a context is fatal.
pub fn curthread() -> ThreadRef {
    match current() {
        Some(td) => td,
        None => fatal!("operation requires an execution context"),
    }
}

#[inline]
pub fn in_context() -> bool {
    current().is_some()
}

/// CPU the caller is executing on, if it is a running context.
pub fn current_cpu() -> Option<usize> {
    current().filter(|td| td.is_executing()).map(|td| td.cpu())
}

/// CPU the caller occupies on `machine`, if any.
pub(crate) fn current_cpu_on(machine: &Arc<Machine>) -> Option<usize> {
    current()
        .filter(|td| td.is_executing() && Arc::ptr_eq(td.machine(), machine))
        .map(|td| td.cpu())
}

// --- IPI queue ---

/// Queue `func` to run on `cpu` at its next safe point.
///
/// While the target FIFO is full the sender drains its own CPU's queue so
/// that two CPUs sending to each other cannot wedge.
pub fn send_ipiq(machine: &Arc<Machine>, cpu: usize, func: IpiFn) {
    let target = machine.cpu(cpu);
    let mut func = func;
    loop {
        match target.ipiq.try_push(func) {
            Ok(()) => break,
            Err(back) => {
                func = back;
                target.post(PendingFlags::IPIQ);
                target.kick();
                if let Some(own) = current_cpu_on(machine) {
                    machine.cpu(own).process_ipiq();
                }
                std::thread::yield_now();
            }
        }
    }
    target.post(PendingFlags::IPIQ);
    target.kick();
}

// --- queue management ---

/// Make `td` runnable on its owning CPU. No-op if it is already queued.
pub fn schedule(td: &ThreadRef) {
    let target = td.cpu();
    if current_cpu_on(td.machine()) == Some(target) {
        schedule_local(td);
    } else {
        let td = td.clone();
        let machine = td.machine().clone();
        send_ipiq(&machine, target, Box::new(move || schedule(&td)));
    }
}

fn schedule_local(td: &ThreadRef) {
    if td.is_idle() {
        fatal!("idle context {} cannot be scheduled", td.id());
    }
    // The adopting CPU queues a migrating context itself.
    if td.flags().contains(ThreadFlags::MIGRATING) {
        return;
    }
    match td.queue_state() {
        QueueState::OnRunQueue => return,
        QueueState::OnWaitQueue => fatal!(
            "context {} '{}' scheduled while on a wait structure",
            td.id(),
            td.name()
        ),
        QueueState::Dead => fatal!("context {} '{}' scheduled after exit", td.id(), td.name()),
        QueueState::NotQueued => {}
    }
    let gd = td.percpu();
    gd.enqueue(td);
    if let Some(cur) = gd.current() {
        if !Arc::ptr_eq(&cur, td) && td.priority() < cur.priority() {
            gd.post(PendingFlags::RESCHED);
        }
    }
    gd.kick();
}

/// Remove `td` from its ready queue without blocking the caller.
pub fn deschedule(td: &ThreadRef) {
    let target = td.cpu();
    if current_cpu_on(td.machine()) == Some(target) {
        td.percpu().dequeue(td);
    } else {
        let td = td.clone();
        let machine = td.machine().clone();
        send_ipiq(&machine, target, Box::new(move || deschedule(&td)));
    }
}

pub fn schedule_self() {
    let td = curthread();
    td.percpu().enqueue(&td);
}

pub fn deschedule_self() {
    let td = curthread();
    td.percpu().dequeue(&td);
}

/// Take `td` (the caller) off its ready queue and mark it as parked on a
/// wait structure. Call with that structure's lock held.
pub(crate) fn sleep_prepare(td: &ThreadRef) {
    let gd = td.percpu();
    gd.with_runq(|rq| {
        if td.queue_state() == QueueState::OnRunQueue {
            rq.remove(td);
            td.set_queue_state(QueueState::NotQueued);
        }
        td.set_queue_state(QueueState::OnWaitQueue);
    });
}

/// Release a context parked by [`sleep_prepare`]. Returns false if some
/// other waker already did.
pub(crate) fn wakeup(td: &ThreadRef) -> bool {
    if td.leave_wait_state() {
        schedule(td);
        true
    } else {
        false
    }
}

// --- switching ---

/// Give up the CPU. Returns when the caller is picked again and holds its
/// whole token set again.
pub fn switch() {
    let td = curthread();
    let gd = td.percpu();
    if gd.in_ipi() {
        fatal!("switch from inside an IPI function on cpu {}", gd.cpu_id());
    }
    if cfg!(debug_assertions) && td.serializers_held() > 0 {
        fatal!(
            "context {} '{}' blocked while holding {} serializer(s)",
            td.id(),
            td.name(),
            td.serializers_held()
        );
    }
    token::release_for_switch(&td);
    loop {
        switch_raw(&td);
        if token::reacquire_all(&td) {
            break;
        }
    }
}

/// Pick the next context on the caller's CPU and hand it the baton.
/// Tokens are not touched here.
pub(crate) fn switch_raw(td: &ThreadRef) {
    let gd = td.percpu();
    gd.process_ipiq();
    gd.take(PendingFlags::RESCHED);

    let next = match gd.pick_next().or_else(|| gd.idle()) {
        Some(next) => next,
        None => fatal!("cpu {} has no runnable context", gd.cpu_id()),
    };
    if Arc::ptr_eq(&next, td) {
        return;
    }

    gd.stats.switches.fetch_add(1, Ordering::Relaxed);
    klog_trace!(
        "cpu {}: switch {} '{}' -> {} '{}'",
        gd.cpu_id(),
        td.id(),
        td.name(),
        next.id(),
        next.name()
    );
    gd.set_current(Some(next.clone()));
    td.set_executing(false);
    next.set_executing(true);

    if td.is_exit_switch() {
        next.exec.restore();
        return;
    }

    let migrate = td.take_migration();
    next.exec.restore();
    if let Some(cpu) = migrate {
        let machine = td.machine().clone();
        let adopted = td.clone();
        send_ipiq(&machine, cpu, Box::new(move || adopt(adopted, cpu)));
    }
    td.exec.save();
}

fn adopt(td: ThreadRef, cpu: usize) {
    td.set_cpu(cpu);
    td.clear_flags(ThreadFlags::MIGRATING);
    klog_debug!("cpu {}: adopted context {} '{}'", cpu, td.id(), td.name());
    schedule_local(&td);
}

/// Requeue the caller behind its priority peers and switch.
pub fn yield_now() {
    let td = curthread();
    td.percpu().stats.yields.fetch_add(1, Ordering::Relaxed);
    schedule_self();
    switch();
}

/// Explicit safe point: service IPIs and honor a pending reschedule.
pub fn preempt_point() {
    let Some(td) = current() else {
        return;
    };
    if !td.is_executing() {
        return;
    }
    let gd = td.percpu();
    if gd.in_ipi() {
        return;
    }
    gd.process_ipiq();
    if !td.machine().config().preempt || !gd.take(PendingFlags::RESCHED) {
        return;
    }
    if td.serializers_held() > 0 {
        gd.post(PendingFlags::RESCHED);
        return;
    }
    if PreemptGuard::is_active() {
        PreemptGuard::set_reschedule_pending();
        return;
    }
    gd.stats.preemptions.fetch_add(1, Ordering::Relaxed);
    yield_now();
}

/// Runs when the outermost `PreemptGuard` drops after a deferred request.
pub(crate) fn deferred_reschedule() {
    let Some(td) = current() else {
        return;
    };
    if !td.is_executing() || td.serializers_held() > 0 || td.percpu().in_ipi() {
        return;
    }
    td.percpu().stats.preemptions.fetch_add(1, Ordering::Relaxed);
    yield_now();
}

/// Ask `cpu` to reschedule at its next safe point. Callable from anywhere.
pub fn request_preempt(machine: &Machine, cpu: usize) {
    let gd = machine.cpu(cpu);
    gd.post(PendingFlags::RESCHED);
    gd.kick();
}

pub fn need_resched(machine: &Machine, cpu: usize) -> bool {
    machine.cpu(cpu).pending().contains(PendingFlags::RESCHED)
}

/// Change `td`'s priority band, requeueing it if it is ready.
pub fn set_priority(td: &ThreadRef, pri: u8) -> KResult {
    if !priority_is_valid(pri) {
        return Err(Errno::Invalid);
    }
    if td.is_idle() {
        fatal!("priority of idle context {} is fixed", td.id());
    }
    let target = td.cpu();
    if current_cpu_on(td.machine()) != Some(target) {
        let td = td.clone();
        let machine = td.machine().clone();
        send_ipiq(
            &machine,
            target,
            Box::new(move || {
                let _ = set_priority(&td, pri);
            }),
        );
        return Ok(());
    }
    let gd = td.percpu();
    if gd.dequeue(td) {
        td.store_priority(pri);
        gd.enqueue(td);
    } else {
        td.store_priority(pri);
    }
    if let Some(cur) = gd.current() {
        if !Arc::ptr_eq(&cur, td) && pri < cur.priority() && td.queue_state() == QueueState::OnRunQueue {
            gd.post(PendingFlags::RESCHED);
        }
    }
    Ok(())
}

/// Move the calling context to `cpu`. The target adopts it through an IPI;
/// the caller resumes there.
pub fn migrate_self(cpu: usize) -> KResult {
    let td = curthread();
    if cpu >= td.machine().ncpus() {
        return Err(Errno::Invalid);
    }
    if td.is_idle() {
        fatal!("idle context {} cannot migrate", td.id());
    }
    while td.cpu() != cpu {
        deschedule_self();
        td.request_migration(cpu);
        switch();
    }
    Ok(())
}
