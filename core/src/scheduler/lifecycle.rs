//! Context bootstrap, exit path and the per-CPU idle loop.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use lwkt_abi::error::{Errno, KResult};
use lwkt_abi::task::{PRI_IDLE_THREAD, QueueState, ThreadFlags};
use lwkt_lib::{klog_debug, klog_warn};

use super::scheduler::{set_current_context, switch_raw};
use super::thread::{SwitchKind, Thread, ThreadRef};
use crate::machine::Machine;
use crate::platform::SavedState;
use crate::sync::token;

/// Unwind payload used by `exit()`; not reported as a panic.
pub(crate) struct ExitUnwind;

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Host-thread body of every context: wait for the first switch-in, run
/// the bootstrap entry, then take the exit path.
pub(crate) fn trampoline(td: ThreadRef) {
    set_current_context(Some(td.clone()));
    td.exec.save();

    if let Some(entry) = td.take_bootstrap() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            if !payload.is::<ExitUnwind>() {
                td.set_flags(ThreadFlags::PANICKED);
                klog_warn!(
                    "context {} '{}' panicked: {}",
                    td.id(),
                    td.name(),
                    panic_message(payload.as_ref())
                );
            }
        }
    }

    exit_path(&td);
    set_current_context(None);
}

fn exit_path(td: &ThreadRef) {
    td.set_flags(ThreadFlags::EXITING);

    if let Some(handler) = td.take_exit_handler() {
        if panic::catch_unwind(AssertUnwindSafe(handler)).is_err() {
            klog_warn!("context {} '{}': exit handler panicked", td.id(), td.name());
        }
    }

    let leaked = token::release_on_exit(td);
    if leaked > 0 {
        klog_warn!(
            "context {} '{}' exited holding {} token(s)",
            td.id(),
            td.name(),
            leaked
        );
    }

    td.port().close();

    td.percpu().dequeue(td);
    td.set_queue_state(QueueState::Dead);
    td.set_flags(ThreadFlags::EXITED);
    td.exit_latch().set();
    td.exit_waiters.wake_all();
    td.machine().context_exited();
    klog_debug!("context {} '{}' exited", td.id(), td.name());

    td.mark_exit_switch();
    switch_raw(td);
}

// --- idle contexts ---

/// Create the idle context of `cpu` and start its host thread. The idle
/// context is current from the start and owns the CPU until something
/// is scheduled there.
pub(crate) fn start_idle(
    machine: &Arc<Machine>,
    cpu: usize,
) -> KResult<std::thread::JoinHandle<()>> {
    let td = Thread::new(
        machine,
        "idle",
        cpu,
        PRI_IDLE_THREAD,
        ThreadFlags::IDLE | ThreadFlags::SYSTEM,
        None,
        SwitchKind::Normal,
    );
    td.set_executing(true);
    let gd = machine.cpu(cpu);
    gd.set_idle(td.clone());
    gd.set_current(Some(td.clone()));

    std::thread::Builder::new()
        .name(format!("lwkt-idle{}", cpu))
        .spawn(move || idle_loop(td))
        .map_err(|err| {
            klog_warn!("cpu {}: idle thread creation failed: {}", cpu, err);
            Errno::NoBuffers
        })
}

fn idle_loop(td: ThreadRef) {
    set_current_context(Some(td.clone()));
    let machine = td.machine().clone();
    let gd = machine.cpu(td.cpu());
    loop {
        gd.process_ipiq();
        if gd.has_ready() {
            switch_raw(&td);
            continue;
        }
        if machine.idle_should_stop() && gd.ipiq.is_empty() {
            break;
        }
        gd.idle_park();
    }
    klog_debug!("cpu {}: idle loop stopped", gd.cpu_id());
    td.set_executing(false);
    set_current_context(None);
}
