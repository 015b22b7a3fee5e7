//! Run a function on a chosen CPU.
//!
//! The function travels as a one-shot handler on a message submitted to
//! the target CPU's cpu-helper port and runs in that CPU's helper context.

use std::sync::Arc;

use lwkt_abi::error::{EOK, Errno, KResult};
use lwkt_abi::msg::{MSG_CLASS_CPU, MsgFlags};
use spin::Mutex;

use crate::machine::Machine;
use crate::msgport::{Message, PortRef, domsg, init_message, sendmsg};
use crate::scheduler::current;

pub const CPU_MSG_CALL: u32 = MSG_CLASS_CPU | 1;
pub const CPU_MSG_SEND: u32 = MSG_CLASS_CPU | 2;

fn helper_port(machine: &Machine, cpu: usize) -> KResult<PortRef> {
    if cpu >= machine.ncpus() {
        return Err(Errno::Invalid);
    }
    machine.cpuhelper_port(cpu).ok_or(Errno::NotConnected)
}

/// Run `func` on `cpu` and wait for its value.
pub fn cpu_call<F, R>(machine: &Arc<Machine>, cpu: usize, func: F) -> KResult<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let port = helper_port(machine, cpu)?;
    // The helper calling itself would wait on its own port forever.
    if current().is_some_and(|td| Arc::ptr_eq(td.port(), &port)) {
        return Ok(func());
    }

    let slot: Arc<Mutex<Option<R>>> = Arc::new(Mutex::new(None));
    let out = slot.clone();
    let msg = Message::new(CPU_MSG_CALL);
    init_message(&msg, machine.done_port().as_ref(), CPU_MSG_CALL, MsgFlags::empty());
    msg.set_oneshot(move |_| {
        *out.lock() = Some(func());
        EOK
    });
    Errno::check(domsg(&port, &msg))?;
    let value = slot.lock().take();
    value.ok_or(Errno::Canceled)
}

/// Queue `func` to run on `cpu` without waiting. The returned message
/// completes once it has run.
pub fn cpu_send<F>(machine: &Arc<Machine>, cpu: usize, func: F) -> KResult<Message>
where
    F: FnOnce() + Send + 'static,
{
    let port = helper_port(machine, cpu)?;
    let msg = Message::new(CPU_MSG_SEND);
    init_message(
        &msg,
        machine.done_port().as_ref(),
        CPU_MSG_SEND,
        MsgFlags::ASYNC,
    );
    msg.set_oneshot(move |_| {
        func();
        EOK
    });
    sendmsg(&port, &msg);
    Ok(msg)
}
