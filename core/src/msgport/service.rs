//! Per-CPU dispatcher contexts.
//!
//! Each CPU runs three dispatchers, each consuming its own port: the cpu
//! helper, the netisr and the syscall dispatcher. A dispatcher runs the
//! handler a message carries; it never interprets the command itself.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use lwkt_abi::error::{ECANCELED, ENOTSUP, KResult};
use lwkt_abi::msg::MsgFlags;
use lwkt_abi::task::{PRI_KERN, PRI_SOFT, ThreadFlags};
use lwkt_lib::{klog_debug, klog_warn};

use super::message::{Message, MsgHandler};
use super::port::{PortRef, reply, reply_if_aborted, wait_port};
use crate::machine::Machine;
use crate::scheduler::lifecycle::ExitUnwind;
use crate::scheduler::{ThreadBuilder, curthread, preempt_point};

pub(crate) fn start_services(machine: &Arc<Machine>, cpu: usize) -> KResult {
    let gd = machine.cpu(cpu);

    let port = spawn_dispatcher(machine, cpu, "cpuhelper", PRI_SOFT)?;
    gd.services.cpuhelper.call_once(|| port);
    let port = spawn_dispatcher(machine, cpu, "netisr", PRI_SOFT)?;
    gd.services.netisr.call_once(|| port);
    let port = spawn_dispatcher(machine, cpu, "syscall", PRI_KERN)?;
    gd.services.syscall.call_once(|| port);
    Ok(())
}

fn spawn_dispatcher(
    machine: &Arc<Machine>,
    cpu: usize,
    name: &str,
    priority: u8,
) -> KResult<PortRef> {
    let handle = ThreadBuilder::new(&format!("{}{}", name, cpu))
        .cpu(cpu)
        .priority(priority)
        .flags(ThreadFlags::SYSTEM | ThreadFlags::SERVICE)
        .spawn(machine, dispatch_loop)?;
    let port = handle.thread().port().clone();
    machine.add_service(handle);
    Ok(port)
}

fn dispatch_loop() {
    let td = curthread();
    let port = td.port().clone();
    klog_debug!("cpu {}: dispatcher '{}' up", td.cpu(), td.name());
    while let Some(msg) = wait_port(&port) {
        dispatch(msg);
        preempt_point();
    }
    klog_debug!("dispatcher '{}' down", td.name());
}

/// Run the handler attached to `msg`. Aborted messages are replied with
/// ECANCELED before the handler sees them; messages without a handler get
/// ENOTSUP. A handler that calls `exit()` takes the dispatcher with it.
pub fn dispatch(msg: Message) {
    if reply_if_aborted(&msg) {
        return;
    }
    let handler = msg.take_handler();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match handler {
        MsgHandler::Dispatch(func) => func(msg.clone()),
        MsgHandler::Once(func) => {
            let error = func(&msg);
            reply(&msg, error);
        }
        MsgHandler::None => reply(&msg, ENOTSUP),
    }));
    if let Err(payload) = outcome {
        if payload.is::<ExitUnwind>() {
            panic::resume_unwind(payload);
        }
        klog_warn!("handler for message {} cmd={:#x} panicked", msg.id(), msg.cmd());
        if !msg.flags().contains(MsgFlags::REPLIED) {
            reply(&msg, ECANCELED);
        }
    }
}
