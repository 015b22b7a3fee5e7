//! Syscalls as messages.
//!
//! A syscall is a message whose command carries the syscall number and
//! whose payload carries the arguments. It is submitted to the syscall
//! dispatcher of the caller's CPU, which looks the number up in the table
//! and replies with the handler's result: the return value in the first
//! payload word, the error code in the result field.

use std::sync::Arc;

use lwkt_abi::error::{ENOSYS, ENOTSUP, EOK, Errno, KResult};
use lwkt_abi::msg::{MsgFlags, MsgPayload};
use lwkt_abi::syscall::{SYS_NOSYS, SYSCALL_MAX_ARGS, syscall_cmd};
use lwkt_lib::{klog_debug, klog_trace};

use super::context::{SyscallArgs, SyscallContext};
use super::handlers::syscall_lookup;
use super::process::Process;
use crate::machine::Machine;
use crate::msgport::{Message, PortRef, domsg, init_message, reply, sendmsg};
use crate::scheduler::{current, current_cpu};

/// Message-side entry point, run by the syscall dispatcher.
pub fn sys_dispatch(msg: Message) {
    let ctx = SyscallContext::new(&msg);
    let number = ctx.number();
    if number == SYS_NOSYS {
        reply(&msg, ENOTSUP);
        return;
    }
    let Some(entry) = syscall_lookup(number) else {
        klog_debug!("syscall {} not implemented", number);
        reply(&msg, ENOSYS);
        return;
    };
    let Some(handler) = entry.handler else {
        reply(&msg, ENOSYS);
        return;
    };
    klog_trace!("syscall {} ({}) args={:?}", number, entry.name, ctx.args());
    match handler(&ctx) {
        Ok(value) => {
            msg.update_payload(|p| p.set_result64(value));
            reply(&msg, EOK);
        }
        Err(err) => reply(&msg, err.as_raw()),
    }
}

/// Build a syscall message: command, arguments, the dispatch function and
/// the calling process as back-reference.
pub fn sysmsg_init(
    msg: &Message,
    process: Option<&Arc<Process>>,
    number: u32,
    args: &[u64],
    reply_port: Option<&PortRef>,
    flags: MsgFlags,
) -> KResult {
    if args.len() > SYSCALL_MAX_ARGS {
        return Err(Errno::TooBig);
    }
    init_message(msg, reply_port, syscall_cmd(number), flags);
    msg.set_payload(MsgPayload::from_words(SyscallArgs::from_slice(args).words()));
    msg.set_dispatch(sys_dispatch);
    if let Some(process) = process {
        msg.set_backref(process.clone());
    }
    Ok(())
}

/// Result of a completed syscall message.
pub fn sysmsg_result(msg: &Message) -> KResult<u64> {
    msg.result().map(|()| msg.payload().result64())
}

fn syscall_port(machine: &Machine) -> KResult<PortRef> {
    let cpu = current_cpu().unwrap_or(0).min(machine.ncpus() - 1);
    machine.syscall_port(cpu).ok_or(Errno::NotConnected)
}

fn caller_process() -> Option<Arc<Process>> {
    current().and_then(|td| td.process().cloned())
}

/// Synchronous syscall on behalf of the calling context's process.
pub fn sendsys(machine: &Arc<Machine>, number: u32, args: &[u64]) -> KResult<u64> {
    sendsys_as(machine, caller_process().as_ref(), number, args)
}

/// Synchronous syscall on behalf of `process`.
pub fn sendsys_as(
    machine: &Arc<Machine>,
    process: Option<&Arc<Process>>,
    number: u32,
    args: &[u64],
) -> KResult<u64> {
    let port = syscall_port(machine)?;
    let msg = Message::new(0);
    let done = machine.done_port();
    sysmsg_init(&msg, process, number, args, done.as_ref(), MsgFlags::ABORTABLE)?;
    domsg(&port, &msg);
    sysmsg_result(&msg)
}

/// Asynchronous syscall. The message lands on `process`'s completion
/// list; collect it with `reap` or `wait_sysmsg`. Only privileged
/// processes may issue asynchronous syscalls.
pub fn sendsys_async(process: &Arc<Process>, number: u32, args: &[u64]) -> KResult<Message> {
    if !process.cred().is_root() {
        return Err(Errno::NotPermitted);
    }
    let port = syscall_port(process.machine())?;
    let msg = Message::new(0);
    sysmsg_init(
        &msg,
        Some(process),
        number,
        args,
        Some(process.completion_port()),
        MsgFlags::ASYNC | MsgFlags::ABORTABLE,
    )?;
    process.track(&msg)?;
    sendmsg(&port, &msg);
    Ok(msg)
}
