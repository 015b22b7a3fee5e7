//! Ports and the submit/wait/reply protocol.
//!
//! A port is a FIFO mailbox bound to one CPU. Every mutation of a port's
//! consumer side happens on that CPU: a sender on another CPU ships the
//! message there as an IPI closure, so per-(sender, port) order is the
//! order of the sender's IPI FIFO.
//!
//! Replies travel the same way to the message's reply port. What happens
//! on arrival depends on the reply port's kind: a mailbox queues the
//! message for its owner (unless a `wait` is already parked on it), a
//! done-only port just marks it done, and a callback port runs its
//! function on its CPU.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use lwkt_abi::error::{ECANCELED, ENOTCONN, ENOTSUP, EOK};
use lwkt_abi::msg::{MSGF_INIT_MASK, MsgFlags, PortId};
use lwkt_lib::klog_trace;
use spin::Mutex;

use super::message::{Message, MsgWaiter};
use crate::machine::Machine;
use crate::scheduler::scheduler::{current, current_cpu_on, send_ipiq, sleep_prepare, switch, wakeup};
use crate::scheduler::{Thread, ThreadRef};

pub type PortRef = Arc<Port>;

/// Reply-port behavior.
#[derive(Clone, Copy)]
pub enum PortKind {
    /// Owner-consumed FIFO.
    Mailbox,
    /// Completion only marks the message done and wakes a waiter.
    ReplyDone,
    /// Completion also runs this function on the port's CPU.
    ReplyFn(fn(&Message)),
}

impl core::fmt::Debug for PortKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Mailbox => f.write_str("Mailbox"),
            Self::ReplyDone => f.write_str("ReplyDone"),
            Self::ReplyFn(_) => f.write_str("ReplyFn"),
        }
    }
}

struct Mailbox {
    queue: VecDeque<Message>,
    /// The owner is parked in `wait_port`.
    waiting: bool,
}

pub struct Port {
    id: PortId,
    name: String,
    kind: PortKind,
    owner: Weak<Thread>,
    cpu: usize,
    machine: Weak<Machine>,
    mbox: Mutex<Mailbox>,
    closed: AtomicBool,
}

impl Port {
    fn build(
        machine: &Arc<Machine>,
        name: &str,
        kind: PortKind,
        owner: Weak<Thread>,
        cpu: usize,
    ) -> Port {
        Port {
            id: machine.alloc_port_id(),
            name: name.to_string(),
            kind,
            owner,
            cpu,
            machine: Arc::downgrade(machine),
            mbox: Mutex::new(Mailbox {
                queue: VecDeque::new(),
                waiting: false,
            }),
            closed: AtomicBool::new(false),
        }
    }

    fn publish(machine: &Arc<Machine>, port: Port) -> PortRef {
        let port = Arc::new(port);
        machine.publish_port(port.id, Arc::downgrade(&port));
        port
    }

    /// A context's own mailbox. Called while the owner is being built.
    pub(crate) fn owned_by(
        machine: &Arc<Machine>,
        name: &str,
        owner: Weak<Thread>,
        cpu: usize,
    ) -> PortRef {
        Self::publish(machine, Self::build(machine, name, PortKind::Mailbox, owner, cpu))
    }

    /// A mailbox owned by `owner`, separate from its own port.
    pub fn mailbox(machine: &Arc<Machine>, name: &str, owner: &ThreadRef) -> PortRef {
        Self::publish(
            machine,
            Self::build(machine, name, PortKind::Mailbox, Arc::downgrade(owner), owner.cpu()),
        )
    }

    pub fn reply_done(machine: &Arc<Machine>, name: &str) -> PortRef {
        Self::publish(machine, Self::build(machine, name, PortKind::ReplyDone, Weak::new(), 0))
    }

    /// Reply port that runs `func` on `cpu` for every completed message.
    pub fn reply_fn(
        machine: &Arc<Machine>,
        name: &str,
        cpu: usize,
        func: fn(&Message),
    ) -> PortRef {
        let cpu = cpu.min(machine.ncpus().saturating_sub(1));
        Self::publish(
            machine,
            Self::build(machine, name, PortKind::ReplyFn(func), Weak::new(), cpu),
        )
    }

    #[inline]
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    pub fn owner(&self) -> Option<ThreadRef> {
        self.owner.upgrade()
    }

    /// The CPU whose context consumes this port. Follows the owner.
    pub fn cpu(&self) -> usize {
        self.owner.upgrade().map_or(self.cpu, |td| td.cpu())
    }

    pub(crate) fn machine(&self) -> Option<Arc<Machine>> {
        self.machine.upgrade()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.mbox.lock().queue.len()
    }

    /// Arrival of `msg` on this port's CPU.
    fn accept(&self, msg: Message) {
        if let Some(machine) = self.machine() {
            machine
                .cpu(self.cpu())
                .stats
                .messages_delivered
                .fetch_add(1, Ordering::Relaxed);
        }
        if msg.flags().contains(MsgFlags::REPLIED) {
            self.accept_reply(msg);
        } else {
            self.accept_request(msg);
        }
    }

    fn accept_request(&self, msg: Message) {
        if !matches!(self.kind, PortKind::Mailbox) {
            reply(&msg, ENOTSUP);
            return;
        }
        let wake = {
            let mut mbox = self.mbox.lock();
            if self.is_closed() {
                None
            } else {
                msg.set_flags(MsgFlags::QUEUED);
                mbox.queue.push_back(msg.clone());
                Some(core::mem::take(&mut mbox.waiting))
            }
        };
        match wake {
            None => reply(&msg, ENOTCONN),
            Some(true) => self.wake_owner(),
            Some(false) => {}
        }
    }

    fn accept_reply(&self, msg: Message) {
        let (waiter, wake_owner) = {
            let mut slot = msg.0.waiter.lock();
            msg.clear_flags(MsgFlags::INFLIGHT);
            msg.set_flags(MsgFlags::DONE);
            let waiter = slot.take();
            let mut wake_owner = false;
            if waiter.is_none() && matches!(self.kind, PortKind::Mailbox) {
                let mut mbox = self.mbox.lock();
                if !self.is_closed() {
                    msg.set_flags(MsgFlags::QUEUED);
                    mbox.queue.push_back(msg.clone());
                    wake_owner = core::mem::take(&mut mbox.waiting);
                }
            }
            (waiter, wake_owner)
        };
        if let PortKind::ReplyFn(func) = self.kind {
            func(&msg);
        }
        if let Some(waiter) = waiter {
            waiter.wake();
        }
        if wake_owner {
            self.wake_owner();
        }
    }

    fn wake_owner(&self) {
        if let Some(owner) = self.owner.upgrade() {
            wakeup(&owner);
        }
    }

    fn remove(&self, msg: &Message) -> bool {
        let mut mbox = self.mbox.lock();
        match mbox.queue.iter().position(|m| m.same(msg)) {
            Some(pos) => {
                mbox.queue.remove(pos);
                msg.clear_flags(MsgFlags::QUEUED);
                true
            }
            None => false,
        }
    }

    /// Stop accepting messages. Queued requests are completed with
    /// ENOTCONN; queued replies are dropped. Idempotent.
    pub fn close(&self) {
        let (drained, wake) = {
            let mut mbox = self.mbox.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            let drained: Vec<Message> = mbox.queue.drain(..).collect();
            (drained, core::mem::take(&mut mbox.waiting))
        };
        for msg in drained {
            msg.clear_flags(MsgFlags::QUEUED);
            if !msg.flags().contains(MsgFlags::REPLIED) {
                reply(&msg, ENOTCONN);
            }
        }
        if wake {
            self.wake_owner();
        }
    }
}

impl core::fmt::Debug for Port {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("cpu", &self.cpu())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Ship `msg` to `port`'s CPU and accept it there.
fn deliver(port: &PortRef, msg: Message) {
    let Some(machine) = port.machine() else {
        port.accept(msg);
        return;
    };
    let cpu = port.cpu();
    if current_cpu_on(&machine) == Some(cpu) {
        port.accept(msg);
    } else {
        let port = port.clone();
        send_ipiq(&machine, cpu, Box::new(move || port.accept(msg)));
    }
}

// --- protocol ---

/// Prepare `msg` for submission. The reply port defaults to the calling
/// context's own port; host callers without one get the done-only
/// behavior.
pub fn init_message(msg: &Message, reply_port: Option<&PortRef>, cmd: u32, flags: MsgFlags) {
    if msg.is_inflight() {
        fatal!("message {} reinitialized while in flight", msg.id());
    }
    msg.set_cmd(cmd);
    msg.store_flags(flags & MSGF_INIT_MASK);
    msg.set_error(EOK);
    let reply_port = match reply_port {
        Some(port) => Some(port.clone()),
        None => current().map(|td| td.port().clone()),
    };
    msg.set_reply_port(reply_port);
}

/// Submit `msg` to `port`. Submitting a message that is still in flight
/// is fatal.
pub fn sendmsg(port: &PortRef, msg: &Message) {
    let prev = msg.flags();
    if prev.contains(MsgFlags::INFLIGHT) {
        fatal!("message {} submitted while in flight", msg.id());
    }
    msg.clear_flags(MsgFlags::DONE | MsgFlags::REPLIED | MsgFlags::ABORT_REQ | MsgFlags::QUEUED);
    msg.set_flags(MsgFlags::INFLIGHT);
    msg.set_error(EOK);
    klog_trace!("sendmsg {} cmd={:#x} -> port {} '{}'", msg.id(), msg.cmd(), port.id(), port.name());
    deliver(port, msg.clone());
}

/// Alias of [`sendmsg`].
pub fn submit(port: &PortRef, msg: &Message) {
    sendmsg(port, msg);
}

/// Submit and wait for the reply. Returns the result code.
pub fn domsg(port: &PortRef, msg: &Message) -> i32 {
    msg.clear_flags(MsgFlags::ASYNC);
    sendmsg(port, msg);
    wait(msg)
}

/// Block until `msg` is done and return its result code. Removes it from
/// its reply port's mailbox if the reply was queued there.
pub fn wait(msg: &Message) -> i32 {
    loop {
        let me = current().filter(|td| td.is_executing());
        {
            let mut slot = msg.0.waiter.lock();
            if msg.is_done() {
                if msg.flags().contains(MsgFlags::QUEUED) {
                    if let Some(port) = msg.reply_port() {
                        port.remove(msg);
                    }
                }
                return msg.error();
            }
            match &me {
                Some(td) => {
                    *slot = Some(MsgWaiter::Context(td.clone()));
                    sleep_prepare(td);
                }
                None => *slot = Some(MsgWaiter::Host(std::thread::current())),
            }
        }
        match me {
            Some(_) => switch(),
            None => std::thread::park(),
        }
    }
}

/// Complete `msg` with `error` and send it to its reply port. Replying
/// twice, or to a message that was never submitted, is fatal.
pub fn reply(msg: &Message, error: i32) {
    let prev = msg.set_flags(MsgFlags::REPLIED);
    if prev.contains(MsgFlags::REPLIED) {
        fatal!("message {} replied twice", msg.id());
    }
    if !prev.contains(MsgFlags::INFLIGHT) {
        fatal!("reply to message {} that is not in flight", msg.id());
    }
    msg.set_error(error);
    klog_trace!("reply {} error={}", msg.id(), error);
    match msg.reply_port() {
        Some(port) => deliver(&port, msg.clone()),
        None => complete_without_port(msg),
    }
}

fn complete_without_port(msg: &Message) {
    let waiter = {
        let mut slot = msg.0.waiter.lock();
        msg.clear_flags(MsgFlags::INFLIGHT);
        msg.set_flags(MsgFlags::DONE);
        slot.take()
    };
    if let Some(waiter) = waiter {
        waiter.wake();
    }
}

/// Ask the receiver to stop early. Returns whether the request was
/// recorded; only abortable messages still in flight accept it.
pub fn abort(msg: &Message) -> bool {
    let flags = msg.flags();
    if !flags.contains(MsgFlags::INFLIGHT | MsgFlags::ABORTABLE)
        || flags.intersects(MsgFlags::DONE | MsgFlags::REPLIED)
    {
        return false;
    }
    msg.set_flags(MsgFlags::ABORT_REQ);
    true
}

/// Reply with ECANCELED if an abort was requested. Returns whether it did.
pub fn reply_if_aborted(msg: &Message) -> bool {
    if msg.abort_requested() {
        reply(msg, ECANCELED);
        true
    } else {
        false
    }
}

/// Hand an in-flight message to another port without replying. The
/// original reply port is kept.
pub fn forward(port: &PortRef, msg: &Message) {
    let flags = msg.flags();
    if !flags.contains(MsgFlags::INFLIGHT) || flags.contains(MsgFlags::REPLIED) {
        fatal!("forward of message {} that is not in flight", msg.id());
    }
    msg.clear_flags(MsgFlags::QUEUED);
    deliver(port, msg.clone());
}

/// Non-blocking dequeue.
pub fn get_port(port: &PortRef) -> Option<Message> {
    let msg = port.mbox.lock().queue.pop_front()?;
    msg.clear_flags(MsgFlags::QUEUED);
    Some(msg)
}

/// Blocking dequeue by the port's owner. Returns None once the port is
/// closed and drained.
pub fn wait_port(port: &PortRef) -> Option<Message> {
    let td = match current() {
        Some(td) if port.owner.upgrade().is_some_and(|o| Arc::ptr_eq(&o, &td)) => td,
        _ => fatal!("wait_port on port {} '{}' by a non-owner", port.id(), port.name()),
    };
    loop {
        {
            let mut mbox = port.mbox.lock();
            if let Some(msg) = mbox.queue.pop_front() {
                msg.clear_flags(MsgFlags::QUEUED);
                return Some(msg);
            }
            if port.is_closed() {
                return None;
            }
            mbox.waiting = true;
            sleep_prepare(&td);
        }
        switch();
    }
}
