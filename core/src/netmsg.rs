//! Network-stack messages.
//!
//! A netmsg carries a dispatch function instead of relying on a passive
//! consumer: the netisr context of the receiving CPU calls it, and the
//! function decides whether to reply, forward the message along a chain
//! of CPUs, or keep it. The socket the request concerns rides along as a
//! back-reference.

use std::any::Any;
use std::ops::Deref;
use std::sync::Arc;

use lwkt_abi::error::{EOK, Errno, KResult};
use lwkt_abi::msg::{MSG_CLASS_NET, MsgFlags};

use crate::machine::Machine;
use crate::msgport::{Message, PortRef, domsg, forward, init_message, reply};
use crate::scheduler::current;

pub const NETMSG_BARRIER: u32 = MSG_CLASS_NET | 0xFF;

pub type NetHandler = fn(Message);

/// A message initialized for netisr dispatch.
#[derive(Clone, Debug)]
pub struct NetMsg(Message);

impl NetMsg {
    /// Build a netmsg. `reply_port` defaults to the caller's own port;
    /// pass the machine's done port for fire-and-forget.
    pub fn new(
        cmd: u32,
        handler: NetHandler,
        socket: Option<Arc<dyn Any + Send + Sync>>,
        reply_port: Option<&PortRef>,
    ) -> NetMsg {
        let msg = Message::new(cmd);
        netmsg_init(&msg, cmd, handler, socket, reply_port);
        NetMsg(msg)
    }

    pub fn message(&self) -> &Message {
        &self.0
    }

    pub fn into_message(self) -> Message {
        self.0
    }
}

impl Deref for NetMsg {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.0
    }
}

/// Initialize `msg` in place for netisr dispatch.
pub fn netmsg_init(
    msg: &Message,
    cmd: u32,
    handler: NetHandler,
    socket: Option<Arc<dyn Any + Send + Sync>>,
    reply_port: Option<&PortRef>,
) {
    init_message(msg, reply_port, cmd, MsgFlags::ABORTABLE);
    msg.set_dispatch(handler);
    if let Some(socket) = socket {
        msg.set_backref(socket);
    }
}

/// Socket back-reference of a netmsg, if it is a `T`.
pub fn netmsg_socket<T: Any + Send + Sync>(msg: &Message) -> Option<Arc<T>> {
    msg.backref::<T>()
}

pub fn netisr_port(machine: &Machine, cpu: usize) -> KResult<PortRef> {
    if cpu >= machine.ncpus() {
        return Err(Errno::Invalid);
    }
    machine.netisr_port(cpu).ok_or(Errno::NotConnected)
}

/// From inside a handler: pass `msg` to the next CPU's netisr. Returns
/// false on the last CPU, where the handler should reply instead.
pub fn netmsg_forward_next(msg: &Message) -> bool {
    let Some(td) = current() else {
        return false;
    };
    let next = td.cpu() + 1;
    match netisr_port(td.machine(), next) {
        Ok(port) => {
            forward(&port, msg);
            true
        }
        Err(_) => false,
    }
}

fn barrier_handler(msg: Message) {
    reply(&msg, EOK);
}

/// Wait until every netisr has drained what was queued before the call.
pub fn netisr_barrier(machine: &Arc<Machine>) -> KResult {
    for cpu in 0..machine.ncpus() {
        let port = netisr_port(machine, cpu)?;
        let msg = NetMsg::new(NETMSG_BARRIER, barrier_handler, None, machine.done_port().as_ref());
        Errno::check(domsg(&port, &msg))?;
    }
    Ok(())
}
