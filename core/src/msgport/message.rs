//! Request/reply envelopes.
//!
//! A [`Message`] is a shared handle: the sender keeps one clone, the
//! receiver gets another. Between `submit` and its reply the message is
//! in flight and belongs to the receiver; the sender must not resubmit it.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use lwkt_abi::error::{EOK, Errno, KResult};
use lwkt_abi::msg::{MsgFlags, MsgHeader, MsgPayload, NULL_PORT_ID};
use spin::Mutex;

use super::port::PortRef;
use crate::machine::Machine;
use crate::scheduler::ThreadRef;
use crate::scheduler::scheduler::wakeup;

static NEXT_MSG_ID: AtomicU64 = AtomicU64::new(1);

/// What the receiving dispatcher runs for a message.
pub enum MsgHandler {
    /// Passive message; the port owner consumes it.
    None,
    /// Persistent dispatch function. It is responsible for the reply.
    Dispatch(fn(Message)),
    /// One-shot closure; the dispatcher replies with its return code.
    Once(Box<dyn FnOnce(&Message) -> i32 + Send + 'static>),
}

/// Who is blocked in `wait` on a message.
pub(crate) enum MsgWaiter {
    Context(ThreadRef),
    Host(std::thread::Thread),
}

impl MsgWaiter {
    pub(crate) fn wake(self) {
        match self {
            Self::Context(td) => {
                wakeup(&td);
            }
            Self::Host(thread) => thread.unpark(),
        }
    }
}

pub(crate) struct MsgInner {
    id: u64,
    cmd: AtomicU32,
    flags: AtomicU32,
    error: AtomicI32,
    payload: Mutex<MsgPayload>,
    reply_port: Mutex<Option<PortRef>>,
    handler: Mutex<MsgHandler>,
    attachment: Mutex<Option<Box<dyn Any + Send>>>,
    backref: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    /// Completion interlock. DONE is set and the waiter taken under it.
    pub(crate) waiter: Mutex<Option<MsgWaiter>>,
}

#[derive(Clone)]
pub struct Message(pub(crate) Arc<MsgInner>);

impl Message {
    pub fn new(cmd: u32) -> Self {
        Self(Arc::new(MsgInner {
            id: NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed),
            cmd: AtomicU32::new(cmd),
            flags: AtomicU32::new(MsgFlags::DONE.bits()),
            error: AtomicI32::new(EOK),
            payload: Mutex::new(MsgPayload::zeroed()),
            reply_port: Mutex::new(None),
            handler: Mutex::new(MsgHandler::None),
            attachment: Mutex::new(None),
            backref: Mutex::new(None),
            waiter: Mutex::new(None),
        }))
    }

    pub fn with_payload(cmd: u32, payload: MsgPayload) -> Self {
        let msg = Self::new(cmd);
        msg.set_payload(payload);
        msg
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn same(&self, other: &Message) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    #[inline]
    pub fn cmd(&self) -> u32 {
        self.0.cmd.load(Ordering::Acquire)
    }

    pub fn set_cmd(&self, cmd: u32) {
        self.0.cmd.store(cmd, Ordering::Release);
    }

    #[inline]
    pub fn flags(&self) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.0.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: MsgFlags) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.0.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    pub(crate) fn clear_flags(&self, flags: MsgFlags) {
        self.0.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn store_flags(&self, flags: MsgFlags) {
        self.0.flags.store(flags.bits(), Ordering::Release);
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.flags().contains(MsgFlags::DONE)
    }

    #[inline]
    pub fn is_inflight(&self) -> bool {
        self.flags().contains(MsgFlags::INFLIGHT)
    }

    /// Receivers poll this at their safe points.
    #[inline]
    pub fn abort_requested(&self) -> bool {
        self.flags().contains(MsgFlags::ABORT_REQ)
    }

    /// Raw result code; 0 is success.
    #[inline]
    pub fn error(&self) -> i32 {
        self.0.error.load(Ordering::Acquire)
    }

    pub fn result(&self) -> KResult {
        Errno::check(self.error())
    }

    pub(crate) fn set_error(&self, error: i32) {
        self.0.error.store(error, Ordering::Release);
    }

    pub fn payload(&self) -> MsgPayload {
        *self.0.payload.lock()
    }

    pub fn set_payload(&self, payload: MsgPayload) {
        *self.0.payload.lock() = payload;
    }

    pub fn update_payload<R>(&self, f: impl FnOnce(&mut MsgPayload) -> R) -> R {
        f(&mut self.0.payload.lock())
    }

    pub fn reply_port(&self) -> Option<PortRef> {
        self.0.reply_port.lock().clone()
    }

    pub(crate) fn set_reply_port(&self, port: Option<PortRef>) {
        *self.0.reply_port.lock() = port;
    }

    // --- dispatch ---

    pub fn set_dispatch(&self, handler: fn(Message)) {
        *self.0.handler.lock() = MsgHandler::Dispatch(handler);
    }

    pub fn set_oneshot<F>(&self, handler: F)
    where
        F: FnOnce(&Message) -> i32 + Send + 'static,
    {
        *self.0.handler.lock() = MsgHandler::Once(Box::new(handler));
    }

    /// Take the handler for one dispatch. Persistent handlers stay.
    pub(crate) fn take_handler(&self) -> MsgHandler {
        let mut handler = self.0.handler.lock();
        match &*handler {
            MsgHandler::Dispatch(f) => MsgHandler::Dispatch(*f),
            MsgHandler::None => MsgHandler::None,
            MsgHandler::Once(_) => core::mem::replace(&mut *handler, MsgHandler::None),
        }
    }

    // --- out-of-line data ---

    pub fn set_attachment<T: Any + Send>(&self, value: T) {
        *self.0.attachment.lock() = Some(Box::new(value));
    }

    pub fn take_attachment<T: Any + Send>(&self) -> Option<T> {
        let boxed = self.0.attachment.lock().take()?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                *self.0.attachment.lock() = Some(other);
                None
            }
        }
    }

    pub fn set_backref(&self, backref: Arc<dyn Any + Send + Sync>) {
        *self.0.backref.lock() = Some(backref);
    }

    pub fn backref<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let backref = self.0.backref.lock().clone()?;
        backref.downcast::<T>().ok()
    }

    // --- layout-stable header ---

    pub fn to_header(&self) -> MsgHeader {
        let reply = self.reply_port().map_or(NULL_PORT_ID, |p| p.id());
        let mut header = MsgHeader::new(self.cmd(), self.flags(), reply);
        header.error = self.error();
        header.payload = self.payload();
        header
    }

    /// Build a fresh, not-in-flight message from a header. The reply port
    /// is resolved through `machine`'s port table.
    pub fn from_header(machine: &Machine, header: &MsgHeader) -> Message {
        let msg = Message::new(header.cmd);
        let flags = header.msg_flags() & lwkt_abi::msg::MSGF_INIT_MASK;
        msg.store_flags(flags | MsgFlags::DONE);
        msg.set_error(header.error);
        msg.set_payload(header.payload);
        if header.reply_port != NULL_PORT_ID {
            msg.set_reply_port(machine.lookup_port(header.reply_port));
        }
        msg
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id())
            .field("cmd", &format_args!("{:#x}", self.cmd()))
            .field("flags", &self.flags())
            .field("error", &self.error())
            .finish()
    }
}
