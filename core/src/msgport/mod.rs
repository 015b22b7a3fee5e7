//! Port/message IPC.

pub mod message;
pub mod port;
pub mod service;

#[cfg(test)]
mod msgport_tests;

pub use message::{Message, MsgHandler};
pub use port::{
    Port, PortKind, PortRef, abort, domsg, forward, get_port, init_message, reply,
    reply_if_aborted, sendmsg, submit, wait, wait_port,
};
pub use service::dispatch;
