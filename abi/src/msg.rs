//! In-memory message layout.
//!
//! [`MsgHeader`] is the layout-stable envelope exchanged between a sender
//! and a receiver that may live in separately compiled subsystems. The
//! core keeps its own live representation and converts to and from this
//! header at that boundary.

use bitflags::bitflags;
use core::mem::{offset_of, size_of};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct MsgFlags: u32 {
        /// Completed and owned by the sender again.
        const DONE       = 1 << 0;
        /// A reply was issued for the current submission.
        const REPLIED    = 1 << 1;
        /// Submitted and not yet replied.
        const INFLIGHT   = 1 << 2;
        /// Sender does not wait; the reply lands on the reply port.
        const ASYNC      = 1 << 3;
        /// Sender asked the receiver to stop early.
        const ABORT_REQ  = 1 << 4;
        /// Receiver honors abort requests for this message.
        const ABORTABLE  = 1 << 5;
        /// Sitting in a port mailbox.
        const QUEUED     = 1 << 6;
    }
}

/// Flags a sender may set at initialization time.
pub const MSGF_INIT_MASK: MsgFlags = MsgFlags::ASYNC.union(MsgFlags::ABORTABLE);

// --- Command classes ---
//
// The top byte of a command identifies the protocol that owns it.

pub const MSG_CLASS_MASK: u32 = 0xFF00_0000;
pub const MSG_CLASS_USER: u32 = 0x0000_0000;
pub const MSG_CLASS_SYSCALL: u32 = 0x0100_0000;
pub const MSG_CLASS_NET: u32 = 0x0200_0000;
pub const MSG_CLASS_CPU: u32 = 0x0300_0000;
pub const MSG_CLASS_CAPS: u32 = 0x0400_0000;

#[inline]
pub const fn msg_class(cmd: u32) -> u32 {
    cmd & MSG_CLASS_MASK
}

pub const MSG_PAYLOAD_WORDS: usize = 4;

/// Inline payload. All variants are plain integers, so every bit pattern
/// is valid for every view.
#[repr(C)]
#[derive(Clone, Copy)]
pub union MsgPayload {
    pub words: [u64; MSG_PAYLOAD_WORDS],
    pub result64: u64,
    pub result32: i32,
    pub fds: [i32; 2],
    pub addr: usize,
}

#[allow(unsafe_code)]
impl MsgPayload {
    pub const fn zeroed() -> Self {
        Self {
            words: [0; MSG_PAYLOAD_WORDS],
        }
    }

    pub const fn from_words(words: [u64; MSG_PAYLOAD_WORDS]) -> Self {
        Self { words }
    }

    #[inline]
    pub const fn words(&self) -> [u64; MSG_PAYLOAD_WORDS] {
        // SAFETY: every field is an integer array or integer overlaying the
        // same 32 bytes; any bit pattern is a valid [u64; 4].
        unsafe { self.words }
    }

    #[inline]
    pub const fn result64(&self) -> u64 {
        // SAFETY: see `words`.
        unsafe { self.result64 }
    }

    #[inline]
    pub fn set_result64(&mut self, value: u64) {
        let mut words = self.words();
        words[0] = value;
        self.words = words;
    }
}

impl Default for MsgPayload {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl core::fmt::Debug for MsgPayload {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("MsgPayload").field(&self.words()).finish()
    }
}

/// Reply-port reference inside a header. Zero means "no reply port".
pub type PortId = u64;
pub const NULL_PORT_ID: PortId = 0;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgHeader {
    pub cmd: u32,
    pub flags: u32,
    pub error: i32,
    pub reserved: u32,
    pub reply_port: PortId,
    pub payload: MsgPayload,
}

impl MsgHeader {
    pub const fn new(cmd: u32, flags: MsgFlags, reply_port: PortId) -> Self {
        Self {
            cmd,
            flags: flags.bits(),
            error: 0,
            reserved: 0,
            reply_port,
            payload: MsgPayload::zeroed(),
        }
    }

    #[inline]
    pub const fn msg_flags(&self) -> MsgFlags {
        MsgFlags::from_bits_truncate(self.flags)
    }
}

pub const MSG_HEADER_CMD_OFFSET: usize = 0;
pub const MSG_HEADER_FLAGS_OFFSET: usize = 4;
pub const MSG_HEADER_ERROR_OFFSET: usize = 8;
pub const MSG_HEADER_REPLY_PORT_OFFSET: usize = 16;
pub const MSG_HEADER_PAYLOAD_OFFSET: usize = 24;
pub const MSG_HEADER_SIZE: usize = 56;

const _: () = {
    assert!(offset_of!(MsgHeader, cmd) == MSG_HEADER_CMD_OFFSET);
    assert!(offset_of!(MsgHeader, flags) == MSG_HEADER_FLAGS_OFFSET);
    assert!(offset_of!(MsgHeader, error) == MSG_HEADER_ERROR_OFFSET);
    assert!(offset_of!(MsgHeader, reply_port) == MSG_HEADER_REPLY_PORT_OFFSET);
    assert!(offset_of!(MsgHeader, payload) == MSG_HEADER_PAYLOAD_OFFSET);
    assert!(size_of::<MsgPayload>() == 32);
    assert!(size_of::<MsgHeader>() == MSG_HEADER_SIZE);
};
