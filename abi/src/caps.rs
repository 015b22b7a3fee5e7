//! Capability-port constants.

use bitflags::bitflags;

use crate::msg::MSG_CLASS_CAPS;

pub const CAPS_MAXNAMELEN: usize = 32;
/// In-flight requests a single client may have outstanding.
pub const CAPS_MAXINPROG: usize = 128;
pub const CAPS_MAXGROUPS: usize = 16;

pub const CAPS_MSG_REQUEST: u32 = MSG_CLASS_CAPS | 1;

pub const CAPS_ABORT_NOTIMPL: u64 = 0;
pub const CAPS_ABORT_RETURNED: u64 = 1;
pub const CAPS_ABORT_BEFORESERVER: u64 = 2;
pub const CAPS_ABORT_ATSERVER: u64 = 3;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct CapsFlags: u32 {
        /// Clients with the service owner's uid may connect.
        const USER    = 1 << 0;
        /// Clients sharing the service owner's gid may connect.
        const GROUP   = 1 << 1;
        /// Anyone may connect.
        const WORLD   = 1 << 2;
        /// Registration fails if the name is taken.
        const EXCL    = 1 << 3;
        /// Connect waits for the service to appear.
        const WAITSVC = 1 << 4;
    }
}

/// Characters allowed in a service name.
#[inline]
pub const fn caps_name_char_ok(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'.'
}

pub fn caps_name_valid(name: &str) -> bool {
    !name.is_empty() && name.len() <= CAPS_MAXNAMELEN && name.bytes().all(caps_name_char_ok)
}
