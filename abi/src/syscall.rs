//! Message-based syscall numbers.
//!
//! A syscall is a message whose command is `MSG_CLASS_SYSCALL | number`.
//! Arguments ride in the inline payload words; the result comes back in
//! `result64` and the error field.

use crate::msg::MSG_CLASS_SYSCALL;

/// Reserved. Always answers "not supported".
pub const SYS_NOSYS: u32 = 0;
pub const SYS_GETPID: u32 = 1;
pub const SYS_YIELD: u32 = 2;
/// Returns its first argument.
pub const SYS_ECHO: u32 = 3;
/// Yields `arg0` times, checking for abort between each.
pub const SYS_SLEEP: u32 = 4;
/// Returns the sum of the four argument words.
pub const SYS_SUM: u32 = 5;
/// Capability message abort. Not implemented; returns `CAPS_ABORT_NOTIMPL`.
pub const SYS_CAPS_ABORT: u32 = 6;
/// Returns the CPU the call was dispatched on.
pub const SYS_GETCPU: u32 = 7;

/// Size of the syscall table. Numbers at or past this answer ENOSYS.
pub const SYSCALL_TABLE_SIZE: usize = 16;

/// Number of argument words carried inline.
pub const SYSCALL_MAX_ARGS: usize = 4;

#[inline]
pub const fn syscall_cmd(number: u32) -> u32 {
    MSG_CLASS_SYSCALL | number
}

#[inline]
pub const fn syscall_number(cmd: u32) -> u32 {
    cmd & !crate::msg::MSG_CLASS_MASK
}
