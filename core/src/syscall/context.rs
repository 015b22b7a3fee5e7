use std::sync::Arc;

use lwkt_abi::error::{Errno, KResult};
use lwkt_abi::syscall::{SYSCALL_MAX_ARGS, syscall_number};

use super::process::Process;
use crate::msgport::Message;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyscallArgs {
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
}

impl SyscallArgs {
    pub fn from_slice(args: &[u64]) -> Self {
        let mut words = [0u64; SYSCALL_MAX_ARGS];
        for (slot, value) in words.iter_mut().zip(args) {
            *slot = *value;
        }
        Self::from_words(words)
    }

    pub const fn from_words(words: [u64; SYSCALL_MAX_ARGS]) -> Self {
        Self {
            arg0: words[0],
            arg1: words[1],
            arg2: words[2],
            arg3: words[3],
        }
    }

    pub const fn words(&self) -> [u64; SYSCALL_MAX_ARGS] {
        [self.arg0, self.arg1, self.arg2, self.arg3]
    }
}

/// What a handler sees of the request it is serving.
pub struct SyscallContext {
    msg: Message,
    number: u32,
    args: SyscallArgs,
    process: Option<Arc<Process>>,
}

impl SyscallContext {
    pub fn new(msg: &Message) -> Self {
        Self {
            number: syscall_number(msg.cmd()),
            args: SyscallArgs::from_words(msg.payload().words()),
            process: msg.backref::<Process>(),
            msg: msg.clone(),
        }
    }

    #[inline]
    pub fn number(&self) -> u32 {
        self.number
    }

    #[inline]
    pub fn args(&self) -> SyscallArgs {
        self.args
    }

    pub fn msg(&self) -> &Message {
        &self.msg
    }

    pub fn process(&self) -> Option<&Arc<Process>> {
        self.process.as_ref()
    }

    /// The calling process; kernel-originated calls have none.
    pub fn require_process(&self) -> KResult<&Arc<Process>> {
        self.process.as_ref().ok_or(Errno::NotPermitted)
    }

    /// Long-running handlers poll this at each step.
    pub fn check_abort(&self) -> KResult {
        if self.msg.abort_requested() {
            Err(Errno::Interrupted)
        } else {
            Ok(())
        }
    }
}
