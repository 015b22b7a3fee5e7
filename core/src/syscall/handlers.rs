use std::time::{Duration, Instant};

use lwkt_abi::caps::CAPS_ABORT_NOTIMPL;
use lwkt_abi::error::Errno;
use lwkt_abi::syscall::{
    SYS_CAPS_ABORT, SYS_ECHO, SYS_GETCPU, SYS_GETPID, SYS_SLEEP, SYS_SUM, SYS_YIELD,
    SYSCALL_TABLE_SIZE,
};

use super::common::SyscallEntry;
use super::context::SyscallContext;
use crate::scheduler::{current, current_cpu, preempt_point, yield_now};

/// Length of one `sleep` tick.
pub const SYS_TICK: Duration = Duration::from_millis(1);

const SLEEP_POLL: Duration = Duration::from_micros(200);

define_syscall!(syscall_getpid(ctx, args) requires(let process) {
    Ok(u64::from(process.pid()))
});

define_syscall!(syscall_yield(ctx, args) {
    yield_now();
    Ok(0)
});

define_syscall!(syscall_echo(ctx, args) {
    Ok(args.arg0)
});

define_syscall!(syscall_sleep(ctx, args) {
    for _ in 0..args.arg0 {
        ctx.check_abort()?;
        sleep_tick(ctx)?;
    }
    Ok(0)
});

define_syscall!(syscall_sum(ctx, args) {
    Ok(args.words().iter().fold(0u64, |acc, v| acc.wrapping_add(*v)))
});

define_syscall!(syscall_caps_abort(ctx, args) {
    Ok(CAPS_ABORT_NOTIMPL)
});

define_syscall!(syscall_getcpu(ctx, args) {
    current_cpu().map(|cpu| cpu as u64).ok_or(Errno::Invalid)
});

/// Let one tick pass, yielding the CPU to anything ready meanwhile.
fn sleep_tick(ctx: &SyscallContext) -> Result<(), Errno> {
    let deadline = Instant::now() + SYS_TICK;
    loop {
        ctx.check_abort()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        preempt_point();
        match current() {
            Some(td) if td.percpu().has_ready() => yield_now(),
            _ => std::thread::sleep(SLEEP_POLL.min(deadline - now)),
        }
    }
}

static SYSCALL_TABLE: [SyscallEntry; SYSCALL_TABLE_SIZE] = {
    let mut table = [SyscallEntry::EMPTY; SYSCALL_TABLE_SIZE];
    table[SYS_GETPID as usize] = SyscallEntry {
        handler: Some(syscall_getpid),
        name: "getpid",
    };
    table[SYS_YIELD as usize] = SyscallEntry {
        handler: Some(syscall_yield),
        name: "yield",
    };
    table[SYS_ECHO as usize] = SyscallEntry {
        handler: Some(syscall_echo),
        name: "echo",
    };
    table[SYS_SLEEP as usize] = SyscallEntry {
        handler: Some(syscall_sleep),
        name: "sleep",
    };
    table[SYS_SUM as usize] = SyscallEntry {
        handler: Some(syscall_sum),
        name: "sum",
    };
    table[SYS_CAPS_ABORT as usize] = SyscallEntry {
        handler: Some(syscall_caps_abort),
        name: "caps_abort",
    };
    table[SYS_GETCPU as usize] = SyscallEntry {
        handler: Some(syscall_getcpu),
        name: "getcpu",
    };
    table
};

/// Table entry for `sysno`, or None past the end of the table.
pub fn syscall_lookup(sysno: u32) -> Option<&'static SyscallEntry> {
    SYSCALL_TABLE.get(sysno as usize)
}
