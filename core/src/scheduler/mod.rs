pub mod ipiq;
pub mod kthread;
pub(crate) mod lifecycle;
pub mod per_cpu;
pub mod scheduler;
pub mod thread;
pub mod waitqueue;

#[cfg(test)]
mod sched_tests;

pub use kthread::{JoinError, ThreadBuilder, ThreadHandle, exit, set_exit_handler};
pub use per_cpu::{CpuStatsSnapshot, PendingFlags, PerCpu};
pub use scheduler::{
    current, current_cpu, curthread, deschedule, deschedule_self, in_context, migrate_self,
    need_resched, preempt_point, request_preempt, schedule, schedule_self, send_ipiq,
    set_priority, switch, yield_now,
};
pub use thread::{Thread, ThreadId, ThreadRef};
pub use waitqueue::WaitQueue;
