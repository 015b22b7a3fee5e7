//! Lightweight kernel threads: a per-CPU cooperative scheduler with tokens,
//! serializers and message ports, plus the protocols built on top of them
//! (syscall messages, netmsg, the per-CPU helper and CAPS).
//!
//! Everything hangs off a [`Machine`], booted with [`Machine::boot`].

#[macro_use]
pub mod fatal;

pub mod caps;
pub mod cpuhelper;
pub mod machine;
pub mod msgport;
pub mod netmsg;
pub mod platform;
pub mod scheduler;
pub mod sync;
#[macro_use]
pub mod syscall;

#[cfg(test)]
mod test_fixture;

pub use caps::{CapsClient, CapsService};
pub use machine::{Machine, MachineStats};
pub use msgport::{Message, Port, PortRef};
pub use scheduler::scheduler as sched;
pub use scheduler::{ThreadBuilder, ThreadHandle, ThreadRef};
pub use sync::{Serializer, Token};
