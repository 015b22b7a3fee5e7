//! Creating, joining and leaving execution contexts.

use std::any::Any;
use std::sync::Arc;

use lwkt_abi::error::{Errno, KResult};
use lwkt_abi::task::{PRI_KERN, THREAD_NAME_MAX_LEN, ThreadFlags, priority_is_valid};
use lwkt_lib::{klog_debug, klog_warn};
use spin::Mutex;

use super::lifecycle::{self, ExitUnwind};
use super::scheduler::{current, current_cpu_on, curthread, schedule};
use super::thread::{SwitchKind, Thread, ThreadRef};
use crate::machine::Machine;
use crate::syscall::Process;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinError {
    /// The entry function panicked.
    Panicked,
    /// The context left through [`exit`] before producing a value.
    Exited,
}

impl core::fmt::Display for JoinError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Panicked => f.write_str("context panicked"),
            Self::Exited => f.write_str("context exited without a value"),
        }
    }
}

pub struct ThreadBuilder {
    name: String,
    cpu: Option<usize>,
    priority: u8,
    flags: ThreadFlags,
    process: Option<Arc<Process>>,
}

impl ThreadBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cpu: None,
            priority: PRI_KERN,
            flags: ThreadFlags::empty(),
            process: None,
        }
    }

    /// Owning CPU. Defaults to the caller's CPU, or round-robin for host
    /// callers.
    pub fn cpu(mut self, cpu: usize) -> Self {
        self.cpu = Some(cpu);
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn process(mut self, process: Arc<Process>) -> Self {
        self.process = Some(process);
        self
    }

    pub(crate) fn flags(mut self, flags: ThreadFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Create the context and schedule it. It starts through the bootstrap
    /// switch the first time its CPU picks it.
    pub fn spawn<F, T>(self, machine: &Arc<Machine>, entry: F) -> KResult<ThreadHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.name.is_empty() || self.name.len() > THREAD_NAME_MAX_LEN {
            return Err(Errno::Invalid);
        }
        if !priority_is_valid(self.priority) {
            return Err(Errno::Invalid);
        }
        if machine.is_shutting_down() {
            return Err(Errno::NotConnected);
        }
        let cpu = match self.cpu {
            Some(cpu) if cpu >= machine.ncpus() => return Err(Errno::Invalid),
            Some(cpu) => cpu,
            None => current_cpu_on(machine).unwrap_or_else(|| machine.next_cpu()),
        };

        let result: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let slot = result.clone();
        let bootstrap = Box::new(move || {
            let value = entry();
            *slot.lock() = Some(value);
        });

        let td = Thread::new(
            machine,
            &self.name,
            cpu,
            self.priority,
            self.flags,
            self.process,
            SwitchKind::Bootstrap(bootstrap),
        );
        let host = td.clone();
        std::thread::Builder::new()
            .name(format!("lwkt-{}", self.name))
            .spawn(move || lifecycle::trampoline(host))
            .map_err(|err| {
                klog_warn!("spawn '{}': host thread creation failed: {}", self.name, err);
                td.port().close();
                Errno::NoBuffers
            })?;

        machine.context_started();
        klog_debug!(
            "spawned context {} '{}' on cpu {} pri {}",
            td.id(),
            td.name(),
            cpu,
            td.priority()
        );
        schedule(&td);
        Ok(ThreadHandle { td, result })
    }
}

/// Owned permission to join a context and collect its value.
pub struct ThreadHandle<T> {
    td: ThreadRef,
    result: Arc<Mutex<Option<T>>>,
}

impl<T> ThreadHandle<T> {
    pub fn thread(&self) -> &ThreadRef {
        &self.td
    }

    pub fn is_finished(&self) -> bool {
        self.td.is_exited()
    }

    /// Wait for the context to exit. A context caller blocks through the
    /// scheduler; a host caller blocks on the exit latch.
    pub fn join(self) -> Result<T, JoinError> {
        wait_exit(&self.td);
        if self.td.flags().contains(ThreadFlags::PANICKED) {
            return Err(JoinError::Panicked);
        }
        self.result.lock().take().ok_or(JoinError::Exited)
    }
}

pub(crate) fn wait_exit(td: &ThreadRef) {
    match current() {
        Some(me) if me.is_executing() => {
            if Arc::ptr_eq(&me, td) {
                fatal!("context {} '{}' joined itself", td.id(), td.name());
            }
            td.exit_waiters.wait_event(|| td.is_exited());
        }
        _ => td.exit_latch().wait(),
    }
}

/// Leave the calling context. Unwinds its entry function, then takes the
/// exit path.
pub fn exit() -> ! {
    let td = curthread();
    klog_debug!("context {} '{}' exiting", td.id(), td.name());
    drop(td);
    let payload: Box<dyn Any + Send> = Box::new(ExitUnwind);
    std::panic::resume_unwind(payload)
}

/// Install a function to run on the calling context when it exits.
pub fn set_exit_handler<F>(handler: F)
where
    F: FnOnce() + Send + 'static,
{
    curthread().store_exit_handler(Box::new(handler));
}
