//! Processes as seen by the syscall layer: credentials and the list of
//! asynchronous syscall messages still owed a reap.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lwkt_abi::caps::CAPS_MAXGROUPS;
use lwkt_abi::error::{Errno, KResult};
use lwkt_lib::{klog_debug, klog_warn};
use spin::Mutex;

use super::dispatch::sysmsg_result;
use crate::machine::Machine;
use crate::msgport::{Message, Port, PortRef, abort, wait};
use crate::scheduler::WaitQueue;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Cred {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn user(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    pub fn with_groups(mut self, groups: &[u32]) -> Self {
        self.groups = groups.iter().copied().take(CAPS_MAXGROUPS).collect();
        self
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// A reaped asynchronous syscall.
#[derive(Debug)]
pub struct SysCompletion {
    pub msg: Message,
    pub result: KResult<u64>,
}

pub struct Process {
    pid: u32,
    cred: Cred,
    machine: Arc<Machine>,
    sysmsgs: Mutex<Vec<Message>>,
    completion_port: PortRef,
    completions: WaitQueue,
    exiting: AtomicBool,
}

/// Completion callback of every process's async reply port.
fn sysmsg_completed(msg: &Message) {
    if let Some(process) = msg.backref::<Process>() {
        process.completions.wake_all();
    }
}

impl Process {
    pub fn new(machine: &Arc<Machine>, cred: Cred) -> Arc<Process> {
        let pid = machine.alloc_pid();
        let completion_port = Port::reply_fn(
            machine,
            &format!("sysmsg{}", pid),
            crate::scheduler::current_cpu().unwrap_or(0),
            sysmsg_completed,
        );
        klog_debug!("process {} created uid={} gid={}", pid, cred.uid, cred.gid);
        Arc::new(Process {
            pid,
            cred,
            machine: machine.clone(),
            sysmsgs: Mutex::new(Vec::new()),
            completion_port,
            completions: WaitQueue::new(),
            exiting: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn cred(&self) -> &Cred {
        &self.cred
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::Acquire)
    }

    pub(crate) fn completion_port(&self) -> &PortRef {
        &self.completion_port
    }

    /// In-flight plus unreaped asynchronous messages.
    pub fn outstanding(&self) -> usize {
        self.sysmsgs.lock().len()
    }

    /// Record an asynchronous message, enforcing the per-process cap.
    pub(crate) fn track(&self, msg: &Message) -> KResult {
        if self.is_exiting() {
            return Err(Errno::NotConnected);
        }
        let mut list = self.sysmsgs.lock();
        if list.len() >= self.machine.config().max_sysmsg {
            return Err(Errno::TooBig);
        }
        list.push(msg.clone());
        Ok(())
    }

    pub(crate) fn untrack(&self, msg: &Message) {
        self.sysmsgs.lock().retain(|m| !m.same(msg));
    }

    /// Collect every completed asynchronous syscall.
    pub fn reap(&self) -> Vec<SysCompletion> {
        let mut list = self.sysmsgs.lock();
        let mut done = Vec::new();
        list.retain(|msg| {
            if msg.is_done() {
                done.push(msg.clone());
                false
            } else {
                true
            }
        });
        drop(list);
        done.into_iter()
            .map(|msg| SysCompletion {
                result: sysmsg_result(&msg),
                msg,
            })
            .collect()
    }

    /// Block until `msg` completes, then reap it.
    pub fn wait_sysmsg(&self, msg: &Message) -> KResult<u64> {
        if !self.sysmsgs.lock().iter().any(|m| m.same(msg)) {
            return Err(Errno::NoEntry);
        }
        self.completions.wait_event(|| msg.is_done());
        self.untrack(msg);
        sysmsg_result(msg)
    }

    /// Tear the process down: abort every in-flight asynchronous message
    /// and wait until all of them are back. Returns how many were drained.
    pub fn teardown(&self) -> usize {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let pending: Vec<Message> = self.sysmsgs.lock().drain(..).collect();
        for msg in &pending {
            if !msg.is_done() {
                abort(msg);
            }
        }
        for msg in &pending {
            wait(msg);
        }
        if !pending.is_empty() {
            klog_warn!("process {}: drained {} async syscall(s)", self.pid, pending.len());
        }
        self.completion_port.close();
        pending.len()
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("cred", &self.cred)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
