//! Execution contexts.
//!
//! A [`Thread`] is the schedulable unit. Its identity is stable for its
//! lifetime and it is always owned by exactly one CPU, recorded in `cpu`;
//! that field changes only when the thread migrates itself. Queue
//! membership ([`QueueState`]) and "currently executing" are tracked
//! separately: a thread may be executing while still listed on its ready
//! queue, or off every queue while it finishes a migration.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use lwkt_abi::task::{QueueState, ThreadFlags};
use spin::Mutex;

use super::per_cpu::PerCpu;
use super::waitqueue::WaitQueue;
use crate::machine::Machine;
use crate::msgport::{Port, PortRef};
use crate::platform::{Latch, PlatformState};
use crate::sync::token::TokenSet;
use crate::syscall::Process;

pub type ThreadId = u32;
pub type ThreadRef = Arc<Thread>;

const NO_MIGRATION: usize = usize::MAX;

/// How a context leaves and enters the CPU.
pub(crate) enum SwitchKind {
    /// Save on switch-out, resume where it left off on switch-in.
    Normal,
    /// Not yet started: the first switch-in runs the entry closure.
    Bootstrap(Box<dyn FnOnce() + Send + 'static>),
    /// Switch-out hands the CPU on and never comes back.
    Exit,
}

pub struct Thread {
    id: ThreadId,
    name: String,
    machine: Arc<Machine>,
    cpu: AtomicUsize,
    priority: AtomicU8,
    queue_state: AtomicU8,
    executing: AtomicBool,
    flags: AtomicU32,
    switch_kind: Mutex<SwitchKind>,
    pub(crate) exec: PlatformState,
    pub(crate) tokens: Mutex<TokenSet>,
    serializers: AtomicU32,
    migrate_to: AtomicUsize,
    port: PortRef,
    process: Option<Arc<Process>>,
    exit_handler: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
    pub(crate) exit_waiters: WaitQueue,
    exit_latch: Latch,
}

impl Thread {
    pub(crate) fn new(
        machine: &Arc<Machine>,
        name: &str,
        cpu: usize,
        priority: u8,
        flags: ThreadFlags,
        process: Option<Arc<Process>>,
        kind: SwitchKind,
    ) -> ThreadRef {
        let id = machine.alloc_thread_id();
        Arc::new_cyclic(|weak| Thread {
            id,
            name: name.to_string(),
            machine: machine.clone(),
            cpu: AtomicUsize::new(cpu),
            priority: AtomicU8::new(priority),
            queue_state: AtomicU8::new(QueueState::NotQueued.as_u8()),
            executing: AtomicBool::new(false),
            flags: AtomicU32::new(flags.bits()),
            switch_kind: Mutex::new(kind),
            exec: PlatformState::new(),
            tokens: Mutex::new(TokenSet::new()),
            serializers: AtomicU32::new(0),
            migrate_to: AtomicUsize::new(NO_MIGRATION),
            port: Port::owned_by(machine, name, weak.clone(), cpu),
            process,
            exit_handler: Mutex::new(None),
            exit_waiters: WaitQueue::new(),
            exit_latch: Latch::new(),
        })
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// The CPU that owns this thread.
    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Release);
    }

    pub fn percpu(&self) -> &PerCpu {
        self.machine.cpu(self.cpu())
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed)
    }

    pub(crate) fn store_priority(&self, pri: u8) {
        self.priority.store(pri, Ordering::Relaxed);
    }

    #[inline]
    pub fn queue_state(&self) -> QueueState {
        QueueState::from_u8(self.queue_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_queue_state(&self, state: QueueState) {
        let prev = self.queue_state();
        if !prev.can_transition_to(state) {
            crate::fatal!(
                "context {} '{}': illegal queue transition {} -> {}",
                self.id,
                self.name,
                prev.as_str(),
                state.as_str()
            );
        }
        self.queue_state.store(state.as_u8(), Ordering::Release);
    }

    /// Atomically move off a wait structure. Only the waker that removed
    /// the thread from that structure wins.
    pub(crate) fn leave_wait_state(&self) -> bool {
        self.queue_state
            .compare_exchange(
                QueueState::OnWaitQueue.as_u8(),
                QueueState::NotQueued.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    #[inline]
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }

    pub(crate) fn set_executing(&self, on: bool) {
        self.executing.store(on, Ordering::Release);
    }

    #[inline]
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn is_idle(&self) -> bool {
        self.flags().contains(ThreadFlags::IDLE)
    }

    pub fn is_exited(&self) -> bool {
        self.flags().contains(ThreadFlags::EXITED)
    }

    /// This thread's own mailbox, the default reply port for its messages.
    pub fn port(&self) -> &PortRef {
        &self.port
    }

    pub fn process(&self) -> Option<&Arc<Process>> {
        self.process.as_ref()
    }

    /// Number of distinct tokens currently held. Diagnostic only.
    pub fn tokens_held(&self) -> usize {
        self.tokens.try_lock().map(|set| set.owned_count()).unwrap_or(0)
    }

    #[inline]
    pub fn serializers_held(&self) -> u32 {
        self.serializers.load(Ordering::Relaxed)
    }

    pub(crate) fn serializer_entered(&self) {
        self.serializers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn serializer_exited(&self) {
        self.serializers.fetch_sub(1, Ordering::Relaxed);
    }

    // --- switch kind ---

    pub(crate) fn take_bootstrap(&self) -> Option<Box<dyn FnOnce() + Send + 'static>> {
        let mut kind = self.switch_kind.lock();
        match core::mem::replace(&mut *kind, SwitchKind::Normal) {
            SwitchKind::Bootstrap(entry) => Some(entry),
            other => {
                *kind = other;
                None
            }
        }
    }

    pub(crate) fn mark_exit_switch(&self) {
        *self.switch_kind.lock() = SwitchKind::Exit;
    }

    pub(crate) fn is_exit_switch(&self) -> bool {
        matches!(*self.switch_kind.lock(), SwitchKind::Exit)
    }

    // --- migration ---

    pub(crate) fn request_migration(&self, cpu: usize) {
        self.set_flags(ThreadFlags::MIGRATING);
        self.migrate_to.store(cpu, Ordering::Release);
    }

    pub(crate) fn take_migration(&self) -> Option<usize> {
        match self.migrate_to.swap(NO_MIGRATION, Ordering::AcqRel) {
            NO_MIGRATION => None,
            cpu => Some(cpu),
        }
    }

    // --- exit ---

    pub(crate) fn store_exit_handler(&self, handler: Box<dyn FnOnce() + Send + 'static>) {
        *self.exit_handler.lock() = Some(handler);
    }

    pub(crate) fn take_exit_handler(&self) -> Option<Box<dyn FnOnce() + Send + 'static>> {
        self.exit_handler.lock().take()
    }

    pub(crate) fn exit_latch(&self) -> &Latch {
        &self.exit_latch
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("cpu", &self.cpu())
            .field("priority", &self.priority())
            .field("queue", &self.queue_state())
            .field("executing", &self.is_executing())
            .field("flags", &self.flags())
            .finish()
    }
}
