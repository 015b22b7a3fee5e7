//! Per-CPU scheduler state.
//!
//! Each logical CPU owns one [`PerCpu`]: its banded ready queue, its
//! current-context pointer, its idle context and its inbound IPI queue.
//! Everything except the pending-request word is written only by code
//! executing on that CPU (directly, or inside an IPI function it drains).
//! Other CPUs reach it through [`IpiQueue`] and the atomic
//! [`PendingFlags`] word.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use lwkt_abi::task::{NUM_PRIORITY_LEVELS, QueueState};
use spin::{Mutex, Once};

use super::ipiq::IpiQueue;
use super::thread::ThreadRef;
use crate::msgport::PortRef;
use crate::platform::Parker;

bitflags! {
    /// Requests posted to a CPU. Set by anyone, cleared by the owner.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PendingFlags: u32 {
        /// Run the scheduler at the next safe point.
        const RESCHED = 1 << 0;
        /// The IPI queue has work.
        const IPIQ    = 1 << 1;
    }
}

const IDLE_PARK_TIMEOUT: Duration = Duration::from_millis(10);

pub(crate) struct RunQueue {
    bands: [VecDeque<ThreadRef>; NUM_PRIORITY_LEVELS],
}

impl RunQueue {
    fn new() -> Self {
        Self {
            bands: core::array::from_fn(|_| VecDeque::new()),
        }
    }

    pub(crate) fn push(&mut self, td: ThreadRef) {
        let band = (td.priority() as usize).min(NUM_PRIORITY_LEVELS - 1);
        self.bands[band].push_back(td);
    }

    /// Highest-priority ready context, oldest first within a band.
    pub(crate) fn pop_highest(&mut self) -> Option<ThreadRef> {
        self.bands.iter_mut().find_map(VecDeque::pop_front)
    }

    pub(crate) fn remove(&mut self, td: &ThreadRef) -> bool {
        for band in self.bands.iter_mut() {
            if let Some(pos) = band.iter().position(|t| t.id() == td.id()) {
                band.remove(pos);
                return true;
            }
        }
        false
    }

    pub(crate) fn len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }

    fn drain_all(&mut self) -> Vec<ThreadRef> {
        self.bands.iter_mut().flat_map(|b| b.drain(..)).collect()
    }
}

#[derive(Default)]
pub struct CpuStats {
    pub switches: AtomicU64,
    pub yields: AtomicU64,
    pub preemptions: AtomicU64,
    pub token_contentions: AtomicU64,
    pub messages_delivered: AtomicU64,
}

/// Point-in-time copy of one CPU's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuStatsSnapshot {
    pub cpu: usize,
    pub switches: u64,
    pub yields: u64,
    pub preemptions: u64,
    pub token_contentions: u64,
    pub messages_delivered: u64,
    pub ipis_sent: u64,
    pub ipis_processed: u64,
    pub ready: usize,
}

/// Per-CPU service ports, created at boot.
#[derive(Default)]
pub(crate) struct ServicePorts {
    pub cpuhelper: Once<PortRef>,
    pub netisr: Once<PortRef>,
    pub syscall: Once<PortRef>,
}

/// Keeps the nesting count balanced if an IPI function unwinds.
struct IpiNesting<'a>(&'a AtomicU32);

impl<'a> IpiNesting<'a> {
    fn enter(count: &'a AtomicU32) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for IpiNesting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[repr(C, align(64))]
pub struct PerCpu {
    cpu_id: usize,
    runq: Mutex<RunQueue>,
    ready: AtomicUsize,
    current: Mutex<Option<ThreadRef>>,
    idle: Mutex<Option<ThreadRef>>,
    pending: AtomicU32,
    ipi_nesting: AtomicU32,
    pub(crate) ipiq: IpiQueue,
    idle_parker: Parker,
    pub stats: CpuStats,
    pub(crate) services: ServicePorts,
}

impl PerCpu {
    pub(crate) fn new(cpu_id: usize, ipiq_depth: usize) -> Self {
        Self {
            cpu_id,
            runq: Mutex::new(RunQueue::new()),
            ready: AtomicUsize::new(0),
            current: Mutex::new(None),
            idle: Mutex::new(None),
            pending: AtomicU32::new(0),
            ipi_nesting: AtomicU32::new(0),
            ipiq: IpiQueue::new(ipiq_depth),
            idle_parker: Parker::new(),
            stats: CpuStats::default(),
            services: ServicePorts::default(),
        }
    }

    #[inline]
    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    // --- ready queue (owner only) ---

    /// Enqueue `td` at the tail of its band. Returns false if it was
    /// already queued.
    pub(crate) fn enqueue(&self, td: &ThreadRef) -> bool {
        let mut rq = self.runq.lock();
        if td.queue_state() == QueueState::OnRunQueue {
            return false;
        }
        td.set_queue_state(QueueState::OnRunQueue);
        rq.push(td.clone());
        self.ready.store(rq.len(), Ordering::Relaxed);
        true
    }

    /// Remove `td` if it is on this ready queue.
    pub(crate) fn dequeue(&self, td: &ThreadRef) -> bool {
        let mut rq = self.runq.lock();
        if td.queue_state() != QueueState::OnRunQueue {
            return false;
        }
        let removed = rq.remove(td);
        if removed {
            td.set_queue_state(QueueState::NotQueued);
        }
        self.ready.store(rq.len(), Ordering::Relaxed);
        removed
    }

    /// Take the next context to run, marking it not queued.
    pub(crate) fn pick_next(&self) -> Option<ThreadRef> {
        let mut rq = self.runq.lock();
        let next = rq.pop_highest();
        if let Some(td) = &next {
            td.set_queue_state(QueueState::NotQueued);
        }
        self.ready.store(rq.len(), Ordering::Relaxed);
        next
    }

    /// Run `f` with the ready queue locked. Lock order: any wait structure
    /// first, then the ready queue.
    pub(crate) fn with_runq<R>(&self, f: impl FnOnce(&mut RunQueue) -> R) -> R {
        let mut rq = self.runq.lock();
        let r = f(&mut rq);
        self.ready.store(rq.len(), Ordering::Relaxed);
        r
    }

    #[inline]
    pub fn ready_count(&self) -> usize {
        self.ready.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn has_ready(&self) -> bool {
        self.ready_count() > 0
    }

    // --- current / idle ---

    pub fn current(&self) -> Option<ThreadRef> {
        self.current.lock().clone()
    }

    pub(crate) fn set_current(&self, td: Option<ThreadRef>) {
        *self.current.lock() = td;
    }

    pub(crate) fn set_idle(&self, td: ThreadRef) {
        *self.idle.lock() = Some(td);
    }

    pub fn idle(&self) -> Option<ThreadRef> {
        self.idle.lock().clone()
    }

    // --- pending requests (any CPU) ---

    #[inline]
    pub fn pending(&self) -> PendingFlags {
        PendingFlags::from_bits_truncate(self.pending.load(Ordering::Acquire))
    }

    #[inline]
    pub fn post(&self, flags: PendingFlags) {
        self.pending.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear and report whether any of `flags` were set. Owner only.
    #[inline]
    pub(crate) fn take(&self, flags: PendingFlags) -> bool {
        let prev = self.pending.fetch_and(!flags.bits(), Ordering::AcqRel);
        prev & flags.bits() != 0
    }

    /// Wake the CPU if it is sitting in its idle loop.
    #[inline]
    pub(crate) fn kick(&self) {
        self.idle_parker.unpark();
    }

    pub(crate) fn idle_park(&self) {
        self.idle_parker.park_timeout(IDLE_PARK_TIMEOUT);
    }

    // --- IPI servicing ---

    #[inline]
    pub fn ipi_nesting(&self) -> u32 {
        self.ipi_nesting.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn in_ipi(&self) -> bool {
        self.ipi_nesting() > 0
    }

    /// Drain the inbound IPI queue. Must run on this CPU's current context.
    pub(crate) fn process_ipiq(&self) -> usize {
        if self.in_ipi() {
            return 0;
        }
        self.take(PendingFlags::IPIQ);
        let _nesting = IpiNesting::enter(&self.ipi_nesting);
        let mut ran = 0;
        while let Some(func) = self.ipiq.pop() {
            func();
            ran += 1;
        }
        ran
    }

    pub fn snapshot(&self) -> CpuStatsSnapshot {
        CpuStatsSnapshot {
            cpu: self.cpu_id,
            switches: self.stats.switches.load(Ordering::Relaxed),
            yields: self.stats.yields.load(Ordering::Relaxed),
            preemptions: self.stats.preemptions.load(Ordering::Relaxed),
            token_contentions: self.stats.token_contentions.load(Ordering::Relaxed),
            messages_delivered: self.stats.messages_delivered.load(Ordering::Relaxed),
            ipis_sent: self.ipiq.sent(),
            ipis_processed: self.ipiq.processed(),
            ready: self.ready_count(),
        }
    }

    /// Drop every reference this CPU holds. Machine teardown only.
    pub(crate) fn release_all(&self) {
        let drained = self.runq.lock().drain_all();
        for td in &drained {
            td.set_queue_state(QueueState::NotQueued);
        }
        self.ready.store(0, Ordering::Relaxed);
        self.ipiq.clear();
        *self.current.lock() = None;
        *self.idle.lock() = None;
    }
}
