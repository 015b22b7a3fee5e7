//! Serializers: spin-based mutual exclusion, reentrant by the owner.
//!
//! A serializer protects short sections, typically interrupt-class work.
//! It has no wait list and no fairness; whoever wins the interlock next
//! owns it. Holding one across a blocking point is a programming error and
//! is fatal in debug builds (see `scheduler::switch`).
//!
//! Plain host threads may use serializers too. They are identified by a
//! per-thread id drawn from a range disjoint from context ids.

use core::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use lwkt_abi::task::INVALID_THREAD_ID;
use lwkt_lib::klog_trace;

use crate::scheduler::scheduler::{current, yield_now};
use crate::scheduler::{ThreadId, ThreadRef};

const HOST_ID_BASE: u32 = 0x8000_0000;
const IPI_POLL_SPINS: u32 = 64;
const DEFAULT_ADAPTIVE_SPINS: u32 = 64;

static NEXT_HOST_ID: AtomicU32 = AtomicU32::new(HOST_ID_BASE);

std::thread_local! {
    static HOST_ID: Cell<u32> = const { Cell::new(INVALID_THREAD_ID) };
}

fn host_id() -> u32 {
    HOST_ID.with(|id| {
        if id.get() == INVALID_THREAD_ID {
            id.set(NEXT_HOST_ID.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

/// Identity of the caller: its context, or its host thread.
fn caller() -> (ThreadId, Option<ThreadRef>) {
    match current().filter(|td| td.is_executing()) {
        Some(td) => (td.id(), Some(td)),
        None => (host_id(), None),
    }
}

#[derive(Default)]
pub struct SerializerStats {
    pub enters: AtomicU64,
    pub contended: AtomicU64,
    pub spins: AtomicU64,
    pub yields: AtomicU64,
}

pub struct Serializer {
    name: String,
    /// Owner id; zero when free.
    lock: AtomicU32,
    depth: AtomicU32,
    last_owner: AtomicU32,
    disabled: AtomicBool,
    pub stats: SerializerStats,
}

impl Serializer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lock: AtomicU32::new(INVALID_THREAD_ID),
            depth: AtomicU32::new(0),
            last_owner: AtomicU32::new(INVALID_THREAD_ID),
            disabled: AtomicBool::new(false),
            stats: SerializerStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn reenter(&self, me: ThreadId) -> bool {
        if self.lock.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn try_claim(&self, me: ThreadId, td: &Option<ThreadRef>) -> bool {
        if self
            .lock
            .compare_exchange(INVALID_THREAD_ID, me, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.depth.store(1, Ordering::Relaxed);
        self.last_owner.store(me, Ordering::Relaxed);
        self.stats.enters.fetch_add(1, Ordering::Relaxed);
        if let Some(td) = td {
            td.serializer_entered();
        }
        true
    }

    fn guard(&self) -> SerializerGuard<'_> {
        SerializerGuard {
            slz: self,
            _not_send: PhantomData,
        }
    }

    /// Spin until the interlock is ours. IPIs addressed to the caller's CPU
    /// are serviced while spinning.
    pub fn enter(&self) -> SerializerGuard<'_> {
        self.enter_with(None)
    }

    /// Like [`enter`](Self::enter), but a context yields the CPU after
    /// `slz.spins` failed attempts when it holds no other serializer.
    pub fn adaptive_enter(&self) -> SerializerGuard<'_> {
        let budget = current()
            .map(|td| td.machine().config().slz_spins)
            .unwrap_or(DEFAULT_ADAPTIVE_SPINS)
            .max(1);
        self.enter_with(Some(budget))
    }

    fn enter_with(&self, yield_after: Option<u32>) -> SerializerGuard<'_> {
        let (me, td) = caller();
        if self.reenter(me) {
            return self.guard();
        }
        if self.try_claim(me, &td) {
            return self.guard();
        }

        self.stats.contended.fetch_add(1, Ordering::Relaxed);
        klog_trace!("serializer '{}': {} spins behind {}", self.name, me, self.owner());
        let mut spins: u32 = 0;
        loop {
            core::hint::spin_loop();
            spins = spins.wrapping_add(1);
            self.stats.spins.fetch_add(1, Ordering::Relaxed);
            if self.lock.load(Ordering::Relaxed) == INVALID_THREAD_ID && self.try_claim(me, &td) {
                return self.guard();
            }
            if spins % IPI_POLL_SPINS == 0 {
                if let Some(td) = &td {
                    td.percpu().process_ipiq();
                }
                std::thread::yield_now();
            }
            if let (Some(budget), Some(ctx)) = (yield_after, &td) {
                if spins >= budget && ctx.serializers_held() == 0 && !ctx.percpu().in_ipi() {
                    self.stats.yields.fetch_add(1, Ordering::Relaxed);
                    yield_now();
                    spins = 0;
                }
            }
        }
    }

    /// Non-blocking enter. Succeeds for the owner (reentrant) or when the
    /// interlock is free.
    pub fn try_enter(&self) -> Option<SerializerGuard<'_>> {
        let (me, td) = caller();
        if self.reenter(me) || self.try_claim(me, &td) {
            Some(self.guard())
        } else {
            None
        }
    }

    fn exit(&self) {
        let (me, td) = caller();
        if self.lock.load(Ordering::Acquire) != me {
            fatal!(
                "serializer '{}' exited by {} but owned by {}",
                self.name,
                me,
                self.owner()
            );
        }
        if self.depth.fetch_sub(1, Ordering::Relaxed) > 1 {
            return;
        }
        self.lock.store(INVALID_THREAD_ID, Ordering::Release);
        if let Some(td) = td {
            td.serializer_exited();
        }
    }

    /// Run `func` serialized unless the serializer is disabled.
    pub fn handler_call<R>(&self, func: impl FnOnce() -> R) -> Option<R> {
        if self.is_disabled() {
            return None;
        }
        let _guard = self.enter();
        Some(func())
    }

    /// Run `func` only if the serializer is enabled and can be entered
    /// without spinning.
    pub fn handler_try<R>(&self, func: impl FnOnce() -> R) -> Option<R> {
        if self.is_disabled() {
            return None;
        }
        let _guard = self.try_enter()?;
        Some(func())
    }

    /// Exclude handler-call users until [`enable`](Self::enable).
    pub fn disable(&self) {
        let _guard = self.enter();
        self.disabled.store(true, Ordering::Release);
    }

    pub fn enable(&self) {
        let _guard = self.enter();
        self.disabled.store(false, Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// True iff the caller owns the serializer.
    pub fn is_serialized(&self) -> bool {
        let (me, _) = caller();
        self.lock.load(Ordering::Acquire) == me
    }

    pub fn assert_serialized(&self) {
        if !self.is_serialized() {
            fatal!("serializer '{}' not held by caller", self.name);
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.lock.load(Ordering::Acquire)
    }

    pub fn last_owner(&self) -> ThreadId {
        self.last_owner.load(Ordering::Relaxed)
    }

    pub fn depth(&self) -> u32 {
        if self.owner() == INVALID_THREAD_ID {
            0
        } else {
            self.depth.load(Ordering::Relaxed)
        }
    }
}

impl core::fmt::Debug for Serializer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Serializer")
            .field("name", &self.name)
            .field("owner", &self.owner())
            .field("depth", &self.depth())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

/// Held serializer level. !Send: released by the entering context.
#[must_use = "dropping the guard exits the serializer"]
pub struct SerializerGuard<'a> {
    slz: &'a Serializer,
    _not_send: PhantomData<*mut ()>,
}

impl SerializerGuard<'_> {
    pub fn exit(self) {
        drop(self);
    }
}

impl Drop for SerializerGuard<'_> {
    fn drop(&mut self) {
        self.slz.exit();
    }
}
