//! Inter-processor request queues.
//!
//! Each CPU owns one inbound FIFO of closures. Any CPU (or a host thread
//! outside the machine) may append; only the owning CPU drains, and only
//! at a safe point: the top of a switch, the idle loop, a serializer spin
//! or an explicit preemption check. A single inbound FIFO preserves
//! per-sender order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

pub type IpiFn = Box<dyn FnOnce() + Send + 'static>;

pub struct IpiQueue {
    fifo: Mutex<VecDeque<IpiFn>>,
    depth: usize,
    sent: AtomicU64,
    processed: AtomicU64,
}

impl IpiQueue {
    pub fn new(depth: usize) -> Self {
        Self {
            fifo: Mutex::new(VecDeque::with_capacity(depth.min(64))),
            depth,
            sent: AtomicU64::new(0),
            processed: AtomicU64::new(0),
        }
    }

    /// Append unless the FIFO is full. Hands the request back when full.
    pub fn try_push(&self, func: IpiFn) -> Result<(), IpiFn> {
        let mut fifo = self.fifo.lock();
        if fifo.len() >= self.depth {
            return Err(func);
        }
        fifo.push_back(func);
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn pop(&self) -> Option<IpiFn> {
        let func = self.fifo.lock().pop_front();
        if func.is_some() {
            self.processed.fetch_add(1, Ordering::Relaxed);
        }
        func
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.fifo.lock().len()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Drop every queued request. Used at machine teardown only.
    pub(crate) fn clear(&self) {
        self.fifo.lock().clear();
    }
}
