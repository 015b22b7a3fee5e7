//! Wait queue for blocking and waking execution contexts.
//!
//! Contexts call [`WaitQueue::wait_event`] to sleep until a condition
//! holds; producers call [`WaitQueue::wake_one`] or
//! [`WaitQueue::wake_all`] after changing it. The condition is re-checked
//! under the queue lock before the caller parks, and the caller is parked
//! with that lock held, so a wake between check and switch is never lost.
//!
//! Plain host threads may wait too. They have no scheduler to block in,
//! so they poll the condition with a short host sleep.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use spin::Mutex;

use super::scheduler::{current, sleep_prepare, switch, wakeup};
use super::thread::ThreadRef;

const HOST_POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct WaitQueue {
    waiters: Mutex<VecDeque<ThreadRef>>,
    /// Bumped on every wake call.
    generation: AtomicU64,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Block until `condition()` returns true.
    pub fn wait_event<F: Fn() -> bool>(&self, condition: F) {
        loop {
            if condition() {
                return;
            }
            let td = match current() {
                Some(td) if td.is_executing() => td,
                _ => {
                    std::thread::sleep(HOST_POLL_INTERVAL);
                    continue;
                }
            };
            {
                let mut waiters = self.waiters.lock();
                if condition() {
                    return;
                }
                waiters.push_back(td.clone());
                sleep_prepare(&td);
            }
            switch();
        }
    }

    /// Sleep until the queue has been woken since `*generation` was
    /// sampled, then refresh the sample.
    pub fn block(&self, generation: &mut u64) {
        let seen = *generation;
        self.wait_event(|| self.generation() != seen);
        *generation = self.generation();
    }

    /// Wake the oldest waiter. Returns false if the queue was empty.
    pub fn wake_one(&self) -> bool {
        let td = {
            let mut waiters = self.waiters.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
            waiters.pop_front()
        };
        match td {
            Some(td) => {
                wakeup(&td);
                true
            }
            None => false,
        }
    }

    /// Wake every waiter. Returns the number woken.
    pub fn wake_all(&self) -> usize {
        let drained: Vec<ThreadRef> = {
            let mut waiters = self.waiters.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
            waiters.drain(..).collect()
        };
        for td in &drained {
            wakeup(td);
        }
        drained.len()
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.lock().is_empty()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
