//! Tokens: cooperative, recursive, blocking locks.
//!
//! A token is owned by at most one context. The owner may re-acquire it
//! (the recursion count grows); anyone else is appended to the wait list
//! and blocks through the scheduler. Releasing the last reference hands
//! ownership straight to the head of the wait list.
//!
//! A context never keeps tokens across a blocking point. `switch` stashes
//! the context's whole token set, releasing each one (with handoff), and
//! reacquires the set before the context resumes. Reacquisition is
//! all-or-nothing: when one token is taken by someone else, the ones just
//! reclaimed are released again and the context waits on the busy one.
//!
//! There is no ordered multi-token acquisition and no deadlock detection;
//! callers pick a consistent order.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lwkt_abi::error::{Errno, KResult};
use lwkt_abi::task::INVALID_THREAD_ID;
use lwkt_lib::klog_trace;
use spin::Mutex;

use crate::scheduler::scheduler::{curthread, sleep_prepare, switch, wakeup};
use crate::scheduler::{ThreadId, ThreadRef};

struct TokenState {
    owner: ThreadId,
    count: u32,
    /// Blocked contexts and the count each wants restored.
    waiters: VecDeque<(ThreadRef, u32)>,
    last_owner: ThreadId,
}

pub(crate) struct TokenCore {
    name: String,
    state: Mutex<TokenState>,
    generation: AtomicU64,
    contentions: AtomicU64,
}

impl TokenCore {
    fn claim(&self, st: &mut TokenState, td: &ThreadRef, count: u32) {
        st.owner = td.id();
        st.count = count;
        if st.last_owner != td.id() {
            st.last_owner = td.id();
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Drop ownership entirely. Returns the waiter that now owns it.
    fn surrender(&self, st: &mut TokenState) -> Option<ThreadRef> {
        match st.waiters.pop_front() {
            Some((next, count)) => {
                self.claim(st, &next, count);
                Some(next)
            }
            None => {
                st.owner = INVALID_THREAD_ID;
                st.count = 0;
                None
            }
        }
    }
}

/// One entry of a context's token set.
pub(crate) struct HeldToken {
    core: Arc<TokenCore>,
    /// Recursion count stashed while the token is released for a switch.
    saved: u32,
    owned: bool,
}

/// The tokens a context holds or must reacquire before it resumes.
#[derive(Default)]
pub(crate) struct TokenSet {
    entries: Vec<HeldToken>,
}

impl TokenSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn owned_count(&self) -> usize {
        self.entries.iter().filter(|h| h.owned).count()
    }

    fn position(&self, core: &Arc<TokenCore>) -> Option<usize> {
        self.entries.iter().position(|h| Arc::ptr_eq(&h.core, core))
    }
}

#[derive(Clone)]
pub struct Token {
    core: Arc<TokenCore>,
}

impl Token {
    pub fn new(name: &str) -> Self {
        Self {
            core: Arc::new(TokenCore {
                name: name.to_string(),
                state: Mutex::new(TokenState {
                    owner: INVALID_THREAD_ID,
                    count: 0,
                    waiters: VecDeque::new(),
                    last_owner: INVALID_THREAD_ID,
                }),
                generation: AtomicU64::new(0),
                contentions: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current owner, or `INVALID_THREAD_ID`.
    pub fn owner(&self) -> ThreadId {
        self.core.state.lock().owner
    }

    pub fn count(&self) -> u32 {
        self.core.state.lock().count
    }

    pub fn waiters(&self) -> usize {
        self.core.state.lock().waiters.len()
    }

    /// Bumped whenever ownership moves to a different context.
    pub fn generation(&self) -> u64 {
        self.core.generation.load(Ordering::Acquire)
    }

    pub fn contentions(&self) -> u64 {
        self.core.contentions.load(Ordering::Relaxed)
    }

    pub fn is_held_by_current(&self) -> bool {
        crate::scheduler::current().is_some_and(|td| self.owner() == td.id())
    }

    /// Acquire, blocking through the scheduler while another context owns
    /// the token.
    pub fn acquire(&self) -> TokenGuard<'_> {
        let td = curthread();
        let mut st = self.core.state.lock();
        if st.owner == td.id() {
            st.count += 1;
            return self.guard();
        }
        if st.owner == INVALID_THREAD_ID {
            self.core.claim(&mut st, &td, 1);
            drop(st);
            self.record_owned(&td);
            return self.guard();
        }

        self.core.contentions.fetch_add(1, Ordering::Relaxed);
        td.percpu()
            .stats
            .token_contentions
            .fetch_add(1, Ordering::Relaxed);
        klog_trace!(
            "token '{}': context {} waits behind {}",
            self.core.name,
            td.id(),
            st.owner
        );
        st.waiters.push_back((td.clone(), 1));
        sleep_prepare(&td);
        drop(st);
        td.tokens.lock().entries.push(HeldToken {
            core: self.core.clone(),
            saved: 1,
            owned: false,
        });
        // The release hands the token to us; switch marks it owned while
        // reacquiring the rest of the set.
        switch();
        self.guard()
    }

    /// Acquire only if that does not require blocking.
    pub fn try_acquire(&self) -> Option<TokenGuard<'_>> {
        let td = curthread();
        let mut st = self.core.state.lock();
        if st.owner == td.id() {
            st.count += 1;
            return Some(self.guard());
        }
        if st.owner == INVALID_THREAD_ID {
            self.core.claim(&mut st, &td, 1);
            drop(st);
            self.record_owned(&td);
            return Some(self.guard());
        }
        None
    }

    /// Bounded variant: `WouldBlock` instead of suspending.
    pub fn acquire_nowait(&self) -> KResult<TokenGuard<'_>> {
        self.try_acquire().ok_or(Errno::WouldBlock)
    }

    fn record_owned(&self, td: &ThreadRef) {
        let mut set = td.tokens.lock();
        match set.position(&self.core) {
            Some(pos) => set.entries[pos].owned = true,
            None => set.entries.push(HeldToken {
                core: self.core.clone(),
                saved: 0,
                owned: true,
            }),
        }
    }

    fn guard(&self) -> TokenGuard<'_> {
        TokenGuard {
            token: self,
            generation: self.generation(),
            _not_send: PhantomData,
        }
    }

    fn release(&self) {
        let td = curthread();
        let handoff = {
            let mut st = self.core.state.lock();
            if st.owner != td.id() {
                fatal!(
                    "context {} released token '{}' owned by {}",
                    td.id(),
                    self.core.name,
                    st.owner
                );
            }
            st.count -= 1;
            if st.count > 0 {
                return;
            }
            self.core.surrender(&mut st)
        };
        let mut set = td.tokens.lock();
        if let Some(pos) = set.position(&self.core) {
            set.entries.remove(pos);
        }
        drop(set);
        if let Some(next) = handoff {
            wakeup(&next);
        }
    }
}

impl core::fmt::Debug for Token {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.core.state.lock();
        f.debug_struct("Token")
            .field("name", &self.core.name)
            .field("owner", &st.owner)
            .field("count", &st.count)
            .field("waiters", &st.waiters.len())
            .finish()
    }
}

/// Held reference to a token. Dropping it releases one level.
/// !Send: it must be released by the context that acquired it.
#[must_use = "dropping the guard releases the token"]
pub struct TokenGuard<'a> {
    token: &'a Token,
    generation: u64,
    _not_send: PhantomData<*mut ()>,
}

impl TokenGuard<'_> {
    /// Generation observed when this guard was taken.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True if another context owned the token at some point after
    /// `generation` was sampled, i.e. state it protects may have changed
    /// across a blocking point.
    pub fn lost_since(&self, generation: u64) -> bool {
        self.token.generation() != generation
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        self.token.release();
    }
}

// --- switch integration ---

/// Release every owned token of `td`, stashing the recursion counts.
pub(crate) fn release_for_switch(td: &ThreadRef) {
    let mut handoffs = Vec::new();
    {
        let mut set = td.tokens.lock();
        for held in set.entries.iter_mut().filter(|h| h.owned) {
            let mut st = held.core.state.lock();
            held.saved = st.count;
            held.owned = false;
            if let Some(next) = held.core.surrender(&mut st) {
                handoffs.push(next);
            }
        }
    }
    for next in handoffs {
        wakeup(&next);
    }
}

/// Reclaim the whole stashed set of `td`. On failure nothing is held and
/// `td` is parked on the busy token's wait list.
pub(crate) fn reacquire_all(td: &ThreadRef) -> bool {
    let mut handoffs = Vec::new();
    let complete = {
        let mut set = td.tokens.lock();
        let mut taken = Vec::new();
        let mut busy = false;
        for (idx, held) in set.entries.iter_mut().enumerate() {
            if held.owned {
                continue;
            }
            let mut st = held.core.state.lock();
            if st.owner == td.id() {
                held.owned = true;
                taken.push(idx);
            } else if st.owner == INVALID_THREAD_ID {
                held.core.claim(&mut st, td, held.saved);
                held.owned = true;
                taken.push(idx);
            } else {
                st.waiters.push_back((td.clone(), held.saved));
                sleep_prepare(td);
                busy = true;
                break;
            }
        }
        if busy {
            for idx in taken {
                let held = &mut set.entries[idx];
                let mut st = held.core.state.lock();
                held.saved = st.count;
                held.owned = false;
                if let Some(next) = held.core.surrender(&mut st) {
                    handoffs.push(next);
                }
            }
        }
        !busy
    };
    for next in handoffs {
        wakeup(&next);
    }
    complete
}

/// Drop whatever `td` still holds as it exits. Returns how many tokens
/// were released.
pub(crate) fn release_on_exit(td: &ThreadRef) -> usize {
    let entries = core::mem::take(&mut td.tokens.lock().entries);
    let mut released = 0;
    for held in entries {
        let handoff = {
            let mut st = held.core.state.lock();
            if st.owner == td.id() {
                released += 1;
                held.core.surrender(&mut st)
            } else {
                st.waiters.retain(|(w, _)| w.id() != td.id());
                None
            }
        };
        if let Some(next) = handoff {
            wakeup(&next);
        }
    }
    released
}
