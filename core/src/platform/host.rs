//! Hosted backend: every context runs on its own host thread and only the
//! context holding its CPU's baton is ever unparked.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::SavedState;

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sticky one-token parker. An `unpark` issued before `park` is not lost.
pub struct Parker {
    token: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    pub const fn new() -> Self {
        Self {
            token: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn park(&self) {
        let mut token = relock(&self.token);
        while !*token {
            token = self.cv.wait(token).unwrap_or_else(PoisonError::into_inner);
        }
        *token = false;
    }

    /// Park for at most `timeout`. Returns whether a token was consumed.
    pub fn park_timeout(&self, timeout: Duration) -> bool {
        let token = relock(&self.token);
        let (mut token, _) = self
            .cv
            .wait_timeout_while(token, timeout, |t| !*t)
            .unwrap_or_else(PoisonError::into_inner);
        let consumed = *token;
        *token = false;
        consumed
    }

    pub fn unpark(&self) {
        *relock(&self.token) = true;
        self.cv.notify_one();
    }
}

impl Default for Parker {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot latch for host threads that are not contexts.
pub struct Latch {
    set: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    pub const fn new() -> Self {
        Self {
            set: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn set(&self) {
        *relock(&self.set) = true;
        self.cv.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *relock(&self.set)
    }

    pub fn wait(&self) {
        let mut set = relock(&self.set);
        while !*set {
            set = self.cv.wait(set).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HostExecState {
    baton: Parker,
}

impl HostExecState {
    pub const fn new() -> Self {
        Self {
            baton: Parker::new(),
        }
    }
}

impl Default for HostExecState {
    fn default() -> Self {
        Self::new()
    }
}

impl SavedState for HostExecState {
    fn save(&self) {
        self.baton.park();
    }

    fn restore(&self) {
        self.baton.unpark();
    }
}
