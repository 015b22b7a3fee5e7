//! Critical sections.
//!
//! RAII guards that defer preemption while held. The count belongs to the
//! executing context, so it travels with the context across a switch the
//! same way a saved register would. Guards nest; a reschedule requested
//! while any guard is live is remembered and performed by the drop of the
//! outermost guard through the registered callback.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

static RESCHEDULE_CALLBACK: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

std::thread_local! {
    static PREEMPT_COUNT: Cell<u32> = const { Cell::new(0) };
    static RESCHEDULE_DEFERRED: Cell<bool> = const { Cell::new(false) };
}

/// RAII guard that defers preemption while held.
/// !Send/!Sync: must be dropped by the context that created it.
#[must_use = "if unused, preemption will be immediately re-enabled"]
pub struct PreemptGuard {
    _marker: PhantomData<*mut ()>,
}

impl PreemptGuard {
    #[inline]
    pub fn new() -> Self {
        PREEMPT_COUNT.with(|c| c.set(c.get() + 1));
        Self {
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn is_active() -> bool {
        Self::count() > 0
    }

    #[inline]
    pub fn count() -> u32 {
        PREEMPT_COUNT.with(Cell::get)
    }

    /// Remember that a reschedule was requested while preemption was
    /// deferred.
    #[inline]
    pub fn set_reschedule_pending() {
        RESCHEDULE_DEFERRED.with(|d| d.set(true));
    }

    #[inline]
    pub fn is_reschedule_pending() -> bool {
        RESCHEDULE_DEFERRED.with(Cell::get)
    }

    #[inline]
    pub fn clear_reschedule_pending() {
        RESCHEDULE_DEFERRED.with(|d| d.set(false));
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    #[inline]
    fn drop(&mut self) {
        let prev = PREEMPT_COUNT.with(|c| {
            let prev = c.get();
            c.set(prev.saturating_sub(1));
            prev
        });
        debug_assert!(prev > 0, "preempt_count underflow");

        if prev == 1 && RESCHEDULE_DEFERRED.with(|d| d.replace(false)) {
            let fn_ptr = RESCHEDULE_CALLBACK.load(Ordering::Acquire);
            if !fn_ptr.is_null() {
                // SAFETY: fn_ptr was set via register_reschedule_callback with a valid fn()
                let callback: fn() = unsafe { core::mem::transmute(fn_ptr) };
                callback();
            }
        }
    }
}

pub fn register_reschedule_callback(callback: fn()) {
    RESCHEDULE_CALLBACK.store(callback as *mut (), Ordering::Release);
}

#[inline]
pub fn is_preemption_disabled() -> bool {
    PreemptGuard::is_active()
}

#[inline]
pub fn preempt_count() -> u32 {
    PreemptGuard::count()
}
