//! Execution-context ABI types shared between the scheduler and its
//! collaborators.

use bitflags::bitflags;

// --- Thread configuration ---

pub const THREAD_NAME_MAX_LEN: usize = 32;
pub const INVALID_THREAD_ID: u32 = 0;

// --- Priority bands ---
//
// Lower value is more urgent. Each band owns one ready queue per CPU.

/// Interrupt-class work (interrupt threads, IPI servicing threads).
pub const PRI_INT: u8 = 0;
/// Timer and soft-interrupt work (netisr, cpu helper).
pub const PRI_SOFT: u8 = 1;
/// Kernel work that may block (syscall dispatch, kernel daemons).
pub const PRI_KERN: u8 = 2;
/// User scheduler classes.
pub const PRI_USER_REALTIME: u8 = 3;
pub const PRI_USER_NORMAL: u8 = 4;
pub const PRI_USER_IDLE: u8 = 5;

/// Number of ready-queue bands per CPU.
pub const NUM_PRIORITY_LEVELS: usize = 6;

/// Reserved for the per-CPU idle context, which is never queued.
pub const PRI_IDLE_THREAD: u8 = NUM_PRIORITY_LEVELS as u8;

#[inline]
pub const fn priority_is_valid(pri: u8) -> bool {
    (pri as usize) < NUM_PRIORITY_LEVELS
}

// --- QueueState ---

/// Which scheduler structure currently lists a context.
///
/// Orthogonal to whether the context is executing: a context may be
/// running while still listed on its ready queue (it scheduled itself),
/// and may be off every queue while still executing (it is about to
/// block, or it is migrating).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum QueueState {
    /// On no queue. Either running or in the middle of a transition.
    #[default]
    NotQueued = 0,
    /// On its owning CPU's ready queue.
    OnRunQueue = 1,
    /// On some wait structure (token wait list, port, message, wait queue).
    OnWaitQueue = 2,
    /// Exited; never queued again.
    Dead = 3,
}

impl QueueState {
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::OnRunQueue,
            2 => Self::OnWaitQueue,
            3 => Self::Dead,
            _ => Self::NotQueued,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match self {
            Self::NotQueued => true,
            Self::OnRunQueue => matches!(target, Self::NotQueued | Self::OnRunQueue),
            Self::OnWaitQueue => matches!(target, Self::NotQueued),
            Self::Dead => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotQueued => "not-queued",
            Self::OnRunQueue => "runq",
            Self::OnWaitQueue => "waitq",
            Self::Dead => "dead",
        }
    }
}

// --- Thread flags ---

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Kernel-internal context (idle, dispatchers).
        const SYSTEM    = 1 << 0;
        /// The per-CPU idle context.
        const IDLE      = 1 << 1;
        /// A dispatcher context that services a port.
        const SERVICE   = 1 << 2;
        /// Exit path has started.
        const EXITING   = 1 << 3;
        /// Exit switch taken; the context will never run again.
        const EXITED    = 1 << 4;
        /// Migration to another CPU is in progress.
        const MIGRATING = 1 << 5;
        /// Entry function panicked.
        const PANICKED  = 1 << 6;
    }
}
