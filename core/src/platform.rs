//! Execution-state backend.
//!
//! The portable scheduler never touches registers or stacks. It asks the
//! outgoing context to [`SavedState::save`] and the incoming one to
//! [`SavedState::restore`]; everything else about how a context is frozen
//! and thawed lives behind this trait.

pub mod host;

pub use host::{HostExecState, Latch, Parker};

/// Saved execution state of one context.
pub trait SavedState: Send + Sync {
    /// Freeze the calling context until a matching `restore`. Returns on the
    /// first `restore` issued after (or before) the call; each restore
    /// releases exactly one save.
    fn save(&self);

    /// Resume the context frozen in `save`.
    fn restore(&self);
}

/// The backend compiled into this build.
pub type PlatformState = HostExecState;
