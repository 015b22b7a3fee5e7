//! Ambient services shared by every LWKT crate: logging, boot
//! configuration, critical-section guards and the test harness.

pub mod config;
pub mod klog;
pub mod preempt;
pub mod testing;

#[doc(hidden)]
pub use paste;

pub use config::{BootConfig, config_from_cmdline, parse_bool};
pub use klog::{
    KlogLevel, klog_get_level, klog_init, klog_is_enabled, klog_register_backend, klog_set_level,
};
pub use preempt::{PreemptGuard, is_preemption_disabled, preempt_count};
