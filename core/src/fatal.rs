//! Fatal invariant violations.
//!
//! Misuse of the core (double reply, double submit, blocking while
//! serialized, releasing a token that is not held, switching from inside an
//! IPI function) is never reported as an error value. [`fatal!`] logs the
//! message together with the state of the offending context and CPU, then
//! aborts the process. Nothing catches it: not the context trampoline, not
//! a dispatcher, not the idle loop. Ordinary panics in a context body are
//! a different matter and are reported through the join handle.

use lwkt_lib::klog_error;

use crate::scheduler::current;

#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = ::std::format!($($arg)*);
        $crate::fatal::report(&message);
        ::std::process::abort()
    }};
}

/// Log diagnostic context for a fatal condition.
pub fn report(message: &str) {
    klog_error!("FATAL: {}", message);
    match current() {
        Some(td) => {
            let gd = td.percpu();
            klog_error!(
                "  context {} '{}' cpu={} pri={} queue={} flags={:?} tokens={} serializers={}",
                td.id(),
                td.name(),
                td.cpu(),
                td.priority(),
                td.queue_state().as_str(),
                td.flags(),
                td.tokens_held(),
                td.serializers_held()
            );
            klog_error!(
                "  cpu {} pending={:?} ready={} ipi_nesting={}",
                gd.cpu_id(),
                gd.pending(),
                gd.ready_count(),
                gd.ipi_nesting()
            );
        }
        None => klog_error!("  caller is not an execution context"),
    }
}
