//! Cross-module scenario suites.
//!
//! Each suite boots its own machine through [`MachineFixture`]; bodies
//! return a `TestResult` and are wired to `#[test]` by
//! `define_test_suite!`.

use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lwkt_core::Machine;
use lwkt_lib::{BootConfig, KlogLevel};

#[cfg(test)]
mod protocol_tests;
#[cfg(test)]
mod scenario_tests;

/// RAII fixture: boots a machine on creation, shuts it down on Drop.
pub struct MachineFixture {
    machine: Arc<Machine>,
}

impl MachineFixture {
    pub fn new(ncpus: usize) -> Self {
        let config = BootConfig {
            klog: KlogLevel::Warn,
            ..BootConfig::with_cpus(ncpus)
        };
        match Machine::boot(config) {
            Ok(machine) => Self { machine },
            Err(err) => panic!("scenario machine failed to boot: {}", err),
        }
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }
}

impl Deref for MachineFixture {
    type Target = Arc<Machine>;

    fn deref(&self) -> &Arc<Machine> {
        &self.machine
    }
}

impl Drop for MachineFixture {
    fn drop(&mut self) {
        self.machine.shutdown();
    }
}

/// Poll `cond` from a host thread for up to two seconds.
pub fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
