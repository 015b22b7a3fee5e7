//! Shared fixture for the in-crate test modules.

use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lwkt_lib::{BootConfig, KlogLevel};

use crate::machine::Machine;

/// RAII fixture: boots a machine on creation, shuts it down on Drop.
pub(crate) struct MachineFixture {
    machine: Arc<Machine>,
}

impl MachineFixture {
    pub(crate) fn new(ncpus: usize) -> Self {
        Self::with_config(BootConfig {
            klog: KlogLevel::Warn,
            ..BootConfig::with_cpus(ncpus)
        })
    }

    pub(crate) fn with_config(config: BootConfig) -> Self {
        match Machine::boot(config) {
            Ok(machine) => Self { machine },
            Err(err) => panic!("test machine failed to boot: {}", err),
        }
    }

    pub(crate) fn machine(&self) -> &Arc<Machine> {
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
pub(crate) fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
