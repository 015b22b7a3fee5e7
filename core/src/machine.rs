//! Machine bootstrap and teardown.
//!
//! A [`Machine`] is one set of logical CPUs with their idle contexts,
//! per-CPU service dispatchers, port table and CAPS registry. Several
//! machines may coexist in one host process; nothing in the core is a
//! process-wide global except the log level.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use lwkt_abi::MAX_CPUS;
use lwkt_abi::error::{Errno, KResult};
use lwkt_abi::msg::PortId;
use lwkt_lib::preempt::register_reschedule_callback;
use lwkt_lib::{BootConfig, klog_info, klog_init, klog_warn};
use spin::{Mutex, Once};

use crate::caps::CapsRegistry;
use crate::msgport::service;
use crate::msgport::{Port, PortRef};
use crate::platform::Parker;
use crate::scheduler::lifecycle;
use crate::scheduler::per_cpu::{CpuStatsSnapshot, PendingFlags, PerCpu};
use crate::scheduler::scheduler::deferred_reschedule;
use crate::scheduler::{ThreadHandle, ThreadId};

/// Aggregate counters across all CPUs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachineStats {
    pub cpus: Vec<CpuStatsSnapshot>,
    pub live_contexts: usize,
}

impl MachineStats {
    pub fn total_switches(&self) -> u64 {
        self.cpus.iter().map(|c| c.switches).sum()
    }

    pub fn total_yields(&self) -> u64 {
        self.cpus.iter().map(|c| c.yields).sum()
    }

    pub fn total_preemptions(&self) -> u64 {
        self.cpus.iter().map(|c| c.preemptions).sum()
    }

    pub fn total_token_contentions(&self) -> u64 {
        self.cpus.iter().map(|c| c.token_contentions).sum()
    }

    pub fn total_ipis_sent(&self) -> u64 {
        self.cpus.iter().map(|c| c.ipis_sent).sum()
    }
}

struct TickSource {
    stop: Arc<AtomicBool>,
    parker: Arc<Parker>,
    handle: JoinHandle<()>,
}

pub struct Machine {
    config: BootConfig,
    cpus: Box<[PerCpu]>,
    next_thread_id: AtomicU32,
    next_port_id: AtomicU64,
    next_pid: AtomicU32,
    spawn_cursor: AtomicUsize,
    live_contexts: AtomicUsize,
    shutting_down: AtomicBool,
    idle_stop: AtomicBool,
    ports: Mutex<HashMap<PortId, Weak<Port>>>,
    pub(crate) caps: CapsRegistry,
    done_port: Once<PortRef>,
    idle_threads: Mutex<Vec<JoinHandle<()>>>,
    services: Mutex<Vec<ThreadHandle<()>>>,
    tick: Mutex<Option<TickSource>>,
}

impl Machine {
    /// Bring up `config.ncpus` CPUs, their idle contexts and the per-CPU
    /// service dispatchers.
    pub fn boot(config: BootConfig) -> KResult<Arc<Machine>> {
        if config.ncpus == 0 || config.ncpus > MAX_CPUS || config.ipiq_depth == 0 {
            return Err(Errno::Invalid);
        }
        klog_init(config.klog);
        register_reschedule_callback(deferred_reschedule);

        let cpus: Box<[PerCpu]> = (0..config.ncpus)
            .map(|id| PerCpu::new(id, config.ipiq_depth))
            .collect();
        let machine = Arc::new(Machine {
            config,
            cpus,
            next_thread_id: AtomicU32::new(1),
            next_port_id: AtomicU64::new(1),
            next_pid: AtomicU32::new(1),
            spawn_cursor: AtomicUsize::new(0),
            live_contexts: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            idle_stop: AtomicBool::new(false),
            ports: Mutex::new(HashMap::new()),
            caps: CapsRegistry::new(config.caps),
            done_port: Once::new(),
            idle_threads: Mutex::new(Vec::new()),
            services: Mutex::new(Vec::new()),
            tick: Mutex::new(None),
        });
        machine.done_port.call_once(|| Port::reply_done(&machine, "done"));

        for cpu in 0..machine.ncpus() {
            match lifecycle::start_idle(&machine, cpu) {
                Ok(handle) => machine.idle_threads.lock().push(handle),
                Err(err) => {
                    machine.shutdown();
                    return Err(err);
                }
            }
        }
        for cpu in 0..machine.ncpus() {
            if let Err(err) = service::start_services(&machine, cpu) {
                machine.shutdown();
                return Err(err);
            }
        }
        if config.hz > 0 {
            machine.start_tick();
        }

        klog_info!(
            "machine up: {} cpu(s), hz={}, preempt={}, caps={}",
            config.ncpus,
            config.hz,
            config.preempt,
            config.caps
        );
        Ok(machine)
    }

    #[inline]
    pub fn config(&self) -> &BootConfig {
        &self.config
    }

    #[inline]
    pub fn ncpus(&self) -> usize {
        self.cpus.len()
    }

    /// Per-CPU state of `cpu`. Out-of-range indices are fatal.
    pub fn cpu(&self, cpu: usize) -> &PerCpu {
        match self.cpus.get(cpu) {
            Some(gd) => gd,
            None => crate::fatal!("cpu {} out of range (ncpus={})", cpu, self.cpus.len()),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Set once every service context has been joined; only then may the
    /// idle loops leave.
    pub(crate) fn idle_should_stop(&self) -> bool {
        self.idle_stop.load(Ordering::Acquire)
    }

    pub(crate) fn alloc_thread_id(&self) -> ThreadId {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn alloc_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_cpu(&self) -> usize {
        self.spawn_cursor.fetch_add(1, Ordering::Relaxed) % self.ncpus()
    }

    pub(crate) fn context_started(&self) {
        self.live_contexts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn context_exited(&self) {
        self.live_contexts.fetch_sub(1, Ordering::AcqRel);
    }

    // --- ports ---

    pub(crate) fn alloc_port_id(&self) -> PortId {
        self.next_port_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn publish_port(&self, id: PortId, port: Weak<Port>) {
        let mut ports = self.ports.lock();
        ports.retain(|_, weak| weak.strong_count() > 0);
        ports.insert(id, port);
    }

    /// Resolve a port id carried in a message header.
    pub fn lookup_port(&self, id: PortId) -> Option<PortRef> {
        self.ports.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Reply port that only marks messages done.
    pub fn done_port(&self) -> Option<PortRef> {
        self.done_port.get().cloned()
    }

    pub fn cpuhelper_port(&self, cpu: usize) -> Option<PortRef> {
        self.cpu(cpu).services.cpuhelper.get().cloned()
    }

    pub fn netisr_port(&self, cpu: usize) -> Option<PortRef> {
        self.cpu(cpu).services.netisr.get().cloned()
    }

    pub fn syscall_port(&self, cpu: usize) -> Option<PortRef> {
        self.cpu(cpu).services.syscall.get().cloned()
    }

    pub(crate) fn add_service(&self, handle: ThreadHandle<()>) {
        self.services.lock().push(handle);
    }

    // --- preemption tick ---

    fn start_tick(self: &Arc<Self>) {
        let stop = Arc::new(AtomicBool::new(false));
        let parker = Arc::new(Parker::new());
        let period = Duration::from_micros(1_000_000 / u64::from(self.config.hz.max(1)));
        let weak = Arc::downgrade(self);
        let (tick_stop, tick_parker) = (stop.clone(), parker.clone());
        let spawned = std::thread::Builder::new()
            .name("lwkt-tick".into())
            .spawn(move || {
                while !tick_stop.load(Ordering::Acquire) {
                    tick_parker.park_timeout(period);
                    let Some(machine) = weak.upgrade() else {
                        break;
                    };
                    for gd in machine.cpus.iter() {
                        if gd.has_ready() {
                            gd.post(PendingFlags::RESCHED);
                            gd.kick();
                        }
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                *self.tick.lock() = Some(TickSource {
                    stop,
                    parker,
                    handle,
                })
            }
            Err(err) => klog_warn!("tick source unavailable: {}", err),
        }
    }

    // --- aggregate state ---

    pub fn stats(&self) -> MachineStats {
        MachineStats {
            cpus: self.cpus.iter().map(PerCpu::snapshot).collect(),
            live_contexts: self.live_contexts.load(Ordering::Acquire),
        }
    }

    /// Run `f` in a fresh context on CPU 0 and wait for its value.
    /// Panics inside `f` are reported as `None`.
    pub fn run<F, T>(self: &Arc<Self>, f: F) -> Option<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let handle = crate::scheduler::ThreadBuilder::new("main")
            .cpu(0)
            .spawn(self, f)
            .ok()?;
        handle.join().ok()
    }

    /// Stop service dispatchers, the tick source and the idle loops, then
    /// drop every per-CPU reference. Idempotent. Call from a host thread,
    /// not from a context of this machine.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        klog_info!("machine shutting down");

        for gd in self.cpus.iter() {
            for port in [
                gd.services.cpuhelper.get(),
                gd.services.netisr.get(),
                gd.services.syscall.get(),
            ]
            .into_iter()
            .flatten()
            {
                port.close();
            }
        }
        let services: Vec<_> = self.services.lock().drain(..).collect();
        for handle in services {
            let _ = handle.join();
        }
        self.caps.close_all();

        if let Some(tick) = self.tick.lock().take() {
            tick.stop.store(true, Ordering::Release);
            tick.parker.unpark();
            let _ = tick.handle.join();
        }

        let idle: Vec<_> = self.idle_threads.lock().drain(..).collect();
        self.idle_stop.store(true, Ordering::Release);
        for gd in self.cpus.iter() {
            gd.kick();
        }
        for handle in idle {
            let _ = handle.join();
        }
        for gd in self.cpus.iter() {
            gd.release_all();
        }
        if let Some(port) = self.done_port.get() {
            port.close();
        }
        let live = self.live_contexts.load(Ordering::Acquire);
        if live > 0 {
            klog_warn!("machine down with {} context(s) still parked", live);
        }
    }
}

impl core::fmt::Debug for Machine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Machine")
            .field("ncpus", &self.ncpus())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
