use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use lwkt_abi::caps::{CapsFlags, caps_name_valid};
use lwkt_abi::error::{ENOTCONN, EOK, Errno, KResult};
use lwkt_abi::msg::MsgPayload;
use lwkt_lib::klog_debug;
use spin::Mutex;

use super::ServiceCore;
use crate::machine::Machine;
use crate::msgport::{Message, Port, get_port, reply, wait_port};
use crate::scheduler::current;
use crate::syscall::Cred;

/// Server side of a registered name. Dropping it closes the service.
pub struct CapsService {
    core: Arc<ServiceCore>,
    machine: Arc<Machine>,
}

impl CapsService {
    /// Register `name`, served by the calling context.
    pub fn register(
        machine: &Arc<Machine>,
        name: &str,
        cred: Cred,
        flags: CapsFlags,
    ) -> KResult<CapsService> {
        if !caps_name_valid(name) {
            return Err(Errno::Invalid);
        }
        let registry = &machine.caps;
        if !registry.enabled {
            return Err(Errno::NotSupported);
        }
        let owner = current().ok_or(Errno::Invalid)?;

        let core = {
            let mut st = registry.state.lock();
            let taken = st.services.get(name).is_some_and(|svc| !svc.is_closed());
            if taken && flags.contains(CapsFlags::EXCL) {
                return Err(Errno::Exists);
            }
            let generation = {
                let g = st.generations.entry(name.to_string()).or_insert(0);
                *g += 1;
                *g
            };
            let core = Arc::new(ServiceCore {
                name: name.to_string(),
                cred,
                flags,
                port: Port::mailbox(machine, name, &owner),
                generation,
                user_gen: AtomicU64::new(0),
                held: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            });
            if let Some(old) = st.services.insert(name.to_string(), core.clone()) {
                st.superseded.retain(|w| w.strong_count() > 0);
                st.superseded.push(Arc::downgrade(&old));
            }
            core
        };
        registry.registered.wake_all();
        klog_debug!("caps: '{}' registered, generation {}", name, core.generation);
        Ok(CapsService {
            core,
            machine: machine.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Registry generation of this registration.
    pub fn generation(&self) -> u64 {
        self.core.generation
    }

    pub fn set_gen(&self, generation: u64) {
        self.core.user_gen.store(generation, Ordering::Release);
    }

    pub fn get_gen(&self) -> u64 {
        self.core.user_gen.load(Ordering::Acquire)
    }

    fn hold(&self, msg: Message) -> Message {
        self.core.held.lock().push(msg.clone());
        msg
    }

    /// Next queued request without blocking.
    pub fn get(&self) -> KResult<Message> {
        if self.core.is_closed() {
            return Err(Errno::NotConnected);
        }
        get_port(&self.core.port)
            .map(|msg| self.hold(msg))
            .ok_or(Errno::WouldBlock)
    }

    /// Block until a request arrives.
    pub fn wait(&self) -> KResult<Message> {
        wait_port(&self.core.port)
            .map(|msg| self.hold(msg))
            .ok_or(Errno::NotConnected)
    }

    /// Complete a request obtained from `get`/`wait` with `payload`.
    pub fn reply(&self, msg: &Message, payload: MsgPayload) -> KResult {
        self.reply_error(msg, payload, EOK)
    }

    pub fn reply_error(&self, msg: &Message, payload: MsgPayload, error: i32) -> KResult {
        {
            let mut held = self.core.held.lock();
            let pos = held
                .iter()
                .position(|m| m.same(msg))
                .ok_or(Errno::Invalid)?;
            held.remove(pos);
        }
        msg.set_payload(payload);
        reply(msg, error);
        Ok(())
    }

    /// Requests currently held by the server.
    pub fn held(&self) -> usize {
        self.core.held.lock().len()
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for CapsService {
    fn drop(&mut self) {
        self.machine.caps.unregister(&self.core);
        close_core(&self.core);
    }
}

/// Close a service: queued and held requests complete with ENOTCONN.
pub(super) fn close_core(core: &Arc<ServiceCore>) {
    if core.closed.swap(true, Ordering::AcqRel) {
        return;
    }
    core.port.close();
    let held: Vec<Message> = core.held.lock().drain(..).collect();
    for msg in &held {
        reply(msg, ENOTCONN);
    }
    klog_debug!("caps: '{}' closed, {} held request(s) dropped", core.name, held.len());
}
