use std::sync::Arc;

use lwkt_abi::caps::{CAPS_ABORT_NOTIMPL, CAPS_MAXINPROG, CAPS_MSG_REQUEST, CapsFlags, caps_name_valid};
use lwkt_abi::error::{Errno, KResult};
use lwkt_abi::msg::{MsgFlags, MsgPayload};
use spin::Mutex;

use super::ServiceCore;
use crate::machine::Machine;
use crate::msgport::{Message, init_message, sendmsg, wait};
use crate::syscall::Cred;

/// A connection to a named service.
pub struct CapsClient {
    service: Arc<ServiceCore>,
    machine: Arc<Machine>,
    generation: u64,
    inflight: Mutex<Vec<Message>>,
}

impl CapsClient {
    /// Connect to `name`. Without `WAITSVC` a missing service is ENOENT;
    /// with it the caller blocks until the name is registered.
    pub fn connect(
        machine: &Arc<Machine>,
        name: &str,
        cred: &Cred,
        flags: CapsFlags,
    ) -> KResult<CapsClient> {
        if !caps_name_valid(name) {
            return Err(Errno::Invalid);
        }
        let registry = &machine.caps;
        if !registry.enabled {
            return Err(Errno::NotSupported);
        }
        let service = match registry.lookup(name) {
            Some(svc) => svc,
            None if flags.contains(CapsFlags::WAITSVC) => {
                registry
                    .registered
                    .wait_event(|| registry.lookup(name).is_some() || machine.is_shutting_down());
                registry.lookup(name).ok_or(Errno::NotConnected)?
            }
            None => return Err(Errno::NoEntry),
        };
        if !service.admits(cred) {
            return Err(Errno::AccessDenied);
        }
        Ok(CapsClient {
            generation: service.generation,
            service,
            machine: machine.clone(),
            inflight: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.service.name
    }

    /// Generation of the registration this client is connected to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Latest registry generation of the service name.
    pub fn server_generation(&self) -> u64 {
        self.machine.caps.generation(&self.service.name)
    }

    /// True once the server went away or the name was registered again.
    pub fn is_stale(&self) -> bool {
        self.service.is_closed() || self.server_generation() != self.generation
    }

    /// Server-defined generation.
    pub fn get_gen(&self) -> KResult<u64> {
        if self.service.is_closed() {
            return Err(Errno::NotConnected);
        }
        Ok(self.service.user_gen.load(std::sync::atomic::Ordering::Acquire))
    }

    /// Submit a request without waiting.
    pub fn put(&self, payload: MsgPayload) -> KResult<Message> {
        if self.service.is_closed() {
            return Err(Errno::NotConnected);
        }
        let mut inflight = self.inflight.lock();
        inflight.retain(|m| !m.is_done());
        if inflight.len() >= CAPS_MAXINPROG {
            return Err(Errno::NoBuffers);
        }
        let msg = Message::with_payload(CAPS_MSG_REQUEST, payload);
        init_message(
            &msg,
            self.machine.done_port().as_ref(),
            CAPS_MSG_REQUEST,
            MsgFlags::ASYNC,
        );
        inflight.push(msg.clone());
        drop(inflight);
        sendmsg(&self.service.port, &msg);
        Ok(msg)
    }

    /// Wait for a request from `put` and return the reply payload.
    pub fn wait(&self, msg: &Message) -> KResult<MsgPayload> {
        let error = wait(msg);
        self.inflight.lock().retain(|m| !m.same(msg));
        Errno::check(error)?;
        Ok(msg.payload())
    }

    /// `put` then `wait`.
    pub fn call(&self, payload: MsgPayload) -> KResult<MsgPayload> {
        let msg = self.put(payload)?;
        self.wait(&msg)
    }

    pub fn inflight(&self) -> usize {
        let mut inflight = self.inflight.lock();
        inflight.retain(|m| !m.is_done());
        inflight.len()
    }

    /// Cancellation of CAPS requests is not implemented.
    pub fn abort(&self, _msg: &Message) -> u64 {
        CAPS_ABORT_NOTIMPL
    }

    pub fn close(self) {
        drop(self);
    }
}
