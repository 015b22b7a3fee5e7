//! CAPS: a small named-port RPC facility.
//!
//! A server registers a name and gets a [`CapsService`] whose port it
//! drains; clients [`CapsClient::connect`] by name and submit request
//! messages to that port. Every registration of a name bumps that name's
//! generation, so a client can tell that the server it connected to has
//! since been replaced.

mod client;
mod service;


use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use lwkt_abi::caps::CapsFlags;
use spin::Mutex;

use crate::msgport::{Message, PortRef};
use crate::scheduler::WaitQueue;
use crate::syscall::Cred;

pub use client::CapsClient;
pub use service::CapsService;

pub(crate) struct ServiceCore {
    name: String,
    cred: Cred,
    flags: CapsFlags,
    port: PortRef,
    /// Registry generation of this registration.
    generation: u64,
    /// Server-defined generation exposed through `set_gen`/`get_gen`.
    user_gen: AtomicU64,
    /// Requests dequeued by the server and not yet replied.
    held: Mutex<Vec<Message>>,
    closed: AtomicBool,
}

impl ServiceCore {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether a client with `cred` may connect.
    fn admits(&self, cred: &Cred) -> bool {
        cred.is_root()
            || self.flags.contains(CapsFlags::WORLD)
            || (self.flags.contains(CapsFlags::USER) && cred.uid == self.cred.uid)
            || (self.flags.contains(CapsFlags::GROUP) && cred.in_group(self.cred.gid))
    }
}

struct RegistryState {
    services: HashMap<String, Arc<ServiceCore>>,
    generations: HashMap<String, u64>,
    /// Registrations replaced by a later one of the same name. They keep
    /// serving their existing clients until closed.
    superseded: Vec<Weak<ServiceCore>>,
}

pub(crate) struct CapsRegistry {
    enabled: bool,
    state: Mutex<RegistryState>,
    /// Woken on every registration.
    registered: WaitQueue,
}

impl CapsRegistry {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::new(RegistryState {
                services: HashMap::new(),
                generations: HashMap::new(),
                superseded: Vec::new(),
            }),
            registered: WaitQueue::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<ServiceCore>> {
        self.state
            .lock()
            .services
            .get(name)
            .filter(|svc| !svc.is_closed())
            .cloned()
    }

    /// Current registry generation of `name`; 0 if it was never registered.
    pub(crate) fn generation(&self, name: &str) -> u64 {
        self.state.lock().generations.get(name).copied().unwrap_or(0)
    }

    fn unregister(&self, core: &Arc<ServiceCore>) {
        let mut st = self.state.lock();
        if st
            .services
            .get(&core.name)
            .is_some_and(|cur| Arc::ptr_eq(cur, core))
        {
            st.services.remove(&core.name);
        }
    }

    pub(crate) fn close_all(&self) {
        let services: Vec<Arc<ServiceCore>> = {
            let mut st = self.state.lock();
            let mut all: Vec<_> = st.services.drain().map(|(_, svc)| svc).collect();
            all.extend(st.superseded.drain(..).filter_map(|w| w.upgrade()));
            all
        };
        for svc in services {
            service::close_core(&svc);
        }
        self.registered.wake_all();
    }
}
