//! End-to-end runs of the derived protocols: cpu helper calls, netmsg
//! chains, barriers and syscalls issued from contexts.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lwkt_abi::error::{EOK, Errno};
use lwkt_abi::msg::MSG_CLASS_NET;
use lwkt_abi::syscall::{SYS_ECHO, SYS_GETCPU, SYS_SLEEP, SYS_SUM};
use lwkt_core::cpuhelper::{cpu_call, cpu_send};
use lwkt_core::msgport::{Message, domsg, reply, sendmsg, wait};
use lwkt_core::netmsg::{NetMsg, netisr_barrier, netisr_port, netmsg_forward_next, netmsg_socket};
use lwkt_core::scheduler::{ThreadBuilder, current_cpu, curthread};
use lwkt_core::syscall::{Cred, Process, sendsys, sendsys_async};
use lwkt_lib::testing::TestResult;
use lwkt_lib::{assert_eq_test, assert_err, assert_ok, assert_test, define_test_suite};
use spin::Mutex;

use crate::{MachineFixture, wait_until};

// =============================================================================
// Cpu helper
// =============================================================================

pub fn test_cpu_call_runs_on_target() -> TestResult {
    let m = MachineFixture::new(3);
    for cpu in 0..3 {
        assert_eq_test!(cpu_call(&m, cpu, current_cpu), Ok(Some(cpu)));
    }
    assert_err!(cpu_call(&m, 3, || ()), Errno::Invalid);
    TestResult::Pass
}

pub fn test_cpu_call_nested_on_same_helper() -> TestResult {
    let m = MachineFixture::new(2);
    let machine = m.machine().clone();
    // The inner call is issued by the helper itself and must not deadlock.
    let nested = cpu_call(&m, 1, move || {
        let outer = curthread().name().to_string();
        cpu_call(&machine, 1, move || outer.len()).ok()
    });
    assert_eq_test!(nested, Ok(Some("cpuhelper1".len())));
    TestResult::Pass
}

pub fn test_cpu_send_completes() -> TestResult {
    let m = MachineFixture::new(2);
    let hits = Arc::new(AtomicUsize::new(0));
    let mut msgs = Vec::new();
    for cpu in 0..2 {
        let h = hits.clone();
        msgs.push(assert_ok!(cpu_send(&m, cpu, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })));
    }
    for msg in &msgs {
        assert_eq_test!(wait(msg), EOK);
    }
    assert_eq_test!(hits.load(Ordering::SeqCst), 2);
    TestResult::Pass
}

// =============================================================================
// Netmsg
// =============================================================================

const NET_CHAIN: u32 = MSG_CLASS_NET | 1;
const NET_PING: u32 = MSG_CLASS_NET | 2;

/// Stand-in for a protocol control block.
struct Socket {
    visited: Mutex<Vec<usize>>,
}

fn chain_handler(msg: Message) {
    if let Some(so) = netmsg_socket::<Socket>(&msg) {
        so.visited.lock().push(curthread().cpu());
    }
    if !netmsg_forward_next(&msg) {
        reply(&msg, EOK);
    }
}

fn ping_handler(msg: Message) {
    reply(&msg, EOK);
}

pub fn test_netmsg_chain_visits_every_cpu() -> TestResult {
    let m = MachineFixture::new(4);
    let so = Arc::new(Socket {
        visited: Mutex::new(Vec::new()),
    });
    let port = assert_ok!(netisr_port(&m, 0));
    let msg = NetMsg::new(
        NET_CHAIN,
        chain_handler,
        Some(so.clone() as Arc<dyn Any + Send + Sync>),
        None,
    );
    assert_eq_test!(domsg(&port, &msg), EOK);
    assert_eq_test!(so.visited.lock().clone(), vec![0, 1, 2, 3]);
    assert_test!(netmsg_socket::<Socket>(msg.message()).is_some());
    assert_test!(netmsg_socket::<String>(&msg).is_none(), "wrong socket type resolved");
    TestResult::Pass
}

pub fn test_netmsg_fire_and_forget_then_barrier() -> TestResult {
    let m = MachineFixture::new(2);
    let done = m.done_port();
    let mut sent = Vec::new();
    for cpu in 0..2 {
        let port = assert_ok!(netisr_port(&m, cpu));
        let msg = NetMsg::new(NET_PING, ping_handler, None, done.as_ref());
        sendmsg(&port, &msg);
        sent.push(msg.into_message());
    }
    assert_ok!(netisr_barrier(&m));
    // The barrier queued behind every ping, so all of them are done.
    assert_test!(sent.iter().all(Message::is_done));
    assert_err!(netisr_port(&m, 2), Errno::Invalid);
    TestResult::Pass
}

// =============================================================================
// Syscalls from contexts
// =============================================================================

pub fn test_syscalls_from_many_contexts() -> TestResult {
    let m = MachineFixture::new(2);
    let mut handles = Vec::new();
    for i in 0..6u64 {
        let machine = m.machine().clone();
        let cpu = (i % 2) as usize;
        handles.push(assert_ok!(ThreadBuilder::new("caller").cpu(cpu).spawn(&m, move || {
            let echoed = sendsys(&machine, SYS_ECHO, &[i]);
            let sum = sendsys(&machine, SYS_SUM, &[i, i, 1]);
            let where_ = sendsys(&machine, SYS_GETCPU, &[]);
            (echoed, sum, where_)
        })));
    }
    for (i, h) in (0..6u64).zip(handles) {
        let cpu = i % 2;
        assert_eq_test!(h.join(), Ok((Ok(i), Ok(2 * i + 1), Ok(cpu))));
    }
    TestResult::Pass
}

pub fn test_async_syscalls_drain_on_teardown() -> TestResult {
    let m = MachineFixture::new(2);
    let p = Process::new(&m, Cred::root());
    let fast = assert_ok!(sendsys_async(&p, SYS_ECHO, &[5]));
    assert_test!(wait_until(|| fast.is_done()));
    assert_eq_test!(p.outstanding(), 1, "completed async syscall awaits reaping");
    let reaped = p.reap();
    assert_eq_test!(reaped.len(), 1);
    assert_eq_test!(reaped[0].result, Ok(5));

    let slow = assert_ok!(sendsys_async(&p, SYS_SLEEP, &[50_000]));
    assert_eq_test!(p.teardown(), 1);
    assert_test!(slow.is_done());
    assert_test!(slow.error() != EOK, "aborted sleep reported success");
    TestResult::Pass
}

define_test_suite!(
    protocol,
    [
        test_cpu_call_runs_on_target,
        test_cpu_call_nested_on_same_helper,
        test_cpu_send_completes,
        test_netmsg_chain_visits_every_cpu,
        test_netmsg_fire_and_forget_then_barrier,
        test_syscalls_from_many_contexts,
        test_async_syscalls_drain_on_teardown,
    ]
);
