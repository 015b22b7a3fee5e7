//! Port and message protocol tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use lwkt_abi::error::{ECANCELED, EINVAL, ENOTCONN, ENOTSUP, EOK};
use lwkt_abi::msg::{MSG_CLASS_USER, MsgFlags, MsgPayload};
use lwkt_lib::testing::{TestResult, expect_abort};
use lwkt_lib::{assert_eq_test, assert_ok, assert_test, define_test_suite};

use super::{
    Message, Port, PortRef, abort, domsg, forward, get_port, init_message, reply,
    reply_if_aborted, sendmsg, wait, wait_port,
};
use crate::scheduler::{ThreadBuilder, ThreadHandle, curthread, exit};
use crate::test_fixture::{MachineFixture, wait_until};

const CMD_ECHO: u32 = MSG_CLASS_USER | 1;
const CMD_FAIL: u32 = MSG_CLASS_USER | 2;

/// Server context: doubles word 0 of every request and replies. Commands
/// other than `CMD_ECHO` are replied with EINVAL. Runs until its port is
/// closed; returns how many requests it served.
fn spawn_echo_server(m: &MachineFixture, cpu: usize) -> ThreadHandle<usize> {
    match ThreadBuilder::new("echo").cpu(cpu).spawn(m.machine(), || {
        let port = curthread().port().clone();
        let mut served = 0;
        while let Some(msg) = wait_port(&port) {
            served += 1;
            if msg.cmd() != CMD_ECHO {
                reply(&msg, EINVAL);
                continue;
            }
            msg.update_payload(|p| {
                let mut words = p.words();
                words[0] *= 2;
                *p = MsgPayload::from_words(words);
            });
            reply(&msg, EOK);
        }
        served
    }) {
        Ok(handle) => handle,
        Err(err) => panic!("echo server spawn failed: {}", err),
    }
}

fn request(word: u64) -> Message {
    Message::with_payload(CMD_ECHO, MsgPayload::from_words([word, 0, 0, 0]))
}

// =============================================================================
// Synchronous and asynchronous exchange
// =============================================================================

pub fn test_domsg_from_host() -> TestResult {
    let m = MachineFixture::new(2);
    let server = spawn_echo_server(&m, 1);
    let port = server.thread().port().clone();

    let msg = request(21);
    init_message(&msg, None, CMD_ECHO, MsgFlags::empty());
    assert_eq_test!(domsg(&port, &msg), EOK);
    assert_test!(msg.is_done());
    assert_test!(!msg.is_inflight());
    assert_eq_test!(msg.payload().words()[0], 42);

    let bad = request(1);
    init_message(&bad, None, CMD_FAIL, MsgFlags::empty());
    assert_eq_test!(domsg(&port, &bad), EINVAL);

    port.close();
    assert_eq_test!(server.join(), Ok(2));
    TestResult::Pass
}

pub fn test_async_replies_in_send_order() -> TestResult {
    let m = MachineFixture::new(2);
    let server = spawn_echo_server(&m, 1);
    let port = server.thread().port().clone();

    let replies = m.run(move || {
        let me = curthread();
        let sent: Vec<Message> = (1..=8).map(request).collect();
        for msg in &sent {
            init_message(msg, None, CMD_ECHO, MsgFlags::ASYNC);
            sendmsg(&port, msg);
        }
        let mut order = Vec::new();
        while order.len() < sent.len() {
            let back = wait_port(me.port())?;
            order.push(back.payload().words()[0]);
        }
        Some(order)
    });
    assert_eq_test!(replies, Some(Some(vec![2, 4, 6, 8, 10, 12, 14, 16])));
    server.thread().port().close();
    assert_eq_test!(server.join(), Ok(8));
    TestResult::Pass
}

pub fn test_wait_removes_queued_reply() -> TestResult {
    let m = MachineFixture::new(1);
    let server = spawn_echo_server(&m, 0);
    let port = server.thread().port().clone();
    let result = m.run(move || {
        let msg = request(5);
        init_message(&msg, None, CMD_ECHO, MsgFlags::ASYNC);
        sendmsg(&port, &msg);
        // Let the server run; the reply lands in our mailbox.
        crate::scheduler::yield_now();
        let queued = curthread().port().pending();
        let error = wait(&msg);
        (queued, error, curthread().port().pending(), msg.payload().words()[0])
    });
    assert_eq_test!(result, Some((1, EOK, 0, 10)));
    server.thread().port().close();
    assert_test!(server.join().is_ok());
    TestResult::Pass
}

// =============================================================================
// Port kinds and closed ports
// =============================================================================

pub fn test_send_to_closed_port() -> TestResult {
    let m = MachineFixture::new(2);
    let server = spawn_echo_server(&m, 1);
    let port = server.thread().port().clone();
    port.close();
    assert_test!(server.join().is_ok());

    let msg = request(3);
    init_message(&msg, None, CMD_ECHO, MsgFlags::empty());
    assert_eq_test!(domsg(&port, &msg), ENOTCONN);
    TestResult::Pass
}

pub fn test_request_to_reply_only_port() -> TestResult {
    let m = MachineFixture::new(1);
    let done = Port::reply_done(m.machine(), "sink");
    let msg = request(3);
    init_message(&msg, None, CMD_ECHO, MsgFlags::empty());
    assert_eq_test!(domsg(&done, &msg), ENOTSUP);
    TestResult::Pass
}

static COMPLETIONS: AtomicUsize = AtomicUsize::new(0);

fn count_completion(msg: &Message) {
    if msg.error() == EOK {
        COMPLETIONS.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn test_reply_function_port() -> TestResult {
    let m = MachineFixture::new(2);
    let server = spawn_echo_server(&m, 1);
    let port = server.thread().port().clone();
    let notify = Port::reply_fn(m.machine(), "notify", 0, count_completion);
    let before = COMPLETIONS.load(Ordering::SeqCst);

    let msgs: Vec<Message> = (0..4).map(request).collect();
    for msg in &msgs {
        init_message(msg, Some(&notify), CMD_ECHO, MsgFlags::ASYNC);
        sendmsg(&port, msg);
    }
    for msg in &msgs {
        assert_eq_test!(wait(msg), EOK);
    }
    assert_test!(wait_until(|| COMPLETIONS.load(Ordering::SeqCst) >= before + 4));
    port.close();
    assert_test!(server.join().is_ok());
    TestResult::Pass
}

pub fn test_port_lookup_by_id() -> TestResult {
    let m = MachineFixture::new(1);
    let port = Port::reply_done(m.machine(), "named");
    let found = m.lookup_port(port.id());
    assert_test!(found.is_some_and(|p| Arc::ptr_eq(&p, &port)));
    let id = port.id();
    drop(port);
    assert_test!(m.lookup_port(id).is_none(), "dropped port still resolvable");
    TestResult::Pass
}

pub fn test_header_roundtrip_resolves_reply_port() -> TestResult {
    let m = MachineFixture::new(1);
    let reply_port = Port::reply_done(m.machine(), "hdr");
    let msg = request(9);
    init_message(&msg, Some(&reply_port), CMD_ECHO, MsgFlags::ABORTABLE);
    let header = msg.to_header();
    let copy = Message::from_header(m.machine(), &header);
    assert_eq_test!(copy.cmd(), CMD_ECHO);
    assert_eq_test!(copy.payload().words()[0], 9);
    assert_test!(copy.flags().contains(MsgFlags::ABORTABLE));
    assert_test!(copy.reply_port().is_some_and(|p: PortRef| p.id() == reply_port.id()));
    TestResult::Pass
}

// =============================================================================
// Abort, forward, misuse
// =============================================================================

pub fn test_abort_before_dispatch() -> TestResult {
    let m = MachineFixture::new(2);
    let gate = Arc::new(AtomicBool::new(false));
    let g = gate.clone();
    let server = assert_ok!(ThreadBuilder::new("lazy").cpu(1).spawn(&m, move || {
        let port = curthread().port().clone();
        let mut results = Vec::new();
        while let Some(msg) = wait_port(&port) {
            while !g.load(Ordering::SeqCst) {
                core::hint::spin_loop();
            }
            if !reply_if_aborted(&msg) {
                reply(&msg, EOK);
            }
            results.push(msg.error());
        }
        results
    }));
    let port = server.thread().port().clone();

    let abortable = request(1);
    init_message(&abortable, None, CMD_ECHO, MsgFlags::ABORTABLE | MsgFlags::ASYNC);
    sendmsg(&port, &abortable);
    let plain = request(2);
    init_message(&plain, None, CMD_ECHO, MsgFlags::ASYNC);
    sendmsg(&port, &plain);

    assert_test!(abort(&abortable), "abortable in-flight message refused abort");
    assert_test!(!abort(&plain), "non-abortable message accepted abort");
    gate.store(true, Ordering::SeqCst);
    assert_eq_test!(wait(&abortable), ECANCELED);
    assert_eq_test!(wait(&plain), EOK);
    assert_test!(!abort(&abortable), "completed message accepted abort");

    port.close();
    assert_eq_test!(server.join(), Ok(vec![ECANCELED, EOK]));
    TestResult::Pass
}

pub fn test_forward_keeps_reply_port() -> TestResult {
    let m = MachineFixture::new(2);
    let echo = spawn_echo_server(&m, 1);
    let echo_port = echo.thread().port().clone();
    let relay = assert_ok!(ThreadBuilder::new("relay").cpu(0).spawn(&m, move || {
        let port = curthread().port().clone();
        let mut relayed = 0;
        while let Some(msg) = wait_port(&port) {
            forward(&echo_port, &msg);
            relayed += 1;
        }
        relayed
    }));
    let relay_port = relay.thread().port().clone();

    let msg = request(50);
    init_message(&msg, None, CMD_ECHO, MsgFlags::empty());
    assert_eq_test!(domsg(&relay_port, &msg), EOK);
    assert_eq_test!(msg.payload().words()[0], 100);

    relay_port.close();
    assert_eq_test!(relay.join(), Ok(1));
    echo.thread().port().close();
    assert_eq_test!(echo.join(), Ok(1));
    TestResult::Pass
}

pub fn test_double_reply_is_fatal() -> TestResult {
    expect_abort("msgport_test_double_reply_is_fatal", || {
        let m = MachineFixture::new(1);
        let h = ThreadBuilder::new("twice").spawn(&m, || {
            let me = curthread();
            let msg = request(1);
            init_message(&msg, None, CMD_ECHO, MsgFlags::ASYNC);
            sendmsg(me.port(), &msg);
            if let Some(got) = get_port(me.port()) {
                reply(&got, EOK);
                reply(&got, EOK);
            }
        });
        if let Ok(h) = h {
            let _ = h.join();
        }
    })
}

pub fn test_double_reply_in_handler_is_fatal() -> TestResult {
    expect_abort("msgport_test_double_reply_in_handler_is_fatal", || {
        let m = MachineFixture::new(2);
        let msg = request(1);
        init_message(&msg, None, CMD_ECHO, MsgFlags::empty());
        // The dispatcher replies once more after the handler returns.
        msg.set_oneshot(|msg: &Message| {
            reply(msg, EOK);
            EOK
        });
        if let Some(port) = m.cpuhelper_port(1) {
            domsg(&port, &msg);
        }
    })
}

pub fn test_resubmit_in_flight_is_fatal() -> TestResult {
    expect_abort("msgport_test_resubmit_in_flight_is_fatal", || {
        let m = MachineFixture::new(1);
        let h = ThreadBuilder::new("resubmit").spawn(&m, || {
            let me = curthread();
            let msg = request(1);
            init_message(&msg, None, CMD_ECHO, MsgFlags::ASYNC);
            sendmsg(me.port(), &msg);
            sendmsg(me.port(), &msg);
        });
        if let Ok(h) = h {
            let _ = h.join();
        }
    })
}

// =============================================================================
// Dispatchers
// =============================================================================

fn echo_dispatch(msg: Message) {
    let value = msg.payload().words()[0];
    msg.set_payload(MsgPayload::from_words([value + 1, 0, 0, 0]));
    reply(&msg, EOK);
}

pub fn test_dispatcher_runs_handlers() -> TestResult {
    let m = MachineFixture::new(2);
    let Some(helper) = m.cpuhelper_port(1) else {
        return TestResult::Fail;
    };

    let msg = request(7);
    msg.set_dispatch(echo_dispatch);
    init_message(&msg, None, CMD_ECHO, MsgFlags::empty());
    assert_eq_test!(domsg(&helper, &msg), EOK);
    assert_eq_test!(msg.payload().words()[0], 8);

    // The persistent handler stays for resubmission.
    init_message(&msg, None, CMD_ECHO, MsgFlags::empty());
    assert_eq_test!(domsg(&helper, &msg), EOK);
    assert_eq_test!(msg.payload().words()[0], 9);

    let once = Message::new(CMD_ECHO);
    once.set_oneshot(|_| EINVAL);
    init_message(&once, None, CMD_ECHO, MsgFlags::empty());
    assert_eq_test!(domsg(&helper, &once), EINVAL);

    let bare = Message::new(CMD_ECHO);
    init_message(&bare, None, CMD_ECHO, MsgFlags::empty());
    assert_eq_test!(domsg(&helper, &bare), ENOTSUP);
    TestResult::Pass
}

pub fn test_dispatcher_survives_handler_panic() -> TestResult {
    let m = MachineFixture::new(1);
    let Some(helper) = m.cpuhelper_port(0) else {
        return TestResult::Fail;
    };
    let msg = Message::new(CMD_ECHO);
    msg.set_oneshot(|_| panic!("handler failure"));
    init_message(&msg, None, CMD_ECHO, MsgFlags::empty());
    assert_eq_test!(domsg(&helper, &msg), ECANCELED);

    let next = request(1);
    next.set_dispatch(echo_dispatch);
    init_message(&next, None, CMD_ECHO, MsgFlags::empty());
    assert_eq_test!(domsg(&helper, &next), EOK);
    TestResult::Pass
}

pub fn test_handler_exit_stops_dispatcher() -> TestResult {
    let m = MachineFixture::new(1);
    let Some(helper) = m.cpuhelper_port(0) else {
        return TestResult::Fail;
    };
    let msg = Message::new(CMD_ECHO);
    init_message(&msg, m.done_port().as_ref(), CMD_ECHO, MsgFlags::ASYNC);
    msg.set_oneshot(|_| exit());
    sendmsg(&helper, &msg);
    assert_test!(wait_until(|| helper.is_closed()), "dispatcher kept serving after exit");

    let after = request(1);
    after.set_dispatch(echo_dispatch);
    init_message(&after, None, CMD_ECHO, MsgFlags::empty());
    assert_eq_test!(domsg(&helper, &after), ENOTCONN);
    TestResult::Pass
}

define_test_suite!(
    msgport,
    [
        test_domsg_from_host,
        test_async_replies_in_send_order,
        test_wait_removes_queued_reply,
        test_send_to_closed_port,
        test_request_to_reply_only_port,
        test_reply_function_port,
        test_port_lookup_by_id,
        test_header_roundtrip_resolves_reply_port,
        test_abort_before_dispatch,
        test_forward_keeps_reply_port,
        test_double_reply_is_fatal,
        test_double_reply_in_handler_is_fatal,
        test_resubmit_in_flight_is_fatal,
        test_dispatcher_runs_handlers,
        test_dispatcher_survives_handler_panic,
        test_handler_exit_stops_dispatcher,
    ]
);
