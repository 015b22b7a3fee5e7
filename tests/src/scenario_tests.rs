//! The four reference scenarios: token contention, a named RPC server,
//! serializer reentry and cooperative abort.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use lwkt_abi::caps::CapsFlags;
use lwkt_abi::error::{ECANCELED, EOK, Errno};
use lwkt_abi::msg::{MSG_CLASS_USER, MsgFlags, MsgPayload};
use lwkt_core::msgport::{
    Message, Port, abort, init_message, reply, reply_if_aborted, sendmsg, wait, wait_port,
};
use lwkt_core::scheduler::{ThreadBuilder, curthread};
use lwkt_core::syscall::Cred;
use lwkt_core::{CapsClient, CapsService, Serializer, Token};
use lwkt_lib::testing::TestResult;
use lwkt_lib::{assert_eq_test, assert_ok, assert_test, define_test_suite};

use crate::{MachineFixture, wait_until};

// =============================================================================
// Scenario A: token contention
// =============================================================================

pub fn test_token_contention_suspends_second_caller() -> TestResult {
    let m = MachineFixture::new(2);
    let token = Token::new("scenario-a");
    let stage = Arc::new(AtomicU32::new(0));

    let (t1, s1) = (token.clone(), stage.clone());
    let first = assert_ok!(ThreadBuilder::new("first").cpu(0).spawn(&m, move || {
        let guard = t1.acquire();
        s1.store(1, Ordering::SeqCst);
        while t1.waiters() == 0 {
            core::hint::spin_loop();
        }
        s1.store(2, Ordering::SeqCst);
        guard.release();
    }));
    assert_test!(wait_until(|| stage.load(Ordering::SeqCst) == 1));

    let (t2, s2) = (token.clone(), stage.clone());
    let second = assert_ok!(ThreadBuilder::new("second").cpu(1).spawn(&m, move || {
        let me = curthread();
        let _guard = t2.acquire();
        (
            s2.load(Ordering::SeqCst),
            t2.owner() == me.id(),
            t2.is_held_by_current(),
        )
    }));
    assert_eq_test!(second.join(), Ok((2, true, true)));
    assert_test!(first.join().is_ok());
    assert_test!(token.contentions() >= 1);
    TestResult::Pass
}

// =============================================================================
// Scenario B: named server replying with the complement
// =============================================================================

pub fn test_named_server_complement() -> TestResult {
    let m = MachineFixture::new(2);
    let machine = m.machine().clone();
    let server = assert_ok!(ThreadBuilder::new("rpcsrv").cpu(1).spawn(&m, move || {
        let svc =
            CapsService::register(&machine, "rpc.complement", Cred::root(), CapsFlags::WORLD)?;
        let mut served = 0usize;
        while let Ok(msg) = svc.wait() {
            let words = msg.payload().words().map(|w| !w);
            svc.reply(&msg, MsgPayload::from_words(words))?;
            served += 1;
        }
        Ok::<usize, Errno>(served)
    }));

    let client = assert_ok!(CapsClient::connect(
        &m,
        "rpc.complement",
        &Cred::user(1000, 1000),
        CapsFlags::WAITSVC,
    ));
    let request = MsgPayload::from_words([0x1234, 0, u64::MAX, 0xF0F0]);
    let msg = assert_ok!(client.put(request));
    let answer = assert_ok!(client.wait(&msg));
    assert_eq_test!(answer.words(), [!0x1234u64, u64::MAX, 0, !0xF0F0u64]);
    drop(client);
    drop(m);
    assert_eq_test!(server.join(), Ok(Ok(1)));
    TestResult::Pass
}

// =============================================================================
// Scenario C: serializer reentry versus another context
// =============================================================================

pub fn test_serializer_reentry_and_exclusion() -> TestResult {
    let m = MachineFixture::new(2);
    let slz = Arc::new(Serializer::new("scenario-c"));
    let entered = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    let (s1, e1, d1) = (slz.clone(), entered.clone(), done.clone());
    let owner = assert_ok!(ThreadBuilder::new("owner").cpu(0).spawn(&m, move || {
        let _outer = s1.enter();
        let reentered = s1.try_enter().map(|inner| {
            let depth = s1.depth();
            drop(inner);
            depth
        });
        e1.store(true, Ordering::SeqCst);
        while !d1.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }
        reentered
    }));
    assert_test!(wait_until(|| entered.load(Ordering::SeqCst)));

    let s2 = slz.clone();
    let other = assert_ok!(ThreadBuilder::new("other").cpu(1).spawn(&m, move || {
        s2.try_enter().is_none()
    }));
    let refused = other.join();
    done.store(true, Ordering::SeqCst);
    assert_eq_test!(owner.join(), Ok(Some(2)));
    assert_eq_test!(refused, Ok(true));
    assert_eq_test!(slz.depth(), 0);
    TestResult::Pass
}

// =============================================================================
// Scenario D: abort of an in-flight message
// =============================================================================

const CMD_WORK: u32 = MSG_CLASS_USER | 0x40;

static REPLIES: AtomicUsize = AtomicUsize::new(0);

fn count_reply(_msg: &Message) {
    REPLIES.fetch_add(1, Ordering::SeqCst);
}

pub fn test_abort_yields_exactly_one_reply() -> TestResult {
    let m = MachineFixture::new(2);
    let gate = Arc::new(AtomicBool::new(false));
    let g = gate.clone();
    let receiver = assert_ok!(ThreadBuilder::new("receiver").cpu(1).spawn(&m, move || {
        let port = curthread().port().clone();
        let msg = wait_port(&port)?;
        while !g.load(Ordering::SeqCst) {
            core::hint::spin_loop();
        }
        if !reply_if_aborted(&msg) {
            reply(&msg, EOK);
        }
        Some(msg.error())
    }));
    let target = receiver.thread().port().clone();
    let counter = Port::reply_fn(m.machine(), "replies", 0, count_reply);
    let before = REPLIES.load(Ordering::SeqCst);

    let msg = Message::new(CMD_WORK);
    init_message(&msg, Some(&counter), CMD_WORK, MsgFlags::ABORTABLE);
    sendmsg(&target, &msg);
    assert_test!(abort(&msg), "abort of an abortable in-flight message refused");
    assert_test!(msg.abort_requested());
    gate.store(true, Ordering::SeqCst);

    assert_eq_test!(wait(&msg), ECANCELED);
    assert_eq_test!(receiver.join(), Ok(Some(ECANCELED)));
    assert_test!(wait_until(|| REPLIES.load(Ordering::SeqCst) > before));
    std::thread::sleep(std::time::Duration::from_millis(10));
    assert_eq_test!(REPLIES.load(Ordering::SeqCst), before + 1, "exactly one reply");
    TestResult::Pass
}

define_test_suite!(
    scenario,
    [
        test_token_contention_suspends_second_caller,
        test_named_server_complement,
        test_serializer_reentry_and_exclusion,
        test_abort_yields_exactly_one_reply,
    ]
);
