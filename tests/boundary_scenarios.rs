//! Cross-crate integration tests for the boundary scenarios named in
//! spec.md §8, driven entirely through the `lanes` facade rather than any
//! one subsystem crate's own unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lanes::{
    cancel_test, CancelRequest, Config, Error, FunctionRef, Lane, LaneOptions, Linda, LindaOutcome,
    NativeFn, NativeFunction, Universe, Value, Vm,
};

fn pool_universe() -> Arc<Universe> {
    Universe::new(Config::default()).unwrap()
}

/// spec.md §8 boundary scenario 2: "batched receive" — five sends under
/// one key, then a single batched receive pops exactly three, leaving two.
#[test]
fn batched_receive_pops_exactly_the_requested_count() {
    let universe = pool_universe();
    let l = lanes::linda(&universe, Some("q".to_string()), None);
    for i in 1..=5 {
        assert!(l
            .send(Value::str("q"), vec![Value::Integer(i)], None)
            .unwrap()
            .is_ready());
    }
    let batch = l
        .receive_batched(Value::str("q"), 3, 3, None)
        .unwrap()
        .ready()
        .unwrap();
    assert_eq!(batch, vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]);
    assert_eq!(
        l.count(&[Value::str("q")]),
        lanes::CountResult::Single(Some(2))
    );
}

/// spec.md §8 boundary scenario 4: "deep identity" — sending the same deep
/// object (here, a linda) twice and receiving it twice yields the same
/// underlying identity both times.
#[test]
fn deep_identity_is_preserved_across_repeated_sends() {
    let universe = pool_universe();
    let mailbox = lanes::linda(&universe, Some("a".to_string()), None);
    let payload = lanes::linda(&universe, Some("d".to_string()), None);
    let payload_identity = payload.identity();

    mailbox
        .send(Value::str("a"), vec![Value::Deep(Arc::clone(payload.prelude()))], None)
        .unwrap();
    mailbox
        .send(Value::str("a"), vec![Value::Deep(Arc::clone(payload.prelude()))], None)
        .unwrap();

    let (_, first) = mailbox.receive(&[Value::str("a")], None).unwrap().ready().unwrap();
    let (_, second) = mailbox.receive(&[Value::str("a")], None).unwrap().ready().unwrap();

    let identity_of = |v: &Value| match v {
        Value::Deep(p) => Arc::as_ptr(p) as usize,
        other => panic!("expected a deep value, got {other:?}"),
    };
    assert_eq!(identity_of(&first), payload_identity);
    assert_eq!(identity_of(&second), payload_identity);
}

/// spec.md §8 boundary scenario 5: "cancellation wakeup" — a lane body
/// genuinely blocked inside `Linda::receive_cancellable`'s condvar wait,
/// on a key nobody ever sends to, is woken by a hard cancel of the lane
/// rather than by its own timeout.
#[test]
fn hard_cancel_of_a_lane_blocked_in_receive_reaches_terminal_state_promptly() {
    use std::sync::OnceLock;

    static KEEPERS: OnceLock<Arc<lanes::KeeperPool>> = OnceLock::new();

    fn block_in_receive(vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, Error> {
        let prelude = match &args[0] {
            Value::Deep(p) => Arc::clone(p),
            other => panic!("expected a linda, got {other:?}"),
        };
        let keepers = Arc::clone(KEEPERS.get().expect("keepers installed before spawn"));
        let linda = Linda::from_parts(prelude, keepers);
        linda
            .receive_cancellable(&[Value::str("never")], None, || cancel_test(vm))
            .map(|_| vec![])
    }
    static BLOCK: NativeFunction = NativeFunction { f: block_in_receive as NativeFn, default_name: None };

    let universe = pool_universe();
    KEEPERS.set(Arc::clone(universe.keepers())).unwrap();
    let linda = lanes::linda(&universe, None, None);

    let creator = Vm::new();
    let function = Value::Function(FunctionRef::Native(&BLOCK));
    let args = [Value::Deep(Arc::clone(linda.prelude()))];
    let lane = Lane::spawn(&creator, &function, &args, LaneOptions::default()).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    lane.cancel(CancelRequest::Hard);
    let result = lane.join(Some(Duration::from_secs(1)));
    assert!(result.is_err());
}

/// spec.md §8 boundary scenario 6: "finalizer ordering" — finalizers run in
/// registration order, each observing the body's error, and the original
/// error survives to the join result.
#[test]
fn finalizers_run_in_registration_order_after_a_body_error() {
    static LOG: Mutex<Vec<&str>> = Mutex::new(Vec::new());
    LOG.lock().unwrap().clear();

    fn boom(_vm: &mut Vm, _args: &[Value]) -> Result<Vec<Value>, Error> {
        Err(Error::other("boom"))
    }
    static BOOM: NativeFunction = NativeFunction { f: boom as NativeFn, default_name: None };

    fn mark_a(_vm: &mut Vm, args: &[Value]) -> Result<Vec<Value>, Error> {
        assert_eq!(args[0], Value::Boolean(false));
        LOG.lock().unwrap().push("A");
        Ok(vec![])
    }
    static MARK_A: NativeFunction = NativeFunction { f: mark_a as NativeFn, default_name: None };

    fn mark_b(_vm: &mut Vm, _args: &[Value]) -> Result<Vec<Value>, Error> {
        LOG.lock().unwrap().push("B");
        Ok(vec![])
    }
    static MARK_B: NativeFunction = NativeFunction { f: mark_b as NativeFn, default_name: None };

    let creator = Vm::new();
    let function = Value::Function(FunctionRef::Native(&BOOM));
    let options = LaneOptions {
        name: None,
        finalizers: vec![
            Value::Function(FunctionRef::Native(&MARK_A)),
            Value::Function(FunctionRef::Native(&MARK_B)),
        ],
    };
    let lane = Lane::spawn(&creator, &function, &[], options).unwrap();
    let err = lane.join(Some(Duration::from_secs(5))).unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert_eq!(*LOG.lock().unwrap(), vec!["A", "B"]);
}

/// spec.md §8 "Universals": a soft-cancelled blocking linda call returns
/// the cancelled outcome rather than raising or blocking forever.
#[test]
fn soft_cancelled_linda_call_returns_without_raising() {
    let universe = pool_universe();
    let l = lanes::linda(&universe, None, None);
    let reader = l.clone();
    let handle = std::thread::spawn(move || reader.receive(&[Value::str("never")], Some(Duration::from_secs(5))));
    std::thread::sleep(Duration::from_millis(30));
    l.cancel(CancelRequest::Soft);
    let outcome: LindaOutcome<(Value, Value)> = handle.join().unwrap().unwrap();
    assert!(outcome.is_cancelled());
}
