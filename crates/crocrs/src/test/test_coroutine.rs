// Coroutines: yield/resume transfer, state machine, script-side thread
// calls, and yield restrictions.

use crate::test::support::{assert_invariants, run, FuncDefBuilder};
use crate::croc_vm::opcode::{konst, reg, Op};
use crate::{CrocVm, ErrorKind, ThreadState, Value};

fn yield_two_def(vm: &mut CrocVm) -> crate::FuncDefId {
    // body() { yield 1; yield 2 }
    let mut b = FuncDefBuilder::new("body", 1);
    let k1 = b.kint(1);
    let k2 = b.kint(2);
    b.emit(Op::Move, 1, konst(k1), 0);
    b.emit(Op::Yield, 1, 2, 1);
    b.emit(Op::Move, 1, konst(k2), 0);
    b.emit(Op::Yield, 1, 2, 1);
    b.emit(Op::SaveRets, 0, 1, 0);
    b.emit(Op::Ret, 0, 0, 0);
    b.build(vm)
}

#[test]
fn yield_resume_sequence_and_states() {
    let mut vm = CrocVm::new();
    let def = yield_two_def(&mut vm);
    let body = vm.new_script_function(def, None).unwrap();
    let t = vm.new_thread(body).unwrap();

    assert_eq!(vm.thread_state(t).unwrap(), "initial");

    let r1 = vm.resume_thread(t, &[]).unwrap();
    assert_eq!(r1[0].as_int(), Some(1));
    assert_eq!(vm.thread_state(t).unwrap(), "suspended");

    let r2 = vm.resume_thread(t, &[]).unwrap();
    assert_eq!(r2[0].as_int(), Some(2));
    assert_eq!(vm.thread_state(t).unwrap(), "suspended");

    let r3 = vm.resume_thread(t, &[]).unwrap();
    assert!(r3.is_empty());
    assert_eq!(vm.thread_state(t).unwrap(), "dead");

    let err = vm.resume_thread(t, &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::State);
    assert_invariants(&vm);
}

#[test]
fn resume_values_flow_into_yield_expression() {
    // body() { got = yield 10; return got + 1 }
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("body", 1);
    let k10 = b.kint(10);
    let k1 = b.kint(1);
    b.emit(Op::Move, 1, konst(k10), 0);
    b.emit(Op::Yield, 1, 2, 2); // yield one value, expect one back in r1
    b.emit(Op::Add, 2, reg(1), konst(k1));
    b.emit(Op::SaveRets, 2, 2, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);
    let body = vm.new_script_function(def, None).unwrap();
    let t = vm.new_thread(body).unwrap();

    let first = vm.resume_thread(t, &[]).unwrap();
    assert_eq!(first[0].as_int(), Some(10));

    let second = vm.resume_thread(t, &[Value::int(41)]).unwrap();
    assert_eq!(second[0].as_int(), Some(42));
    assert_eq!(vm.thread_state(t).unwrap(), "dead");
}

#[test]
fn initial_resume_passes_arguments_as_parameters() {
    // body(x, y) { return x + y }
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("body", 3);
    b.emit(Op::Add, 3, reg(1), reg(2));
    b.emit(Op::SaveRets, 3, 2, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);
    let body = vm.new_script_function(def, None).unwrap();
    let t = vm.new_thread(body).unwrap();

    let r = vm.resume_thread(t, &[Value::int(40), Value::int(2)]).unwrap();
    assert_eq!(r[0].as_int(), Some(42));
}

#[test]
fn script_calls_thread_like_a_function() {
    // main(t) { return [t(), t()] } over a yield-two coroutine.
    let mut vm = CrocVm::new();
    let def = yield_two_def(&mut vm);
    let body = vm.new_script_function(def, None).unwrap();
    let t = vm.new_thread(body).unwrap();

    let mut m = FuncDefBuilder::new("main", 2);
    let knull = m.knull();
    m.emit(Op::Move, 2, reg(1), 0); // thread value
    m.emit(Op::Move, 3, konst(knull), 0);
    m.emit(Op::Call, 2, 1, 2); // first resume -> r2
    m.emit(Op::Move, 4, reg(1), 0);
    m.emit(Op::Move, 5, konst(knull), 0);
    m.emit(Op::Call, 4, 1, 2); // second resume -> r4
    m.emit(Op::Move, 3, reg(4), 0);
    m.emit(Op::SaveRets, 2, 3, 0);
    m.emit(Op::Ret, 0, 0, 0);
    let main_def = m.build(&mut vm);

    let results = run(&mut vm, main_def, &[t]).unwrap();
    assert_eq!(results[0].as_int(), Some(1));
    assert_eq!(results[1].as_int(), Some(2));
    assert_eq!(vm.thread_state(t).unwrap(), "suspended");
    assert_invariants(&vm);
}

#[test]
fn yield_from_main_thread_is_an_error() {
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("f", 1);
    b.emit(Op::Yield, 1, 1, 1);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);

    let err = run(&mut vm, def, &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(err.message, "Attempting to yield out of the main thread");
}

#[test]
fn yield_across_native_boundary_is_an_error() {
    // The coroutine body calls a metamethod-free helper through the
    // nested runner (a foreach iterator call) and tries to yield inside.
    let mut vm = CrocVm::new();

    let mut inner = FuncDefBuilder::new("inner", 2);
    inner.emit(Op::Yield, 1, 1, 1);
    inner.emit(Op::SaveRets, 0, 1, 0);
    inner.emit(Op::Ret, 0, 0, 0);
    let inner_def = inner.build(&mut vm);
    let inner_fn = vm.new_script_function(inner_def, None).unwrap();
    vm.set_global("inner", inner_fn);

    // body() iterates with `inner` as the foreach iterator, which runs
    // it across a native boundary.
    let mut b = FuncDefBuilder::new("body", 1);
    let kname = b.kstr(&mut vm, "inner");
    let knull = b.knull();
    b.emit(Op::GetGlobal, 1, kname, 0);
    b.emit(Op::Move, 2, konst(knull), 0);
    b.emit(Op::Move, 3, konst(knull), 0);
    let foreach = b.emit(Op::Foreach, 1, 0, 0);
    let loop_pc = b.here();
    b.emit(Op::ForeachLoop, 1, 1, 0);
    b.emit(Op::SaveRets, 0, 1, 0);
    b.emit(Op::Ret, 0, 0, 0);
    b.patch_jump1(foreach, loop_pc);
    let def = b.build(&mut vm);
    let body = vm.new_script_function(def, None).unwrap();
    let t = vm.new_thread(body).unwrap();

    let err = vm.resume_thread(t, &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(
        err.message,
        "Attempting to yield across native / metamethod call boundary"
    );
    assert_eq!(vm.thread_state(t).unwrap(), "dead");
}

#[test]
fn halt_surfaces_as_halt_exception() {
    let mut vm = CrocVm::new();
    let def = yield_two_def(&mut vm);
    let body = vm.new_script_function(def, None).unwrap();
    let t = vm.new_thread(body).unwrap();

    vm.resume_thread(t, &[]).unwrap();
    vm.halt_thread(t).unwrap();
    let err = vm.resume_thread(t, &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Halt);
    assert_eq!(vm.thread_state(t).unwrap(), "dead");
}

#[test]
fn dead_thread_observed_by_state_accessor() {
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("body", 1);
    b.emit(Op::SaveRets, 0, 1, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);
    let body = vm.new_script_function(def, None).unwrap();
    let t = vm.new_thread(body).unwrap();

    assert_eq!(vm.heap[t.as_thread_id().unwrap()].state, ThreadState::Initial);
    vm.resume_thread(t, &[]).unwrap();
    assert_eq!(vm.heap[t.as_thread_id().unwrap()].state, ThreadState::Dead);
}
