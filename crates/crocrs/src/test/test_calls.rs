// Call machinery: script calls, native calls, multi-returns, method
// dispatch, typechecks, and tailcall depth.

use crate::test::support::{assert_invariants, run, FuncDefBuilder};
use crate::croc_vm::opcode::{konst, reg, Op};
use crate::{CrocResult, CrocType, CrocVm, ErrorKind, Value};

#[test]
fn script_calls_script() {
    // double(x) = x + x; main() = double(21)
    let mut vm = CrocVm::new();

    let mut d = FuncDefBuilder::new("double", 2);
    d.emit(Op::Add, 2, reg(1), reg(1));
    d.emit(Op::SaveRets, 2, 2, 0);
    d.emit(Op::Ret, 0, 0, 0);
    let double_def = d.build(&mut vm);
    let double = vm.new_script_function(double_def, None).unwrap();
    vm.set_global("double", double);

    let mut m = FuncDefBuilder::new("main", 1);
    let kname = m.kstr(&mut vm, "double");
    let knull = m.knull();
    let k21 = m.kint(21);
    m.emit(Op::GetGlobal, 1, kname, 0);
    m.emit(Op::Move, 2, konst(knull), 0);
    m.emit(Op::Move, 3, konst(k21), 0);
    m.emit(Op::Call, 1, 3, 2); // two params (this + x), one result
    m.emit(Op::SaveRets, 1, 2, 0);
    m.emit(Op::Ret, 0, 0, 0);
    let main_def = m.build(&mut vm);

    let results = run(&mut vm, main_def, &[]).unwrap();
    assert_eq!(results[0].as_int(), Some(42));
    assert_invariants(&vm);
}

#[test]
fn multi_return_and_move_ret() {
    // pair() returns (1, 2); caller fetches both through the results
    // buffer and also pads a missing third with null.
    let mut vm = CrocVm::new();

    let mut p = FuncDefBuilder::new("pair", 1);
    let k1 = p.kint(1);
    let k2 = p.kint(2);
    p.emit(Op::Move, 1, konst(k1), 0);
    p.emit(Op::Move, 2, konst(k2), 0);
    p.emit(Op::SaveRets, 1, 3, 0);
    p.emit(Op::Ret, 0, 0, 0);
    let pair_def = p.build(&mut vm);
    let pair = vm.new_script_function(pair_def, None).unwrap();
    vm.set_global("pair", pair);

    let mut m = FuncDefBuilder::new("main", 1);
    let kname = m.kstr(&mut vm, "pair");
    let knull = m.knull();
    m.emit(Op::GetGlobal, 1, kname, 0);
    m.emit(Op::Move, 2, konst(knull), 0);
    m.emit(Op::Call, 1, 1, 3); // no args beyond this, two results
    m.emit(Op::MoveRet, 3, 0, 0);
    m.emit(Op::MoveRet, 4, 1, 0);
    m.emit(Op::MoveRet, 5, 2, 0); // past numResults: null
    m.emit(Op::SaveRets, 3, 4, 0);
    m.emit(Op::Ret, 0, 0, 0);
    let main_def = m.build(&mut vm);

    let results = run(&mut vm, main_def, &[]).unwrap();
    assert_eq!(results[0].as_int(), Some(1));
    assert_eq!(results[1].as_int(), Some(2));
    assert!(results[2].is_null());
}

#[test]
fn call_with_all_results_chains_stack() {
    // main() = sum(pair())  -- pair's results feed sum's params via
    // numParams = 0 (use everything up to stackIndex).
    let mut vm = CrocVm::new();

    let mut p = FuncDefBuilder::new("pair", 1);
    let k30 = p.kint(30);
    let k12 = p.kint(12);
    p.emit(Op::Move, 1, konst(k30), 0);
    p.emit(Op::Move, 2, konst(k12), 0);
    p.emit(Op::SaveRets, 1, 3, 0);
    p.emit(Op::Ret, 0, 0, 0);
    let pair_def = p.build(&mut vm);
    let pair = vm.new_script_function(pair_def, None).unwrap();
    vm.set_global("pair", pair);

    let mut s = FuncDefBuilder::new("sum", 3);
    s.emit(Op::Add, 3, reg(1), reg(2));
    s.emit(Op::SaveRets, 3, 2, 0);
    s.emit(Op::Ret, 0, 0, 0);
    let sum_def = s.build(&mut vm);
    let sum = vm.new_script_function(sum_def, None).unwrap();
    vm.set_global("sum", sum);

    let mut m = FuncDefBuilder::new("main", 1);
    let ksum = m.kstr(&mut vm, "sum");
    let kpair = m.kstr(&mut vm, "pair");
    let knull = m.knull();
    m.emit(Op::GetGlobal, 1, ksum, 0);
    m.emit(Op::Move, 2, konst(knull), 0);
    m.emit(Op::GetGlobal, 3, kpair, 0);
    m.emit(Op::Move, 4, konst(knull), 0);
    m.emit(Op::Call, 3, 1, 0); // pair(): keep all results on the stack
    m.emit(Op::Call, 1, 0, 2); // sum(this, <all values up to stackIndex>)
    m.emit(Op::SaveRets, 1, 2, 0);
    m.emit(Op::Ret, 0, 0, 0);
    let main_def = m.build(&mut vm);

    let results = run(&mut vm, main_def, &[]).unwrap();
    assert_eq!(results[0].as_int(), Some(42));
}

fn native_sum(vm: &mut CrocVm) -> CrocResult<usize> {
    let n = vm.native_num_params();
    let mut total = 0i64;
    for i in 1..n {
        if let Some(v) = vm.native_param(i).as_int() {
            total += v;
        }
    }
    vm.push_value(Value::int(total));
    Ok(1)
}

#[test]
fn native_call_from_script() {
    let mut vm = CrocVm::new();
    let sum = vm.new_native_function("sum", native_sum);
    vm.set_global("sum", sum);

    let mut m = FuncDefBuilder::new("main", 1);
    let kname = m.kstr(&mut vm, "sum");
    let knull = m.knull();
    let k1 = m.kint(1);
    let k2 = m.kint(2);
    let k3 = m.kint(3);
    m.emit(Op::GetGlobal, 1, kname, 0);
    m.emit(Op::Move, 2, konst(knull), 0);
    m.emit(Op::Move, 3, konst(k1), 0);
    m.emit(Op::Move, 4, konst(k2), 0);
    m.emit(Op::Move, 5, konst(k3), 0);
    m.emit(Op::Call, 1, 5, 2);
    m.emit(Op::SaveRets, 1, 2, 0);
    m.emit(Op::Ret, 0, 0, 0);
    let main_def = m.build(&mut vm);

    let results = run(&mut vm, main_def, &[]).unwrap();
    assert_eq!(results[0].as_int(), Some(6));
    assert_invariants(&vm);
}

#[test]
fn tail_recursion_runs_in_constant_stack() {
    // f(n, acc) = n == 0 ? acc : f(n - 1, acc + n)
    let mut vm = CrocVm::new();

    let mut f = FuncDefBuilder::new("f", 3);
    let kname = f.kstr(&mut vm, "f");
    let k0 = f.kint(0);
    let k1 = f.kint(1);
    let knull = f.knull();
    f.emit(Op::Equals, 1, reg(1), konst(k0));
    let eq_extra = f.extra(0, 0);
    f.emit(Op::Sub, 3, reg(1), konst(k1));
    f.emit(Op::Add, 4, reg(2), reg(1));
    f.emit(Op::GetGlobal, 5, kname, 0);
    f.emit(Op::Move, 6, konst(knull), 0);
    f.emit(Op::Move, 7, reg(3), 0);
    f.emit(Op::Move, 8, reg(4), 0);
    f.emit(Op::TailCall, 5, 4, 0);
    let base_case = f.here();
    f.emit(Op::SaveRets, 2, 2, 0);
    f.emit(Op::Ret, 0, 0, 0);
    f.patch_extra_jump(eq_extra, base_case);
    let f_def = f.build(&mut vm);
    let func = vm.new_script_function(f_def, None).unwrap();
    vm.set_global("f", func);

    let results = vm
        .call_function(func, Value::null(), &[Value::int(100_000), Value::int(0)])
        .unwrap();
    assert_eq!(results[0].as_int(), Some(5_000_050_000));

    // One frame regardless of recursion depth.
    assert!(vm.heap[vm.cur_thread].ars.is_empty());
    assert_invariants(&vm);
}

#[test]
fn call_depth_overflow_without_tailcall() {
    // f() = f() + 0  -- a genuine recursive call must trip the AR cap.
    let mut vm = CrocVm::new();

    let mut f = FuncDefBuilder::new("f", 1);
    let kname = f.kstr(&mut vm, "f");
    let knull = f.knull();
    f.emit(Op::GetGlobal, 1, kname, 0);
    f.emit(Op::Move, 2, konst(knull), 0);
    f.emit(Op::Call, 1, 1, 2);
    f.emit(Op::SaveRets, 1, 2, 0);
    f.emit(Op::Ret, 0, 0, 0);
    let f_def = f.build(&mut vm);
    let func = vm.new_script_function(f_def, None).unwrap();
    vm.set_global("f", func);

    let err = vm.call_function(func, Value::null(), &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Runtime);
    assert_eq!(err.message, "Call stack overflow");
}

#[test]
fn method_call_on_type_metatable() {
    // Register an int "method" in the Int type metatable and invoke it
    // through the Method opcode.
    let mut vm = CrocVm::new();

    let mut d = FuncDefBuilder::new("doubled", 2);
    d.emit(Op::Add, 2, reg(0), reg(0));
    d.emit(Op::SaveRets, 2, 2, 0);
    d.emit(Op::Ret, 0, 0, 0);
    let doubled_def = d.build(&mut vm);
    let doubled = vm.new_script_function(doubled_def, None).unwrap();

    let ns = vm.new_namespace("intlib", None).unwrap();
    vm.set_field(ns, "doubled", doubled).unwrap();
    vm.set_type_metatable(CrocType::Int, Some(ns)).unwrap();

    let mut m = FuncDefBuilder::new("main", 1);
    let k21 = m.kint(21);
    let kname = m.kstr(&mut vm, "doubled");
    m.emit(Op::Method, 1, konst(k21), konst(kname));
    m.extra(2, 2); // this only, one result
    m.emit(Op::SaveRets, 1, 2, 0);
    m.emit(Op::Ret, 0, 0, 0);
    let main_def = m.build(&mut vm);

    let results = run(&mut vm, main_def, &[]).unwrap();
    assert_eq!(results[0].as_int(), Some(42));
}

#[test]
fn method_call_missing_is_field_error() {
    let mut vm = CrocVm::new();
    let mut m = FuncDefBuilder::new("main", 1);
    let k21 = m.kint(21);
    let kname = m.kstr(&mut vm, "nope");
    m.emit(Op::Method, 1, konst(k21), konst(kname));
    m.extra(2, 2);
    m.emit(Op::Ret, 0, 0, 0);
    let main_def = m.build(&mut vm);

    let err = run(&mut vm, main_def, &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Field);
    assert_eq!(err.message, "No implementation of method 'nope' for type 'int'");
}

#[test]
fn param_typecheck_rejects_bad_argument() {
    let mut vm = CrocVm::new();

    let this_mask = u32::MAX;
    let int_only = CrocType::Int.mask_bit();
    let mut f = FuncDefBuilder::new("wants_int", 2).param_masks(vec![this_mask, int_only]);
    f.emit(Op::CheckParams, 0, 0, 0);
    f.emit(Op::SaveRets, 1, 2, 0);
    f.emit(Op::Ret, 0, 0, 0);
    let f_def = f.build(&mut vm);
    let func = vm.new_script_function(f_def, None).unwrap();

    let ok = vm.call_function(func, Value::null(), &[Value::int(1)]);
    assert!(ok.is_ok());

    let err = vm
        .call_function(func, Value::null(), &[Value::bool(true)])
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
    assert_eq!(err.message, "Parameter 1: type 'bool' is not allowed");
}

#[test]
fn return_typecheck_rejects_bad_return() {
    let mut vm = CrocVm::new();

    let int_only = CrocType::Int.mask_bit();
    let mut f = FuncDefBuilder::new("returns_int", 1)
        .returns(1)
        .return_masks(vec![int_only]);
    let kb = f.k(Value::bool(true));
    f.emit(Op::Move, 1, konst(kb), 0);
    f.emit(Op::SaveRets, 1, 2, 0);
    f.emit(Op::CheckRets, 0, 0, 0);
    f.emit(Op::Ret, 0, 0, 0);
    let f_def = f.build(&mut vm);
    let func = vm.new_script_function(f_def, None).unwrap();

    let err = vm.call_function(func, Value::null(), &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
    assert_eq!(err.message, "Return 1: type 'bool' is not allowed");
}

#[test]
fn arity_check_on_extra_returns() {
    let mut vm = CrocVm::new();

    let mut f = FuncDefBuilder::new("one_ret", 1).returns(1);
    let k1 = f.kint(1);
    let k2 = f.kint(2);
    f.emit(Op::Move, 1, konst(k1), 0);
    f.emit(Op::Move, 2, konst(k2), 0);
    f.emit(Op::SaveRets, 1, 3, 0);
    f.emit(Op::CheckRets, 0, 0, 0);
    f.emit(Op::Ret, 0, 0, 0);
    let f_def = f.build(&mut vm);
    let func = vm.new_script_function(f_def, None).unwrap();

    let err = vm.call_function(func, Value::null(), &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Param);
    assert_eq!(
        err.message,
        "Function one_ret expects at most 1 returns but was given 2"
    );
}

#[test]
fn calling_a_non_callable_is_a_type_error() {
    let mut vm = CrocVm::new();
    let err = vm
        .call_function(Value::int(5), Value::null(), &[])
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
    assert_eq!(err.message, "Attempting to call a value of type 'int'");
}
