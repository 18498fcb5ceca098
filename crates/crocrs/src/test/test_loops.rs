// Numeric for, foreach, switch, and global access.

use crate::test::support::{run, FuncDefBuilder};
use crate::croc_vm::opcode::{konst, reg, Op};
use crate::{CrocVm, ErrorKind, SwitchTable, Value};

fn sum_loop_def(vm: &mut CrocVm, lo: i64, hi: i64, step: i64) -> crate::FuncDefId {
    // acc = 0; for i = lo, hi, step { acc += i }; return acc
    let mut b = FuncDefBuilder::new("sumloop", 1);
    let k0 = b.kint(0);
    let klo = b.kint(lo);
    let khi = b.kint(hi);
    let kstep = b.kint(step);
    b.emit(Op::Move, 5, konst(k0), 0); // acc
    b.emit(Op::Move, 1, konst(klo), 0);
    b.emit(Op::Move, 2, konst(khi), 0);
    b.emit(Op::Move, 3, konst(kstep), 0);
    let for_at = b.emit(Op::For, 1, 0, 0);
    let body = b.here();
    b.emit(Op::AddEq, 5, reg(4), 0); // r4 is the visible index
    let loop_at = b.emit(Op::ForLoop, 1, 0, 0);
    b.patch_jump1(for_at, loop_at);
    b.patch_jump1(loop_at, body);
    b.emit(Op::SaveRets, 5, 2, 0);
    b.emit(Op::Ret, 0, 0, 0);
    b.build(vm)
}

#[test]
fn ascending_for_sums_half_open_range() {
    let mut vm = CrocVm::new();
    let def = sum_loop_def(&mut vm, 0, 5, 1);
    let results = run(&mut vm, def, &[]).unwrap();
    // visits 0,1,2,3,4
    assert_eq!(results[0].as_int(), Some(10));
}

#[test]
fn descending_for_visits_expected_endpoint() {
    let mut vm = CrocVm::new();
    let def = sum_loop_def(&mut vm, 5, 0, -1);
    let results = run(&mut vm, def, &[]).unwrap();
    // visits 4,3,2,1,0
    assert_eq!(results[0].as_int(), Some(10));
}

#[test]
fn for_flips_step_sign_to_match_direction() {
    let mut vm = CrocVm::new();
    let def = sum_loop_def(&mut vm, 0, 5, -1);
    let results = run(&mut vm, def, &[]).unwrap();
    assert_eq!(results[0].as_int(), Some(10));
}

#[test]
fn for_step_zero_is_a_value_error() {
    let mut vm = CrocVm::new();
    let def = sum_loop_def(&mut vm, 0, 5, 0);
    let err = run(&mut vm, def, &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Value);
    assert_eq!(err.message, "Numeric for loop step value may not be 0");
}

#[test]
fn for_requires_integers() {
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("f", 1);
    let kf = b.kfloat(1.5);
    let k5 = b.kint(5);
    let k1 = b.kint(1);
    b.emit(Op::Move, 1, konst(kf), 0);
    b.emit(Op::Move, 2, konst(k5), 0);
    b.emit(Op::Move, 3, konst(k1), 0);
    b.emit(Op::For, 1, 0, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);

    let err = run(&mut vm, def, &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
    assert_eq!(
        err.message,
        "Numeric for loop low, high, and step values must be integers"
    );
}

#[test]
fn foreach_over_function_iterator() {
    // iter(state, control) = control < state ? control + 1 : null
    // Loop variables are the iterator's results; sum them.
    let mut vm = CrocVm::new();

    let mut it = FuncDefBuilder::new("iter", 2);
    let k1 = it.kint(1);
    let knull = it.knull();
    it.emit(Op::Cmp, 0, reg(1), reg(0)); // control < state
    let cmp_extra = it.extra(0, 0);
    it.emit(Op::Move, 2, konst(knull), 0);
    it.emit(Op::SaveRets, 2, 2, 0);
    it.emit(Op::Ret, 0, 0, 0);
    let next = it.here();
    it.emit(Op::Add, 2, reg(1), konst(k1));
    it.emit(Op::SaveRets, 2, 2, 0);
    it.emit(Op::Ret, 0, 0, 0);
    it.patch_extra_jump(cmp_extra, next);
    let iter_def = it.build(&mut vm);
    let iter_fn = vm.new_script_function(iter_def, None).unwrap();
    vm.set_global("iter", iter_fn);

    let mut b = FuncDefBuilder::new("main", 1);
    let kname = b.kstr(&mut vm, "iter");
    let k3 = b.kint(3);
    let k0 = b.kint(0);
    b.emit(Op::Move, 5, konst(k0), 0); // acc
    b.emit(Op::GetGlobal, 1, kname, 0);
    b.emit(Op::Move, 2, konst(k3), 0); // state = 3
    b.emit(Op::Move, 3, konst(k0), 0); // control = 0
    let foreach = b.emit(Op::Foreach, 1, 0, 0);
    let body = b.here();
    b.emit(Op::AddEq, 5, reg(4), 0); // loop var
    let loop_at = b.emit(Op::ForeachLoop, 1, 1, 0);
    b.patch_jump1(foreach, loop_at);
    b.patch_jump2(loop_at, body);
    b.emit(Op::SaveRets, 5, 2, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);

    let results = run(&mut vm, def, &[]).unwrap();
    assert_eq!(results[0].as_int(), Some(6)); // 1 + 2 + 3
}

#[test]
fn foreach_over_plain_value_needs_op_apply() {
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("main", 1);
    let k3 = b.kint(3);
    b.emit(Op::Move, 1, konst(k3), 0);
    let foreach = b.emit(Op::Foreach, 1, 0, 0);
    let loop_at = b.emit(Op::ForeachLoop, 1, 1, 0);
    b.patch_jump1(foreach, loop_at);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);

    let err = run(&mut vm, def, &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
    assert_eq!(err.message, "No implementation of opApply for type 'int'");
}

#[test]
fn switch_dispatches_and_requires_default() {
    let mut vm = CrocVm::new();

    // switch(x) { case 1: return 10; case "two": return 20;
    //             default: return -1 }
    let mut b = FuncDefBuilder::new("main", 2);
    let k10 = b.kint(10);
    let k20 = b.kint(20);
    let km1 = b.kint(-1);
    let two = vm.new_string("two");

    let sw = b.emit(Op::Switch, 0, reg(1), 0);
    let case1 = b.here();
    b.emit(Op::Move, 2, konst(k10), 0);
    b.emit(Op::SaveRets, 2, 2, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let case2 = b.here();
    b.emit(Op::Move, 2, konst(k20), 0);
    b.emit(Op::SaveRets, 2, 2, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let dflt = b.here();
    b.emit(Op::Move, 2, konst(km1), 0);
    b.emit(Op::SaveRets, 2, 2, 0);
    b.emit(Op::Ret, 0, 0, 0);

    let mut st = SwitchTable::new();
    st.offsets.insert(Value::int(1), FuncDefBuilder::offset_to(sw, case1) as i32);
    st.offsets.insert(two, FuncDefBuilder::offset_to(sw, case2) as i32);
    st.default_offset = Some(FuncDefBuilder::offset_to(sw, dflt) as i32);
    let st_idx = b.switch_table(st);
    assert_eq!(st_idx, 0);
    let def = b.build(&mut vm);

    let r = run(&mut vm, def, &[Value::int(1)]).unwrap();
    assert_eq!(r[0].as_int(), Some(10));
    let r = run(&mut vm, def, &[two]).unwrap();
    assert_eq!(r[0].as_int(), Some(20));
    let r = run(&mut vm, def, &[Value::int(99)]).unwrap();
    assert_eq!(r[0].as_int(), Some(-1));
}

#[test]
fn switch_without_default_raises() {
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("main", 2);
    let sw = b.emit(Op::Switch, 0, reg(1), 0);
    let case1 = b.here();
    b.emit(Op::Ret, 0, 0, 0);
    let mut st = SwitchTable::new();
    st.offsets.insert(Value::int(1), FuncDefBuilder::offset_to(sw, case1) as i32);
    b.switch_table(st);
    let def = b.build(&mut vm);

    let err = run(&mut vm, def, &[Value::int(2)]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Switch);
    assert_eq!(err.message, "Switch without default");
}

#[test]
fn globals_create_read_write_and_errors() {
    let mut vm = CrocVm::new();

    let mut b = FuncDefBuilder::new("main", 1);
    let kx = b.kstr(&mut vm, "x");
    let k5 = b.kint(5);
    let k6 = b.kint(6);
    b.emit(Op::Move, 1, konst(k5), 0);
    b.emit(Op::NewGlobal, 1, kx, 0);
    b.emit(Op::Move, 1, konst(k6), 0);
    b.emit(Op::SetGlobal, 1, kx, 0);
    b.emit(Op::GetGlobal, 2, kx, 0);
    b.emit(Op::SaveRets, 2, 2, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);

    let results = run(&mut vm, def, &[]).unwrap();
    assert_eq!(results[0].as_int(), Some(6));
    assert_eq!(vm.get_global("x").unwrap().as_int(), Some(6));

    // Creating it again collides.
    let err = run(&mut vm, def, &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Name);
    assert_eq!(err.message, "Attempting to create a global 'x' that already exists");
}

#[test]
fn missing_global_is_a_name_error() {
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("main", 1);
    let kx = b.kstr(&mut vm, "nosuch");
    b.emit(Op::GetGlobal, 1, kx, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);

    let err = run(&mut vm, def, &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Name);
    assert_eq!(err.message, "Attempting to get a nonexistent global 'nosuch'");
}
