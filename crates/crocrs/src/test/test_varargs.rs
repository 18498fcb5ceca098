// Vararg window: packing, length, indexing, and unpacking.

use crate::test::support::{assert_invariants, run, FuncDefBuilder};
use crate::croc_vm::opcode::{konst, Op};
use crate::{CrocVm, ErrorKind, Value};

#[test]
fn varg_len_and_index() {
    // f(x, ...) returns (#vararg, vararg[0], vararg[-1])
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("f", 2).vararg();
    let k0 = b.kint(0);
    let km1 = b.kint(-1);
    b.emit(Op::VargLen, 1, 0, 0);
    b.emit(Op::VargIndex, 2, konst(k0), 0);
    b.emit(Op::VargIndex, 3, konst(km1), 0);
    b.emit(Op::SaveRets, 1, 4, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);

    let results = run(
        &mut vm,
        def,
        &[Value::int(1), Value::int(10), Value::int(20), Value::int(30)],
    )
    .unwrap();
    assert_eq!(results[0].as_int(), Some(3));
    assert_eq!(results[1].as_int(), Some(10));
    assert_eq!(results[2].as_int(), Some(30));
    assert_invariants(&vm);
}

#[test]
fn declared_params_are_not_varargs() {
    // Declared x gets the first argument; varargs hold the rest.
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("f", 2).vararg();
    b.emit(Op::VargLen, 1, 0, 0);
    b.emit(Op::SaveRets, 1, 2, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);

    let results = run(&mut vm, def, &[Value::int(1)]).unwrap();
    assert_eq!(results[0].as_int(), Some(0));
}

#[test]
fn vararg_unpack_all_and_padded() {
    // return vararg  (unpack everything)
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("f", 1).vararg();
    b.emit(Op::Vararg, 1, 0, 0);
    b.emit(Op::SaveRets, 1, 0, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);

    let results = run(&mut vm, def, &[Value::int(7), Value::int(8)]).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_int(), Some(7));
    assert_eq!(results[1].as_int(), Some(8));

    // Fixed-count unpack pads with null.
    let mut b2 = FuncDefBuilder::new("g", 1).vararg();
    b2.emit(Op::Vararg, 1, 4, 0); // exactly 3 values
    b2.emit(Op::SaveRets, 1, 4, 0);
    b2.emit(Op::Ret, 0, 0, 0);
    let def2 = b2.build(&mut vm);

    let results = run(&mut vm, def2, &[Value::int(7)]).unwrap();
    assert_eq!(results[0].as_int(), Some(7));
    assert!(results[1].is_null());
    assert!(results[2].is_null());
}

#[test]
fn varg_index_out_of_bounds() {
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("f", 1).vararg();
    let k5 = b.kint(5);
    b.emit(Op::VargIndex, 1, konst(k5), 0);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);

    let err = run(&mut vm, def, &[Value::int(1)]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Bounds);
    assert_eq!(err.message, "Invalid 'vararg' index: 5 (only have 1)");
}

#[test]
fn varg_index_assign_writes_the_window() {
    let mut vm = CrocVm::new();
    let mut b = FuncDefBuilder::new("f", 1).vararg();
    let k0 = b.kint(0);
    let k99 = b.kint(99);
    b.emit(Op::VargIndexAssign, 0, konst(k0), konst(k99));
    b.emit(Op::VargIndex, 1, konst(k0), 0);
    b.emit(Op::SaveRets, 1, 2, 0);
    b.emit(Op::Ret, 0, 0, 0);
    let def = b.build(&mut vm);

    let results = run(&mut vm, def, &[Value::int(1)]).unwrap();
    assert_eq!(results[0].as_int(), Some(99));
}
