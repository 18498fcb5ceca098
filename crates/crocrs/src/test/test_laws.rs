// Property-based laws over the arithmetic and comparison protocols.

use crate::test::support::{run, FuncDefBuilder};
use crate::croc_vm::opcode::{reg, Op};
use crate::{CrocVm, FuncDefId, Value};
use proptest::prelude::*;

fn divmod_def(vm: &mut CrocVm) -> FuncDefId {
    // f(a, b) = (a / b, a mod b)
    let mut b = FuncDefBuilder::new("divmod", 3);
    b.emit(Op::Div, 3, reg(1), reg(2));
    b.emit(Op::Mod, 4, reg(1), reg(2));
    b.emit(Op::SaveRets, 3, 3, 0);
    b.emit(Op::Ret, 0, 0, 0);
    b.build(vm)
}

fn cmp3_def(vm: &mut CrocVm) -> FuncDefId {
    let mut b = FuncDefBuilder::new("cmp3", 3);
    b.emit(Op::Cmp3, 3, reg(1), reg(2));
    b.emit(Op::SaveRets, 3, 2, 0);
    b.emit(Op::Ret, 0, 0, 0);
    b.build(vm)
}

proptest! {
    #[test]
    fn division_identity_and_mod_sign(a in any::<i64>(), b in any::<i64>().prop_filter("nonzero", |b| *b != 0)) {
        let mut vm = CrocVm::new();
        let def = divmod_def(&mut vm);
        let results = run(&mut vm, def, &[Value::int(a), Value::int(b)]).unwrap();
        let q = results[0].as_int().unwrap();
        let r = results[1].as_int().unwrap();

        // (a/b)*b + (a mod b) == a, wrapping where the quotient wraps.
        prop_assert_eq!(q.wrapping_mul(b).wrapping_add(r), a);
        // sign(a mod b) == sign(a) (or zero).
        if r != 0 {
            prop_assert_eq!(r.signum(), a.signum());
        }
    }

    #[test]
    fn cmp3_antisymmetry_ints(a in any::<i64>(), b in any::<i64>()) {
        let mut vm = CrocVm::new();
        let def = cmp3_def(&mut vm);
        let ab = run(&mut vm, def, &[Value::int(a), Value::int(b)]).unwrap()[0].as_int().unwrap();
        let ba = run(&mut vm, def, &[Value::int(b), Value::int(a)]).unwrap()[0].as_int().unwrap();
        prop_assert_eq!(ab + ba, 0);
    }

    #[test]
    fn cmp3_antisymmetry_mixed_numeric(a in any::<i32>(), b in -1000.0f64..1000.0) {
        let mut vm = CrocVm::new();
        let def = cmp3_def(&mut vm);
        let ab = run(&mut vm, def, &[Value::int(a as i64), Value::float(b)]).unwrap()[0].as_int().unwrap();
        let ba = run(&mut vm, def, &[Value::float(b), Value::int(a as i64)]).unwrap()[0].as_int().unwrap();
        prop_assert_eq!(ab + ba, 0);
    }

    #[test]
    fn cmp3_matches_string_ordering(a in "[a-z]{0,8}", b in "[a-z]{0,8}") {
        let mut vm = CrocVm::new();
        let def = cmp3_def(&mut vm);
        let va = vm.new_string(&a);
        let vb = vm.new_string(&b);
        let got = run(&mut vm, def, &[va, vb]).unwrap()[0].as_int().unwrap();
        let expected = match a.cmp(&b) {
            std::cmp::Ordering::Less => -1,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        };
        prop_assert_eq!(got, expected);
    }

    #[test]
    fn scalar_display_round_trips(a in any::<i64>()) {
        let mut vm = CrocVm::new();
        let v = Value::int(a);
        let s = vm.value_to_string(v);
        let back = vm.parse_scalar(&s);
        prop_assert!(v.identical(&back));
    }

    #[test]
    fn float_display_round_trips(f in any::<f64>().prop_filter("finite", |f| f.is_finite())) {
        let mut vm = CrocVm::new();
        let v = Value::float(f);
        let s = vm.value_to_string(v);
        let back = vm.parse_scalar(&s);
        prop_assert_eq!(back.as_float(), Some(f));
    }
}
