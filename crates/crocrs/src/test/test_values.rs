// Value representation: truthiness, identity, display round-trips.

use crate::{CrocType, CrocVm, Value};

#[test]
fn truthiness() {
    assert!(Value::null().is_false());
    assert!(Value::bool(false).is_false());
    assert!(Value::bool(true).is_true());
    assert!(Value::int(0).is_true());
    assert!(Value::float(0.0).is_true());
    let mut vm = CrocVm::new();
    assert!(vm.new_string("").is_true());
}

#[test]
fn kinds_and_names() {
    let mut vm = CrocVm::new();
    assert_eq!(Value::null().kind(), CrocType::Null);
    assert_eq!(Value::int(3).kind(), CrocType::Int);
    assert_eq!(Value::float(3.0).kind(), CrocType::Float);
    assert_eq!(vm.new_string("x").kind(), CrocType::String);
    assert_eq!(vm.new_table().kind(), CrocType::Table);
    assert_eq!(vm.new_array(0).kind(), CrocType::Array);
    assert_eq!(Value::int(3).type_name(), "int");
}

#[test]
fn string_interning_gives_identity() {
    let mut vm = CrocVm::new();
    let a = vm.new_string("hello");
    let b = vm.new_string("hello");
    let c = vm.new_string("world");
    assert!(a.identical(&b));
    assert!(!a.identical(&c));
}

#[test]
fn heap_identity_is_per_object() {
    let mut vm = CrocVm::new();
    let a = vm.new_table();
    let b = vm.new_table();
    assert!(a.identical(&a));
    assert!(!a.identical(&b));
}

#[test]
fn display_round_trips_scalars() {
    let mut vm = CrocVm::new();
    let cases = [
        Value::null(),
        Value::bool(true),
        Value::bool(false),
        Value::int(0),
        Value::int(-42),
        Value::int(i64::MAX),
        Value::float(1.5),
        Value::float(-0.25),
        Value::float(5.0),
        Value::float(1e100),
    ];
    for v in cases {
        let s = vm.value_to_string(v);
        let back = vm.parse_scalar(&s);
        assert_eq!(v.kind(), back.kind(), "kind changed for {s}");
        assert!(v.identical(&back), "round trip failed for {s}");
    }

    let s = vm.new_string("some text");
    let text = vm.value_to_string(s);
    let back = vm.parse_scalar(&text);
    assert!(s.identical(&back));
}

#[test]
fn int_float_value_sixteen_bytes() {
    assert_eq!(std::mem::size_of::<Value>(), 16);
    assert_eq!(Value::int(i64::MIN).as_int(), Some(i64::MIN));
    assert_eq!(Value::float(f64::MAX).as_float(), Some(f64::MAX));
}
