// Arithmetic, bitwise, and unary operations.
//
// Both-Int stays Int (wrapping add/sub/mul, truncating div/mod with the
// sign of the dividend); any Float operand widens both to Float. Failing
// that, user metamethods get a chance before TypeError.

use crate::croc_value::{CrocType, Value};
use crate::croc_vm::execute::metamethod::{try_binary_mm, MetaMethod};
use crate::croc_vm::opcode::Op;
use crate::croc_vm::{CrocError, CrocResult, CrocVm};
use crate::gc::ThreadId;

fn op_verb(op: Op) -> &'static str {
    match op {
        Op::Add | Op::AddEq => "add",
        Op::Sub | Op::SubEq => "subtract",
        Op::Mul | Op::MulEq => "multiply",
        Op::Div | Op::DivEq => "divide",
        Op::Mod | Op::ModEq => "modulo",
        Op::And | Op::AndEq => "and",
        Op::Or | Op::OrEq => "or",
        Op::Xor | Op::XorEq => "xor",
        Op::Shl | Op::ShlEq => "left-shift",
        Op::Shr | Op::ShrEq => "right-shift",
        Op::UShr | Op::UShrEq => "unsigned right-shift",
        _ => "operate on",
    }
}

fn arith_mm(op: Op) -> MetaMethod {
    match op {
        Op::Add | Op::AddEq => MetaMethod::Add,
        Op::Sub | Op::SubEq => MetaMethod::Sub,
        Op::Mul | Op::MulEq => MetaMethod::Mul,
        Op::Div | Op::DivEq => MetaMethod::Div,
        _ => MetaMethod::Mod,
    }
}

fn int_arith(op: Op, i1: i64, i2: i64) -> CrocResult<i64> {
    match op {
        Op::Add | Op::AddEq => Ok(i1.wrapping_add(i2)),
        Op::Sub | Op::SubEq => Ok(i1.wrapping_sub(i2)),
        Op::Mul | Op::MulEq => Ok(i1.wrapping_mul(i2)),
        Op::Div | Op::DivEq => {
            if i2 == 0 {
                return Err(CrocError::value_error("Integer divide by zero"));
            }
            Ok(i1.wrapping_div(i2))
        }
        Op::Mod | Op::ModEq => {
            if i2 == 0 {
                return Err(CrocError::value_error("Integer modulo by zero"));
            }
            Ok(i1.wrapping_rem(i2))
        }
        _ => Err(CrocError::vm_error("bad arithmetic opcode")),
    }
}

fn float_arith(op: Op, f1: f64, f2: f64) -> CrocResult<f64> {
    match op {
        Op::Add | Op::AddEq => Ok(f1 + f2),
        Op::Sub | Op::SubEq => Ok(f1 - f2),
        Op::Mul | Op::MulEq => Ok(f1 * f2),
        Op::Div | Op::DivEq => Ok(f1 / f2),
        // fmod semantics: result carries the dividend's sign.
        Op::Mod | Op::ModEq => Ok(f1 % f2),
        _ => Err(CrocError::vm_error("bad arithmetic opcode")),
    }
}

/// Binary arithmetic: `stack[dest] = rs op rt`.
pub fn bin_op(
    vm: &mut CrocVm,
    tid: ThreadId,
    op: Op,
    dest: usize,
    rs: Value,
    rt: Value,
) -> CrocResult<()> {
    let result = match (rs.kind(), rt.kind()) {
        (CrocType::Int, CrocType::Int) => {
            let (i1, i2) = (rs.secondary as i64, rt.secondary as i64);
            Value::int(int_arith(op, i1, i2)?)
        }
        (CrocType::Int, CrocType::Float)
        | (CrocType::Float, CrocType::Int)
        | (CrocType::Float, CrocType::Float) => {
            let (f1, f2) = (rs.as_num().unwrap_or(0.0), rt.as_num().unwrap_or(0.0));
            Value::float(float_arith(op, f1, f2)?)
        }
        _ => match try_binary_mm(vm, tid, arith_mm(op), rs, rt)? {
            Some(v) => v,
            None => {
                return Err(CrocError::type_error(format!(
                    "Attempting to {} a '{}' and a '{}'",
                    op_verb(op),
                    rs.type_name(),
                    rt.type_name()
                )))
            }
        },
    };

    vm.heap[tid].stack[dest] = result;
    Ok(())
}

/// Reflexive arithmetic: `stack[dest] op= rs`, converting the slot to
/// Float when contaminated.
pub fn refl_bin_op(
    vm: &mut CrocVm,
    tid: ThreadId,
    op: Op,
    dest: usize,
    rs: Value,
) -> CrocResult<()> {
    let lhs = vm.heap[tid].stack[dest];

    let result = match (lhs.kind(), rs.kind()) {
        (CrocType::Int, CrocType::Int) => {
            Value::int(int_arith(op, lhs.secondary as i64, rs.secondary as i64)?)
        }
        (CrocType::Int, CrocType::Float)
        | (CrocType::Float, CrocType::Int)
        | (CrocType::Float, CrocType::Float) => {
            let (f1, f2) = (lhs.as_num().unwrap_or(0.0), rs.as_num().unwrap_or(0.0));
            Value::float(float_arith(op, f1, f2)?)
        }
        _ => {
            return Err(CrocError::type_error(format!(
                "Attempting to {}-assign a '{}' and a '{}'",
                op_verb(op),
                lhs.type_name(),
                rs.type_name()
            )))
        }
    };

    vm.heap[tid].stack[dest] = result;
    Ok(())
}

fn int_bitwise(op: Op, i1: i64, i2: i64) -> CrocResult<i64> {
    // Shift counts are taken unsigned; >= 64 (including every negative
    // count) shifts everything out.
    let shift = i2 as u64;
    match op {
        Op::And | Op::AndEq => Ok(i1 & i2),
        Op::Or | Op::OrEq => Ok(i1 | i2),
        Op::Xor | Op::XorEq => Ok(i1 ^ i2),
        Op::Shl | Op::ShlEq => Ok(if shift >= 64 { 0 } else { ((i1 as u64) << shift) as i64 }),
        Op::Shr | Op::ShrEq => Ok(if shift >= 64 { i1 >> 63 } else { i1 >> shift }),
        Op::UShr | Op::UShrEq => Ok(if shift >= 64 { 0 } else { ((i1 as u64) >> shift) as i64 }),
        _ => Err(CrocError::vm_error("bad bitwise opcode")),
    }
}

/// Binary bitwise: both operands must be Int.
pub fn bin_bitwise(
    vm: &mut CrocVm,
    tid: ThreadId,
    op: Op,
    dest: usize,
    rs: Value,
    rt: Value,
) -> CrocResult<()> {
    match (rs.as_int(), rt.as_int()) {
        (Some(i1), Some(i2)) => {
            let v = Value::int(int_bitwise(op, i1, i2)?);
            vm.heap[tid].stack[dest] = v;
            Ok(())
        }
        _ => Err(CrocError::type_error(format!(
            "Attempting to bitwise {} a '{}' and a '{}'",
            op_verb(op),
            rs.type_name(),
            rt.type_name()
        ))),
    }
}

pub fn refl_bitwise(
    vm: &mut CrocVm,
    tid: ThreadId,
    op: Op,
    dest: usize,
    rs: Value,
) -> CrocResult<()> {
    let lhs = vm.heap[tid].stack[dest];
    match (lhs.as_int(), rs.as_int()) {
        (Some(i1), Some(i2)) => {
            let v = Value::int(int_bitwise(op, i1, i2)?);
            vm.heap[tid].stack[dest] = v;
            Ok(())
        }
        _ => Err(CrocError::type_error(format!(
            "Attempting to bitwise {}-assign a '{}' and a '{}'",
            op_verb(op),
            lhs.type_name(),
            rs.type_name()
        ))),
    }
}

pub fn neg(vm: &mut CrocVm, tid: ThreadId, dest: usize, rs: Value) -> CrocResult<()> {
    let v = match rs.kind() {
        CrocType::Int => Value::int((rs.secondary as i64).wrapping_neg()),
        CrocType::Float => Value::float(-f64::from_bits(rs.secondary)),
        _ => {
            return Err(CrocError::type_error(format!(
                "Cannot perform negation on a '{}'",
                rs.type_name()
            )))
        }
    };
    vm.heap[tid].stack[dest] = v;
    Ok(())
}

pub fn com(vm: &mut CrocVm, tid: ThreadId, dest: usize, rs: Value) -> CrocResult<()> {
    match rs.as_int() {
        Some(i) => {
            vm.heap[tid].stack[dest] = Value::int(!i);
            Ok(())
        }
        None => Err(CrocError::type_error(format!(
            "Cannot perform bitwise complement on a '{}'",
            rs.type_name()
        ))),
    }
}

pub fn as_int(rs: Value) -> CrocResult<Value> {
    match rs.kind() {
        CrocType::Bool => Ok(Value::int(if rs.is_true() { 1 } else { 0 })),
        CrocType::Int => Ok(rs),
        CrocType::Float => Ok(Value::int(f64::from_bits(rs.secondary) as i64)),
        _ => Err(CrocError::type_error(format!(
            "Cannot convert type '{}' to int",
            rs.type_name()
        ))),
    }
}

pub fn as_float(rs: Value) -> CrocResult<Value> {
    match rs.kind() {
        CrocType::Int => Ok(Value::float(rs.secondary as i64 as f64)),
        CrocType::Float => Ok(rs),
        _ => Err(CrocError::type_error(format!(
            "Cannot convert type '{}' to float",
            rs.type_name()
        ))),
    }
}

/// In-place increment/decrement of an Int or Float register.
pub fn crement(vm: &mut CrocVm, tid: ThreadId, dest: usize, delta: i64) -> CrocResult<()> {
    let cur = vm.heap[tid].stack[dest];
    let v = match cur.kind() {
        CrocType::Int => Value::int((cur.secondary as i64).wrapping_add(delta)),
        CrocType::Float => Value::float(f64::from_bits(cur.secondary) + delta as f64),
        _ => {
            let what = if delta > 0 { "increment" } else { "decrement" };
            return Err(CrocError::type_error(format!(
                "Cannot {} a '{}'",
                what,
                cur.type_name()
            )));
        }
    };
    vm.heap[tid].stack[dest] = v;
    Ok(())
}
