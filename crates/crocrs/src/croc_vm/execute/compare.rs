// Comparison, equality, identity, and membership protocols.

use crate::croc_value::{CrocType, Value};
use crate::croc_vm::execute::metamethod::{call_metamethod, get_metamethod, MetaMethod};
use crate::croc_vm::{CrocError, CrocResult, CrocVm};
use crate::gc::ThreadId;

fn order_f64(a: f64, b: f64) -> i64 {
    if a < b {
        -1
    } else if a > b {
        1
    } else {
        0
    }
}

fn order_i64(a: i64, b: i64) -> i64 {
    match a.cmp(&b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// Three-way comparison: -1/0/1. Int and Float promote to Float against
/// each other; strings compare lexicographically; otherwise `opCmp`
/// decides (negated when found on the right operand).
pub fn cmp3(vm: &mut CrocVm, tid: ThreadId, a: Value, b: Value) -> CrocResult<i64> {
    match (a.kind(), b.kind()) {
        (CrocType::Int, CrocType::Int) => {
            return Ok(order_i64(a.secondary as i64, b.secondary as i64))
        }
        (CrocType::Int, CrocType::Float)
        | (CrocType::Float, CrocType::Int)
        | (CrocType::Float, CrocType::Float) => {
            let (f1, f2) = (a.as_num().unwrap_or(0.0), b.as_num().unwrap_or(0.0));
            return Ok(order_f64(f1, f2));
        }
        (CrocType::Null, CrocType::Null) => return Ok(0),
        (CrocType::Bool, CrocType::Bool) => {
            let (b1, b2) = (a.is_true() as i64, b.is_true() as i64);
            return Ok(order_i64(b1, b2));
        }
        (CrocType::String, CrocType::String) => {
            if a.identical(&b) {
                return Ok(0);
            }
            let (sa, sb) = (a.as_string_id(), b.as_string_id());
            if let (Some(sa), Some(sb)) = (sa, sb) {
                let s1 = vm.heap.str(sa);
                let s2 = vm.heap.str(sb);
                return Ok(match s1.cmp(s2) {
                    std::cmp::Ordering::Less => -1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Greater => 1,
                });
            }
        }
        _ => {}
    }

    if let Some(method) = get_metamethod(vm, a, MetaMethod::Cmp) {
        let r = call_metamethod(vm, tid, method, a, &[b])?;
        return r.as_int().ok_or_else(|| {
            CrocError::type_error(format!("opCmp must return an int, not a '{}'", r.type_name()))
        });
    }
    if let Some(method) = get_metamethod(vm, b, MetaMethod::Cmp) {
        let r = call_metamethod(vm, tid, method, b, &[a])?;
        let v = r.as_int().ok_or_else(|| {
            CrocError::type_error(format!("opCmp must return an int, not a '{}'", r.type_name()))
        })?;
        return Ok(-v);
    }

    Err(CrocError::type_error(format!(
        "Attempting to compare a '{}' and a '{}'",
        a.type_name(),
        b.type_name()
    )))
}

/// Equality: value equality for scalars and strings (with Int/Float
/// promotion), identity for heap objects, `opEquals` fallback.
pub fn equals(vm: &mut CrocVm, tid: ThreadId, a: Value, b: Value) -> CrocResult<bool> {
    if a.identical(&b) {
        return Ok(true);
    }

    match (a.kind(), b.kind()) {
        (CrocType::Int, CrocType::Float)
        | (CrocType::Float, CrocType::Int)
        | (CrocType::Float, CrocType::Float) => {
            return Ok(a.as_num().unwrap_or(0.0) == b.as_num().unwrap_or(0.0))
        }
        (CrocType::Int, CrocType::Int)
        | (CrocType::Null, CrocType::Null)
        | (CrocType::Bool, CrocType::Bool)
        | (CrocType::String, CrocType::String) => {
            // Identity already covered value equality for these.
            return Ok(false);
        }
        _ => {}
    }

    if let Some(method) = get_metamethod(vm, a, MetaMethod::Equals) {
        let r = call_metamethod(vm, tid, method, a, &[b])?;
        return Ok(r.is_true());
    }
    if let Some(method) = get_metamethod(vm, b, MetaMethod::Equals) {
        let r = call_metamethod(vm, tid, method, b, &[a])?;
        return Ok(r.is_true());
    }

    if a.kind() == b.kind() {
        // Same heap type, different objects, no override.
        return Ok(false);
    }

    Err(CrocError::type_error(format!(
        "Attempting to compare equality of a '{}' and a '{}'",
        a.type_name(),
        b.type_name()
    )))
}

/// Switch-table equality: raw identity plus Int/Float numeric equality.
/// Never consults metamethods and never fails.
pub fn switch_cmp(a: Value, b: Value) -> bool {
    if a.identical(&b) {
        return true;
    }
    if a.is_num() && b.is_num() {
        return a.as_num().unwrap_or(0.0) == b.as_num().unwrap_or(0.0);
    }
    false
}

/// The `in` operator: membership in a container, `opIn` override on the
/// container otherwise.
pub fn in_op(vm: &mut CrocVm, tid: ThreadId, item: Value, container: Value) -> CrocResult<bool> {
    match container.kind() {
        CrocType::String => {
            let needle = item.as_string_id().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Attempting to look up a '{}' in a string",
                    item.type_name()
                ))
            })?;
            let hay = container.as_string_id().ok_or_else(|| CrocError::vm_error("bad string"))?;
            let needle_str = vm.heap.str(needle);
            let hay_str = vm.heap.str(hay);
            Ok(hay_str.contains(needle_str))
        }
        CrocType::Array => {
            let aid = container.as_array_id().ok_or_else(|| CrocError::vm_error("bad array"))?;
            Ok(vm.heap[aid].contains(item))
        }
        CrocType::Table => {
            let tid2 = container.as_table_id().ok_or_else(|| CrocError::vm_error("bad table"))?;
            Ok(vm.heap[tid2].contains(&item))
        }
        CrocType::Namespace => {
            let nid = container
                .as_namespace_id()
                .ok_or_else(|| CrocError::vm_error("bad namespace"))?;
            match item.as_string_id() {
                Some(name) => Ok(vm.heap[nid].contains(name)),
                None => Ok(false),
            }
        }
        _ => {
            if let Some(method) = get_metamethod(vm, container, MetaMethod::In) {
                let r = call_metamethod(vm, tid, method, container, &[item])?;
                return Ok(r.is_true());
            }
            Err(CrocError::type_error(format!(
                "No implementation of opIn for type '{}'",
                container.type_name()
            )))
        }
    }
}
