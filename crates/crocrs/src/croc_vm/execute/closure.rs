// Closure instantiation and the open-upvalue list.
//
// The per-thread open list is kept slot-descending with no duplicates;
// returns and unwinds close every upvalue at or above the dying frame's
// base, transferring the stack value into the upvalue's own storage.

use crate::croc_value::{FuncKind, Function, Upvalue, Value};
use crate::croc_vm::{CrocError, CrocResult, CrocVm};
use crate::gc::{FuncDefId, GcId, NamespaceId, ThreadId, UpvalueId};

/// Finds the open upvalue for an absolute stack slot, creating one if
/// none exists.
pub fn find_upvalue(vm: &mut CrocVm, tid: ThreadId, abs_slot: usize) -> UpvalueId {
    // Existing entry? The list is slot-descending, so stop early.
    let mut insert_at = 0;
    {
        let t = &vm.heap[tid];
        for (i, &uv_id) in t.open_upvalues.iter().enumerate() {
            if let Upvalue::Open { slot, .. } = vm.heap[uv_id] {
                if slot == abs_slot {
                    return uv_id;
                }
                if slot < abs_slot {
                    break;
                }
            }
            insert_at = i + 1;
        }
    }

    let uv_id = vm.heap.alloc_upvalue(Upvalue::Open { thread: tid, slot: abs_slot });
    vm.heap[tid].open_upvalues.insert(insert_at, uv_id);
    uv_id
}

/// Closes every open upvalue at or above `from_slot`.
pub fn close_upvalues(vm: &mut CrocVm, tid: ThreadId, from_slot: usize) {
    loop {
        let uv_id = {
            let t = &vm.heap[tid];
            match t.open_upvalues.first() {
                Some(&id) => id,
                None => return,
            }
        };
        let slot = match vm.heap[uv_id] {
            Upvalue::Open { slot, .. } => slot,
            Upvalue::Closed(_) => {
                // Stale list entry; drop it.
                vm.heap[tid].open_upvalues.remove(0);
                continue;
            }
        };
        if slot < from_slot {
            return;
        }
        let val = vm.heap[tid].stack[slot];
        vm.heap.barrier_back(GcId::Upvalue(uv_id));
        vm.heap[uv_id] = Upvalue::Closed(val);
        vm.heap[tid].open_upvalues.remove(0);
    }
}

pub fn read_upvalue(vm: &CrocVm, uv_id: UpvalueId) -> Value {
    match vm.heap[uv_id] {
        Upvalue::Open { thread, slot } => vm.heap[thread].stack[slot],
        Upvalue::Closed(v) => v,
    }
}

pub fn write_upvalue(vm: &mut CrocVm, uv_id: UpvalueId, val: Value) {
    vm.heap.barrier_back(GcId::Upvalue(uv_id));
    match vm.heap[uv_id] {
        Upvalue::Open { thread, slot } => vm.heap[thread].stack[slot] = val,
        Upvalue::Closed(_) => vm.heap[uv_id] = Upvalue::Closed(val),
    }
}

/// Instantiates an inner function definition into a closure, capturing
/// upvalues per its descriptors: either the enclosing function's upvalue
/// handles or fresh/open upvalues over enclosing-frame registers.
pub fn make_closure(
    vm: &mut CrocVm,
    tid: ThreadId,
    stack_base: usize,
    def_id: FuncDefId,
    env: NamespaceId,
    parent_upvals: &[UpvalueId],
) -> CrocResult<Value> {
    let (name, descs) = {
        let def = &vm.heap[def_id];
        (def.name, def.upvals.clone())
    };

    let mut upvals = Vec::with_capacity(descs.len());
    for desc in &descs {
        if desc.is_upval {
            let uv = parent_upvals.get(desc.index as usize).copied().ok_or_else(|| {
                CrocError::vm_error("closure upvalue descriptor out of range")
            })?;
            upvals.push(uv);
        } else {
            upvals.push(find_upvalue(vm, tid, stack_base + desc.index as usize));
        }
    }

    let func_id = vm.heap.alloc_function(Function {
        name,
        kind: FuncKind::Script { def: def_id, env, upvals },
    });
    Ok(Value::function(func_id))
}
