// Call prologues and epilogues, method dispatch, tailcalls, and the
// nested call runner used by metamethods, iterators, hooks, and the host.
//
// Result protocol: a returning frame's `SaveRets` span is published to
// the caller's AR (for MoveRet/CheckObjRet/RetAsFloat) and also copied to
// the stack at the call slot, padded or truncated to the caller's
// expectation; expectation -1 keeps every result and raises stackIndex.

use crate::croc_value::{CrocType, FuncKind, Instance, Value};
use crate::croc_vm::execute::metamethod::{get_metamethod, MetaMethod};
use crate::croc_vm::execute::{closure, execute, thread_ops};
use crate::croc_vm::{ActivationRecord, CrocError, CrocResult, CrocVm};
use crate::gc::{FunctionId, StringId, ThreadId};

/// Outcome of a call prologue.
pub enum Called {
    /// A script frame was pushed (or replaced, for tailcalls); the
    /// dispatch loop re-enters.
    Script,
    /// The call finished inline; results are already delivered.
    Complete,
    /// A tailcall finished inline; the current frame must now return its
    /// results, which sit at `slot..stackIndex`.
    TailComplete { slot: usize },
}

/// Copies `vals` into the results buffer (publishing the span to the
/// current AR) and onto the stack at `dest` per `expect`.
pub fn publish_and_deliver(
    vm: &mut CrocVm,
    tid: ThreadId,
    dest: usize,
    expect: isize,
    vals: &[Value],
) {
    let t = &mut vm.heap[tid];

    if t.ars.is_empty() {
        t.results.clear();
        t.results.extend_from_slice(vals);
    } else {
        let top = t.ars.len() - 1;
        let first = t.ars[top].first_result.min(t.results.len());
        t.results.truncate(first);
        let start = t.results.len();
        t.results.extend_from_slice(vals);
        t.ars[top].first_result = start;
        t.ars[top].num_results = vals.len();
    }

    let n = vals.len();
    let k = if expect < 0 { n } else { expect as usize };
    t.ensure_stack(dest + k.max(n) + 1);
    for i in 0..k {
        t.stack[dest + i] = vals.get(i).copied().unwrap_or(Value::null());
    }

    if expect < 0 {
        t.stack_index = dest + n;
    } else {
        let restore = match t.ars.last() {
            Some(ar) if !ar.is_native => ar.saved_top,
            _ => dest + k,
        };
        t.stack_index = restore.max(dest + k);
    }
}

/// Records `count` stack values starting at `first_abs` as the current
/// frame's saved returns.
pub fn save_results(vm: &mut CrocVm, tid: ThreadId, first_abs: usize, count: usize) {
    let t = &mut vm.heap[tid];
    let top = t.ars.len() - 1;
    let start = t.results.len();
    for i in 0..count {
        let v = t.stack[first_abs + i];
        t.results.push(v);
    }
    t.ars[top].first_result = start;
    t.ars[top].num_results = count;
}

/// Pops the current frame and routes its saved returns to the caller.
pub fn call_epilogue(vm: &mut CrocVm, tid: ThreadId) -> CrocResult<()> {
    let popped = {
        let t = &mut vm.heap[tid];
        match t.ars.pop() {
            Some(ar) => ar,
            None => return Err(CrocError::vm_error("Return with no activation record")),
        }
    };
    let popped_index = vm.heap[tid].ars.len();

    // This frame's leftover handler frames die with it.
    loop {
        let t = &mut vm.heap[tid];
        match t.eh_frames.last() {
            Some(f) if f.is_script() && f.ar_index() >= popped_index => {
                t.eh_frames.pop();
            }
            _ => break,
        }
    }

    closure::close_upvalues(vm, tid, popped.stack_base);

    let vals: Vec<Value> = {
        let t = &vm.heap[tid];
        let first = popped.first_result.min(t.results.len());
        let end = (first + popped.num_results).min(t.results.len());
        t.results[first..end].to_vec()
    };
    {
        let t = &mut vm.heap[tid];
        t.results.truncate(popped.first_result.min(t.results.len()));
        t.stack_base = match t.ars.last() {
            Some(ar) => ar.stack_base,
            None => 0,
        };
    }

    publish_and_deliver(vm, tid, popped.return_slot, popped.num_returns, &vals);
    Ok(())
}

/// Truncates the results buffer to the caller's live mark; everything the
/// caller already consumed is dead once it starts a new call.
fn compact_results(vm: &mut CrocVm, tid: ThreadId) {
    let t = &mut vm.heap[tid];
    match t.ars.last_mut() {
        Some(ar) => {
            let mark = ar.first_result.min(t.results.len());
            t.results.truncate(mark);
            ar.num_results = 0;
        }
        None => t.results.clear(),
    }
}

fn script_prologue(
    vm: &mut CrocVm,
    tid: ThreadId,
    slot: usize,
    func_id: FunctionId,
    num_returns: isize,
    num_params: usize,
    is_tail: bool,
) -> CrocResult<Called> {
    let (is_vararg, decl_params, stack_size) = {
        let f = &vm.heap[func_id];
        match &f.kind {
            FuncKind::Script { def, .. } => {
                let d = &vm.heap[*def];
                (d.is_vararg, d.num_params as usize, d.stack_size as usize)
            }
            FuncKind::Native { .. } => return Err(CrocError::vm_error("native function in script prologue")),
        }
    };

    if !is_tail && vm.heap[tid].ars.len() >= vm.options.max_call_depth {
        return Err(CrocError::runtime_error("Call stack overflow"));
    }

    let (slot, num_returns, return_slot) = if is_tail {
        // Replace the current frame in place: reuse its delivery slot and
        // expectation, and drop it from tracebacks' accounting.
        let (cur_base, cur_return_slot, cur_returns) = {
            let t = &vm.heap[tid];
            let ar = &t.ars[t.ars.len() - 1];
            (ar.stack_base, ar.return_slot, ar.num_returns)
        };
        closure::close_upvalues(vm, tid, cur_base);

        let t = &mut vm.heap[tid];
        let window = 1 + num_params;
        t.ensure_stack(cur_return_slot + window);
        for i in 0..window {
            t.stack[cur_return_slot + i] = t.stack[slot + i];
        }
        t.ars.pop();
        (cur_return_slot, cur_returns, cur_return_slot)
    } else {
        (slot, num_returns, slot)
    };

    let base = slot + 1;
    let given = num_params;

    let (new_base, varg_base) = if is_vararg && given > decl_params {
        let t = &mut vm.heap[tid];
        t.ensure_stack(base + given + decl_params + stack_size);
        for i in 0..decl_params {
            t.stack[base + given + i] = t.stack[base + i];
        }
        (base + given, base + decl_params)
    } else {
        let t = &mut vm.heap[tid];
        t.ensure_stack(base + decl_params + stack_size);
        for i in given..decl_params {
            t.stack[base + i] = Value::null();
        }
        (base, base)
    };

    let saved_top = new_base + stack_size;
    {
        let t = &mut vm.heap[tid];
        t.ensure_stack(saved_top + 1);
        for i in (new_base + decl_params)..saved_top {
            t.stack[i] = Value::null();
        }
        t.stack_base = new_base;
        t.stack_index = saved_top;

        let first_result = t.results.len();
        let mut ar = ActivationRecord::new(func_id, new_base);
        ar.varg_base = varg_base;
        ar.saved_top = saved_top;
        ar.return_slot = return_slot;
        ar.num_returns = num_returns;
        ar.first_result = first_result;
        ar.is_tailcall = is_tail;
        t.ars.push(ar);
    }

    Ok(Called::Script)
}

fn native_call(
    vm: &mut CrocVm,
    tid: ThreadId,
    slot: usize,
    func_id: FunctionId,
    num_returns: isize,
    num_params: usize,
) -> CrocResult<()> {
    if vm.heap[tid].ars.len() >= vm.options.max_call_depth {
        return Err(CrocError::runtime_error("Call stack overflow"));
    }
    if vm.heap[tid].native_call_depth >= vm.options.max_native_depth {
        return Err(CrocError::runtime_error("Native call stack overflow"));
    }

    let func = {
        let f = &vm.heap[func_id];
        match &f.kind {
            FuncKind::Native { func } => *func,
            FuncKind::Script { .. } => return Err(CrocError::vm_error("script function in native call")),
        }
    };

    {
        let t = &mut vm.heap[tid];
        let base = slot + 1;
        t.stack_index = base + num_params;
        t.stack_base = base;
        let first_result = t.results.len();
        let mut ar = ActivationRecord::new(func_id, base);
        ar.saved_top = t.stack_index;
        ar.return_slot = slot;
        ar.num_returns = num_returns;
        ar.first_result = first_result;
        ar.is_native = true;
        t.ars.push(ar);
        t.native_call_depth += 1;
    }

    let result = func(vm);
    vm.heap[tid].native_call_depth -= 1;
    let nrets = result?;

    let first_abs = vm.heap[tid].stack_index.saturating_sub(nrets);
    save_results(vm, tid, first_abs, nrets);
    call_epilogue(vm, tid)
}

/// Resolves a method by the object's method-resolution protocol.
pub fn lookup_method(vm: &mut CrocVm, obj: Value, name: StringId) -> CrocResult<Value> {
    let found = match obj.kind() {
        CrocType::Instance => {
            let id = obj.as_instance_id().ok_or_else(|| CrocError::vm_error("bad instance"))?;
            let inst = &vm.heap[id];
            inst.get_field(name).or_else(|| vm.heap[inst.class].get_method(name))
        }
        CrocType::Class => {
            let id = obj.as_class_id().ok_or_else(|| CrocError::vm_error("bad class"))?;
            let cls = &vm.heap[id];
            cls.get_method(name).or_else(|| cls.get_field(name))
        }
        CrocType::Namespace => {
            let id = obj.as_namespace_id().ok_or_else(|| CrocError::vm_error("bad namespace"))?;
            vm.heap[id].get(name)
        }
        CrocType::Table => {
            let id = obj.as_table_id().ok_or_else(|| CrocError::vm_error("bad table"))?;
            let v = vm.heap[id].get(&Value::string(name));
            if v.is_null() { None } else { Some(v) }
        }
        _ => {
            let mt = vm.type_metatables[obj.kind() as usize];
            mt.and_then(|ns| vm.heap[ns].get(name))
        }
    };

    match found {
        Some(v) => Ok(v),
        None => {
            let method_name = vm.heap.str(name).to_string();
            Err(CrocError::field_error(format!(
                "No implementation of method '{}' for type '{}'",
                method_name,
                obj.type_name()
            )))
        }
    }
}

/// Creates an instance of `cls` and runs its constructor, if any, with
/// the call window's arguments.
fn instantiate(
    vm: &mut CrocVm,
    tid: ThreadId,
    slot: usize,
    num_params: usize,
) -> CrocResult<Value> {
    let callee = vm.heap[tid].stack[slot];
    let cls_id = callee.as_class_id().ok_or_else(|| CrocError::vm_error("bad class"))?;

    let inst = {
        let cls = &vm.heap[cls_id];
        Instance::new(cls_id, cls)
    };
    let inst_id = vm.heap.alloc_instance(inst);
    let inst_val = Value::instance(inst_id);

    let ctor = vm.heap[cls_id].get_method(vm.ctor_name);
    if let Some(ctor) = ctor {
        // ctor(this=instance, args...); args follow the original `this`
        // slot in the call window.
        let args: Vec<Value> = {
            let t = &vm.heap[tid];
            if num_params > 1 {
                t.stack[slot + 2..slot + 1 + num_params].to_vec()
            } else {
                Vec::new()
            }
        };
        let call_slot = {
            let t = &mut vm.heap[tid];
            let s = t.stack_index;
            t.ensure_stack(s + 2 + args.len());
            t.stack[s] = ctor;
            t.stack[s + 1] = inst_val;
            for (i, a) in args.iter().enumerate() {
                t.stack[s + 2 + i] = *a;
            }
            t.stack_index = s + 2 + args.len();
            s
        };
        call_and_run(vm, tid, call_slot, 1 + args.len(), 0)?;
        vm.heap[tid].stack_index = call_slot;
    }

    Ok(inst_val)
}

/// Decides script vs native dispatch for the callee at `slot` and runs
/// the appropriate prologue. The window is `[slot]=callee, [slot+1]=this,
/// args beyond`; `num_params` counts `this` plus the args.
pub fn call_prologue(
    vm: &mut CrocVm,
    tid: ThreadId,
    slot: usize,
    num_returns: isize,
    num_params: usize,
    is_tail: bool,
) -> CrocResult<Called> {
    compact_results(vm, tid);

    let callee = vm.heap[tid].stack[slot];

    match callee.kind() {
        CrocType::Function => {
            let func_id = callee.as_function_id().ok_or_else(|| CrocError::vm_error("bad function"))?;
            if vm.heap[func_id].is_native() {
                let expect = if is_tail { -1 } else { num_returns };
                native_call(vm, tid, slot, func_id, expect, num_params)?;
                if is_tail {
                    Ok(Called::TailComplete { slot })
                } else {
                    Ok(Called::Complete)
                }
            } else {
                script_prologue(vm, tid, slot, func_id, num_returns, num_params, is_tail)
            }
        }
        CrocType::Thread => {
            let target = callee.as_thread_id().ok_or_else(|| CrocError::vm_error("bad thread"))?;
            let expect = if is_tail { -1 } else { num_returns };
            thread_ops::resume_into(vm, tid, target, slot, num_params, expect)?;
            if is_tail {
                Ok(Called::TailComplete { slot })
            } else {
                Ok(Called::Complete)
            }
        }
        CrocType::Class => {
            let inst = instantiate(vm, tid, slot, num_params)?;
            let expect = if is_tail { -1 } else { num_returns };
            publish_and_deliver(vm, tid, slot, expect, &[inst]);
            if is_tail {
                Ok(Called::TailComplete { slot })
            } else {
                Ok(Called::Complete)
            }
        }
        _ => match get_metamethod(vm, callee, MetaMethod::Call) {
            Some(method) => {
                // The callee becomes `this` for its opCall.
                let t = &mut vm.heap[tid];
                t.ensure_stack(slot + 2);
                t.stack[slot] = method;
                t.stack[slot + 1] = callee;
                call_prologue(vm, tid, slot, num_returns, num_params.max(1), is_tail)
            }
            None => Err(CrocError::type_error(format!(
                "Attempting to call a value of type '{}'",
                callee.type_name()
            ))),
        },
    }
}

/// Method-call prologue: resolves `name` on `obj`, writes the method and
/// receiver into the call window, then dispatches like a normal call.
pub fn method_call_prologue(
    vm: &mut CrocVm,
    tid: ThreadId,
    slot: usize,
    obj: Value,
    name: StringId,
    num_returns: isize,
    num_params: usize,
    is_tail: bool,
) -> CrocResult<Called> {
    let method = lookup_method(vm, obj, name)?;
    {
        let t = &mut vm.heap[tid];
        t.stack[slot] = method;
        t.stack[slot + 1] = obj;
    }
    call_prologue(vm, tid, slot, num_returns, num_params, is_tail)
}

/// Runs a call to completion: prologue, then a nested dispatch loop for
/// script callees. This is the native boundary used by metamethods,
/// foreach iterators, hooks, and the host API; yields cannot cross it.
pub fn call_and_run(
    vm: &mut CrocVm,
    tid: ThreadId,
    slot: usize,
    num_params: usize,
    num_returns: isize,
) -> CrocResult<()> {
    if vm.heap[tid].native_call_depth >= vm.options.max_native_depth {
        return Err(CrocError::runtime_error("Native call stack overflow"));
    }

    vm.heap[tid].native_call_depth += 1;
    let result = (|| -> CrocResult<()> {
        match call_prologue(vm, tid, slot, num_returns, num_params, false)? {
            Called::Script => {
                let start_ar = vm.heap[tid].ars.len();
                execute(vm, start_ar)?;
                Ok(())
            }
            Called::Complete | Called::TailComplete { .. } => Ok(()),
        }
    })();
    vm.heap[tid].native_call_depth -= 1;
    result
}
