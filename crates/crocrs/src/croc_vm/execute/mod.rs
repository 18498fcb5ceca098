/*----------------------------------------------------------------------
  Bytecode dispatch loop.

  Structure mirrors the exception-retry shape of the execution engine:
  `execute` pushes a native-boundary EH frame and loops `interpret`
  (the hot loop, which fails by returning Err) against `unwind_step`
  (which routes the error to a script handler or out of the loop).

  The hot loop caches the current frame's context (base, constants,
  environment, upvalues, pc) in locals and reloads them exactly when the
  activation record changes ('reentry).
----------------------------------------------------------------------*/

pub(crate) mod arith;
pub(crate) mod call;
pub(crate) mod closure;
pub(crate) mod compare;
pub(crate) mod eh;
pub(crate) mod metamethod;
pub(crate) mod ops;
pub(crate) mod thread_ops;

use crate::croc_value::{
    Array, Class, CrocType, FuncDef, Namespace, ThreadState, Value, HOOK_DELAY, HOOK_LINE,
};
use crate::croc_vm::opcode::{Instruction, Op, ARRAY_SET_BLOCK, CONST_BIT};
use crate::croc_vm::{CrocError, CrocResult, CrocVm};
use crate::gc::{ClassId, GcId, StringId, ThreadId, UpvalueId};
use std::rc::Rc;

/// How a dispatch invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// The frame that entered the loop returned.
    Returned,
    /// The thread suspended; only resume re-enters.
    Yielded,
}

/// Runs the current thread from its current frame until the frame that
/// entered (`start_ar` deep) returns, the thread yields, or an exception
/// escapes this invocation.
pub(crate) fn execute(vm: &mut CrocVm, start_ar: usize) -> CrocResult<Exit> {
    let tid = vm.cur_thread;
    eh::push_native_boundary(vm, tid, start_ar);
    execute_inner(vm, tid, start_ar)
}

/// Re-enters a suspended thread's dispatch. The boundary frame from the
/// original entry is still on the thread's EH stack (possibly under
/// handler frames that were live at the yield), so none is pushed.
pub(crate) fn execute_resumed(vm: &mut CrocVm, start_ar: usize) -> CrocResult<Exit> {
    let tid = vm.cur_thread;
    execute_inner(vm, tid, start_ar)
}

fn execute_inner(vm: &mut CrocVm, tid: ThreadId, start_ar: usize) -> CrocResult<Exit> {
    loop {
        match interpret(vm, tid, start_ar) {
            Ok(Exit::Returned) => {
                eh::pop_native_boundary(vm, tid);
                return Ok(Exit::Returned);
            }
            // The boundary stays for the resume that will continue us.
            Ok(Exit::Yielded) => return Ok(Exit::Yielded),
            Err(e) => match eh::unwind_step(vm, tid, e) {
                eh::Unwound::Caught => continue,
                eh::Unwound::Boundary(e) => return Err(e),
            },
        }
    }
}

/// Register-or-constant operand fetch.
#[inline(always)]
fn oper(vm: &CrocVm, tid: ThreadId, base: usize, def: &FuncDef, word: u32) -> CrocResult<Value> {
    if word & CONST_BIT != 0 {
        def.constants
            .get((word & !CONST_BIT) as usize)
            .copied()
            .ok_or_else(|| CrocError::vm_error("constant index out of range"))
    } else {
        vm.heap[tid]
            .stack
            .get(base + word as usize)
            .copied()
            .ok_or_else(|| CrocError::vm_error("register out of range"))
    }
}

#[inline(always)]
fn const_string(def: &FuncDef, idx: u32) -> CrocResult<StringId> {
    def.constants
        .get(idx as usize)
        .and_then(|v| v.as_string_id())
        .ok_or_else(|| CrocError::vm_error("expected a string constant"))
}

/// Consumes the trailing ExtraArg record of a wide instruction.
#[inline(always)]
fn fetch_extra(def: &FuncDef, pc: &mut usize) -> CrocResult<Instruction> {
    let extra = def
        .code
        .get(*pc)
        .copied()
        .ok_or_else(|| CrocError::vm_error("truncated wide instruction"))?;
    if extra.opcode != Op::ExtraArg {
        return Err(CrocError::vm_error("wide instruction without ExtraArg"));
    }
    *pc += 1;
    Ok(extra)
}

#[inline(always)]
fn branch(pc: usize, offset: i32) -> usize {
    (pc as i64 + offset as i64) as usize
}

#[inline(always)]
fn set_pc(vm: &mut CrocVm, tid: ThreadId, pc: usize) {
    let t = &mut vm.heap[tid];
    let top = t.ars.len() - 1;
    t.ars[top].pc = pc;
}

/// Walks an instance's class chain.
pub(crate) fn instance_derives_from(vm: &CrocVm, inst: Value, cls: ClassId) -> bool {
    let iid = match inst.as_instance_id() {
        Some(id) => id,
        None => return false,
    };
    let mut cur = Some(vm.heap[iid].class);
    while let Some(c) = cur {
        if c == cls {
            return true;
        }
        cur = vm.heap[c].base;
    }
    false
}

/// Runs a hook callback with hooks masked off for its duration.
fn call_hook(vm: &mut CrocVm, tid: ThreadId, kind: &str) -> CrocResult<()> {
    let func = match vm.heap[tid].hook_func {
        Some(f) => f,
        None => return Ok(()),
    };
    let saved = vm.heap[tid].hooks;
    vm.heap[tid].hooks = 0;

    let kind_val = vm.new_string(kind);
    let slot = {
        let t = &mut vm.heap[tid];
        let s = t.stack_index;
        t.ensure_stack(s + 3);
        t.stack[s] = func;
        t.stack[s + 1] = Value::null();
        t.stack[s + 2] = kind_val;
        t.stack_index = s + 3;
        s
    };
    let result = call::call_and_run(vm, tid, slot, 2, 0);
    let t = &mut vm.heap[tid];
    t.stack_index = slot;
    t.hooks = saved;
    result
}

/// A return value slot read from the results buffer, null past the end.
fn ret_at(vm: &CrocVm, tid: ThreadId, idx: usize) -> Value {
    let t = &vm.heap[tid];
    let top = t.ars.len() - 1;
    let ar = &t.ars[top];
    if idx < ar.num_results {
        t.results.get(ar.first_result + idx).copied().unwrap_or(Value::null())
    } else {
        Value::null()
    }
}

fn interpret(vm: &mut CrocVm, tid: ThreadId, start_ar: usize) -> CrocResult<Exit> {
    'reentry: loop {
        // ===== Load frame context; reloaded at every AR change =====
        let (func_id, mut pc, base) = {
            let t = &vm.heap[tid];
            if t.ars.is_empty() {
                return Err(CrocError::vm_error("dispatch with no activation record"));
            }
            let ar = &t.ars[t.ars.len() - 1];
            (ar.func, ar.pc, ar.stack_base)
        };
        let (def, env): (Rc<FuncDef>, _) = {
            let f = &vm.heap[func_id];
            match f.script_parts() {
                Some((d, e, _)) => (vm.heap[d].clone(), e),
                None => return Err(CrocError::vm_error("native frame in dispatch loop")),
            }
        };
        let upvals: Vec<UpvalueId> = {
            let f = &vm.heap[func_id];
            match f.script_parts() {
                Some((_, _, u)) => u.to_vec(),
                None => Vec::new(),
            }
        };
        let mut prev_pc: Option<usize> = None;

        loop {
            {
                let t = &mut vm.heap[tid];
                if t.should_halt {
                    t.should_halt = false;
                    return Err(CrocError::new(crate::croc_vm::ErrorKind::Halt, "Thread halted"));
                }
            }

            let head = pc;

            let hooks = vm.heap[tid].hooks;
            if hooks != 0 {
                set_pc(vm, tid, head);
                if hooks & HOOK_DELAY != 0 {
                    let fire = {
                        let t = &mut vm.heap[tid];
                        if t.hook_counter > 0 {
                            t.hook_counter -= 1;
                        }
                        t.hook_counter == 0
                    };
                    if fire {
                        let delay = vm.heap[tid].hook_delay;
                        vm.heap[tid].hook_counter = delay;
                        call_hook(vm, tid, "delay")?;
                    }
                }
                if hooks & HOOK_LINE != 0 {
                    let line = def.line_at(head);
                    let fire = match prev_pc {
                        None => true,
                        Some(p) => head < p || line != def.line_at(p),
                    };
                    if fire {
                        call_hook(vm, tid, "line")?;
                    }
                }
            }

            let i = def
                .code
                .get(pc)
                .copied()
                .ok_or_else(|| CrocError::vm_error("fell off the end of the code"))?;
            pc += 1;
            let rd = i.rd as usize;

            match i.opcode {
                // ===== Binary arithmetic =====
                Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    set_pc(vm, tid, pc);
                    arith::bin_op(vm, tid, i.opcode, base + rd, rs, rt)?;
                }

                // ===== Reflexive arithmetic =====
                Op::AddEq | Op::SubEq | Op::MulEq | Op::DivEq | Op::ModEq => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    set_pc(vm, tid, pc);
                    arith::refl_bin_op(vm, tid, i.opcode, base + rd, rs)?;
                }

                // ===== Binary bitwise =====
                Op::And | Op::Or | Op::Xor | Op::Shl | Op::Shr | Op::UShr => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    arith::bin_bitwise(vm, tid, i.opcode, base + rd, rs, rt)?;
                }

                // ===== Reflexive bitwise =====
                Op::AndEq | Op::OrEq | Op::XorEq | Op::ShlEq | Op::ShrEq | Op::UShrEq => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    arith::refl_bitwise(vm, tid, i.opcode, base + rd, rs)?;
                }

                // ===== Unary =====
                Op::Neg => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    arith::neg(vm, tid, base + rd, rs)?;
                }
                Op::Com => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    arith::com(vm, tid, base + rd, rs)?;
                }
                Op::Not => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    vm.heap[tid].stack[base + rd] = Value::bool(rs.is_false());
                }
                Op::AsBool => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    vm.heap[tid].stack[base + rd] = Value::bool(rs.is_true());
                }
                Op::AsInt => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let v = arith::as_int(rs)?;
                    vm.heap[tid].stack[base + rd] = v;
                }
                Op::AsFloat => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let v = arith::as_float(rs)?;
                    vm.heap[tid].stack[base + rd] = v;
                }
                Op::AsString => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let s = vm.value_to_string(rs);
                    let v = vm.new_string(&s);
                    vm.heap[tid].stack[base + rd] = v;
                    vm.maybe_collect();
                }
                Op::Inc => arith::crement(vm, tid, base + rd, 1)?,
                Op::Dec => arith::crement(vm, tid, base + rd, -1)?,
                Op::Length => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    set_pc(vm, tid, pc);
                    ops::length(vm, tid, base + rd, rs)?;
                }
                Op::LengthAssign => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let obj = vm.heap[tid].stack[base + rd];
                    set_pc(vm, tid, pc);
                    ops::length_assign(vm, tid, obj, rs)?;
                }

                // ===== Data transfer =====
                Op::Move => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    vm.heap[tid].stack[base + rd] = rs;
                }
                Op::NewGlobal => {
                    let name = const_string(&def, i.op1)?;
                    let val = vm.heap[tid].stack[base + rd];
                    vm.new_global_impl(env, name, val)?;
                }
                Op::GetGlobal => {
                    let name = const_string(&def, i.op1)?;
                    let v = vm.get_global_impl(env, name)?;
                    vm.heap[tid].stack[base + rd] = v;
                }
                Op::SetGlobal => {
                    let name = const_string(&def, i.op1)?;
                    let val = vm.heap[tid].stack[base + rd];
                    vm.set_global_impl(env, name, val)?;
                }
                Op::GetUpval => {
                    let uv = upvals
                        .get(i.op1 as usize)
                        .copied()
                        .ok_or_else(|| CrocError::vm_error("upvalue index out of range"))?;
                    let v = closure::read_upvalue(vm, uv);
                    vm.heap[tid].stack[base + rd] = v;
                }
                Op::SetUpval => {
                    let uv = upvals
                        .get(i.op1 as usize)
                        .copied()
                        .ok_or_else(|| CrocError::vm_error("upvalue index out of range"))?;
                    let val = vm.heap[tid].stack[base + rd];
                    closure::write_upvalue(vm, uv, val);
                }

                // ===== Comparison and branches =====
                Op::Cmp3 => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    set_pc(vm, tid, pc);
                    let c = compare::cmp3(vm, tid, rs, rt)?;
                    vm.heap[tid].stack[base + rd] = Value::int(c);
                }
                Op::Cmp => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    let extra = fetch_extra(&def, &mut pc)?;
                    let jump = extra.imm1();
                    set_pc(vm, tid, pc);
                    let c = compare::cmp3(vm, tid, rs, rt)?;
                    let take = match rd {
                        0 => c < 0,  // LT
                        1 => c <= 0, // LE
                        2 => c > 0,  // GT
                        3 => c >= 0, // GE
                        _ => return Err(CrocError::vm_error("bad comparison kind")),
                    };
                    if take {
                        pc = branch(pc, jump);
                    }
                }
                Op::SwitchCmp => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    let extra = fetch_extra(&def, &mut pc)?;
                    if compare::switch_cmp(rs, rt) {
                        pc = branch(pc, extra.imm1());
                    }
                }
                Op::Equals => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    let extra = fetch_extra(&def, &mut pc)?;
                    set_pc(vm, tid, pc);
                    if compare::equals(vm, tid, rs, rt)? == (rd != 0) {
                        pc = branch(pc, extra.imm1());
                    }
                }
                Op::Is => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    let extra = fetch_extra(&def, &mut pc)?;
                    if rs.identical(&rt) == (rd != 0) {
                        pc = branch(pc, extra.imm1());
                    }
                }
                Op::In => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    let extra = fetch_extra(&def, &mut pc)?;
                    set_pc(vm, tid, pc);
                    if compare::in_op(vm, tid, rs, rt)? == (rd != 0) {
                        pc = branch(pc, extra.imm1());
                    }
                }
                Op::IsTrue => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    if rs.is_false() != (rd != 0) {
                        pc = branch(pc, i.imm2());
                    }
                }
                Op::Jmp => {
                    if rd != 0 {
                        pc = branch(pc, i.imm1());
                    }
                }
                Op::Switch => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let st = def
                        .switch_tables
                        .get(rd)
                        .ok_or_else(|| CrocError::vm_error("switch table index out of range"))?;
                    match st.offsets.get(&rs) {
                        Some(&off) => pc = branch(pc, off),
                        None => match st.default_offset {
                            Some(off) => pc = branch(pc, off),
                            None => {
                                return Err(CrocError::new(
                                    crate::croc_vm::ErrorKind::Switch,
                                    "Switch without default",
                                ))
                            }
                        },
                    }
                }
                Op::Close => closure::close_upvalues(vm, tid, base + rd),

                // ===== Loops =====
                Op::For => {
                    let jump = i.imm1();
                    let (lo, hi, step) = {
                        let t = &vm.heap[tid];
                        (t.stack[base + rd], t.stack[base + rd + 1], t.stack[base + rd + 2])
                    };
                    let (mut idx, hi, mut step) = match (lo.as_int(), hi.as_int(), step.as_int()) {
                        (Some(a), Some(b), Some(c)) => (a, b, c),
                        _ => {
                            return Err(CrocError::type_error(
                                "Numeric for loop low, high, and step values must be integers",
                            ))
                        }
                    };
                    if step == 0 {
                        return Err(CrocError::value_error(
                            "Numeric for loop step value may not be 0",
                        ));
                    }
                    if (idx > hi && step > 0) || (idx < hi && step < 0) {
                        step = -step;
                    }
                    if step < 0 {
                        // Round the start so a descending loop lands
                        // exactly on the high endpoint.
                        let span = idx.wrapping_sub(hi);
                        let mut new_idx =
                            hi.wrapping_add(span.wrapping_div(step).wrapping_mul(step));
                        if new_idx == idx {
                            new_idx = new_idx.wrapping_add(step);
                        }
                        idx = new_idx;
                    }
                    {
                        let t = &mut vm.heap[tid];
                        t.stack[base + rd] = Value::int(idx);
                        t.stack[base + rd + 2] = Value::int(step);
                    }
                    pc = branch(pc, jump);
                }
                Op::ForLoop => {
                    let jump = i.imm1();
                    let (idx, hi, step) = {
                        let t = &vm.heap[tid];
                        match (
                            t.stack[base + rd].as_int(),
                            t.stack[base + rd + 1].as_int(),
                            t.stack[base + rd + 2].as_int(),
                        ) {
                            (Some(a), Some(b), Some(c)) => (a, b, c),
                            _ => return Err(CrocError::vm_error("corrupt for loop state")),
                        }
                    };
                    let cont = if step > 0 { idx < hi } else { idx >= hi };
                    if cont {
                        let t = &mut vm.heap[tid];
                        t.stack[base + rd + 3] = Value::int(idx);
                        t.stack[base + rd] = Value::int(idx.wrapping_add(step));
                        pc = branch(pc, jump);
                    }
                }
                Op::Foreach => {
                    let jump = i.imm1();
                    let mut src = vm.heap[tid].stack[base + rd];

                    if !src.is_function() && !src.is_thread() {
                        set_pc(vm, tid, pc);
                        let method =
                            match metamethod::get_metamethod(vm, src, metamethod::MetaMethod::Apply)
                            {
                                Some(m) => m,
                                None => {
                                    return Err(CrocError::type_error(format!(
                                        "No implementation of opApply for type '{}'",
                                        src.type_name()
                                    )))
                                }
                            };
                        {
                            let t = &mut vm.heap[tid];
                            t.stack[base + rd + 2] = t.stack[base + rd + 1];
                            t.stack[base + rd + 1] = src;
                            t.stack[base + rd] = method;
                            t.stack_index = base + rd + 3;
                        }
                        call::call_and_run(vm, tid, base + rd, 2, 3)?;
                        src = vm.heap[tid].stack[base + rd];
                        if !src.is_function() && !src.is_thread() {
                            return Err(CrocError::type_error(format!(
                                "Invalid iterable type '{}' returned from opApply",
                                src.type_name()
                            )));
                        }
                    }

                    if let Some(iter_tid) = src.as_thread_id() {
                        if vm.heap[iter_tid].state != ThreadState::Initial {
                            return Err(CrocError::state_error(
                                "Attempting to iterate over a thread that is not in the 'initial' state",
                            ));
                        }
                    }
                    pc = branch(pc, jump);
                }
                Op::ForeachLoop => {
                    let num_indices = i.op1 as usize;
                    let jump = i.imm2();
                    let func_reg = rd + 3;

                    set_pc(vm, tid, pc);
                    {
                        let t = &mut vm.heap[tid];
                        t.ensure_stack(base + func_reg + 3);
                        t.stack[base + func_reg + 2] = t.stack[base + rd + 2];
                        t.stack[base + func_reg + 1] = t.stack[base + rd + 1];
                        t.stack[base + func_reg] = t.stack[base + rd];
                        t.stack_index = base + func_reg + 3;
                    }
                    call::call_and_run(vm, tid, base + func_reg, 2, num_indices as isize)?;

                    let src = vm.heap[tid].stack[base + rd];
                    if let Some(iter_tid) = src.as_thread_id() {
                        if vm.heap[iter_tid].state != ThreadState::Dead {
                            pc = branch(pc, jump);
                        }
                    } else {
                        let first = vm.heap[tid].stack[base + func_reg];
                        if !first.is_null() {
                            vm.heap[tid].stack[base + rd + 2] = first;
                            pc = branch(pc, jump);
                        }
                    }
                }

                // ===== Exception handling =====
                Op::PushCatch | Op::PushFinally => {
                    let target = branch(pc, i.imm1());
                    eh::push_script_eh(vm, tid, i.opcode == Op::PushCatch, i.rd, target)?;
                }
                Op::PopEH => eh::pop_script_eh(vm, tid)?,
                Op::EndFinal => {
                    if let Some(ex) = vm.pending_ex.take() {
                        return Err(ex);
                    }
                    let has_pending_return = {
                        let t = &vm.heap[tid];
                        t.ars[t.ars.len() - 1].unwind_return.is_some()
                            || t.ars[t.ars.len() - 1].unwind_counter > 0
                    };
                    if has_pending_return {
                        eh::unwind_return(vm, tid)?;
                        continue 'reentry;
                    }
                }
                Op::Throw => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    set_pc(vm, tid, pc);
                    let msg = vm.value_to_string(rs);
                    let mut err = CrocError::thrown(rs, msg);
                    if rd != 0 {
                        // Rethrow: keep the original traceback.
                        if let Some(prev) = vm.pending_ex.take() {
                            err = prev;
                        }
                    }
                    return Err(err);
                }
                Op::Unwind => {
                    {
                        let t = &mut vm.heap[tid];
                        let top = t.ars.len() - 1;
                        t.ars[top].unwind_return = Some(pc);
                        t.ars[top].unwind_counter = i.rd;
                    }
                    eh::unwind_return(vm, tid)?;
                    continue 'reentry;
                }

                // ===== Calls =====
                Op::Call | Op::TailCall => {
                    let is_tail = i.opcode == Op::TailCall;
                    let mut num_params = i.op1 as usize;
                    let num_returns: isize = if is_tail { -1 } else { i.op2 as isize - 1 };
                    {
                        let t = &mut vm.heap[tid];
                        if num_params == 0 {
                            num_params = t.stack_index.saturating_sub(base + rd + 1);
                        } else {
                            num_params -= 1;
                            t.stack_index = base + rd + 1 + num_params;
                        }
                    }
                    set_pc(vm, tid, pc);
                    let called = call::call_prologue(vm, tid, base + rd, num_returns, num_params, is_tail)?;
                    vm.maybe_collect();
                    match called {
                        call::Called::Script => continue 'reentry,
                        call::Called::Complete => continue 'reentry,
                        call::Called::TailComplete { slot } => {
                            let n = vm.heap[tid].stack_index.saturating_sub(slot);
                            call::save_results(vm, tid, slot, n);
                            call::call_epilogue(vm, tid)?;
                            if vm.heap[tid].ars.len() < start_ar {
                                return Ok(Exit::Returned);
                            }
                            continue 'reentry;
                        }
                    }
                }
                Op::Method | Op::TailMethod => {
                    let is_tail = i.opcode == Op::TailMethod;
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    let extra = fetch_extra(&def, &mut pc)?;
                    let mut num_params = extra.op1 as usize;
                    let num_returns: isize = if is_tail { -1 } else { extra.op2 as isize - 1 };

                    let name = rt.as_string_id().ok_or_else(|| {
                        CrocError::type_error(format!(
                            "Attempting to get a method with a non-string name (type '{}' instead)",
                            rt.type_name()
                        ))
                    })?;

                    {
                        let t = &mut vm.heap[tid];
                        if num_params == 0 {
                            num_params = t.stack_index.saturating_sub(base + rd + 1);
                        } else {
                            num_params -= 1;
                            t.stack_index = base + rd + 1 + num_params;
                        }
                    }
                    set_pc(vm, tid, pc);
                    let called = call::method_call_prologue(
                        vm, tid, base + rd, rs, name, num_returns, num_params, is_tail,
                    )?;
                    vm.maybe_collect();
                    match called {
                        call::Called::Script | call::Called::Complete => continue 'reentry,
                        call::Called::TailComplete { slot } => {
                            let n = vm.heap[tid].stack_index.saturating_sub(slot);
                            call::save_results(vm, tid, slot, n);
                            call::call_epilogue(vm, tid)?;
                            if vm.heap[tid].ars.len() < start_ar {
                                return Ok(Exit::Returned);
                            }
                            continue 'reentry;
                        }
                    }
                }
                Op::SaveRets => {
                    let raw = i.op1 as usize;
                    let first = base + rd;
                    if raw == 0 {
                        let n = vm.heap[tid].stack_index.saturating_sub(first);
                        call::save_results(vm, tid, first, n);
                        let t = &mut vm.heap[tid];
                        let top = t.ars.len() - 1;
                        t.stack_index = t.ars[top].saved_top;
                    } else {
                        call::save_results(vm, tid, first, raw - 1);
                    }
                }
                Op::Ret => {
                    call::call_epilogue(vm, tid)?;
                    if vm.heap[tid].ars.len() < start_ar {
                        return Ok(Exit::Returned);
                    }
                    continue 'reentry;
                }
                Op::Vararg => {
                    let raw = i.op1 as usize;
                    let (varg_base, num_varargs) = {
                        let t = &vm.heap[tid];
                        let ar = &t.ars[t.ars.len() - 1];
                        (ar.varg_base, ar.num_varargs())
                    };
                    let dest = base + rd;
                    let needed = if raw == 0 { num_varargs } else { raw - 1 };
                    {
                        let t = &mut vm.heap[tid];
                        t.ensure_stack(dest + needed + 1);
                        for k in 0..needed {
                            t.stack[dest + k] = if k < num_varargs {
                                t.stack[varg_base + k]
                            } else {
                                Value::null()
                            };
                        }
                        if raw == 0 {
                            t.stack_index = dest + needed;
                        }
                    }
                }
                Op::VargLen => {
                    let n = {
                        let t = &vm.heap[tid];
                        t.ars[t.ars.len() - 1].num_varargs()
                    };
                    vm.heap[tid].stack[base + rd] = Value::int(n as i64);
                }
                Op::VargIndex => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let (varg_base, num_varargs) = {
                        let t = &vm.heap[tid];
                        let ar = &t.ars[t.ars.len() - 1];
                        (ar.varg_base, ar.num_varargs())
                    };
                    let idx = rs.as_int().ok_or_else(|| {
                        CrocError::type_error(format!(
                            "Attempting to index 'vararg' with a '{}'",
                            rs.type_name()
                        ))
                    })?;
                    let idx = if idx < 0 { idx + num_varargs as i64 } else { idx };
                    if idx < 0 || idx as usize >= num_varargs {
                        return Err(CrocError::bounds_error(format!(
                            "Invalid 'vararg' index: {} (only have {})",
                            idx, num_varargs
                        )));
                    }
                    let v = vm.heap[tid].stack[varg_base + idx as usize];
                    vm.heap[tid].stack[base + rd] = v;
                }
                Op::VargIndexAssign => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    let (varg_base, num_varargs) = {
                        let t = &vm.heap[tid];
                        let ar = &t.ars[t.ars.len() - 1];
                        (ar.varg_base, ar.num_varargs())
                    };
                    let idx = rs.as_int().ok_or_else(|| {
                        CrocError::type_error(format!(
                            "Attempting to index 'vararg' with a '{}'",
                            rs.type_name()
                        ))
                    })?;
                    let idx = if idx < 0 { idx + num_varargs as i64 } else { idx };
                    if idx < 0 || idx as usize >= num_varargs {
                        return Err(CrocError::bounds_error(format!(
                            "Invalid 'vararg' index: {} (only have {})",
                            idx, num_varargs
                        )));
                    }
                    vm.heap[tid].stack[varg_base + idx as usize] = rt;
                }
                Op::Yield => {
                    if tid == vm.main_thread {
                        return Err(CrocError::runtime_error(
                            "Attempting to yield out of the main thread",
                        ));
                    }
                    if vm.heap[tid].native_call_depth > 0 {
                        return Err(CrocError::runtime_error(
                            "Attempting to yield across native / metamethod call boundary",
                        ));
                    }
                    let raw_params = i.op1 as usize;
                    let expect = i.op2 as isize - 1;
                    let first = base + rd;
                    set_pc(vm, tid, pc);
                    {
                        let t = &mut vm.heap[tid];
                        let n = if raw_params == 0 {
                            t.stack_index.saturating_sub(first)
                        } else {
                            raw_params - 1
                        };
                        t.transfer = t.stack[first..first + n].to_vec();
                        t.yield_slot = first;
                        t.yield_expect = expect;
                        t.saved_start_ar = start_ar;
                        t.state = ThreadState::Suspended;
                    }
                    return Ok(Exit::Yielded);
                }

                // ===== Parameter / return typechecks =====
                Op::CheckParams => {
                    for idx in 0..def.param_masks.len() {
                        let val = vm.heap[tid].stack[base + idx];
                        if def.param_masks[idx] & val.kind().mask_bit() == 0 {
                            return Err(if idx == 0 {
                                CrocError::type_error(format!(
                                    "'this' parameter: type '{}' is not allowed",
                                    val.type_name()
                                ))
                            } else {
                                CrocError::type_error(format!(
                                    "Parameter {}: type '{}' is not allowed",
                                    idx,
                                    val.type_name()
                                ))
                            });
                        }
                    }
                }
                Op::CheckObjParam => {
                    let val = vm.heap[tid].stack[base + rd];
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let jump = i.imm2();
                    if val.kind() != CrocType::Instance {
                        pc = branch(pc, jump);
                    } else {
                        let cls = match rs.as_class_id() {
                            Some(c) => c,
                            None => {
                                return Err(if rd == 0 {
                                    CrocError::type_error(format!(
                                        "'this' parameter: instance type constraint type must be 'class', not '{}'",
                                        rs.type_name()
                                    ))
                                } else {
                                    CrocError::type_error(format!(
                                        "Parameter {}: instance type constraint type must be 'class', not '{}'",
                                        rd,
                                        rs.type_name()
                                    ))
                                });
                            }
                        };
                        if instance_derives_from(vm, val, cls) {
                            pc = branch(pc, jump);
                        }
                    }
                }
                Op::ObjParamFail => {
                    let val = vm.heap[tid].stack[base + rd];
                    return Err(if rd == 0 {
                        CrocError::type_error(format!(
                            "'this' parameter: type '{}' is not allowed",
                            val.type_name()
                        ))
                    } else {
                        CrocError::type_error(format!(
                            "Parameter {}: type '{}' is not allowed",
                            rd,
                            val.type_name()
                        ))
                    });
                }
                Op::CustomParamFail => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let constraint = match rs.as_string_id() {
                        Some(s) => vm.heap.str(s).to_string(),
                        None => rs.type_name().to_string(),
                    };
                    return Err(if rd == 0 {
                        CrocError::type_error(format!(
                            "'this' parameter: value does not satisfy constraint '{}'",
                            constraint
                        ))
                    } else {
                        CrocError::type_error(format!(
                            "Parameter {}: value does not satisfy constraint '{}'",
                            rd, constraint
                        ))
                    });
                }
                Op::CheckRets => {
                    let actual = {
                        let t = &vm.heap[tid];
                        t.ars[t.ars.len() - 1].num_results
                    };
                    if !def.is_varret && actual > def.num_returns as usize {
                        let name = vm.heap.str(def.name).to_string();
                        return Err(CrocError::new(
                            crate::croc_vm::ErrorKind::Param,
                            format!(
                                "Function {} expects at most {} returns but was given {}",
                                name, def.num_returns, actual
                            ),
                        ));
                    }
                    for idx in 0..def.return_masks.len() {
                        let val = ret_at(vm, tid, idx);
                        if def.return_masks[idx] & val.kind().mask_bit() == 0 {
                            return Err(CrocError::type_error(format!(
                                "Return {}: type '{}' is not allowed",
                                idx + 1,
                                val.type_name()
                            )));
                        }
                    }
                }
                Op::CheckObjRet => {
                    let val = ret_at(vm, tid, rd);
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let jump = i.imm2();
                    if val.kind() != CrocType::Instance {
                        pc = branch(pc, jump);
                    } else {
                        let cls = rs.as_class_id().ok_or_else(|| {
                            CrocError::type_error(format!(
                                "Return {}: instance type constraint type must be 'class', not '{}'",
                                rd + 1,
                                rs.type_name()
                            ))
                        })?;
                        if instance_derives_from(vm, val, cls) {
                            pc = branch(pc, jump);
                        }
                    }
                }
                Op::ObjRetFail => {
                    let val = ret_at(vm, tid, rd);
                    return Err(CrocError::type_error(format!(
                        "Return {}: type '{}' is not allowed",
                        rd + 1,
                        val.type_name()
                    )));
                }
                Op::CustomRetFail => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let constraint = match rs.as_string_id() {
                        Some(s) => vm.heap.str(s).to_string(),
                        None => rs.type_name().to_string(),
                    };
                    return Err(CrocError::type_error(format!(
                        "Return {}: value does not satisfy constraint '{}'",
                        rd + 1,
                        constraint
                    )));
                }
                Op::MoveRet => {
                    let v = ret_at(vm, tid, i.op1 as usize);
                    vm.heap[tid].stack[base + rd] = v;
                }
                Op::RetAsFloat => {
                    let val = ret_at(vm, tid, rd);
                    match val.kind() {
                        CrocType::Float => {}
                        CrocType::Int => {
                            let t = &mut vm.heap[tid];
                            let top = t.ars.len() - 1;
                            let ar = &t.ars[top];
                            if rd < ar.num_results {
                                let pos = ar.first_result + rd;
                                t.results[pos] = Value::float(val.secondary as i64 as f64);
                            }
                        }
                        _ => {
                            return Err(CrocError::type_error(format!(
                                "Cannot convert type '{}' to float",
                                val.type_name()
                            )))
                        }
                    }
                }
                Op::AssertFail => {
                    let msg = vm.heap[tid].stack[base + rd];
                    return Err(match msg.as_string_id() {
                        Some(s) => {
                            let text = vm.heap.str(s).to_string();
                            CrocError::new(crate::croc_vm::ErrorKind::Assert, text)
                        }
                        None => CrocError::new(
                            crate::croc_vm::ErrorKind::Assert,
                            format!(
                                "Assertion failed, but the message is a '{}', not a 'string'",
                                msg.type_name()
                            ),
                        ),
                    });
                }

                // ===== Arrays, tables, fields, slices =====
                Op::Append => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let target = vm.heap[tid].stack[base + rd];
                    let aid = target
                        .as_array_id()
                        .ok_or_else(|| CrocError::vm_error("Append target is not an array"))?;
                    vm.heap.barrier_back(GcId::Array(aid));
                    vm.heap[aid].append(rs);
                }
                Op::SetArray => {
                    let raw = i.op1 as usize;
                    let block = i.op2 as usize;
                    let target = vm.heap[tid].stack[base + rd];
                    let aid = target
                        .as_array_id()
                        .ok_or_else(|| CrocError::vm_error("SetArray target is not an array"))?;
                    let first = base + rd + 1;
                    let vals: Vec<Value> = {
                        let t = &vm.heap[tid];
                        if raw == 0 {
                            t.stack[first..t.stack_index].to_vec()
                        } else {
                            t.stack[first..first + raw - 1].to_vec()
                        }
                    };
                    vm.heap.barrier_back(GcId::Array(aid));
                    vm.heap[aid].set_block(block * ARRAY_SET_BLOCK, &vals);
                    if raw == 0 {
                        let t = &mut vm.heap[tid];
                        let top = t.ars.len() - 1;
                        t.stack_index = t.ars[top].saved_top;
                    }
                }
                Op::Cat => {
                    let rs = i.op1 as usize;
                    let num_vals = i.op2 as usize;
                    set_pc(vm, tid, pc);
                    ops::cat(vm, tid, base + rd, base + rs, num_vals)?;
                    vm.maybe_collect();
                }
                Op::CatEq => {
                    let rs = i.op1 as usize;
                    let num_vals = i.op2 as usize;
                    set_pc(vm, tid, pc);
                    ops::cat_eq(vm, tid, base + rd, base + rs, num_vals)?;
                    vm.maybe_collect();
                }
                Op::Index => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    set_pc(vm, tid, pc);
                    ops::idx(vm, tid, base + rd, rs, rt)?;
                }
                Op::IndexAssign => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    let target = vm.heap[tid].stack[base + rd];
                    set_pc(vm, tid, pc);
                    ops::idxa(vm, tid, target, rs, rt)?;
                }
                Op::Field => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    let name = rt.as_string_id().ok_or_else(|| {
                        CrocError::type_error(format!(
                            "Field name must be a string, not a '{}'",
                            rt.type_name()
                        ))
                    })?;
                    set_pc(vm, tid, pc);
                    ops::field(vm, tid, base + rd, rs, name)?;
                }
                Op::FieldAssign => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    let target = vm.heap[tid].stack[base + rd];
                    let name = rs.as_string_id().ok_or_else(|| {
                        CrocError::type_error(format!(
                            "Field name must be a string, not a '{}'",
                            rs.type_name()
                        ))
                    })?;
                    set_pc(vm, tid, pc);
                    ops::fielda(vm, tid, target, name, rt)?;
                }
                Op::Slice => {
                    let rs = i.op1 as usize;
                    set_pc(vm, tid, pc);
                    ops::slice(vm, tid, base + rd, base + rs)?;
                }
                Op::SliceAssign => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    set_pc(vm, tid, pc);
                    ops::slice_assign(vm, tid, base + rd, rs)?;
                }

                // ===== Value creation =====
                Op::NewArray => {
                    let size = def
                        .constants
                        .get(i.op1 as usize)
                        .and_then(|v| v.as_int())
                        .ok_or_else(|| CrocError::vm_error("NewArray size must be an int constant"))?;
                    let aid = vm.heap.alloc_array(Array::new(size.max(0) as usize));
                    vm.heap[tid].stack[base + rd] = Value::array(aid);
                    vm.maybe_collect();
                }
                Op::NewTable => {
                    let id = vm.heap.alloc_table();
                    vm.heap[tid].stack[base + rd] = Value::table(id);
                    vm.maybe_collect();
                }
                Op::Closure | Op::ClosureWithEnv => {
                    let inner = def
                        .inner_funcs
                        .get(i.op1 as usize)
                        .copied()
                        .ok_or_else(|| CrocError::vm_error("inner funcdef index out of range"))?;
                    let func_env = if i.opcode == Op::ClosureWithEnv {
                        let v = vm.heap[tid].stack[base + rd];
                        v.as_namespace_id().ok_or_else(|| {
                            CrocError::type_error(format!(
                                "Attempting to use a '{}' as a closure environment",
                                v.type_name()
                            ))
                        })?
                    } else {
                        env
                    };
                    let v = closure::make_closure(vm, tid, base, inner, func_env, &upvals)?;
                    vm.heap[tid].stack[base + rd] = v;
                    vm.maybe_collect();
                }
                Op::Class => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let base_reg = i.op2 as usize;
                    let extra = fetch_extra(&def, &mut pc)?;
                    let num_bases = extra.op1 as usize;

                    let name = rs
                        .as_string_id()
                        .ok_or_else(|| CrocError::vm_error("class name must be a string"))?;
                    let cls_id = vm.heap.alloc_class(Class::new(name));

                    for k in 0..num_bases {
                        let base_val = vm.heap[tid].stack[base + base_reg + k];
                        let bid = base_val.as_class_id().ok_or_else(|| {
                            CrocError::type_error(format!(
                                "Attempting to derive a class from a value of type '{}'",
                                base_val.type_name()
                            ))
                        })?;
                        let (methods, fields): (Vec<_>, Vec<_>) = {
                            let b = &vm.heap[bid];
                            (
                                b.methods().map(|(k, v)| (*k, *v)).collect(),
                                b.field_defaults().map(|(k, v)| (*k, *v)).collect(),
                            )
                        };
                        let cls = &mut vm.heap[cls_id];
                        for (mk, mv) in methods {
                            let exists = cls.has_member(mk);
                            cls.add_method(mk, mv, exists);
                        }
                        for (fk, fv) in fields {
                            let exists = cls.has_member(fk);
                            cls.add_field(fk, fv, exists);
                        }
                        cls.base = Some(bid);
                    }

                    vm.heap[tid].stack[base + rd] = Value::class(cls_id);
                    vm.maybe_collect();
                }
                Op::Namespace => {
                    let name = const_string(&def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    let parent = match rt.kind() {
                        CrocType::Null => None,
                        CrocType::Namespace => rt.as_namespace_id(),
                        _ => {
                            let ns_name = vm.heap.str(name).to_string();
                            return Err(CrocError::type_error(format!(
                                "Attempted to use a '{}' as a parent namespace for namespace '{}'",
                                rt.type_name(),
                                ns_name
                            )));
                        }
                    };
                    let id = vm.heap.alloc_namespace(Namespace::new(name, parent));
                    vm.heap[tid].stack[base + rd] = Value::namespace(id);
                    vm.maybe_collect();
                }
                Op::NamespaceNP => {
                    let name = const_string(&def, i.op1)?;
                    let id = vm.heap.alloc_namespace(Namespace::new(name, Some(env)));
                    vm.heap[tid].stack[base + rd] = Value::namespace(id);
                    vm.maybe_collect();
                }
                Op::SuperOf => {
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let v = ops::super_of(vm, rs)?;
                    vm.heap[tid].stack[base + rd] = v;
                }
                Op::AddMember => {
                    let cls_val = vm.heap[tid].stack[base + rd];
                    let rs = oper(vm, tid, base, &def, i.op1)?;
                    let rt = oper(vm, tid, base, &def, i.op2)?;
                    let extra = fetch_extra(&def, &mut pc)?;
                    let flags = extra.op1;

                    // Codegen guarantees these.
                    let cls_id = cls_val
                        .as_class_id()
                        .ok_or_else(|| CrocError::vm_error("AddMember target is not a class"))?;
                    let name = rs
                        .as_string_id()
                        .ok_or_else(|| CrocError::vm_error("AddMember name is not a string"))?;

                    let is_method = flags & 1 != 0;
                    let is_override = flags & 2 != 0;

                    vm.heap.barrier_back(GcId::Class(cls_id));
                    let ok = if is_method {
                        vm.heap[cls_id].add_method(name, rt, is_override)
                    } else {
                        vm.heap[cls_id].add_field(name, rt, is_override)
                    };

                    if !ok {
                        let member = vm.heap.str(name).to_string();
                        let cls_name = vm.heap.str(vm.heap[cls_id].name).to_string();
                        let what = if is_method { "method" } else { "field" };
                        return Err(if is_override {
                            CrocError::field_error(format!(
                                "Attempting to override {} '{}' in class '{}', but no such member already exists",
                                what, member, cls_name
                            ))
                        } else {
                            CrocError::field_error(format!(
                                "Attempting to add a {} '{}' which already exists to class '{}'",
                                what, member, cls_name
                            ))
                        });
                    }
                }

                Op::ExtraArg => {
                    return Err(CrocError::vm_error("executed an ExtraArg operand record"))
                }
            }

            set_pc(vm, tid, pc);
            prev_pc = Some(head);
        }
    }
}
