// Exception handling: EH frame bookkeeping, the throw unwinder, and the
// return-through-finally engine.
//
// Throws travel as Rust `Err(CrocError)` up to the dispatch loop, which
// hands them to `unwind_step`. The unwinder pops one EH frame at a time:
// catches restore state and resume in the catch body; finallies restore
// state, stash the exception as pending, and resume in the finally body
// (whose `EndFinal` re-raises); native boundaries hand the error back to
// the Rust caller that entered the loop.

use crate::croc_value::Value;
use crate::croc_vm::croc_error::TracebackEntry;
use crate::croc_vm::eh_frame::EhFrame;
use crate::croc_vm::execute::closure;
use crate::croc_vm::{CrocError, CrocResult, CrocVm, ErrorKind};
use crate::gc::ThreadId;

pub enum Unwound {
    /// A script handler took the exception; the dispatch loop re-enters.
    Caught,
    /// Unwound out of this dispatch invocation.
    Boundary(CrocError),
}

pub fn push_script_eh(
    vm: &mut CrocVm,
    tid: ThreadId,
    is_catch: bool,
    slot: u16,
    pc: usize,
) -> CrocResult<()> {
    let max_depth = vm.options.max_eh_depth;
    let t = &mut vm.heap[tid];
    if t.eh_frames.len() >= max_depth {
        return Err(CrocError::runtime_error("Exception handler stack overflow"));
    }
    let ar_index = t.ars.len() - 1;
    let stack_index = t.stack_index;
    let frame = if is_catch {
        EhFrame::ScriptCatch { ar_index, stack_index, slot, pc }
    } else {
        EhFrame::ScriptFinally { ar_index, stack_index, pc }
    };
    t.eh_frames.push(frame);
    Ok(())
}

pub fn pop_script_eh(vm: &mut CrocVm, tid: ThreadId) -> CrocResult<()> {
    let t = &mut vm.heap[tid];
    match t.eh_frames.pop() {
        Some(frame) if frame.is_script() => Ok(()),
        Some(frame) => {
            t.eh_frames.push(frame);
            Err(CrocError::vm_error("PopEH across a native boundary"))
        }
        None => Err(CrocError::vm_error("PopEH with no handler frame")),
    }
}

pub fn push_native_boundary(vm: &mut CrocVm, tid: ThreadId, start_ar: usize) {
    let t = &mut vm.heap[tid];
    let frame = EhFrame::NativeBoundary {
        ar_index: start_ar.saturating_sub(1),
        stack_index: t.stack_index,
    };
    t.eh_frames.push(frame);
}

/// Pops the boundary pushed by `push_native_boundary` on a normal exit.
pub fn pop_native_boundary(vm: &mut CrocVm, tid: ThreadId) {
    let t = &mut vm.heap[tid];
    if matches!(t.eh_frames.last(), Some(EhFrame::NativeBoundary { .. })) {
        t.eh_frames.pop();
    }
}

/// Pops activation records down to `new_len`, closing each dying frame's
/// upvalues, then restores the stack cursors.
fn restore_frames(vm: &mut CrocVm, tid: ThreadId, new_len: usize, stack_index: usize) {
    while vm.heap[tid].ars.len() > new_len {
        let base = {
            let t = &vm.heap[tid];
            t.ars[t.ars.len() - 1].stack_base
        };
        closure::close_upvalues(vm, tid, base);
        vm.heap[tid].ars.pop();
    }
    let t = &mut vm.heap[tid];
    t.stack_index = stack_index;
    t.stack_base = match t.ars.last() {
        Some(ar) => ar.stack_base,
        None => 0,
    };
}

/// The exception value a script catch receives: the thrown value itself,
/// or `"Kind: message"` for runtime-raised errors.
fn materialize(vm: &mut CrocVm, err: &CrocError) -> Value {
    match err.value {
        Some(v) => v,
        None => {
            let s = format!("{}: {}", err.kind.name(), err.message);
            vm.new_string(&s)
        }
    }
}

/// Records the current call chain on the error, innermost first.
/// Tailcall-replaced frames appear as a single marked entry.
fn capture_traceback(vm: &CrocVm, tid: ThreadId, err: &mut CrocError) {
    let t = &vm.heap[tid];
    for ar in t.ars.iter().rev() {
        let func = &vm.heap[ar.func];
        let name = vm.heap.str(func.name).to_string();
        let line = match func.script_parts() {
            Some((def_id, _, _)) => {
                let def = &vm.heap[def_id];
                def.line_at(ar.pc.saturating_sub(1))
            }
            None => 0,
        };
        err.traceback.push(TracebackEntry {
            func_name: name,
            line,
            is_tailcall: ar.is_tailcall,
        });
    }
}

/// Routes a thrown exception. Walks the current thread's EH frames from
/// the top; `HaltException` refuses script catches but still runs
/// finallies.
pub fn unwind_step(vm: &mut CrocVm, tid: ThreadId, mut err: CrocError) -> Unwound {
    if err.traceback.is_empty() {
        capture_traceback(vm, tid, &mut err);
    }

    loop {
        let frame = vm.heap[tid].eh_frames.pop();
        match frame {
            None => return Unwound::Boundary(err),
            Some(EhFrame::NativeBoundary { ar_index, stack_index }) => {
                restore_frames(vm, tid, ar_index, stack_index);
                return Unwound::Boundary(err);
            }
            Some(EhFrame::ScriptCatch { ar_index, stack_index, slot, pc }) => {
                if err.kind == ErrorKind::Halt {
                    continue;
                }
                restore_frames(vm, tid, ar_index + 1, stack_index);
                let ex_val = materialize(vm, &err);
                let t = &mut vm.heap[tid];
                let top = t.ars.len() - 1;
                t.ars[top].pc = pc;
                let base = t.ars[top].stack_base;
                t.stack[base + slot as usize] = ex_val;
                vm.pending_ex = None;
                return Unwound::Caught;
            }
            Some(EhFrame::ScriptFinally { ar_index, stack_index, pc }) => {
                restore_frames(vm, tid, ar_index + 1, stack_index);
                let t = &mut vm.heap[tid];
                let top = t.ars.len() - 1;
                t.ars[top].pc = pc;
                vm.pending_ex = Some(err);
                return Unwound::Caught;
            }
        }
    }
}

/// The `Unwind`/`EndFinal` return path: runs the next pending finally in
/// the current frame, or performs the deferred return branch once the
/// counter drains.
pub fn unwind_return(vm: &mut CrocVm, tid: ThreadId) -> CrocResult<()> {
    loop {
        let (counter, top) = {
            let t = &vm.heap[tid];
            let top = t.ars.len() - 1;
            (t.ars[top].unwind_counter, top)
        };

        if counter == 0 {
            let t = &mut vm.heap[tid];
            match t.ars[top].unwind_return.take() {
                Some(pc) => {
                    t.ars[top].pc = pc;
                    return Ok(());
                }
                None => return Err(CrocError::vm_error("Unwind with no pending return")),
            }
        }

        let frame = vm.heap[tid]
            .eh_frames
            .pop()
            .ok_or_else(|| CrocError::vm_error("Unwind past the handler stack"))?;
        vm.heap[tid].ars[top].unwind_counter -= 1;

        match frame {
            EhFrame::ScriptCatch { .. } => continue,
            EhFrame::ScriptFinally { stack_index, pc, .. } => {
                let t = &mut vm.heap[tid];
                t.stack_index = stack_index;
                t.ars[top].pc = pc;
                return Ok(());
            }
            EhFrame::NativeBoundary { .. } => {
                return Err(CrocError::vm_error("Unwind across a native boundary"))
            }
        }
    }
}
