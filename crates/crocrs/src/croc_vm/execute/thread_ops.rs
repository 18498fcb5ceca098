// Coroutine transfer: resume switches the VM's current thread and runs
// the target's dispatch loop until it yields, returns, or dies; yield
// packs transfer values and unwinds the target's own loop invocation.

use crate::croc_value::{ThreadState, Value};
use crate::croc_vm::execute::call::{call_prologue, publish_and_deliver, Called};
use crate::croc_vm::execute::{execute, execute_resumed, Exit};
use crate::croc_vm::{CrocError, CrocResult, CrocVm};
use crate::gc::ThreadId;

/// Resumes `target` with `this`/`args`, returning the values it yields or
/// returns. The caller thread is parked in the `Normal` state meanwhile.
pub fn resume(
    vm: &mut CrocVm,
    target: ThreadId,
    this: Value,
    args: &[Value],
) -> CrocResult<Vec<Value>> {
    let caller = vm.cur_thread;
    if target == caller {
        return Err(CrocError::state_error("Attempting to resume the currently-running thread"));
    }

    let initial = match vm.heap[target].state {
        ThreadState::Initial => true,
        ThreadState::Suspended => false,
        ThreadState::Dead => {
            return Err(CrocError::state_error("Attempting to resume a dead thread"))
        }
        ThreadState::Running | ThreadState::Normal => {
            return Err(CrocError::state_error(
                "Attempting to resume a thread that is already running",
            ))
        }
    };

    vm.heap[caller].state = ThreadState::Normal;
    vm.heap[target].state = ThreadState::Running;
    vm.heap[target].parent = Some(caller);
    vm.cur_thread = target;

    let exec_result = run_target(vm, target, initial, this, args);

    vm.cur_thread = caller;
    vm.heap[caller].state = ThreadState::Running;
    vm.heap[target].parent = None;

    match exec_result {
        Ok(Exit::Yielded) => {
            // State was set to Suspended by the yield itself.
            let vals = std::mem::take(&mut vm.heap[target].transfer);
            Ok(vals)
        }
        Ok(Exit::Returned) => {
            let t = &mut vm.heap[target];
            t.state = ThreadState::Dead;
            t.should_halt = false;
            let vals = t.stack[..t.stack_index.min(t.stack.len())].to_vec();
            Ok(vals)
        }
        Err(e) => {
            let t = &mut vm.heap[target];
            t.state = ThreadState::Dead;
            t.should_halt = false;
            Err(e)
        }
    }
}

fn run_target(
    vm: &mut CrocVm,
    target: ThreadId,
    initial: bool,
    this: Value,
    args: &[Value],
) -> CrocResult<Exit> {
    if initial {
        let func_id = vm.heap[target]
            .main_func
            .take()
            .ok_or_else(|| CrocError::state_error("Thread has no body to run"))?;

        {
            let t = &mut vm.heap[target];
            t.ensure_stack(2 + args.len() + 8);
            t.stack[0] = Value::function(func_id);
            t.stack[1] = this;
            for (i, a) in args.iter().enumerate() {
                t.stack[2 + i] = *a;
            }
            t.stack_index = 2 + args.len();
        }

        match call_prologue(vm, target, 0, -1, 1 + args.len(), false)? {
            Called::Script => execute(vm, 1),
            // A native thread body completes in one shot.
            Called::Complete | Called::TailComplete { .. } => Ok(Exit::Returned),
        }
    } else {
        let (dest, expect, start_ar) = {
            let t = &vm.heap[target];
            (t.yield_slot, t.yield_expect, t.saved_start_ar)
        };
        publish_and_deliver(vm, target, dest, expect, args);
        execute_resumed(vm, start_ar)
    }
}

/// A thread called like a function: resume it with the call window's
/// arguments and deliver whatever it hands back as the call's results.
pub fn resume_into(
    vm: &mut CrocVm,
    caller: ThreadId,
    target: ThreadId,
    slot: usize,
    num_params: usize,
    expect: isize,
) -> CrocResult<()> {
    let (this, args) = {
        let t = &vm.heap[caller];
        let this = t.stack[slot + 1];
        let args = if num_params > 1 {
            t.stack[slot + 2..slot + 1 + num_params].to_vec()
        } else {
            Vec::new()
        };
        (this, args)
    };

    let vals = resume(vm, target, this, &args)?;
    publish_and_deliver(vm, caller, slot, expect, &vals);
    Ok(())
}
