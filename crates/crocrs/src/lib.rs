// Croc Runtime
// A register-based bytecode VM for the Croc scripting language, with a
// managed heap, cooperative coroutines, and exception unwinding.

#[cfg(test)]
mod test;

pub mod croc_value;
pub mod croc_vm;
pub mod gc;

pub use croc_value::{
    Array, Class, CrocType, FuncDef, FuncKind, Function, Instance, Memblock, Namespace, NativeObj,
    SwitchTable, Table, Thread, ThreadState, UpvalDesc, Upvalue, Value, WeakRef,
};
pub use croc_vm::opcode::{konst, reg, Comparison, Instruction, Op, CONST_BIT};
pub use croc_vm::{
    CrocError, CrocResult, CrocVm, ErrorKind, MetaMethod, NativeFn, TracebackEntry, VmOptions,
};
pub use gc::{FuncDefId, StringId, ThreadId};

/// Instantiates a compiled top-level function definition in a fresh VM
/// and runs it, returning its first result.
pub fn execute(def: FuncDef) -> CrocResult<Value> {
    let mut vm = CrocVm::new();
    let def_id = vm.new_funcdef(def);
    let func = vm.new_script_function(def_id, None)?;
    let results = vm.call_function(func, Value::null(), &[])?;
    Ok(results.into_iter().next().unwrap_or(Value::null()))
}
