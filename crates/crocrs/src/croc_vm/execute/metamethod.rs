use crate::croc_value::Value;
use crate::croc_vm::execute::call;
use crate::croc_vm::{CrocResult, CrocVm};
use crate::gc::ThreadId;

/// The open set of user-overridable operations, keyed by name on the
/// object's class (instances) or the per-type metatable namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetaMethod {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
    Cmp = 5,
    Equals = 6,
    In = 7,
    Apply = 8,
    Index = 9,
    IndexAssign = 10,
    Field = 11,
    FieldAssign = 12,
    Length = 13,
    LengthAssign = 14,
    Slice = 15,
    SliceAssign = 16,
    Cat = 17,
    CatAssign = 18,
    Call = 19,
}

pub const NUM_METAMETHODS: usize = 20;

impl MetaMethod {
    pub const fn name(self) -> &'static str {
        match self {
            MetaMethod::Add => "opAdd",
            MetaMethod::Sub => "opSub",
            MetaMethod::Mul => "opMul",
            MetaMethod::Div => "opDiv",
            MetaMethod::Mod => "opMod",
            MetaMethod::Cmp => "opCmp",
            MetaMethod::Equals => "opEquals",
            MetaMethod::In => "opIn",
            MetaMethod::Apply => "opApply",
            MetaMethod::Index => "opIndex",
            MetaMethod::IndexAssign => "opIndexAssign",
            MetaMethod::Field => "opField",
            MetaMethod::FieldAssign => "opFieldAssign",
            MetaMethod::Length => "opLength",
            MetaMethod::LengthAssign => "opLengthAssign",
            MetaMethod::Slice => "opSlice",
            MetaMethod::SliceAssign => "opSliceAssign",
            MetaMethod::Cat => "opCat",
            MetaMethod::CatAssign => "opCatAssign",
            MetaMethod::Call => "opCall",
        }
    }

    pub const ALL: [MetaMethod; NUM_METAMETHODS] = [
        MetaMethod::Add,
        MetaMethod::Sub,
        MetaMethod::Mul,
        MetaMethod::Div,
        MetaMethod::Mod,
        MetaMethod::Cmp,
        MetaMethod::Equals,
        MetaMethod::In,
        MetaMethod::Apply,
        MetaMethod::Index,
        MetaMethod::IndexAssign,
        MetaMethod::Field,
        MetaMethod::FieldAssign,
        MetaMethod::Length,
        MetaMethod::LengthAssign,
        MetaMethod::Slice,
        MetaMethod::SliceAssign,
        MetaMethod::Cat,
        MetaMethod::CatAssign,
        MetaMethod::Call,
    ];
}

/// Looks up `mm` for a value. Instances consult their class's methods
/// first; every type then falls back to the VM's per-type metatable
/// namespace.
pub fn get_metamethod(vm: &CrocVm, val: Value, mm: MetaMethod) -> Option<Value> {
    let name = vm.mm_names[mm as usize];

    if let Some(iid) = val.as_instance_id() {
        let inst = &vm.heap[iid];
        let cls = &vm.heap[inst.class];
        if let Some(method) = cls.get_method(name) {
            return Some(method);
        }
    }

    let mt = vm.type_metatables[val.kind() as usize]?;
    vm.heap[mt].get(name)
}

/// Calls `func` as `func(this, args...)` expecting one result.
/// This is a native boundary: yields across it are forbidden.
pub fn call_metamethod(
    vm: &mut CrocVm,
    tid: ThreadId,
    func: Value,
    this: Value,
    args: &[Value],
) -> CrocResult<Value> {
    let slot = {
        let t = &mut vm.heap[tid];
        let slot = t.stack_index;
        t.ensure_stack(slot + 2 + args.len());
        t.stack[slot] = func;
        t.stack[slot + 1] = this;
        for (i, a) in args.iter().enumerate() {
            t.stack[slot + 2 + i] = *a;
        }
        t.stack_index = slot + 2 + args.len();
        slot
    };

    call::call_and_run(vm, tid, slot, 1 + args.len(), 1)?;

    let t = &mut vm.heap[tid];
    let result = t.stack[slot];
    t.stack_index = slot;
    Ok(result)
}

/// Binary metamethod dispatch: the method is looked up on the left
/// operand, then reflected onto the right; the owner becomes `this`.
pub fn try_binary_mm(
    vm: &mut CrocVm,
    tid: ThreadId,
    mm: MetaMethod,
    lhs: Value,
    rhs: Value,
) -> CrocResult<Option<Value>> {
    if let Some(method) = get_metamethod(vm, lhs, mm) {
        let result = call_metamethod(vm, tid, method, lhs, &[rhs])?;
        return Ok(Some(result));
    }
    if let Some(method) = get_metamethod(vm, rhs, mm) {
        let result = call_metamethod(vm, tid, method, rhs, &[lhs])?;
        return Ok(Some(result));
    }
    Ok(None)
}

