use crate::croc_value::Value;
use crate::croc_vm::opcode::Instruction;
use crate::croc_vm::NativeFn;
use crate::gc::{FuncDefId, NamespaceId, StringId, UpvalueId};
use ahash::RandomState;
use std::collections::HashMap;

/// Upvalue capture descriptor in a compiled function definition.
/// `is_upval` selects the enclosing function's upvalue list; otherwise
/// `index` is a register in the enclosing frame.
#[derive(Debug, Clone, Copy)]
pub struct UpvalDesc {
    pub is_upval: bool,
    pub index: u32,
}

/// Jump table for `Switch`: raw-identity value keys, offsets relative to
/// the pc after the Switch instruction. `default_offset` of None means a
/// missing default raises `SwitchError`.
pub struct SwitchTable {
    pub offsets: HashMap<Value, i32, RandomState>,
    pub default_offset: Option<i32>,
}

impl SwitchTable {
    pub fn new() -> Self {
        Self {
            offsets: HashMap::with_capacity_and_hasher(0, RandomState::new()),
            default_offset: None,
        }
    }
}

impl Default for SwitchTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable compiled function artifact. Shared by reference (`Rc` in the
/// pool) so the dispatch loop can hold it across heap mutations.
pub struct FuncDef {
    pub name: StringId,
    pub num_params: u32,
    pub is_vararg: bool,
    pub is_varret: bool,
    pub num_returns: u32,
    /// Bit `1 << CrocType` per parameter slot; slot 0 is `this`.
    pub param_masks: Vec<u32>,
    pub return_masks: Vec<u32>,
    pub constants: Vec<Value>,
    pub code: Vec<Instruction>,
    pub switch_tables: Vec<SwitchTable>,
    pub inner_funcs: Vec<FuncDefId>,
    pub upvals: Vec<UpvalDesc>,
    /// One source line per instruction record.
    pub line_info: Vec<u32>,
    /// Register window size for this function's frames.
    pub stack_size: u32,
    #[cfg(feature = "docs")]
    pub docs: Option<String>,
}

impl FuncDef {
    pub fn line_at(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }
}

pub enum FuncKind {
    Script {
        def: FuncDefId,
        env: NamespaceId,
        upvals: Vec<UpvalueId>,
    },
    Native {
        func: NativeFn,
    },
}

/// A callable: either a closure over a `FuncDef` (bound environment plus
/// captured upvalues) or a native callback.
pub struct Function {
    pub name: StringId,
    pub kind: FuncKind,
}

impl Function {
    pub fn is_native(&self) -> bool {
        matches!(self.kind, FuncKind::Native { .. })
    }

    pub fn script_parts(&self) -> Option<(FuncDefId, NamespaceId, &[UpvalueId])> {
        match &self.kind {
            FuncKind::Script { def, env, upvals } => Some((*def, *env, upvals)),
            FuncKind::Native { .. } => None,
        }
    }
}

/// Open upvalues point into their owning thread's stack; closing moves the
/// value into the upvalue's own storage.
#[derive(Clone, Copy)]
pub enum Upvalue {
    Open { thread: crate::gc::ThreadId, slot: usize },
    Closed(Value),
}
