// Bytecode construction helpers. The compiler front-end is a separate
// concern; tests assemble FuncDefs directly.

use crate::croc_value::{FuncDef, SwitchTable, ThreadState, UpvalDesc, Value};
use crate::croc_vm::opcode::{Instruction, Op};
use crate::gc::FuncDefId;
use crate::{CrocResult, CrocVm};

pub struct FuncDefBuilder {
    name: String,
    num_params: u32,
    is_vararg: bool,
    num_returns: u32,
    is_varret: bool,
    param_masks: Vec<u32>,
    return_masks: Vec<u32>,
    constants: Vec<Value>,
    code: Vec<Instruction>,
    switch_tables: Vec<SwitchTable>,
    inner_funcs: Vec<FuncDefId>,
    upvals: Vec<UpvalDesc>,
    stack_size: u32,
}

impl FuncDefBuilder {
    pub fn new(name: &str, num_params: u32) -> Self {
        Self {
            name: name.to_string(),
            num_params,
            is_vararg: false,
            num_returns: 0,
            is_varret: true,
            param_masks: Vec::new(),
            return_masks: Vec::new(),
            constants: Vec::new(),
            code: Vec::new(),
            switch_tables: Vec::new(),
            inner_funcs: Vec::new(),
            upvals: Vec::new(),
            stack_size: 32,
        }
    }

    pub fn vararg(mut self) -> Self {
        self.is_vararg = true;
        self
    }

    pub fn returns(mut self, n: u32) -> Self {
        self.num_returns = n;
        self.is_varret = false;
        self
    }

    pub fn param_masks(mut self, masks: Vec<u32>) -> Self {
        self.param_masks = masks;
        self
    }

    pub fn return_masks(mut self, masks: Vec<u32>) -> Self {
        self.return_masks = masks;
        self
    }

    pub fn stack_size(mut self, n: u32) -> Self {
        self.stack_size = n;
        self
    }

    /// Declares an upvalue capture: `is_upval` selects the parent's
    /// upvalue list, otherwise a parent register.
    pub fn capture(mut self, is_upval: bool, index: u32) -> Self {
        self.upvals.push(UpvalDesc { is_upval, index });
        self
    }

    pub fn inner(&mut self, id: FuncDefId) -> u32 {
        self.inner_funcs.push(id);
        (self.inner_funcs.len() - 1) as u32
    }

    // ---- Constants ----

    pub fn k(&mut self, v: Value) -> u32 {
        self.constants.push(v);
        (self.constants.len() - 1) as u32
    }

    pub fn kint(&mut self, i: i64) -> u32 {
        self.k(Value::int(i))
    }

    pub fn kfloat(&mut self, f: f64) -> u32 {
        self.k(Value::float(f))
    }

    pub fn knull(&mut self) -> u32 {
        self.k(Value::null())
    }

    pub fn kstr(&mut self, vm: &mut CrocVm, s: &str) -> u32 {
        let v = vm.new_string(s);
        self.k(v)
    }

    // ---- Code ----

    pub fn emit(&mut self, op: Op, rd: u16, op1: u32, op2: u32) -> usize {
        self.code.push(Instruction::new(op, rd, op1, op2));
        self.code.len() - 1
    }

    /// Trailing operand record for wide instructions.
    pub fn extra(&mut self, op1: u32, op2: u32) -> usize {
        self.emit(Op::ExtraArg, 0, op1, op2)
    }

    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Patches a single-record instruction whose jump lives in op1.
    pub fn patch_jump1(&mut self, idx: usize, target: usize) {
        self.code[idx].op1 = (target as i64 - (idx as i64 + 1)) as i32 as u32;
    }

    /// Patches a single-record instruction whose jump lives in op2.
    pub fn patch_jump2(&mut self, idx: usize, target: usize) {
        self.code[idx].op2 = (target as i64 - (idx as i64 + 1)) as i32 as u32;
    }

    /// Patches the jump carried in a wide instruction's ExtraArg record.
    pub fn patch_extra_jump(&mut self, extra_idx: usize, target: usize) {
        self.code[extra_idx].op1 = (target as i64 - (extra_idx as i64 + 1)) as i32 as u32;
    }

    /// Offset for a hand-written jump landing at `target` from the record
    /// after `idx`.
    pub fn offset_to(idx: usize, target: usize) -> u32 {
        (target as i64 - (idx as i64 + 1)) as i32 as u32
    }

    pub fn switch_table(&mut self, st: SwitchTable) -> u16 {
        self.switch_tables.push(st);
        (self.switch_tables.len() - 1) as u16
    }

    pub fn build(self, vm: &mut CrocVm) -> FuncDefId {
        let name = vm.heap.intern(&self.name);
        let line_info = (0..self.code.len()).map(|i| i as u32 + 1).collect();
        let param_masks = if self.param_masks.is_empty() {
            vec![u32::MAX; self.num_params as usize]
        } else {
            self.param_masks
        };
        vm.new_funcdef(FuncDef {
            name,
            num_params: self.num_params,
            is_vararg: self.is_vararg,
            is_varret: self.is_varret,
            num_returns: self.num_returns,
            param_masks,
            return_masks: self.return_masks,
            constants: self.constants,
            code: self.code,
            switch_tables: self.switch_tables,
            inner_funcs: self.inner_funcs,
            upvals: self.upvals,
            line_info,
            stack_size: self.stack_size,
            #[cfg(feature = "docs")]
            docs: None,
        })
    }
}

/// Instantiates and runs a top-level def with the given arguments.
pub fn run(vm: &mut CrocVm, def_id: FuncDefId, args: &[Value]) -> CrocResult<Vec<Value>> {
    let func = vm.new_script_function(def_id, None)?;
    vm.call_function(func, Value::null(), args)
}

/// Machine-state invariants checked by tests after interesting
/// operations.
pub fn assert_invariants(vm: &CrocVm) {
    let mut running = 0;
    for tid in vm.heap.threads.live_ids() {
        let t = &vm.heap[crate::gc::ThreadId(tid)];
        if t.state == ThreadState::Running {
            running += 1;
        }
        assert!(t.stack_index <= t.stack.len(), "stackIndex past the stack");
        for ar in &t.ars {
            assert!(ar.varg_base <= ar.stack_base, "vargBase above stackBase");
        }
        if let Some(ar) = t.ars.last() {
            assert!(ar.stack_base <= t.stack_index, "stackBase above stackIndex");
        }
        for &uv in &t.open_upvalues {
            match vm.heap[uv] {
                crate::croc_value::Upvalue::Open { slot, .. } => {
                    assert!(slot < t.stack.len(), "open upvalue points off the stack")
                }
                crate::croc_value::Upvalue::Closed(_) => panic!("closed upvalue in open list"),
            }
        }
    }
    assert!(running <= 1, "more than one Running thread");
    assert_eq!(
        vm.heap[vm.cur_thread].state,
        ThreadState::Running,
        "current thread is not Running"
    );
}
