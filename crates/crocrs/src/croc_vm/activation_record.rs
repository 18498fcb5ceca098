use crate::gc::FunctionId;

/// Per-call frame.
///
/// Layout invariant: `varg_base <= stack_base <= thread.stack_index`.
/// The window `varg_base..stack_base` holds this frame's packed excess
/// arguments; `stack_base` is register 0 (`this`).
#[derive(Debug, Clone)]
pub struct ActivationRecord {
    pub func: FunctionId,
    /// Next instruction to execute.
    pub pc: usize,
    pub stack_base: usize,
    pub varg_base: usize,
    /// Top of this frame's register window; `stackIndex` is restored here
    /// after nested calls.
    pub saved_top: usize,
    /// Absolute slot the call's results are delivered to (the slot the
    /// callee value occupied).
    pub return_slot: usize,
    /// Caller's expectation: -1 keeps all results on the stack.
    pub num_returns: isize,
    /// Span into the thread's results buffer, published by `SaveRets` and
    /// handed to the caller's frame by the epilogue.
    pub first_result: usize,
    pub num_results: usize,
    /// Pending return through finally blocks: target pc and remaining
    /// finally count.
    pub unwind_return: Option<usize>,
    pub unwind_counter: u16,
    pub is_tailcall: bool,
    pub is_native: bool,
}

impl ActivationRecord {
    pub fn new(func: FunctionId, stack_base: usize) -> Self {
        Self {
            func,
            pc: 0,
            stack_base,
            varg_base: stack_base,
            saved_top: stack_base,
            return_slot: stack_base,
            num_returns: -1,
            first_result: 0,
            num_results: 0,
            unwind_return: None,
            unwind_counter: 0,
            is_tailcall: false,
            is_native: false,
        }
    }

    #[inline(always)]
    pub fn num_varargs(&self) -> usize {
        self.stack_base - self.varg_base
    }
}
