use crate::croc_value::Value;
use crate::croc_vm::{ActivationRecord, EhFrame};
use crate::gc::{FunctionId, ThreadId, UpvalueId};

/// Hook bit: fire the delay hook every `hook_delay` instructions.
pub const HOOK_DELAY: u8 = 1 << 0;
/// Hook bit: fire the line hook on function entry, back-jumps, and line
/// changes.
pub const HOOK_LINE: u8 = 1 << 1;

/// Coroutine state.
///
/// `Normal` marks a thread that has resumed another and is waiting for it;
/// it is not resumable and keeps the single-Running invariant during
/// nested resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, never resumed.
    Initial,
    /// Currently executing; exactly one thread per VM.
    Running,
    /// Resumed another thread and is waiting for it.
    Normal,
    /// Yielded; resumable.
    Suspended,
    /// Returned from its body or died to an exception. Terminal.
    Dead,
}

impl ThreadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadState::Initial => "initial",
            ThreadState::Running => "running",
            ThreadState::Normal => "normal",
            ThreadState::Suspended => "suspended",
            ThreadState::Dead => "dead",
        }
    }
}

/// A coroutine: its own value stack, activation records, results buffer,
/// exception-handler frames, and open upvalue list.
pub struct Thread {
    /// Contiguous value stack shared by all this thread's frames.
    pub stack: Vec<Value>,
    /// First register slot of the current frame. Mirrors the current AR.
    pub stack_base: usize,
    /// One past the last live slot.
    pub stack_index: usize,
    /// Activation record stack; the last entry is the current frame.
    pub ars: Vec<ActivationRecord>,
    /// Saved-return buffer, disjoint from the value stack.
    pub results: Vec<Value>,
    /// Exception-handler frames, innermost last.
    pub eh_frames: Vec<EhFrame>,
    /// Open upvalues into this thread's stack, slot-descending, no
    /// duplicates.
    pub open_upvalues: Vec<UpvalueId>,
    pub state: ThreadState,
    /// Depth of native/metamethod/iterator call nesting; yielding across
    /// it is an error.
    pub native_call_depth: usize,

    pub hooks: u8,
    pub hook_delay: u32,
    pub hook_counter: u32,
    pub hook_func: Option<Value>,

    /// Sampled at the top of every dispatch iteration.
    pub should_halt: bool,
    /// Dispatch-loop entry depth recorded at yield, to re-enter on resume.
    pub saved_start_ar: usize,
    /// The thread that resumed us, while we run.
    pub parent: Option<ThreadId>,

    /// Yield/resume value handoff.
    pub transfer: Vec<Value>,
    /// Absolute slot where resume values land.
    pub yield_slot: usize,
    /// Expected resume value count; -1 keeps all.
    pub yield_expect: isize,

    /// Body function; consumed by the first resume.
    pub main_func: Option<FunctionId>,
}

impl Thread {
    pub fn new(main_func: Option<FunctionId>, initial_stack: usize) -> Self {
        Self {
            stack: vec![Value::null(); initial_stack],
            stack_base: 0,
            stack_index: 0,
            ars: Vec::new(),
            results: Vec::new(),
            eh_frames: Vec::new(),
            open_upvalues: Vec::new(),
            state: if main_func.is_some() { ThreadState::Initial } else { ThreadState::Running },
            native_call_depth: 0,
            hooks: 0,
            hook_delay: 0,
            hook_counter: 0,
            hook_func: None,
            should_halt: false,
            saved_start_ar: 0,
            parent: None,
            transfer: Vec::new(),
            yield_slot: 0,
            yield_expect: -1,
            main_func,
        }
    }

    /// Grows the stack (null-filled) so `needed` slots are addressable.
    pub fn ensure_stack(&mut self, needed: usize) {
        if needed > self.stack.len() {
            let new_len = needed.max(self.stack.len() * 2);
            self.stack.resize(new_len, Value::null());
        }
    }

    #[inline(always)]
    pub fn ar_top_index(&self) -> usize {
        self.ars.len() - 1
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self.state, ThreadState::Initial | ThreadState::Suspended)
    }
}
