/// Exception-handler frames, kept per thread, innermost last.
///
/// Unwinding pops one frame at a time: a catch restores the recorded AR
/// and stack height and branches to its pc with the exception value in
/// `slot`; a finally does the same but leaves the exception pending so
/// `EndFinal` re-raises it; a native boundary returns the error to the
/// Rust caller that entered the dispatch loop.
#[derive(Debug, Clone)]
pub enum EhFrame {
    ScriptCatch {
        /// Index into the thread's AR stack.
        ar_index: usize,
        /// Stack height to restore.
        stack_index: usize,
        /// Register (relative to the frame's base) receiving the
        /// exception value.
        slot: u16,
        /// Catch body pc.
        pc: usize,
    },
    ScriptFinally {
        ar_index: usize,
        stack_index: usize,
        /// Finally body pc.
        pc: usize,
    },
    /// Marks a dispatch-loop entry from native code (host call, resume,
    /// metamethod, hook). Unwinding past it leaves the loop.
    NativeBoundary {
        ar_index: usize,
        stack_index: usize,
    },
}

impl EhFrame {
    pub fn ar_index(&self) -> usize {
        match self {
            EhFrame::ScriptCatch { ar_index, .. }
            | EhFrame::ScriptFinally { ar_index, .. }
            | EhFrame::NativeBoundary { ar_index, .. } => *ar_index,
        }
    }

    pub fn is_script(&self) -> bool {
        !matches!(self, EhFrame::NativeBoundary { .. })
    }
}
