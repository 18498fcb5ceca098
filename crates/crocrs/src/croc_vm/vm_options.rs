use super::limits::{
    INITIAL_STACK_SIZE, MAX_CALL_DEPTH, MAX_EH_DEPTH, MAX_NATIVE_DEPTH, MAX_STACK_SIZE,
};

/// Resource caps for a VM instance.
#[derive(Debug, Clone)]
pub struct VmOptions {
    pub max_stack_size: usize,
    /// Maximum activation-record depth per thread.
    pub max_call_depth: usize,
    /// Maximum exception-handler frame depth per thread.
    pub max_eh_depth: usize,
    /// Maximum native/metamethod call nesting (Rust recursion guard).
    pub max_native_depth: usize,
    pub initial_stack_size: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            max_stack_size: MAX_STACK_SIZE,
            max_call_depth: MAX_CALL_DEPTH,
            max_eh_depth: MAX_EH_DEPTH,
            max_native_depth: MAX_NATIVE_DEPTH,
            initial_stack_size: INITIAL_STACK_SIZE,
        }
    }
}
