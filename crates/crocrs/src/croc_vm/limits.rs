/// Maximum activation-record depth per thread.
pub const MAX_CALL_DEPTH: usize = 1024;

/// Maximum exception-handler frames per thread.
pub const MAX_EH_DEPTH: usize = 1024;

/// Maximum native/metamethod nesting (Rust recursion guard).
pub const MAX_NATIVE_DEPTH: usize = 200;

/// Initial value-stack slots per thread.
pub const INITIAL_STACK_SIZE: usize = 64;

/// Hard cap on value-stack growth.
pub const MAX_STACK_SIZE: usize = 1_000_000;
