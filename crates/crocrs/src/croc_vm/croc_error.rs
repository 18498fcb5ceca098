use crate::croc_value::Value;
use thiserror::Error;

/// Exception taxonomy. The names surface to script and host as the string
/// class of the exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Operand types are wrong for the operation.
    Type,
    /// Type is right, the value is not (divide by zero, bad step).
    Value,
    /// Out-of-range index.
    Bounds,
    /// Missing or duplicate member.
    Field,
    /// Missing global or upvalue.
    Name,
    /// Switch without default.
    Switch,
    /// Thread state mismatch.
    State,
    Runtime,
    /// Arity mismatch.
    Param,
    Assert,
    /// Thread halted from outside; not catchable by script.
    Halt,
    /// Impossible opcode or invariant breach - a bug class.
    Vm,
}

impl ErrorKind {
    pub const fn name(self) -> &'static str {
        match self {
            ErrorKind::Type => "TypeError",
            ErrorKind::Value => "ValueError",
            ErrorKind::Bounds => "BoundsError",
            ErrorKind::Field => "FieldError",
            ErrorKind::Name => "NameError",
            ErrorKind::Switch => "SwitchError",
            ErrorKind::State => "StateError",
            ErrorKind::Runtime => "RuntimeError",
            ErrorKind::Param => "ParamError",
            ErrorKind::Assert => "AssertError",
            ErrorKind::Halt => "HaltException",
            ErrorKind::Vm => "VMError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One traceback frame, recorded while unwinding.
#[derive(Debug, Clone)]
pub struct TracebackEntry {
    pub func_name: String,
    pub line: u32,
    pub is_tailcall: bool,
}

/// An in-flight Croc exception.
///
/// Script `throw` carries the thrown value; errors raised by the runtime
/// carry only kind + message and materialize as a string when a script
/// catch receives them.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct CrocError {
    pub kind: ErrorKind,
    pub message: String,
    pub value: Option<Value>,
    pub traceback: Vec<TracebackEntry>,
}

impl CrocError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), value: None, traceback: Vec::new() }
    }

    pub fn thrown(value: Value, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Runtime,
            message: message.into(),
            value: Some(value),
            traceback: Vec::new(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn bounds_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Bounds, message)
    }

    pub fn field_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Field, message)
    }

    pub fn name_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Name, message)
    }

    pub fn state_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::State, message)
    }

    pub fn runtime_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn vm_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Vm, message)
    }

    /// Renders the traceback under the error line, innermost frame first.
    pub fn render(&self) -> String {
        let mut out = format!("{self}");
        for entry in &self.traceback {
            out.push_str(&format!("\n    at {} (line {})", entry.func_name, entry.line));
            if entry.is_tailcall {
                out.push_str(" [tailcall]");
            }
        }
        out
    }
}

pub type CrocResult<T> = Result<T, CrocError>;
