//! Error types for the embedding surface.

use thiserror::Error;

use pyrite_vm_core::VmError;

/// A syntax or lowering fault reported by the pluggable compiler.
#[derive(Debug, Clone, Error)]
#[error("{message} ({source_name}:{line})")]
pub struct CompileError {
    pub message: String,
    /// Name of the source the compiler was given.
    pub source_name: String,
    /// 1-indexed line of the fault (0 when unknown).
    pub line: u32,
}

impl CompileError {
    pub fn new(message: impl Into<String>, source_name: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            source_name: source_name.into(),
            line,
        }
    }
}

/// Engine error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source failed to compile.
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    /// An uncaught guest exception or an execution fault.
    #[error(transparent)]
    Vm(#[from] VmError),

    /// A compile entry point was used before [`crate::Engine::set_compiler`].
    #[error("no compiler configured")]
    NoCompiler,
}

impl EngineError {
    /// The uncaught guest exception, when that is what this error is.
    pub fn as_exception(&self) -> Option<&pyrite_vm_core::PyException> {
        match self {
            EngineError::Vm(VmError::Exception(exc)) => Some(exc),
            _ => None,
        }
    }
}

/// Result type using [`EngineError`].
pub type EngineResult<T> = Result<T, EngineError>;
