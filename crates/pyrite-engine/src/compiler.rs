//! The compiler boundary.
//!
//! The engine executes [`CodeUnit`] values and does not care where they
//! come from; a front end is plugged in through this trait. Hosts that
//! assemble units by hand (or load serialized ones) never need it.

use pyrite_vm_bytecode::CodeUnit;

use crate::error::CompileError;

/// Turns source text into an executable code unit.
pub trait Compiler: Send + Sync {
    /// Compile `source`, attributing positions to `source_name`.
    fn compile(&self, source: &str, source_name: &str) -> Result<CodeUnit, CompileError>;
}
