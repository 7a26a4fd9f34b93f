//! Bytecode errors

use thiserror::Error;

/// Errors raised while building or inspecting code units.
#[derive(Debug, Error)]
pub enum BytecodeError {
    /// A table index is out of range for the unit
    #[error("index {index} out of range for {table} (len {len})")]
    IndexOutOfRange {
        /// Which table was indexed
        table: &'static str,
        /// The offending index
        index: usize,
        /// The table length
        len: usize,
    },

    /// The unit is structurally inconsistent
    #[error("malformed code unit: {0}")]
    Malformed(String),
}
