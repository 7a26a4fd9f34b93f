//! # Pyrite VM bytecode
//!
//! The compiled-unit contract consumed by the execution engine.
//!
//! A [`CodeUnit`] is an immutable record produced by a compiler front
//! end: an instruction array (one opcode, one 16-bit operand each), a
//! parallel per-instruction metadata array, a constants table, a
//! local-name table, a structured-block table, a label table, and
//! nested [`FuncDecl`] records describing parameter-binding shapes.
//!
//! The engine trusts this structure completely — jump targets and
//! operand ranges are not re-validated beyond normal dispatch.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod code;
pub mod constant;
pub mod error;
pub mod function;
pub mod instruction;

pub use code::{Block, BlockKind, CodeUnit, CodeUnitBuilder, InstrMeta, Label, NO_BLOCK};
pub use constant::Constant;
pub use error::BytecodeError;
pub use function::FuncDecl;
pub use instruction::{Instr, NO_ARG, Op, pack_call};
