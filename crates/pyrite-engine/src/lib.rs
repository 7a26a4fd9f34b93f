//! Pyrite embedding surface.
//!
//! This crate is the host-facing API of the Pyrite runtime: an
//! [`Engine`] owns a VM together with the module registry, output
//! writers, the import hook, and the pluggable compiler front end.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use pyrite_engine::{Engine, NativeSig, Value};
//! use pyrite_vm_bytecode::{CodeUnitBuilder, Op, NO_ARG};
//!
//! let mut engine = Engine::new();
//! let host = engine.new_module("host");
//! engine.register_native(host, "answer", NativeSig::Fixed(0), |_, _| {
//!     Ok(Value::Int(42))
//! });
//!
//! let mut b = CodeUnitBuilder::new("<main>", "<embedded>");
//! b.emit(Op::LoadNone, NO_ARG);
//! b.emit(Op::Return, NO_ARG);
//! let main = engine.new_module("__main__");
//! engine.exec(Arc::new(b.build()), main).unwrap();
//! ```

pub mod compiler;
pub mod engine;
pub mod error;

pub use compiler::Compiler;
pub use engine::Engine;
pub use error::{CompileError, EngineError, EngineResult};

// Re-export the core types hosts touch at the engine boundary.
pub use pyrite_vm_core::{
    NativeSig, PyException, TypeId, TypeOps, Value, Vm, VmError, VmResult,
};
