//! Core execution engine for the Pyrite VM.
//!
//! This crate owns the runtime value representation, the heap object model,
//! the attribute tables used for instance, class, and module namespaces,
//! and the bytecode interpreter itself. Host programs normally interact
//! with it through `pyrite-engine`, which wraps a [`Vm`] together with a
//! module registry and host I/O hooks.
//!
//! The layering mirrors the crate boundaries: `pyrite-vm-bytecode` defines
//! the instruction set and code containers, `pyrite-vm-gc` supplies the
//! pooled allocators and the mark-and-sweep collector, and this crate ties
//! them together into an executable machine.

pub mod attrs;
pub mod builtins;
pub mod call;
pub mod error;
pub mod frame;
pub mod generator;
pub mod intern;
pub mod object;
pub mod stack;
pub mod types;
pub mod value;
pub mod vm;

pub use attrs::NameDict;
pub use error::{PyException, TraceEntry, VmError, VmResult};
pub use frame::{Frame, UnwindTarget};
pub use generator::{GenState, GeneratorObj, ResumeResult};
pub use intern::Name;
pub use object::{ExcData, HeapObject, IterState, NativeFn, NativeSig, ObjPayload};
pub use stack::ValueStack;
pub use types::{AttrGetHook, AttrSetHook, TypeDesc, TypeId, TypeOps, TypeTable};
pub use value::{ObjRef, Value};
pub use vm::{ImportHook, Vm};
