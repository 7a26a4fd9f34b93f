//! The heap object model.
//!
//! Every heap-backed value is a [`HeapObject`]: a type id, an optional
//! attribute table, and a payload variant. The attribute table is lazily
//! boxed so that payload kinds which never grow attributes (strings,
//! tuples, iterators) pay a single pointer for it.

use std::sync::Arc;

use pyrite_vm_bytecode::FuncDecl;
use pyrite_vm_gc::{Handle, Trace};

use crate::attrs::NameDict;
use crate::error::{TraceEntry, VmResult};
use crate::generator::GeneratorObj;
use crate::intern::Name;
use crate::types::TypeId;
use crate::value::Value;
use crate::vm::Vm;

/// Host-provided function body. Receives the VM and the flat argument
/// view; the receiver, when bound, is the first element.
pub type NativeFn = Arc<dyn Fn(&mut Vm, &[Value]) -> VmResult<Value>>;

/// How a native function's arguments are checked before the body runs.
#[derive(Clone)]
pub enum NativeSig {
    /// Exactly `n` positional arguments, no keywords.
    Fixed(usize),
    /// Bound through the same parameter-binding path as guest functions,
    /// using the declaration's parameter list and defaults.
    Decl(Arc<FuncDecl>),
}

/// A guest function: its compiled declaration plus the module whose
/// globals it closes over.
pub struct FunctionObj {
    pub decl: Arc<FuncDecl>,
    pub module: Value,
}

pub struct NativeFuncObj {
    pub name: Name,
    pub func: NativeFn,
    pub sig: NativeSig,
}

/// State of a builtin iterator object.
pub enum IterState {
    /// Iterates a heap-backed sequence (list or tuple) by index.
    Seq { seq: Handle, index: usize },
    /// Iterates an arithmetic progression without materialising it.
    Range { current: i64, stop: i64, step: i64 },
}

/// Payload of a raised-and-caught exception object.
pub struct ExcData {
    pub type_name: String,
    pub message: String,
    pub trace: Vec<TraceEntry>,
}

pub enum ObjPayload {
    Str(String),
    List(Vec<Value>),
    Tuple(Box<[Value]>),
    /// Association list keyed by identity equality of the key values.
    Dict(Vec<(Value, Value)>),
    Range { start: i64, stop: i64, step: i64 },
    Iter(IterState),
    Function(FunctionObj),
    NativeFunc(NativeFuncObj),
    BoundMethod { func: Value, receiver: Value },
    Property { getter: Value, setter: Value },
    /// A first-class type object; delegates its namespace to the type table.
    Type(TypeId),
    Module(Name),
    /// Plain instance; all state lives in the attribute table.
    Instance,
    Generator(Box<GeneratorObj>),
    Exception(Box<ExcData>),
}

pub struct HeapObject {
    pub type_id: TypeId,
    pub attrs: Option<Box<NameDict>>,
    pub payload: ObjPayload,
}

impl HeapObject {
    pub fn new(type_id: TypeId, payload: ObjPayload) -> HeapObject {
        HeapObject {
            type_id,
            attrs: None,
            payload,
        }
    }

    pub fn attr(&self, name: Name) -> Option<Value> {
        self.attrs.as_ref().and_then(|d| d.get(name))
    }

    /// Inserts into the attribute table, materialising it on first use.
    pub fn set_attr(&mut self, name: Name, value: Value) {
        self.attrs
            .get_or_insert_with(|| Box::new(NameDict::new()))
            .insert(name, value);
    }

    pub fn remove_attr(&mut self, name: Name) -> Option<Value> {
        self.attrs.as_mut().and_then(|d| d.remove(name))
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.payload {
            ObjPayload::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match &self.payload {
            ObjPayload::List(items) => Some(items),
            _ => None,
        }
    }
}

impl Trace for HeapObject {
    fn trace(&self, mark: &mut dyn FnMut(Handle)) {
        if let Some(attrs) = &self.attrs {
            for v in attrs.values() {
                v.trace(mark);
            }
        }
        match &self.payload {
            ObjPayload::Str(_)
            | ObjPayload::Range { .. }
            | ObjPayload::Module(_)
            | ObjPayload::Type(_)
            | ObjPayload::Instance
            | ObjPayload::Exception(_) => {}
            ObjPayload::List(items) => {
                for v in items {
                    v.trace(mark);
                }
            }
            ObjPayload::Tuple(items) => {
                for v in items.iter() {
                    v.trace(mark);
                }
            }
            ObjPayload::Dict(pairs) => {
                for (k, v) in pairs {
                    k.trace(mark);
                    v.trace(mark);
                }
            }
            ObjPayload::Iter(state) => match state {
                IterState::Seq { seq, .. } => mark(*seq),
                IterState::Range { .. } => {}
            },
            ObjPayload::Function(f) => f.module.trace(mark),
            ObjPayload::NativeFunc(_) => {}
            ObjPayload::BoundMethod { func, receiver } => {
                func.trace(mark);
                receiver.trace(mark);
            }
            ObjPayload::Property { getter, setter } => {
                getter.trace(mark);
                setter.trace(mark);
            }
            ObjPayload::Generator(generator) => generator.trace(mark),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attrs_are_lazily_allocated() {
        let mut obj = HeapObject::new(TypeId::OBJECT, ObjPayload::Instance);
        assert!(obj.attrs.is_none());
        let name = Name::intern("field");
        obj.set_attr(name, Value::Int(3));
        assert!(obj.attrs.is_some());
        assert_eq!(obj.attr(name), Some(Value::Int(3)));
        assert_eq!(obj.remove_attr(name), Some(Value::Int(3)));
        assert_eq!(obj.attr(name), None);
    }

    #[test]
    fn test_trace_visits_payload_and_attrs() {
        let target = Handle {
            index: 5,
            generation: 1,
        };
        let other = Handle {
            index: 9,
            generation: 1,
        };
        let mut obj = HeapObject::new(
            TypeId::LIST,
            ObjPayload::List(vec![Value::Int(1), Value::obj(target, TypeId::STR)]),
        );
        obj.set_attr(Name::intern("tag"), Value::obj(other, TypeId::STR));
        let mut seen = Vec::new();
        obj.trace(&mut |h| seen.push(h));
        assert!(seen.contains(&target));
        assert!(seen.contains(&other));
        assert_eq!(seen.len(), 2);
    }
}
