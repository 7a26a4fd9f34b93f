//! Type descriptors and the per-VM type table.
//!
//! Every value kind, builtin or host-registered, is described by a
//! [`TypeDesc`]: its name, an optional base type, a set of operator hooks
//! the interpreter dispatches through, and a namespace of methods. The
//! table is append-only; a [`TypeId`] is an index into it and stays valid
//! for the life of the VM.

use crate::attrs::NameDict;
use crate::error::VmResult;
use crate::intern::Name;
use crate::value::Value;
use crate::vm::Vm;

/// Index of a type in the [`TypeTable`]. The ids of the builtin types are
/// fixed by registration order and exposed as constants here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub u16);

impl TypeId {
    /// Internal sentinel type of `Value::Null`; never guest-visible.
    pub const NULL: TypeId = TypeId(0);
    pub const NONE: TypeId = TypeId(1);
    pub const ELLIPSIS: TypeId = TypeId(2);
    pub const NOT_IMPLEMENTED: TypeId = TypeId(3);
    pub const BOOL: TypeId = TypeId(4);
    pub const INT: TypeId = TypeId(5);
    pub const FLOAT: TypeId = TypeId(6);
    pub const STR: TypeId = TypeId(7);
    pub const LIST: TypeId = TypeId(8);
    pub const TUPLE: TypeId = TypeId(9);
    pub const DICT: TypeId = TypeId(10);
    pub const RANGE: TypeId = TypeId(11);
    pub const ITER: TypeId = TypeId(12);
    pub const FUNCTION: TypeId = TypeId(13);
    pub const NATIVE_FUNC: TypeId = TypeId(14);
    pub const BOUND_METHOD: TypeId = TypeId(15);
    pub const PROPERTY: TypeId = TypeId(16);
    pub const TYPE: TypeId = TypeId(17);
    pub const MODULE: TypeId = TypeId(18);
    pub const OBJECT: TypeId = TypeId(19);
    pub const GENERATOR: TypeId = TypeId(20);
    pub const EXCEPTION: TypeId = TypeId(21);

    pub const BUILTIN_COUNT: u16 = 22;

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

pub type UnaryHook = fn(&mut Vm, Value) -> VmResult<Value>;
pub type BinaryHook = fn(&mut Vm, Value, Value) -> VmResult<Value>;
pub type TernaryHook = fn(&mut Vm, Value, Value, Value) -> VmResult<Value>;
/// Attribute interception, consulted before the default resolution.
/// `Ok(None)` declines the lookup and lets resolution continue.
pub type AttrGetHook = fn(&mut Vm, Value, Name) -> VmResult<Option<Value>>;
/// Store interception; `Ok(false)` declines and the store proceeds
/// through the default path.
pub type AttrSetHook = fn(&mut Vm, Value, Name, Value) -> VmResult<bool>;

/// Operator hooks consulted by the dispatch loop. A `None` slot means the
/// operation is not supported by the type and raises `TypeError`.
#[derive(Default)]
pub struct TypeOps {
    pub repr: Option<fn(&mut Vm, Value) -> VmResult<String>>,
    /// Display conversion; falls back to `repr` when absent.
    pub str: Option<fn(&mut Vm, Value) -> VmResult<String>>,
    /// Hash for dict keys and the `hash` builtin; a type without one is
    /// unhashable.
    pub hash: Option<fn(&mut Vm, Value) -> VmResult<i64>>,
    pub len: Option<fn(&mut Vm, Value) -> VmResult<usize>>,
    pub iter: Option<UnaryHook>,
    /// Advance an iterator; yields the next element or raises
    /// `StopIteration` at the end of the sequence.
    pub next: Option<UnaryHook>,
    pub eq: Option<BinaryHook>,
    pub lt: Option<BinaryHook>,
    pub add: Option<BinaryHook>,
    pub sub: Option<BinaryHook>,
    pub mul: Option<BinaryHook>,
    pub div: Option<BinaryHook>,
    pub floordiv: Option<BinaryHook>,
    pub rem: Option<BinaryHook>,
    pub neg: Option<UnaryHook>,
    pub getitem: Option<BinaryHook>,
    pub setitem: Option<TernaryHook>,
    pub getattr: Option<AttrGetHook>,
    pub setattr: Option<AttrSetHook>,
}

/// Descriptor for one runtime type.
pub struct TypeDesc {
    pub name: Name,
    pub base: Option<TypeId>,
    pub ops: TypeOps,
    /// Class namespace: methods and class attributes, looked up during
    /// attribute resolution after the instance's own storage.
    pub attrs: NameDict,
}

/// Append-only table of type descriptors owned by a [`Vm`].
pub struct TypeTable {
    descs: Vec<TypeDesc>,
}

impl TypeTable {
    pub fn new() -> TypeTable {
        TypeTable { descs: Vec::new() }
    }

    pub fn register(&mut self, name: &str, base: Option<TypeId>, ops: TypeOps) -> TypeId {
        let id = TypeId(self.descs.len() as u16);
        self.descs.push(TypeDesc {
            name: Name::intern(name),
            base,
            ops,
            attrs: NameDict::new(),
        });
        id
    }

    pub fn get(&self, id: TypeId) -> &TypeDesc {
        &self.descs[id.index()]
    }

    pub fn get_mut(&mut self, id: TypeId) -> &mut TypeDesc {
        &mut self.descs[id.index()]
    }

    pub fn name_of(&self, id: TypeId) -> Name {
        self.descs[id.index()].name
    }

    pub fn len(&self) -> usize {
        self.descs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Looks `name` up on `id`'s namespace, walking base links.
    pub fn lookup(&self, id: TypeId, name: Name) -> Option<Value> {
        let mut cur = Some(id);
        while let Some(t) = cur {
            let desc = &self.descs[t.index()];
            if let Some(v) = desc.attrs.get(name) {
                return Some(v);
            }
            cur = desc.base;
        }
        None
    }

    /// True if `id` is `ancestor` or inherits from it.
    pub fn is_subtype(&self, id: TypeId, ancestor: TypeId) -> bool {
        let mut cur = Some(id);
        while let Some(t) = cur {
            if t == ancestor {
                return true;
            }
            cur = self.descs[t.index()].base;
        }
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeDesc)> {
        self.descs
            .iter()
            .enumerate()
            .map(|(i, d)| (TypeId(i as u16), d))
    }
}

impl Default for TypeTable {
    fn default() -> TypeTable {
        TypeTable::new()
    }
}
