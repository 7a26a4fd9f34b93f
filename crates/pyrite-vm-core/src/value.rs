//! The runtime value representation.
//!
//! A [`Value`] is a small `Copy` tag-plus-payload union. Immediate kinds
//! (`None`, booleans, machine integers, floats) carry their payload inline
//! and never touch the heap; everything else is a [`ObjRef`] holding a pool
//! handle together with a cached [`TypeId`], so classifying a value never
//! requires dereferencing the heap.

use pyrite_vm_gc::Handle;

use crate::types::TypeId;

/// Reference to a heap object. The type id is duplicated here so that
/// dispatch on a value's type stays a register-only operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjRef {
    pub handle: Handle,
    pub type_id: TypeId,
}

/// A runtime value.
///
/// Equality via `PartialEq` is *identity* equality: inline payloads compare
/// bitwise and references compare by handle. Guest-level `==` goes through
/// the type's comparison hook instead (see `Vm::values_equal`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Internal "absent" marker used by the calling convention for the
    /// receiver slot and by attribute probes. Never visible to guest code.
    Null,
    None,
    Ellipsis,
    NotImplemented,
    Bool(bool),
    Int(i64),
    Float(f64),
    Ref(ObjRef),
}

impl Value {
    /// The dynamic type of this value, in O(1) and without a heap access.
    pub fn type_id(&self) -> TypeId {
        match self {
            Value::Null => TypeId::NULL,
            Value::None => TypeId::NONE,
            Value::Ellipsis => TypeId::ELLIPSIS,
            Value::NotImplemented => TypeId::NOT_IMPLEMENTED,
            Value::Bool(_) => TypeId::BOOL,
            Value::Int(_) => TypeId::INT,
            Value::Float(_) => TypeId::FLOAT,
            Value::Ref(r) => r.type_id,
        }
    }

    pub fn obj(handle: Handle, type_id: TypeId) -> Value {
        Value::Ref(ObjRef { handle, type_id })
    }

    pub fn as_ref(&self) -> Option<ObjRef> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Truthiness for inline kinds. Heap-backed kinds are resolved by the
    /// VM, which can consult the object's length hook.
    pub fn inline_truthy(&self) -> Option<bool> {
        match self {
            Value::None => Some(false),
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::Ellipsis | Value::NotImplemented => Some(true),
            Value::Null | Value::Ref(_) => None,
        }
    }

    /// If this value refers to the heap, hand its handle to `mark`.
    pub fn trace(&self, mark: &mut dyn FnMut(Handle)) {
        if let Value::Ref(r) = self {
            mark(r.handle);
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value {
        Value::Float(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_type_ids() {
        assert_eq!(Value::None.type_id(), TypeId::NONE);
        assert_eq!(Value::Bool(true).type_id(), TypeId::BOOL);
        assert_eq!(Value::Int(7).type_id(), TypeId::INT);
        assert_eq!(Value::Float(1.5).type_id(), TypeId::FLOAT);
    }

    #[test]
    fn test_inline_truthiness() {
        assert_eq!(Value::Int(0).inline_truthy(), Some(false));
        assert_eq!(Value::Int(-3).inline_truthy(), Some(true));
        assert_eq!(Value::None.inline_truthy(), Some(false));
        assert_eq!(Value::Float(0.0).inline_truthy(), Some(false));
    }

    #[test]
    fn test_numeric_coercion_accessors() {
        assert_eq!(Value::Int(4).as_float(), Some(4.0));
        assert_eq!(Value::Float(2.5).as_int(), None);
        assert_eq!(Value::Bool(true).as_int(), None);
    }

    #[test]
    fn test_inline_values_never_touch_the_heap() {
        let mut vm = crate::vm::Vm::new();
        let before = vm.heap_stats().live_objects;
        let values = [
            Value::from(true),
            Value::from(-7i64),
            Value::from(2.5f64),
            Value::None,
        ];
        assert_eq!(values[0].as_bool(), Some(true));
        assert_eq!(values[1].as_int(), Some(-7));
        assert_eq!(values[2].as_float(), Some(2.5));
        assert!(values[3].is_none());
        // Wrapping and extracting immediates must not allocate.
        assert_eq!(vm.heap_stats().live_objects, before);
    }

    #[test]
    fn test_value_is_small_and_copy() {
        // Tag plus widest payload; keeping this small keeps stack traffic cheap.
        assert!(std::mem::size_of::<Value>() <= 24);
        let v = Value::Int(1);
        let w = v;
        assert_eq!(v, w);
    }
}
