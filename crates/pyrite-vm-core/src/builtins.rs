//! Builtin types and the default builtins namespace.
//!
//! Registration order is fixed: it must match the `TypeId` constants,
//! which are the indices the dispatch loop caches inside every value.

use std::sync::Arc;

use pyrite_vm_bytecode::{Constant, FuncDecl};

use crate::error::{VmError, VmResult};
use crate::intern::Name;
use crate::object::{HeapObject, IterState, NativeFuncObj, NativeSig, ObjPayload};
use crate::types::{TypeId, TypeOps, TypeTable};
use crate::value::Value;
use crate::vm::Vm;

pub fn register_default_types(types: &mut TypeTable) {
    types.register("<null>", None, TypeOps::default());
    types.register(
        "NoneType",
        None,
        TypeOps {
            repr: Some(|_, _| Ok("None".to_string())),
            hash: Some(|_, _| Ok(0)),
            ..TypeOps::default()
        },
    );
    types.register(
        "ellipsis",
        None,
        TypeOps {
            repr: Some(|_, _| Ok("Ellipsis".to_string())),
            ..TypeOps::default()
        },
    );
    types.register(
        "NotImplementedType",
        None,
        TypeOps {
            repr: Some(|_, _| Ok("NotImplemented".to_string())),
            ..TypeOps::default()
        },
    );
    // bool inherits the numeric hooks from int.
    let int_ops = || TypeOps {
        repr: Some(num_repr),
        hash: Some(num_hash),
        eq: Some(num_eq),
        lt: Some(num_lt),
        add: Some(num_add),
        sub: Some(num_sub),
        mul: Some(num_mul),
        div: Some(num_div),
        floordiv: Some(num_floordiv),
        rem: Some(num_rem),
        neg: Some(num_neg),
        ..TypeOps::default()
    };
    types.register(
        "bool",
        Some(TypeId::INT),
        TypeOps {
            repr: Some(bool_repr),
            ..TypeOps::default()
        },
    );
    types.register("int", None, int_ops());
    types.register("float", None, int_ops());
    types.register(
        "str",
        None,
        TypeOps {
            repr: Some(str_repr),
            str: Some(str_str),
            hash: Some(str_hash),
            len: Some(str_len),
            eq: Some(str_eq),
            lt: Some(str_lt),
            add: Some(str_add),
            mul: Some(str_mul),
            getitem: Some(str_getitem),
            ..TypeOps::default()
        },
    );
    types.register(
        "list",
        None,
        TypeOps {
            repr: Some(list_repr),
            len: Some(list_len),
            eq: Some(seq_eq),
            add: Some(list_add),
            mul: Some(list_mul),
            getitem: Some(list_getitem),
            setitem: Some(list_setitem),
            iter: Some(seq_iter),
            ..TypeOps::default()
        },
    );
    types.register(
        "tuple",
        None,
        TypeOps {
            repr: Some(tuple_repr),
            hash: Some(tuple_hash),
            len: Some(tuple_len),
            eq: Some(seq_eq),
            getitem: Some(tuple_getitem),
            iter: Some(seq_iter),
            ..TypeOps::default()
        },
    );
    types.register(
        "dict",
        None,
        TypeOps {
            repr: Some(dict_repr),
            len: Some(dict_len),
            getitem: Some(dict_getitem),
            setitem: Some(dict_setitem),
            ..TypeOps::default()
        },
    );
    types.register(
        "range",
        None,
        TypeOps {
            repr: Some(range_repr),
            len: Some(range_len),
            iter: Some(range_iter),
            ..TypeOps::default()
        },
    );
    types.register(
        "iterator",
        None,
        TypeOps {
            iter: Some(identity_iter),
            next: Some(iter_next),
            ..TypeOps::default()
        },
    );
    types.register(
        "function",
        None,
        TypeOps {
            repr: Some(function_repr),
            ..TypeOps::default()
        },
    );
    types.register(
        "builtin_function_or_method",
        None,
        TypeOps {
            repr: Some(native_repr),
            ..TypeOps::default()
        },
    );
    types.register(
        "method",
        None,
        TypeOps {
            repr: Some(|_, _| Ok("<bound method>".to_string())),
            ..TypeOps::default()
        },
    );
    types.register("property", None, TypeOps::default());
    types.register(
        "type",
        None,
        TypeOps {
            repr: Some(type_repr),
            ..TypeOps::default()
        },
    );
    types.register(
        "module",
        None,
        TypeOps {
            repr: Some(module_repr),
            ..TypeOps::default()
        },
    );
    types.register("object", None, TypeOps::default());
    types.register(
        "generator",
        None,
        TypeOps {
            iter: Some(identity_iter),
            next: Some(gen_next),
            ..TypeOps::default()
        },
    );
    types.register(
        "Exception",
        None,
        TypeOps {
            repr: Some(exc_repr),
            ..TypeOps::default()
        },
    );
    debug_assert_eq!(types.len(), TypeId::BUILTIN_COUNT as usize);
}

/// Wraps a Rust closure as a callable native function value.
pub fn make_native(
    vm: &mut Vm,
    name: &str,
    sig: NativeSig,
    f: impl Fn(&mut Vm, &[Value]) -> VmResult<Value> + 'static,
) -> Value {
    vm.alloc(HeapObject::new(
        TypeId::NATIVE_FUNC,
        ObjPayload::NativeFunc(NativeFuncObj {
            name: Name::intern(name),
            func: Arc::new(f),
            sig,
        }),
    ))
}

/// Populates the builtins module and the method namespaces of the
/// container types.
pub fn install_builtins(vm: &mut Vm) {
    let builtins = vm.builtins_module();

    let len_fn = make_native(vm, "len", NativeSig::Fixed(1), |vm, args| {
        let n = vm.value_len(args[0])?;
        Ok(Value::Int(n as i64))
    });
    vm.set_module_attr(builtins, "len", len_fn);

    let repr_fn = make_native(vm, "repr", NativeSig::Fixed(1), |vm, args| {
        let s = vm.repr_value(args[0])?;
        Ok(vm.new_str(s))
    });
    vm.set_module_attr(builtins, "repr", repr_fn);

    let str_fn = make_native(vm, "str", NativeSig::Fixed(1), |vm, args| {
        let s = vm.str_value(args[0])?;
        Ok(vm.new_str(s))
    });
    vm.set_module_attr(builtins, "str", str_fn);

    let hash_fn = make_native(vm, "hash", NativeSig::Fixed(1), |vm, args| {
        Ok(Value::Int(vm.hash_value(args[0])?))
    });
    vm.set_module_attr(builtins, "hash", hash_fn);

    let iter_fn = make_native(vm, "iter", NativeSig::Fixed(1), |vm, args| {
        let v = args[0];
        let hook = vm.resolve_unary(v.type_id(), |ops| ops.iter).ok_or_else(|| {
            VmError::type_error(format!("'{}' object is not iterable", vm.type_name(v)))
        })?;
        hook(vm, v)
    });
    vm.set_module_attr(builtins, "iter", iter_fn);

    let next_fn = make_native(vm, "next", NativeSig::Fixed(1), |vm, args| {
        let v = args[0];
        let hook = vm.resolve_unary(v.type_id(), |ops| ops.next).ok_or_else(|| {
            VmError::type_error(format!("'{}' object is not an iterator", vm.type_name(v)))
        })?;
        hook(vm, v)
    });
    vm.set_module_attr(builtins, "next", next_fn);

    // range(stop) / range(start, stop) / range(start, stop, step), bound
    // through the guest binding path so the optional forms work.
    let range_decl = Arc::new(
        FuncDecl::new(
            "range",
            pyrite_vm_bytecode::CodeUnitBuilder::new("range", "<builtin>").build(),
            vec!["start".into(), "stop".into(), "step".into()],
        )
        .with_defaults(vec![Constant::None, Constant::Int(1)]),
    );
    let range_fn = make_native(vm, "range", NativeSig::Decl(range_decl), |vm, args| {
        let step = args[2].as_int().unwrap_or(1);
        if step == 0 {
            return Err(VmError::value_error("range() arg 3 must not be zero"));
        }
        let (start, stop) = match (args[0].as_int(), args[1]) {
            (Some(a), Value::None) => (0, a),
            (Some(a), Value::Int(b)) => (a, b),
            _ => return Err(VmError::type_error("range() arguments must be integers")),
        };
        Ok(vm.new_range(start, stop, step))
    });
    vm.set_module_attr(builtins, "range", range_fn);

    // Container methods.
    let append = make_native(vm, "append", NativeSig::Fixed(2), |vm, args| {
        let r = expect_ref(args[0])?;
        let item = args[1];
        match &mut obj_mut(vm, r.handle)?.payload {
            ObjPayload::List(items) => {
                items.push(item);
                Ok(Value::None)
            }
            _ => Err(VmError::Internal("append receiver is not a list".into())),
        }
    });
    vm.types
        .get_mut(TypeId::LIST)
        .attrs
        .insert(Name::intern("append"), append);

    let pop = make_native(vm, "pop", NativeSig::Fixed(1), |vm, args| {
        let r = expect_ref(args[0])?;
        match &mut obj_mut(vm, r.handle)?.payload {
            ObjPayload::List(items) => items
                .pop()
                .ok_or_else(|| VmError::index_error("pop from empty list")),
            _ => Err(VmError::Internal("pop receiver is not a list".into())),
        }
    });
    vm.types
        .get_mut(TypeId::LIST)
        .attrs
        .insert(Name::intern("pop"), pop);

    let dict_get = make_native(vm, "get", NativeSig::Fixed(2), |vm, args| {
        let pairs = dict_pairs(vm, args[0])?;
        for (k, v) in pairs {
            if vm.values_equal(k, args[1])? {
                return Ok(v);
            }
        }
        Ok(Value::None)
    });
    vm.types
        .get_mut(TypeId::DICT)
        .attrs
        .insert(Name::intern("get"), dict_get);
}

// ---- shared helpers ----------------------------------------------------

fn expect_ref(v: Value) -> VmResult<crate::value::ObjRef> {
    v.as_ref()
        .ok_or_else(|| VmError::Internal("heap operation on an inline value".into()))
}

fn obj_mut(vm: &mut Vm, handle: pyrite_vm_gc::Handle) -> VmResult<&mut HeapObject> {
    vm.heap
        .get_mut(handle)
        .ok_or_else(|| VmError::Internal("operation on a dead object".into()))
}

fn int_of(v: Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(i),
        Value::Bool(b) => Some(b as i64),
        _ => None,
    }
}

fn float_of(v: Value) -> Option<f64> {
    match v {
        Value::Float(f) => Some(f),
        Value::Int(i) => Some(i as f64),
        Value::Bool(b) => Some(b as i64 as f64),
        _ => None,
    }
}

fn str_clone(vm: &Vm, v: Value) -> Option<String> {
    let r = v.as_ref()?;
    vm.heap.get(r.handle)?.as_str().map(str::to_string)
}

fn items_clone(vm: &Vm, v: Value) -> VmResult<Vec<Value>> {
    let r = expect_ref(v)?;
    let obj = vm
        .heap
        .get(r.handle)
        .ok_or_else(|| VmError::Internal("operation on a dead object".into()))?;
    match &obj.payload {
        ObjPayload::List(items) => Ok(items.clone()),
        ObjPayload::Tuple(items) => Ok(items.to_vec()),
        _ => Err(VmError::Internal("value is not a sequence".into())),
    }
}

fn dict_pairs(vm: &Vm, v: Value) -> VmResult<Vec<(Value, Value)>> {
    let r = expect_ref(v)?;
    let obj = vm
        .heap
        .get(r.handle)
        .ok_or_else(|| VmError::Internal("operation on a dead object".into()))?;
    match &obj.payload {
        ObjPayload::Dict(pairs) => Ok(pairs.clone()),
        _ => Err(VmError::Internal("value is not a dict".into())),
    }
}

/// Resolves a possibly negative index against `len`.
fn resolve_index(idx: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let i = if idx < 0 { idx + len } else { idx };
    if i < 0 || i >= len { None } else { Some(i as usize) }
}

fn type_pair(vm: &Vm, l: Value, r: Value) -> (String, String) {
    (vm.type_name(l), vm.type_name(r))
}

// ---- numeric hooks -----------------------------------------------------

fn num_repr(_vm: &mut Vm, v: Value) -> VmResult<String> {
    match v {
        Value::Int(i) => {
            let mut buf = itoa::Buffer::new();
            Ok(buf.format(i).to_string())
        }
        Value::Float(f) => {
            let mut buf = ryu::Buffer::new();
            Ok(buf.format(f).to_string())
        }
        _ => Err(VmError::Internal("numeric repr on a non-number".into())),
    }
}

fn bool_repr(_vm: &mut Vm, v: Value) -> VmResult<String> {
    Ok(if v == Value::Bool(true) { "True" } else { "False" }.to_string())
}

fn num_eq(_vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
    match (float_of(l), float_of(r)) {
        (Some(a), Some(b)) => Ok(Value::Bool(a == b)),
        _ => Ok(Value::Bool(false)),
    }
}

fn num_lt(vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
    match (float_of(l), float_of(r)) {
        (Some(a), Some(b)) => Ok(Value::Bool(a < b)),
        _ => {
            let (ln, rn) = type_pair(vm, l, r);
            Err(VmError::type_error(format!(
                "'<' not supported between instances of '{ln}' and '{rn}'"
            )))
        }
    }
}

macro_rules! num_binop {
    ($name:ident, $symbol:literal, $int:expr, $float:expr) => {
        fn $name(vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
            if let (Some(a), Some(b)) = (int_of(l), int_of(r)) {
                return Ok(Value::Int($int(a, b)));
            }
            match (float_of(l), float_of(r)) {
                (Some(a), Some(b)) => Ok(Value::Float($float(a, b))),
                _ => {
                    let (ln, rn) = type_pair(vm, l, r);
                    Err(VmError::type_error(format!(
                        "unsupported operand type(s) for {}: '{ln}' and '{rn}'",
                        $symbol
                    )))
                }
            }
        }
    };
}

num_binop!(num_add, "+", |a: i64, b: i64| a.wrapping_add(b), |a, b| a + b);
num_binop!(num_sub, "-", |a: i64, b: i64| a.wrapping_sub(b), |a, b| a - b);
num_binop!(num_mul, "*", |a: i64, b: i64| a.wrapping_mul(b), |a, b| a * b);

fn num_div(vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
    match (float_of(l), float_of(r)) {
        (Some(a), Some(b)) => {
            if b == 0.0 {
                Err(VmError::zero_division("division by zero"))
            } else {
                Ok(Value::Float(a / b))
            }
        }
        _ => {
            let (ln, rn) = type_pair(vm, l, r);
            Err(VmError::type_error(format!(
                "unsupported operand type(s) for /: '{ln}' and '{rn}'"
            )))
        }
    }
}

fn num_floordiv(vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
    if let (Some(a), Some(b)) = (int_of(l), int_of(r)) {
        if b == 0 {
            return Err(VmError::zero_division("integer division or modulo by zero"));
        }
        // Round toward negative infinity, as guest semantics require.
        let q = a.wrapping_div(b);
        let adjusted = if (a % b != 0) && ((a < 0) != (b < 0)) {
            q - 1
        } else {
            q
        };
        return Ok(Value::Int(adjusted));
    }
    match (float_of(l), float_of(r)) {
        (Some(a), Some(b)) => {
            if b == 0.0 {
                Err(VmError::zero_division("float floor division by zero"))
            } else {
                Ok(Value::Float((a / b).floor()))
            }
        }
        _ => {
            let (ln, rn) = type_pair(vm, l, r);
            Err(VmError::type_error(format!(
                "unsupported operand type(s) for //: '{ln}' and '{rn}'"
            )))
        }
    }
}

fn num_rem(vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
    if let (Some(a), Some(b)) = (int_of(l), int_of(r)) {
        if b == 0 {
            return Err(VmError::zero_division("integer division or modulo by zero"));
        }
        let m = a.wrapping_rem(b);
        let adjusted = if m != 0 && ((m < 0) != (b < 0)) { m + b } else { m };
        return Ok(Value::Int(adjusted));
    }
    match (float_of(l), float_of(r)) {
        (Some(a), Some(b)) => {
            if b == 0.0 {
                Err(VmError::zero_division("float modulo"))
            } else {
                let m = a % b;
                let adjusted = if m != 0.0 && (m < 0.0) != (b < 0.0) { m + b } else { m };
                Ok(Value::Float(adjusted))
            }
        }
        _ => {
            let (ln, rn) = type_pair(vm, l, r);
            Err(VmError::type_error(format!(
                "unsupported operand type(s) for %: '{ln}' and '{rn}'"
            )))
        }
    }
}

fn num_neg(_vm: &mut Vm, v: Value) -> VmResult<Value> {
    match v {
        Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
        Value::Float(f) => Ok(Value::Float(-f)),
        Value::Bool(b) => Ok(Value::Int(-(b as i64))),
        _ => Err(VmError::Internal("numeric negation on a non-number".into())),
    }
}

// Hashes agree across numeric kinds where the values compare equal:
// an integral float hashes as its integer value.
fn num_hash(_vm: &mut Vm, v: Value) -> VmResult<i64> {
    match v {
        Value::Bool(b) => Ok(b as i64),
        Value::Int(i) => Ok(i),
        Value::Float(f) => {
            if f == (f as i64) as f64 {
                Ok(f as i64)
            } else {
                Ok(f.to_bits() as i64)
            }
        }
        _ => Err(VmError::Internal("numeric hash on a non-number".into())),
    }
}

// ---- string hooks ------------------------------------------------------

fn str_repr(vm: &mut Vm, v: Value) -> VmResult<String> {
    let s = str_clone(vm, v).ok_or_else(|| VmError::Internal("str repr on non-str".into()))?;
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('\'');
    Ok(out)
}

// str(s) is the raw contents; the quoting above is repr-only.
fn str_str(vm: &mut Vm, v: Value) -> VmResult<String> {
    str_clone(vm, v).ok_or_else(|| VmError::Internal("str conversion on non-str".into()))
}

fn str_hash(vm: &mut Vm, v: Value) -> VmResult<i64> {
    use std::hash::Hasher;
    let s = str_clone(vm, v).ok_or_else(|| VmError::Internal("str hash on non-str".into()))?;
    let mut h = rustc_hash::FxHasher::default();
    h.write(s.as_bytes());
    Ok(h.finish() as i64)
}

fn str_len(vm: &mut Vm, v: Value) -> VmResult<usize> {
    let r = expect_ref(v)?;
    let obj = vm
        .heap
        .get(r.handle)
        .ok_or_else(|| VmError::Internal("len of a dead object".into()))?;
    obj.as_str()
        .map(|s| s.chars().count())
        .ok_or_else(|| VmError::Internal("str len on non-str".into()))
}

fn str_eq(vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
    let (Some(a), Some(b)) = (str_clone(vm, l), str_clone(vm, r)) else {
        return Ok(Value::Bool(false));
    };
    Ok(Value::Bool(a == b))
}

fn str_lt(vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
    match (str_clone(vm, l), str_clone(vm, r)) {
        (Some(a), Some(b)) => Ok(Value::Bool(a < b)),
        _ => {
            let (ln, rn) = type_pair(vm, l, r);
            Err(VmError::type_error(format!(
                "'<' not supported between instances of '{ln}' and '{rn}'"
            )))
        }
    }
}

fn str_add(vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
    let a = str_clone(vm, l).ok_or_else(|| VmError::Internal("str add on non-str".into()))?;
    match str_clone(vm, r) {
        Some(b) => Ok(vm.new_str(a + &b)),
        None => Err(VmError::type_error(format!(
            "can only concatenate str (not \"{}\") to str",
            vm.type_name(r)
        ))),
    }
}

fn str_mul(vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
    let a = str_clone(vm, l).ok_or_else(|| VmError::Internal("str mul on non-str".into()))?;
    let n = int_of(r).ok_or_else(|| {
        VmError::type_error(format!(
            "can't multiply sequence by non-int of type '{}'",
            vm.type_name(r)
        ))
    })?;
    let n = n.max(0) as usize;
    Ok(vm.new_str(a.repeat(n)))
}

fn str_getitem(vm: &mut Vm, l: Value, index: Value) -> VmResult<Value> {
    let s = str_clone(vm, l).ok_or_else(|| VmError::Internal("str index on non-str".into()))?;
    let idx = index.as_int().ok_or_else(|| {
        VmError::type_error(format!(
            "string indices must be integers, not '{}'",
            vm.type_name(index)
        ))
    })?;
    let len = s.chars().count();
    let i = resolve_index(idx, len)
        .ok_or_else(|| VmError::index_error("string index out of range"))?;
    let c = s.chars().nth(i).expect("index checked");
    Ok(vm.new_str(c.to_string()))
}

// ---- sequence hooks ----------------------------------------------------

fn list_len(vm: &mut Vm, v: Value) -> VmResult<usize> {
    Ok(items_clone(vm, v)?.len())
}

fn tuple_len(vm: &mut Vm, v: Value) -> VmResult<usize> {
    Ok(items_clone(vm, v)?.len())
}

fn seq_eq(vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
    if l.type_id() != r.type_id() {
        return Ok(Value::Bool(false));
    }
    let a = items_clone(vm, l)?;
    let b = items_clone(vm, r)?;
    if a.len() != b.len() {
        return Ok(Value::Bool(false));
    }
    for (x, y) in a.into_iter().zip(b) {
        if !vm.values_equal(x, y)? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn list_getitem(vm: &mut Vm, l: Value, index: Value) -> VmResult<Value> {
    let idx = index.as_int().ok_or_else(|| {
        VmError::type_error(format!(
            "list indices must be integers, not '{}'",
            vm.type_name(index)
        ))
    })?;
    let items = items_clone(vm, l)?;
    let i = resolve_index(idx, items.len())
        .ok_or_else(|| VmError::index_error("list index out of range"))?;
    Ok(items[i])
}

fn tuple_getitem(vm: &mut Vm, l: Value, index: Value) -> VmResult<Value> {
    let idx = index.as_int().ok_or_else(|| {
        VmError::type_error(format!(
            "tuple indices must be integers, not '{}'",
            vm.type_name(index)
        ))
    })?;
    let items = items_clone(vm, l)?;
    let i = resolve_index(idx, items.len())
        .ok_or_else(|| VmError::index_error("tuple index out of range"))?;
    Ok(items[i])
}

fn list_setitem(vm: &mut Vm, l: Value, index: Value, value: Value) -> VmResult<Value> {
    let idx = index.as_int().ok_or_else(|| {
        VmError::type_error(format!(
            "list indices must be integers, not '{}'",
            vm.type_name(index)
        ))
    })?;
    let r = expect_ref(l)?;
    match &mut obj_mut(vm, r.handle)?.payload {
        ObjPayload::List(items) => {
            let i = resolve_index(idx, items.len())
                .ok_or_else(|| VmError::index_error("list assignment index out of range"))?;
            items[i] = value;
            Ok(Value::None)
        }
        _ => Err(VmError::Internal("list setitem on non-list".into())),
    }
}

fn list_add(vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
    if r.type_id() != TypeId::LIST {
        return Err(VmError::type_error(format!(
            "can only concatenate list (not \"{}\") to list",
            vm.type_name(r)
        )));
    }
    let mut a = items_clone(vm, l)?;
    a.extend(items_clone(vm, r)?);
    Ok(vm.new_list(a))
}

fn list_mul(vm: &mut Vm, l: Value, r: Value) -> VmResult<Value> {
    let n = int_of(r).ok_or_else(|| {
        VmError::type_error(format!(
            "can't multiply sequence by non-int of type '{}'",
            vm.type_name(r)
        ))
    })?;
    let items = items_clone(vm, l)?;
    let n = n.max(0) as usize;
    let mut out = Vec::with_capacity(items.len() * n);
    for _ in 0..n {
        out.extend_from_slice(&items);
    }
    Ok(vm.new_list(out))
}

fn seq_iter(vm: &mut Vm, v: Value) -> VmResult<Value> {
    let r = expect_ref(v)?;
    Ok(vm.alloc(HeapObject::new(
        TypeId::ITER,
        ObjPayload::Iter(IterState::Seq {
            seq: r.handle,
            index: 0,
        }),
    )))
}

fn list_repr(vm: &mut Vm, v: Value) -> VmResult<String> {
    let items = items_clone(vm, v)?;
    let mut parts = Vec::with_capacity(items.len());
    for item in items {
        parts.push(vm.repr_value(item)?);
    }
    Ok(format!("[{}]", parts.join(", ")))
}

fn tuple_repr(vm: &mut Vm, v: Value) -> VmResult<String> {
    let items = items_clone(vm, v)?;
    let mut parts = Vec::with_capacity(items.len());
    for item in &items {
        parts.push(vm.repr_value(*item)?);
    }
    if items.len() == 1 {
        Ok(format!("({},)", parts[0]))
    } else {
        Ok(format!("({})", parts.join(", ")))
    }
}

// A tuple is hashable iff every element is; the combiner mirrors the
// usual polynomial fold so equal tuples hash equal.
fn tuple_hash(vm: &mut Vm, v: Value) -> VmResult<i64> {
    let items = items_clone(vm, v)?;
    let mut acc: i64 = 0x345678;
    for item in items {
        let h = vm.hash_value(item)?;
        acc = acc.wrapping_mul(1_000_003).wrapping_add(h);
    }
    Ok(acc)
}

// ---- dict hooks --------------------------------------------------------

fn dict_len(vm: &mut Vm, v: Value) -> VmResult<usize> {
    Ok(dict_pairs(vm, v)?.len())
}

fn dict_getitem(vm: &mut Vm, d: Value, key: Value) -> VmResult<Value> {
    let pairs = dict_pairs(vm, d)?;
    for (k, v) in pairs {
        if vm.values_equal(k, key)? {
            return Ok(v);
        }
    }
    let shown = vm.repr_value(key)?;
    Err(VmError::key_error(shown))
}

fn dict_setitem(vm: &mut Vm, d: Value, key: Value, value: Value) -> VmResult<Value> {
    // Find the matching key first; equality may reenter the VM, so the
    // mutable borrow is taken only for the final write.
    let pairs = dict_pairs(vm, d)?;
    let mut found = None;
    for (i, (k, _)) in pairs.iter().enumerate() {
        if vm.values_equal(*k, key)? {
            found = Some(i);
            break;
        }
    }
    let r = expect_ref(d)?;
    match &mut obj_mut(vm, r.handle)?.payload {
        ObjPayload::Dict(pairs) => {
            match found {
                Some(i) => pairs[i].1 = value,
                None => pairs.push((key, value)),
            }
            Ok(Value::None)
        }
        _ => Err(VmError::Internal("dict setitem on non-dict".into())),
    }
}

fn dict_repr(vm: &mut Vm, v: Value) -> VmResult<String> {
    let pairs = dict_pairs(vm, v)?;
    let mut parts = Vec::with_capacity(pairs.len());
    for (k, val) in pairs {
        let ks = vm.repr_value(k)?;
        let vs = vm.repr_value(val)?;
        parts.push(format!("{ks}: {vs}"));
    }
    Ok(format!("{{{}}}", parts.join(", ")))
}

// ---- range and iterator hooks ------------------------------------------

fn range_fields(vm: &Vm, v: Value) -> VmResult<(i64, i64, i64)> {
    let r = expect_ref(v)?;
    let obj = vm
        .heap
        .get(r.handle)
        .ok_or_else(|| VmError::Internal("operation on a dead object".into()))?;
    match obj.payload {
        ObjPayload::Range { start, stop, step } => Ok((start, stop, step)),
        _ => Err(VmError::Internal("value is not a range".into())),
    }
}

fn range_len(vm: &mut Vm, v: Value) -> VmResult<usize> {
    let (start, stop, step) = range_fields(vm, v)?;
    let span = if step > 0 { stop - start } else { start - stop };
    let step = step.abs();
    if span <= 0 {
        Ok(0)
    } else {
        Ok(((span + step - 1) / step) as usize)
    }
}

fn range_iter(vm: &mut Vm, v: Value) -> VmResult<Value> {
    let (start, stop, step) = range_fields(vm, v)?;
    Ok(vm.alloc(HeapObject::new(
        TypeId::ITER,
        ObjPayload::Iter(IterState::Range {
            current: start,
            stop,
            step,
        }),
    )))
}

fn range_repr(vm: &mut Vm, v: Value) -> VmResult<String> {
    let (start, stop, step) = range_fields(vm, v)?;
    if step == 1 {
        Ok(format!("range({start}, {stop})"))
    } else {
        Ok(format!("range({start}, {stop}, {step})"))
    }
}

fn identity_iter(_vm: &mut Vm, v: Value) -> VmResult<Value> {
    Ok(v)
}

fn iter_next(vm: &mut Vm, v: Value) -> VmResult<Value> {
    let r = expect_ref(v)?;
    // Read the iterator state, fetch the element, then bump the index.
    let step = {
        let obj = vm
            .heap
            .get(r.handle)
            .ok_or_else(|| VmError::Internal("next on a dead iterator".into()))?;
        match &obj.payload {
            ObjPayload::Iter(IterState::Seq { seq, index }) => Ok((*seq, *index)),
            ObjPayload::Iter(IterState::Range {
                current,
                stop,
                step,
            }) => Err((*current, *stop, *step)),
            _ => return Err(VmError::Internal("next on a non-iterator".into())),
        }
    };
    match step {
        Ok((seq, index)) => {
            let item = {
                let seq_obj = vm
                    .heap
                    .get(seq)
                    .ok_or_else(|| VmError::Internal("iterated sequence vanished".into()))?;
                match &seq_obj.payload {
                    ObjPayload::List(items) => items.get(index).copied(),
                    ObjPayload::Tuple(items) => items.get(index).copied(),
                    _ => return Err(VmError::Internal("iterated value is not a sequence".into())),
                }
            };
            match item {
                Some(item) => {
                    if let ObjPayload::Iter(IterState::Seq { index, .. }) =
                        &mut obj_mut(vm, r.handle)?.payload
                    {
                        *index += 1;
                    }
                    Ok(item)
                }
                None => Err(VmError::stop_iteration()),
            }
        }
        Err((current, stop, step)) => {
            let exhausted = if step > 0 { current >= stop } else { current <= stop };
            if exhausted {
                return Err(VmError::stop_iteration());
            }
            if let ObjPayload::Iter(IterState::Range { current: c, .. }) =
                &mut obj_mut(vm, r.handle)?.payload
            {
                *c = current + step;
            }
            Ok(Value::Int(current))
        }
    }
}

fn gen_next(vm: &mut Vm, v: Value) -> VmResult<Value> {
    let r = expect_ref(v)?;
    match vm.resume_generator(r, Value::None)? {
        crate::generator::ResumeResult::Yielded(x) => Ok(x),
        crate::generator::ResumeResult::Done(_) => Err(VmError::stop_iteration()),
    }
}

// ---- object reprs ------------------------------------------------------

fn function_repr(vm: &mut Vm, v: Value) -> VmResult<String> {
    let r = expect_ref(v)?;
    let obj = vm
        .heap
        .get(r.handle)
        .ok_or_else(|| VmError::Internal("repr of a dead object".into()))?;
    match &obj.payload {
        ObjPayload::Function(f) => Ok(format!("<function {}>", f.decl.name)),
        _ => Ok("<function>".to_string()),
    }
}

fn native_repr(vm: &mut Vm, v: Value) -> VmResult<String> {
    let r = expect_ref(v)?;
    let obj = vm
        .heap
        .get(r.handle)
        .ok_or_else(|| VmError::Internal("repr of a dead object".into()))?;
    match &obj.payload {
        ObjPayload::NativeFunc(n) => Ok(format!("<built-in function {}>", n.name)),
        _ => Ok("<built-in function>".to_string()),
    }
}

fn type_repr(vm: &mut Vm, v: Value) -> VmResult<String> {
    let r = expect_ref(v)?;
    let obj = vm
        .heap
        .get(r.handle)
        .ok_or_else(|| VmError::Internal("repr of a dead object".into()))?;
    match obj.payload {
        ObjPayload::Type(t) => Ok(format!("<class '{}'>", vm.types.name_of(t))),
        _ => Ok("<class>".to_string()),
    }
}

fn module_repr(vm: &mut Vm, v: Value) -> VmResult<String> {
    let r = expect_ref(v)?;
    let obj = vm
        .heap
        .get(r.handle)
        .ok_or_else(|| VmError::Internal("repr of a dead object".into()))?;
    match obj.payload {
        ObjPayload::Module(name) => Ok(format!("<module '{name}'>")),
        _ => Ok("<module>".to_string()),
    }
}

fn exc_repr(vm: &mut Vm, v: Value) -> VmResult<String> {
    let r = expect_ref(v)?;
    let obj = vm
        .heap
        .get(r.handle)
        .ok_or_else(|| VmError::Internal("repr of a dead object".into()))?;
    match &obj.payload {
        ObjPayload::Exception(data) => Ok(format!("{}('{}')", data.type_name, data.message)),
        _ => Ok("<exception>".to_string()),
    }
}
