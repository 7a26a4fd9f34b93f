//! End-to-end execution tests: hand-assembled code units driven through
//! the full dispatch loop.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use pyrite_vm_bytecode::{
    BlockKind, CodeUnit, CodeUnitBuilder, Constant, FuncDecl, NO_ARG, NO_BLOCK, Op, pack_call,
};
use pyrite_vm_core::builtins::make_native;
use pyrite_vm_core::{
    GenState, HeapObject, Name, NativeSig, ObjPayload, ResumeResult, TypeId, TypeOps, Value, Vm,
    VmError,
};

fn exec(vm: &mut Vm, unit: CodeUnit) -> Result<Value, VmError> {
    let module = vm.new_module("__main__");
    vm.exec(Arc::new(unit), module)
}

fn exec_in(vm: &mut Vm, unit: CodeUnit, module: Value) -> Result<Value, VmError> {
    vm.exec(Arc::new(unit), module)
}

fn exc_message(err: &VmError) -> String {
    match err {
        VmError::Exception(e) => format!("{}: {}", e.type_name, e.message),
        other => panic!("expected a guest exception, got {other:?}"),
    }
}

#[test]
fn test_arithmetic() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    b.emit(Op::LoadSmallInt, 2);
    b.emit(Op::LoadSmallInt, 3);
    b.emit(Op::Mul, NO_ARG);
    b.emit(Op::LoadSmallInt, 4);
    b.emit(Op::Add, NO_ARG);
    b.emit(Op::Return, NO_ARG);
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(10));
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn test_true_division_yields_float() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    b.emit(Op::LoadSmallInt, 7);
    b.emit(Op::LoadSmallInt, 2);
    b.emit(Op::Div, NO_ARG);
    b.emit(Op::Return, NO_ARG);
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Float(3.5));
}

#[test]
fn test_floor_division_rounds_toward_negative_infinity() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    b.emit(Op::LoadSmallInt, (-7i16) as u16);
    b.emit(Op::LoadSmallInt, 2);
    b.emit(Op::FloorDiv, NO_ARG);
    b.emit(Op::Return, NO_ARG);
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(-4));
}

#[test]
fn test_locals_roundtrip() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let x = b.add_name("x");
    b.emit(Op::LoadSmallInt, 5);
    b.emit(Op::StoreLocal, x);
    b.emit(Op::LoadLocal, x);
    b.emit(Op::LoadLocal, x);
    b.emit(Op::Mul, NO_ARG);
    b.emit(Op::Return, NO_ARG);
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(25));
}

#[test]
fn test_conditional_jump() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    b.emit(Op::LoadSmallInt, 2);
    b.emit(Op::LoadSmallInt, 1);
    b.emit(Op::Lt, NO_ARG);
    let jmp = b.emit(Op::PopJumpIfFalse, 0);
    b.emit(Op::LoadSmallInt, 10);
    b.emit(Op::Return, NO_ARG);
    let else_at = b.here();
    b.patch(jmp, else_at as u16);
    b.emit(Op::LoadSmallInt, 20);
    b.emit(Op::Return, NO_ARG);
    // 2 < 1 is false, so control lands in the else branch.
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(20));
}

fn add_func_decl() -> FuncDecl {
    let mut inner = CodeUnitBuilder::new("add", "<test>");
    let a = inner.add_name("a");
    let bslot = inner.add_name("b");
    inner.emit(Op::LoadLocal, a);
    inner.emit(Op::LoadLocal, bslot);
    inner.emit(Op::Add, NO_ARG);
    inner.emit(Op::Return, NO_ARG);
    FuncDecl::new("add", inner.build(), vec!["a".into(), "b".into()])
}

#[test]
fn test_simple_function_call() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let f = b.add_func(add_func_decl());
    b.emit(Op::MakeFunction, f);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadSmallInt, 3);
    b.emit(Op::LoadSmallInt, 4);
    b.emit(Op::Call, pack_call(2, 0));
    b.emit(Op::Return, NO_ARG);
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(7));
    assert_eq!(vm.stack_depth(), 0);
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn test_call_fills_default_from_declaration() {
    let mut vm = Vm::new();
    let decl = add_func_decl().with_defaults(vec![Constant::Int(10)]);
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let f = b.add_func(decl);
    b.emit(Op::MakeFunction, f);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadSmallInt, 1);
    b.emit(Op::Call, pack_call(1, 0));
    b.emit(Op::Return, NO_ARG);
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(11));
}

#[test]
fn test_keyword_argument_overrides_default() {
    let mut vm = Vm::new();
    let decl = add_func_decl().with_defaults(vec![Constant::Int(10)]);
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let f = b.add_func(decl);
    let kw = b.add_const(Constant::Str("b".into()));
    b.emit(Op::MakeFunction, f);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadSmallInt, 1);
    b.emit(Op::LoadConst, kw);
    b.emit(Op::LoadSmallInt, 5);
    b.emit(Op::Call, pack_call(1, 1));
    b.emit(Op::Return, NO_ARG);
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(6));
}

#[test]
fn test_duplicate_argument_raises_type_error() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let f = b.add_func(add_func_decl());
    let kw = b.add_const(Constant::Str("a".into()));
    b.emit(Op::MakeFunction, f);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadSmallInt, 1);
    b.emit(Op::LoadSmallInt, 2);
    b.emit(Op::LoadConst, kw);
    b.emit(Op::LoadSmallInt, 3);
    b.emit(Op::Call, pack_call(2, 1));
    b.emit(Op::Return, NO_ARG);
    let err = exec(&mut vm, b.build()).unwrap_err();
    assert_eq!(
        exc_message(&err),
        "TypeError: add() got multiple values for argument 'a'"
    );
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn test_missing_argument_raises_type_error() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let f = b.add_func(add_func_decl());
    b.emit(Op::MakeFunction, f);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadSmallInt, 1);
    b.emit(Op::Call, pack_call(1, 0));
    b.emit(Op::Return, NO_ARG);
    let err = exec(&mut vm, b.build()).unwrap_err();
    assert_eq!(
        exc_message(&err),
        "TypeError: add() missing 1 required positional argument: 'b'"
    );
}

#[test]
fn test_unexpected_keyword_raises_type_error() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let f = b.add_func(add_func_decl());
    let kw = b.add_const(Constant::Str("c".into()));
    b.emit(Op::MakeFunction, f);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadSmallInt, 1);
    b.emit(Op::LoadSmallInt, 2);
    b.emit(Op::LoadConst, kw);
    b.emit(Op::LoadSmallInt, 3);
    b.emit(Op::Call, pack_call(2, 1));
    b.emit(Op::Return, NO_ARG);
    let err = exec(&mut vm, b.build()).unwrap_err();
    assert_eq!(
        exc_message(&err),
        "TypeError: add() got an unexpected keyword argument 'c'"
    );
}

#[test]
fn test_too_many_positionals_raises_type_error() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let f = b.add_func(add_func_decl());
    b.emit(Op::MakeFunction, f);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadSmallInt, 1);
    b.emit(Op::LoadSmallInt, 2);
    b.emit(Op::LoadSmallInt, 3);
    b.emit(Op::Call, pack_call(3, 0));
    b.emit(Op::Return, NO_ARG);
    let err = exec(&mut vm, b.build()).unwrap_err();
    assert_eq!(
        exc_message(&err),
        "TypeError: add() takes 2 positional arguments but 3 were given"
    );
}

#[test]
fn test_star_args_collects_extras() {
    let mut vm = Vm::new();
    let mut inner = CodeUnitBuilder::new("variadic", "<test>");
    inner.add_name("a");
    let rest = inner.add_name("rest");
    let len_name = inner.add_const(Constant::Str("len".into()));
    inner.emit(Op::LoadGlobal, len_name);
    inner.emit(Op::PushNull, NO_ARG);
    inner.emit(Op::LoadLocal, rest);
    inner.emit(Op::Call, pack_call(1, 0));
    inner.emit(Op::Return, NO_ARG);
    let decl = FuncDecl::new("variadic", inner.build(), vec!["a".into()]).with_star_args();

    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let f = b.add_func(decl);
    b.emit(Op::MakeFunction, f);
    b.emit(Op::PushNull, NO_ARG);
    for i in 1..=4 {
        b.emit(Op::LoadSmallInt, i);
    }
    b.emit(Op::Call, pack_call(4, 0));
    b.emit(Op::Return, NO_ARG);
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(3));
}

#[test]
fn test_star_kwargs_collects_extras() {
    let mut vm = Vm::new();
    let mut inner = CodeUnitBuilder::new("kw_only", "<test>");
    let kwargs = inner.add_name("kwargs");
    let len_name = inner.add_const(Constant::Str("len".into()));
    inner.emit(Op::LoadGlobal, len_name);
    inner.emit(Op::PushNull, NO_ARG);
    inner.emit(Op::LoadLocal, kwargs);
    inner.emit(Op::Call, pack_call(1, 0));
    inner.emit(Op::Return, NO_ARG);
    let decl = FuncDecl::new("kw_only", inner.build(), vec![]).with_star_kwargs();

    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let f = b.add_func(decl);
    let kx = b.add_const(Constant::Str("x".into()));
    let ky = b.add_const(Constant::Str("y".into()));
    b.emit(Op::MakeFunction, f);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadConst, kx);
    b.emit(Op::LoadSmallInt, 1);
    b.emit(Op::LoadConst, ky);
    b.emit(Op::LoadSmallInt, 2);
    b.emit(Op::Call, pack_call(0, 2));
    b.emit(Op::Return, NO_ARG);
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(2));
}

/// A loop whose body raises on one iteration, catches it, and keeps
/// going, leaving the operand stack balanced throughout.
#[test]
fn test_loop_with_try_except_stays_balanced() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let total = b.add_name("total");
    let i = b.add_name("i");
    let range_name = b.add_const(Constant::Str("range".into()));
    let loop_b = b.add_block(BlockKind::Loop, NO_BLOCK);
    let try_b = b.add_block(BlockKind::TryExcept, loop_b);

    b.emit(Op::LoadSmallInt, 0);
    b.emit(Op::StoreLocal, total);
    b.emit(Op::LoadGlobal, range_name);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadSmallInt, 4);
    b.emit(Op::Call, pack_call(1, 0));
    b.emit(Op::GetIter, NO_ARG);
    b.emit(Op::PushLoop, loop_b);
    let head = b.here();
    let for_iter = b.emit(Op::ForIter, 0);
    b.emit(Op::StoreLocal, i);
    let try_start = b.emit(Op::EnterTry, try_b);
    // total += 10 // (i - 2); raises ZeroDivisionError when i == 2.
    b.emit(Op::LoadLocal, total);
    b.emit(Op::LoadSmallInt, 10);
    b.emit(Op::LoadLocal, i);
    b.emit(Op::LoadSmallInt, 2);
    b.emit(Op::Sub, NO_ARG);
    b.emit(Op::FloorDiv, NO_ARG);
    b.emit(Op::Add, NO_ARG);
    b.emit(Op::StoreLocal, total);
    let try_end = b.emit(Op::ExitTry, try_b);
    let skip_handler = b.emit(Op::Jump, 0);
    let handler = b.here();
    b.emit(Op::Pop, NO_ARG);
    b.emit(Op::PopException, NO_ARG);
    b.emit(Op::LoadLocal, total);
    b.emit(Op::LoadSmallInt, 100);
    b.emit(Op::Add, NO_ARG);
    b.emit(Op::StoreLocal, total);
    let after = b.here();
    b.patch(skip_handler, after as u16);
    b.emit(Op::Jump, head as u16);
    let end = b.here();
    b.patch(for_iter, end as u16);
    b.emit(Op::LoadLocal, total);
    b.emit(Op::Return, NO_ARG);
    b.patch_block(loop_b, head, end, 0);
    b.patch_block(try_b, try_start, try_end, handler);

    // i=0: 10 // -2 = -5; i=1: 10 // -1 = -10; i=2: handler adds 100;
    // i=3: 10 // 1 = 10. Total: 95.
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(95));
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn test_break_and_continue() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let total = b.add_name("total");
    let i = b.add_name("i");
    let range_name = b.add_const(Constant::Str("range".into()));
    let loop_b = b.add_block(BlockKind::Loop, NO_BLOCK);

    b.emit(Op::LoadSmallInt, 0);
    b.emit(Op::StoreLocal, total);
    b.emit(Op::LoadGlobal, range_name);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadSmallInt, 10);
    b.emit(Op::Call, pack_call(1, 0));
    b.emit(Op::GetIter, NO_ARG);
    b.emit(Op::PushLoop, loop_b);
    let head = b.here();
    let for_iter = b.emit(Op::ForIter, 0);
    b.emit(Op::StoreLocal, i);
    // if i == 3: continue
    b.emit(Op::LoadLocal, i);
    b.emit(Op::LoadSmallInt, 3);
    b.emit(Op::Eq, NO_ARG);
    let no_cont = b.emit(Op::PopJumpIfFalse, 0);
    b.emit(Op::Continue, loop_b);
    let after_cont = b.here();
    b.patch(no_cont, after_cont as u16);
    // if i == 6: break
    b.emit(Op::LoadLocal, i);
    b.emit(Op::LoadSmallInt, 6);
    b.emit(Op::Eq, NO_ARG);
    let no_break = b.emit(Op::PopJumpIfFalse, 0);
    b.emit(Op::Break, loop_b);
    let after_break = b.here();
    b.patch(no_break, after_break as u16);
    b.emit(Op::LoadLocal, total);
    b.emit(Op::LoadLocal, i);
    b.emit(Op::Add, NO_ARG);
    b.emit(Op::StoreLocal, total);
    b.emit(Op::Jump, head as u16);
    let end = b.here();
    b.patch(for_iter, end as u16);
    b.emit(Op::LoadLocal, total);
    b.emit(Op::Return, NO_ARG);
    b.patch_block(loop_b, head, end, 0);

    // 0+1+2+4+5 = 12 (3 skipped, loop breaks at 6).
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(12));
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn test_uncaught_exception_carries_traceback() {
    let mut vm = Vm::new();

    let mut boom = CodeUnitBuilder::new("boom", "demo.py");
    boom.line(12);
    boom.emit(Op::LoadSmallInt, 1);
    boom.emit(Op::LoadSmallInt, 0);
    boom.emit(Op::FloorDiv, NO_ARG);
    boom.emit(Op::Return, NO_ARG);
    let boom_decl = FuncDecl::new("boom", boom.build(), vec![]);

    let mut mid = CodeUnitBuilder::new("call_boom", "demo.py");
    let boom_name = mid.add_const(Constant::Str("boom".into()));
    mid.line(7);
    mid.emit(Op::LoadGlobal, boom_name);
    mid.emit(Op::PushNull, NO_ARG);
    mid.emit(Op::Call, pack_call(0, 0));
    mid.emit(Op::Return, NO_ARG);
    let mid_decl = FuncDecl::new("call_boom", mid.build(), vec![]);

    let mut b = CodeUnitBuilder::new("<module>", "demo.py");
    let fb = b.add_func(boom_decl);
    let fm = b.add_func(mid_decl);
    let boom_name = b.add_const(Constant::Str("boom".into()));
    let mid_name = b.add_const(Constant::Str("call_boom".into()));
    b.line(1);
    b.emit(Op::MakeFunction, fb);
    b.emit(Op::StoreGlobal, boom_name);
    b.emit(Op::MakeFunction, fm);
    b.emit(Op::StoreGlobal, mid_name);
    b.line(3);
    b.emit(Op::LoadGlobal, mid_name);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::Call, pack_call(0, 0));
    b.emit(Op::Return, NO_ARG);

    let err = exec(&mut vm, b.build()).unwrap_err();
    let VmError::Exception(exc) = err else {
        panic!("expected an exception");
    };
    assert_eq!(exc.type_name, "ZeroDivisionError");
    // Innermost frame first in the raw trace.
    assert_eq!(exc.trace.len(), 3);
    assert_eq!(exc.trace[0].func, "boom");
    assert_eq!(exc.trace[0].line, 12);
    assert_eq!(exc.trace[1].func, "call_boom");
    assert_eq!(exc.trace[2].func, "<module>");
    let report = exc.format_traceback();
    assert!(report.starts_with("Traceback (most recent call last):"));
    assert!(report.contains("File \"demo.py\", line 12, in boom"));
    // The VM is fully reset afterwards.
    assert_eq!(vm.stack_depth(), 0);
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn test_handler_receives_exception_object() {
    let mut vm = Vm::new();
    let module = vm.new_module("__main__");
    let err_obj = vm.new_exception("ValueError", "bad input");
    vm.set_module_attr(module, "err", err_obj);

    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let err_name = b.add_const(Constant::Str("err".into()));
    let try_b = b.add_block(BlockKind::TryExcept, NO_BLOCK);
    let start = b.emit(Op::EnterTry, try_b);
    b.emit(Op::LoadGlobal, err_name);
    b.emit(Op::Raise, NO_ARG);
    let handler = b.here();
    b.emit(Op::Return, NO_ARG);
    b.patch_block(try_b, start, handler, handler);

    let caught = exec_in(&mut vm, b.build(), module).unwrap();
    let r = caught.as_ref().expect("handler value is heap-backed");
    assert_eq!(r.type_id, TypeId::EXCEPTION);
    let obj = vm.heap.get(r.handle).unwrap();
    match &obj.payload {
        ObjPayload::Exception(data) => {
            assert_eq!(data.type_name, "ValueError");
            assert_eq!(data.message, "bad input");
            assert_eq!(data.trace.len(), 1);
        }
        _ => panic!("expected exception payload"),
    }
}

#[test]
fn test_reraise_propagates_original() {
    let mut vm = Vm::new();
    let module = vm.new_module("__main__");
    let err_obj = vm.new_exception("KeyError", "gone");
    vm.set_module_attr(module, "err", err_obj);

    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let err_name = b.add_const(Constant::Str("err".into()));
    let try_b = b.add_block(BlockKind::TryExcept, NO_BLOCK);
    let start = b.emit(Op::EnterTry, try_b);
    b.emit(Op::LoadGlobal, err_name);
    b.emit(Op::Raise, NO_ARG);
    let handler = b.here();
    b.emit(Op::Pop, NO_ARG);
    b.emit(Op::Reraise, NO_ARG);
    b.patch_block(try_b, start, handler, handler);

    let err = exec_in(&mut vm, b.build(), module).unwrap_err();
    let VmError::Exception(exc) = err else {
        panic!("expected an exception");
    };
    assert_eq!(exc.type_name, "KeyError");
    // The re-raising frame appears once, not once per raise.
    assert_eq!(exc.trace.len(), 1);
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn test_attribute_cycle_is_collected() {
    let mut vm = Vm::new();
    let baseline = vm.heap_stats().live_objects;
    let a = vm.new_instance(TypeId::OBJECT);
    let b = vm.new_instance(TypeId::OBJECT);
    vm.setattr(a, Name::intern("peer"), b).unwrap();
    vm.setattr(b, Name::intern("peer"), a).unwrap();
    assert_eq!(vm.heap_stats().live_objects, baseline + 2);
    // Nothing roots the pair; the cycle must not keep itself alive.
    vm.collect_garbage();
    assert_eq!(vm.heap_stats().live_objects, baseline);
}

#[test]
fn test_generator_driven_from_host() {
    let mut vm = Vm::new();
    let module = vm.new_module("m");

    let mut gb = CodeUnitBuilder::new("counter", "<test>");
    for i in 1..=3 {
        gb.emit(Op::LoadSmallInt, i);
        gb.emit(Op::Yield, NO_ARG);
        gb.emit(Op::Pop, NO_ARG);
    }
    gb.emit(Op::LoadNone, NO_ARG);
    gb.emit(Op::Return, NO_ARG);
    let decl = FuncDecl::new("counter", gb.build(), vec![]).generator();

    let f = vm.new_function(Arc::new(decl), module);
    let generator = vm.call_function(f, Value::Null, &[], &[]).unwrap();
    let r = generator.as_ref().expect("generator is heap-backed");
    assert_eq!(r.type_id, TypeId::GENERATOR);

    for expected in 1..=3 {
        let step = vm.resume_generator(r, Value::None).unwrap();
        assert_eq!(step, ResumeResult::Yielded(Value::Int(expected)));
        assert_eq!(vm.stack_depth(), 0);
    }
    let done = vm.resume_generator(r, Value::None).unwrap();
    assert_eq!(done, ResumeResult::Done(Value::None));

    // Exhaustion drops the retained frame and its saved span.
    let obj = vm.heap.get(r.handle).unwrap();
    match &obj.payload {
        ObjPayload::Generator(g) => {
            assert_eq!(g.state, GenState::Exhausted);
            assert!(g.frame.is_none());
            assert!(g.saved_stack.is_empty());
        }
        _ => panic!("expected generator payload"),
    }
    // A further resume reports exhaustion.
    let err = vm.resume_generator(r, Value::None).unwrap_err();
    assert!(err.is_stop_iteration());
}

#[test]
fn test_generator_in_for_loop() {
    let mut vm = Vm::new();

    let mut gb = CodeUnitBuilder::new("counter", "<test>");
    for i in 1..=3 {
        gb.emit(Op::LoadSmallInt, i);
        gb.emit(Op::Yield, NO_ARG);
        gb.emit(Op::Pop, NO_ARG);
    }
    gb.emit(Op::LoadNone, NO_ARG);
    gb.emit(Op::Return, NO_ARG);
    let decl = FuncDecl::new("counter", gb.build(), vec![]).generator();

    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let f = b.add_func(decl);
    let total = b.add_name("total");
    let loop_b = b.add_block(BlockKind::Loop, NO_BLOCK);
    b.emit(Op::LoadSmallInt, 0);
    b.emit(Op::StoreLocal, total);
    b.emit(Op::MakeFunction, f);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::Call, pack_call(0, 0));
    b.emit(Op::GetIter, NO_ARG);
    b.emit(Op::PushLoop, loop_b);
    let head = b.here();
    let for_iter = b.emit(Op::ForIter, 0);
    b.emit(Op::LoadLocal, total);
    b.emit(Op::Add, NO_ARG);
    b.emit(Op::StoreLocal, total);
    b.emit(Op::Jump, head as u16);
    let end = b.here();
    b.patch(for_iter, end as u16);
    b.emit(Op::LoadLocal, total);
    b.emit(Op::Return, NO_ARG);
    b.patch_block(loop_b, head, end, 0);

    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(6));
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn test_method_call_fast_path_appends() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let lst = b.add_name("lst");
    let append = b.add_const(Constant::Str("append".into()));
    b.emit(Op::BuildList, 0);
    b.emit(Op::StoreLocal, lst);
    for v in [7, 9] {
        b.emit(Op::LoadLocal, lst);
        b.emit(Op::LoadMethod, append);
        b.emit(Op::LoadSmallInt, v);
        b.emit(Op::CallMethod, pack_call(1, 0));
        b.emit(Op::Pop, NO_ARG);
    }
    b.emit(Op::LoadLocal, lst);
    b.emit(Op::Return, NO_ARG);

    let result = exec(&mut vm, b.build()).unwrap();
    let r = result.as_ref().unwrap();
    let obj = vm.heap.get(r.handle).unwrap();
    assert_eq!(
        obj.as_list().unwrap().as_slice(),
        &[Value::Int(7), Value::Int(9)]
    );
}

#[test]
fn test_import_resolves_registered_module() {
    let mut vm = Vm::new();
    let dep = vm.new_module("config");
    vm.set_module_attr(dep, "answer", Value::Int(42));
    vm.register_module("config", dep);

    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let mod_name = b.add_const(Constant::Str("config".into()));
    let attr = b.add_const(Constant::Str("answer".into()));
    b.emit(Op::ImportName, mod_name);
    b.emit(Op::LoadAttr, attr);
    b.emit(Op::Return, NO_ARG);
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(42));
}

#[test]
fn test_missing_import_raises() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let mod_name = b.add_const(Constant::Str("nowhere".into()));
    b.emit(Op::ImportName, mod_name);
    b.emit(Op::Return, NO_ARG);
    let err = exec(&mut vm, b.build()).unwrap_err();
    assert_eq!(exc_message(&err), "ImportError: No module named 'nowhere'");
}

#[test]
fn test_class_construction_runs_init() {
    let mut vm = Vm::new();
    let module = vm.new_module("__main__");

    let point = vm.types.register("Point", Some(TypeId::OBJECT), TypeOps::default());
    let mut ib = CodeUnitBuilder::new("__init__", "<test>");
    let self_slot = ib.add_name("self");
    let x_slot = ib.add_name("x");
    let x_attr = ib.add_const(Constant::Str("x".into()));
    ib.emit(Op::LoadLocal, self_slot);
    ib.emit(Op::LoadLocal, x_slot);
    ib.emit(Op::StoreAttr, x_attr);
    ib.emit(Op::LoadNone, NO_ARG);
    ib.emit(Op::Return, NO_ARG);
    let init_decl = FuncDecl::new("__init__", ib.build(), vec!["self".into(), "x".into()]);
    let init = vm.new_function(Arc::new(init_decl), module);
    vm.types
        .get_mut(point)
        .attrs
        .insert(Name::intern("__init__"), init);
    let type_obj = vm.new_type_object(point);
    vm.set_module_attr(module, "Point", type_obj);

    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let cls = b.add_const(Constant::Str("Point".into()));
    let x_attr = b.add_const(Constant::Str("x".into()));
    b.emit(Op::LoadGlobal, cls);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadSmallInt, 5);
    b.emit(Op::Call, pack_call(1, 0));
    b.emit(Op::LoadAttr, x_attr);
    b.emit(Op::Return, NO_ARG);
    assert_eq!(exec_in(&mut vm, b.build(), module).unwrap(), Value::Int(5));
}

#[test]
fn test_property_getter_and_readonly_setter() {
    let mut vm = Vm::new();
    let described = vm.types.register("Measured", Some(TypeId::OBJECT), TypeOps::default());
    let getter = make_native(&mut vm, "value", NativeSig::Fixed(1), |_, _| {
        Ok(Value::Int(99))
    });
    let prop = vm.alloc(HeapObject::new(
        TypeId::PROPERTY,
        ObjPayload::Property {
            getter,
            setter: Value::Null,
        },
    ));
    vm.types
        .get_mut(described)
        .attrs
        .insert(Name::intern("value"), prop);

    let inst = vm.new_instance(described);
    let got = vm.getattr(inst, Name::intern("value")).unwrap();
    assert_eq!(got, Value::Int(99));

    let err = vm
        .setattr(inst, Name::intern("value"), Value::Int(1))
        .unwrap_err();
    assert!(exc_message(&err).contains("has no setter"));
}

#[test]
fn test_with_block_calls_exit_hook() {
    let mut vm = Vm::new();
    let module = vm.new_module("__main__");
    let res_type = vm.types.register("Res", Some(TypeId::OBJECT), TypeOps::default());
    let exit = make_native(&mut vm, "__exit__", NativeSig::Fixed(1), |vm, args| {
        let r = args[0].as_ref().expect("receiver is heap-backed");
        vm.heap
            .get_mut(r.handle)
            .expect("receiver alive")
            .set_attr(Name::intern("closed"), Value::Bool(true));
        Ok(Value::None)
    });
    vm.types
        .get_mut(res_type)
        .attrs
        .insert(Name::intern("__exit__"), exit);
    let res = vm.new_instance(res_type);
    vm.set_module_attr(module, "res", res);

    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let res_name = b.add_const(Constant::Str("res".into()));
    let with_b = b.add_block(BlockKind::With, NO_BLOCK);
    b.emit(Op::LoadGlobal, res_name);
    let start = b.emit(Op::EnterWith, with_b);
    b.emit(Op::Nop, NO_ARG);
    let end = b.emit(Op::ExitWith, with_b);
    b.patch_block(with_b, start, end, 0);
    b.emit(Op::LoadNone, NO_ARG);
    b.emit(Op::Return, NO_ARG);

    exec_in(&mut vm, b.build(), module).unwrap();
    assert_eq!(
        vm.getattr(res, Name::intern("closed")).unwrap(),
        Value::Bool(true)
    );
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn test_recursion_limit() {
    let mut vm = Vm::new();
    vm.set_max_call_depth(50);

    let mut rb = CodeUnitBuilder::new("forever", "<test>");
    let fname = rb.add_const(Constant::Str("forever".into()));
    rb.emit(Op::LoadGlobal, fname);
    rb.emit(Op::PushNull, NO_ARG);
    rb.emit(Op::Call, pack_call(0, 0));
    rb.emit(Op::Return, NO_ARG);
    let decl = FuncDecl::new("forever", rb.build(), vec![]);

    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let f = b.add_func(decl);
    let fname = b.add_const(Constant::Str("forever".into()));
    b.emit(Op::MakeFunction, f);
    b.emit(Op::StoreGlobal, fname);
    b.emit(Op::LoadGlobal, fname);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::Call, pack_call(0, 0));
    b.emit(Op::Return, NO_ARG);

    let err = exec(&mut vm, b.build()).unwrap_err();
    assert!(matches!(err, VmError::RecursionLimit));
    assert_eq!(vm.stack_depth(), 0);
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn test_operand_stack_overflow() {
    let mut vm = Vm::with_stack_limit(16);
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    b.emit(Op::LoadSmallInt, 1);
    for _ in 0..40 {
        b.emit(Op::Dup, NO_ARG);
    }
    b.emit(Op::Return, NO_ARG);
    let err = exec(&mut vm, b.build()).unwrap_err();
    assert!(matches!(err, VmError::StackOverflow));
    assert_eq!(vm.stack_depth(), 0);
}

#[test]
fn test_interrupt_stops_execution() {
    let mut vm = Vm::new();
    vm.interrupt_handle().store(true, Ordering::Relaxed);
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    b.emit(Op::Jump, 0);
    let err = exec(&mut vm, b.build()).unwrap_err();
    assert!(matches!(err, VmError::Interrupted));

    // The reset clears the flag; the VM is usable again.
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    b.emit(Op::LoadSmallInt, 1);
    b.emit(Op::Return, NO_ARG);
    assert_eq!(exec(&mut vm, b.build()).unwrap(), Value::Int(1));
}

#[test]
fn test_allocation_pressure_triggers_collection() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let i = b.add_name("i");
    let a = b.add_const(Constant::Str("left".into()));
    let c = b.add_const(Constant::Str("right".into()));
    let range_name = b.add_const(Constant::Str("range".into()));
    let loop_b = b.add_block(BlockKind::Loop, NO_BLOCK);
    b.emit(Op::LoadGlobal, range_name);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadSmallInt, 1000);
    b.emit(Op::Call, pack_call(1, 0));
    b.emit(Op::GetIter, NO_ARG);
    b.emit(Op::PushLoop, loop_b);
    let head = b.here();
    let for_iter = b.emit(Op::ForIter, 0);
    b.emit(Op::StoreLocal, i);
    b.emit(Op::LoadConst, a);
    b.emit(Op::LoadConst, c);
    b.emit(Op::Add, NO_ARG);
    b.emit(Op::Pop, NO_ARG);
    b.emit(Op::Jump, head as u16);
    let end = b.here();
    b.patch(for_iter, end as u16);
    b.emit(Op::LoadNone, NO_ARG);
    b.emit(Op::Return, NO_ARG);
    b.patch_block(loop_b, head, end, 0);

    exec(&mut vm, b.build()).unwrap();
    assert!(
        vm.heap_stats().collections >= 1,
        "expected at least one collection under allocation pressure"
    );
    // With nothing referencing the loop's strings, a final collection
    // brings the heap back down to the builtin population.
    vm.collect_garbage();
    let live = vm.heap_stats().live_objects;
    assert!(live < 100, "live objects after collection: {live}");
}

#[test]
fn test_builtin_repr() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let repr_name = b.add_const(Constant::Str("repr".into()));
    let hello = b.add_const(Constant::Str("hi".into()));
    b.emit(Op::LoadGlobal, repr_name);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadConst, hello);
    b.emit(Op::Call, pack_call(1, 0));
    b.emit(Op::Return, NO_ARG);
    let result = exec(&mut vm, b.build()).unwrap();
    let r = result.as_ref().unwrap();
    assert_eq!(vm.heap.get(r.handle).unwrap().as_str(), Some("'hi'"));
}

#[test]
fn test_builtin_str_renders_strings_raw() {
    let mut vm = Vm::new();
    let mut b = CodeUnitBuilder::new("<module>", "<test>");
    let str_name = b.add_const(Constant::Str("str".into()));
    let hello = b.add_const(Constant::Str("hi".into()));
    b.emit(Op::LoadGlobal, str_name);
    b.emit(Op::PushNull, NO_ARG);
    b.emit(Op::LoadConst, hello);
    b.emit(Op::Call, pack_call(1, 0));
    b.emit(Op::Return, NO_ARG);
    let result = exec(&mut vm, b.build()).unwrap();
    let r = result.as_ref().unwrap();
    // str strips the quotes repr adds; non-strings fall back to repr.
    assert_eq!(vm.heap.get(r.handle).unwrap().as_str(), Some("hi"));
    assert_eq!(vm.str_value(Value::Float(3.5)).unwrap(), "3.5");
}

#[test]
fn test_hash_agrees_across_equal_values() {
    let mut vm = Vm::new();
    let a = vm.new_str("key");
    let b = vm.new_str("key");
    assert_eq!(vm.hash_value(a).unwrap(), vm.hash_value(b).unwrap());
    assert_eq!(vm.hash_value(Value::Int(7)).unwrap(), 7);
    // An integral float hashes as its integer value.
    assert_eq!(
        vm.hash_value(Value::Float(7.0)).unwrap(),
        vm.hash_value(Value::Int(7)).unwrap()
    );
    assert_eq!(vm.hash_value(Value::Bool(true)).unwrap(), 1);

    let pair = vm.new_tuple(vec![Value::Int(1), a]);
    let same = vm.new_tuple(vec![Value::Int(1), b]);
    assert_eq!(vm.hash_value(pair).unwrap(), vm.hash_value(same).unwrap());
}

#[test]
fn test_unhashable_type_raises() {
    let mut vm = Vm::new();
    let list = vm.new_list(vec![Value::Int(1)]);
    let err = vm.hash_value(list).unwrap_err();
    assert_eq!(exc_message(&err), "TypeError: unhashable type: 'list'");
}

#[test]
fn test_type_getattr_hook_intercepts_lookup() {
    let mut vm = Vm::new();
    let tid = vm.types.register(
        "Celsius",
        None,
        TypeOps {
            getattr: Some(|vm, obj, name| {
                if &*name.as_str() == "fahrenheit" {
                    let c = vm
                        .getattr(obj, Name::intern("degrees"))?
                        .as_int()
                        .unwrap_or(0);
                    return Ok(Some(Value::Int(c * 9 / 5 + 32)));
                }
                Ok(None)
            }),
            ..TypeOps::default()
        },
    );
    let reading = vm.new_instance(tid);
    vm.setattr(reading, Name::intern("degrees"), Value::Int(100))
        .unwrap();
    assert_eq!(
        vm.getattr(reading, Name::intern("fahrenheit")).unwrap(),
        Value::Int(212)
    );
    // Names the hook declines resolve through instance storage.
    assert_eq!(
        vm.getattr(reading, Name::intern("degrees")).unwrap(),
        Value::Int(100)
    );
}

#[test]
fn test_type_setattr_hook_guards_stores() {
    let mut vm = Vm::new();
    let tid = vm.types.register(
        "Config",
        None,
        TypeOps {
            setattr: Some(|_vm, _obj, name, _value| {
                if &*name.as_str() == "frozen" {
                    return Err(VmError::exception(
                        "AttributeError",
                        "attribute 'frozen' is read-only",
                    ));
                }
                Ok(false)
            }),
            ..TypeOps::default()
        },
    );
    let cfg = vm.new_instance(tid);
    let err = vm
        .setattr(cfg, Name::intern("frozen"), Value::Int(1))
        .unwrap_err();
    assert_eq!(
        exc_message(&err),
        "AttributeError: attribute 'frozen' is read-only"
    );
    // Declined stores land in the instance's own storage.
    vm.setattr(cfg, Name::intern("retries"), Value::Int(3))
        .unwrap();
    assert_eq!(
        vm.getattr(cfg, Name::intern("retries")).unwrap(),
        Value::Int(3)
    );
}

#[test]
fn test_generator_resume_honors_call_depth_limit() {
    let mut vm = Vm::new();
    let module = vm.new_module("m");

    let mut gb = CodeUnitBuilder::new("counter", "<test>");
    gb.emit(Op::LoadSmallInt, 1);
    gb.emit(Op::Yield, NO_ARG);
    gb.emit(Op::Pop, NO_ARG);
    gb.emit(Op::LoadNone, NO_ARG);
    gb.emit(Op::Return, NO_ARG);
    let decl = FuncDecl::new("counter", gb.build(), vec![]).generator();

    let f = vm.new_function(Arc::new(decl), module);
    let generator = vm.call_function(f, Value::Null, &[], &[]).unwrap();
    let r = generator.as_ref().expect("generator is heap-backed");

    vm.set_max_call_depth(0);
    let err = vm.resume_generator(r, Value::None).unwrap_err();
    assert!(matches!(err, VmError::RecursionLimit));

    // The refused resume re-parks the frame; lifting the limit resumes.
    vm.set_max_call_depth(50);
    let step = vm.resume_generator(r, Value::None).unwrap();
    assert_eq!(step, ResumeResult::Yielded(Value::Int(1)));
}

#[test]
fn test_type_objects_survive_collection_unrooted() {
    let mut vm = Vm::new();
    let type_obj = vm.new_type_object(TypeId::OBJECT);
    let r = type_obj.as_ref().unwrap();
    // Nothing roots the value; permanence comes from the exempt set.
    vm.collect_garbage();
    assert!(vm.heap.contains(r.handle));
}
