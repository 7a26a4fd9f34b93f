//! The virtual machine.
//!
//! [`Vm`] owns the heap, the type table, the shared operand stack, and the
//! frame pool, and executes code units through a single dispatch loop.
//! Calls into guest functions nest through [`Vm::run_frame`]; the Rust
//! call depth therefore tracks the guest call depth, and both are bounded
//! by `max_call_depth` well below the native stack.
//!
//! Exception handling rides on `Result`: a raising instruction returns
//! `Err(VmError::Exception(..))`, each frame's loop offers it to the
//! frame's active try blocks, and an unhandled exception propagates to the
//! caller through `?` after recording a traceback entry and releasing the
//! frame's stack region.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pyrite_vm_bytecode::{BlockKind, CodeUnit, Constant, Instr, Op};
use pyrite_vm_gc::{Handle, Heap, HeapStats, SlabPool};

use crate::attrs::NameDict;
use crate::builtins;
use crate::error::{PyException, TraceEntry, VmError, VmResult};
use crate::frame::{Frame, UnwindTarget};
use crate::intern::Name;
use crate::object::{ExcData, FunctionObj, HeapObject, ObjPayload};
use crate::stack::ValueStack;
use crate::types::{BinaryHook, TypeId, TypeOps, TypeTable, UnaryHook};
use crate::value::Value;

/// Maximum number of nested guest calls.
pub const MAX_CALL_DEPTH: usize = 1000;

/// Fallback consulted when an import names an unregistered module. The
/// hook may compile and run the module body (registering it as a side
/// effect) and returns the module value, or `None` to report the usual
/// import error. Shared so that a module body run by the hook can
/// itself import.
pub type ImportHook = Arc<dyn Fn(&mut Vm, &str) -> VmResult<Option<Value>>>;

/// What one instruction asked the frame loop to do next.
pub(crate) enum Dispatch {
    Continue,
    Jump(usize),
    Return(Value),
    Yield(Value),
}

/// How a frame finished executing.
pub(crate) enum FrameOutcome {
    Returned(Value),
    Yielded(Value),
}

pub struct Vm {
    pub heap: Heap<HeapObject>,
    pub types: TypeTable,
    pub(crate) stack: ValueStack,
    pub(crate) frames: SlabPool<Frame>,
    pub(crate) call_stack: Vec<u32>,
    /// Registered modules by name; append-only.
    modules: NameDict,
    /// Fallback namespace for global lookups.
    builtins_module: Value,
    /// The exception object currently bound inside a handler.
    cur_exception: Option<Value>,
    /// Set by a bare `raise`; the next unwind skips the duplicate
    /// traceback entry for the re-raising frame.
    reraising: bool,
    import_hook: Option<ImportHook>,
    interrupt: Arc<AtomicBool>,
    pub(crate) max_call_depth: usize,
}

impl Vm {
    pub fn new() -> Vm {
        let mut types = TypeTable::new();
        builtins::register_default_types(&mut types);
        let mut vm = Vm {
            heap: Heap::new(),
            types,
            stack: ValueStack::new(),
            frames: SlabPool::with_capacity(16),
            call_stack: Vec::new(),
            modules: NameDict::new(),
            builtins_module: Value::None,
            cur_exception: None,
            reraising: false,
            import_hook: None,
            interrupt: Arc::new(AtomicBool::new(false)),
            max_call_depth: MAX_CALL_DEPTH,
        };
        let builtins_module = vm.new_module("builtins");
        vm.builtins_module = builtins_module;
        vm.register_module("builtins", builtins_module);
        builtins::install_builtins(&mut vm);
        vm
    }

    pub fn with_stack_limit(limit: usize) -> Vm {
        let mut vm = Vm::new();
        vm.stack = ValueStack::with_limit(limit);
        vm
    }

    pub fn set_max_call_depth(&mut self, depth: usize) {
        self.max_call_depth = depth;
    }

    /// Shared flag checked at every dispatch step; setting it makes the
    /// VM unwind with [`VmError::Interrupted`] at the next safepoint.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::Relaxed);
    }

    // ---- allocation helpers -------------------------------------------

    /// Moves `obj` onto the heap and returns a reference value for it.
    pub fn alloc(&mut self, obj: HeapObject) -> Value {
        let type_id = obj.type_id;
        let handle = self.heap.alloc(obj);
        Value::obj(handle, type_id)
    }

    pub fn new_str(&mut self, s: impl Into<String>) -> Value {
        self.alloc(HeapObject::new(TypeId::STR, ObjPayload::Str(s.into())))
    }

    pub fn new_list(&mut self, items: Vec<Value>) -> Value {
        self.alloc(HeapObject::new(TypeId::LIST, ObjPayload::List(items)))
    }

    pub fn new_tuple(&mut self, items: Vec<Value>) -> Value {
        self.alloc(HeapObject::new(
            TypeId::TUPLE,
            ObjPayload::Tuple(items.into_boxed_slice()),
        ))
    }

    pub fn new_dict(&mut self, pairs: Vec<(Value, Value)>) -> Value {
        self.alloc(HeapObject::new(TypeId::DICT, ObjPayload::Dict(pairs)))
    }

    pub fn new_range(&mut self, start: i64, stop: i64, step: i64) -> Value {
        self.alloc(HeapObject::new(
            TypeId::RANGE,
            ObjPayload::Range { start, stop, step },
        ))
    }

    pub fn new_instance(&mut self, type_id: TypeId) -> Value {
        self.alloc(HeapObject::new(type_id, ObjPayload::Instance))
    }

    /// Creates the guest-callable object standing for a registered type.
    /// Type objects live for the life of the VM: they join the heap's
    /// exempt generation and are never swept, so hosts may hold the
    /// returned value without rooting it.
    pub fn new_type_object(&mut self, type_id: TypeId) -> Value {
        let v = self.alloc(HeapObject::new(TypeId::TYPE, ObjPayload::Type(type_id)));
        if let Some(r) = v.as_ref() {
            self.heap.mark_exempt(r.handle);
        }
        v
    }

    pub fn new_function(&mut self, decl: Arc<pyrite_vm_bytecode::FuncDecl>, module: Value) -> Value {
        self.alloc(HeapObject::new(
            TypeId::FUNCTION,
            ObjPayload::Function(FunctionObj { decl, module }),
        ))
    }

    /// Creates an exception object that `raise` will accept.
    pub fn new_exception(&mut self, type_name: &str, message: &str) -> Value {
        self.alloc(HeapObject::new(
            TypeId::EXCEPTION,
            ObjPayload::Exception(Box::new(ExcData {
                type_name: type_name.to_string(),
                message: message.to_string(),
                trace: Vec::new(),
            })),
        ))
    }

    /// Creates a module object. Modules are permanent: the object is
    /// exempt from collection, though its namespace contents remain
    /// ordinary collectible values reached through the registry roots.
    pub fn new_module(&mut self, name: &str) -> Value {
        let v = self.alloc(HeapObject::new(
            TypeId::MODULE,
            ObjPayload::Module(Name::intern(name)),
        ));
        if let Some(r) = v.as_ref() {
            self.heap.mark_exempt(r.handle);
        }
        v
    }

    // ---- module registry ----------------------------------------------

    /// Registers `module` under `name`. The registry is append-only;
    /// registering the same name twice is an unrecoverable setup bug.
    pub fn register_module(&mut self, name: &str, module: Value) {
        let key = Name::intern(name);
        if self.modules.contains(key) {
            panic!("module '{name}' registered twice");
        }
        self.modules.insert(key, module);
    }

    pub fn lookup_module(&self, name: &str) -> Option<Value> {
        self.modules.get(Name::intern(name))
    }

    pub fn builtins_module(&self) -> Value {
        self.builtins_module
    }

    /// Binds `name` in a module's namespace.
    pub fn set_module_attr(&mut self, module: Value, name: &str, value: Value) {
        let key = Name::intern(name);
        if let Some(r) = module.as_ref() {
            if let Some(obj) = self.heap.get_mut(r.handle) {
                obj.set_attr(key, value);
            }
        }
    }

    pub fn module_attr(&self, module: Value, name: &str) -> Option<Value> {
        let r = module.as_ref()?;
        self.heap.get(r.handle)?.attr(Name::intern(name))
    }

    // ---- execution entry points ---------------------------------------

    /// Runs `unit` as the body of `module`. On an uncaught exception or
    /// an engine fault the VM is left reset and the error is returned.
    pub fn exec(&mut self, unit: Arc<CodeUnit>, module: Value) -> VmResult<Value> {
        debug_assert!(self.call_stack.is_empty());
        match self.exec_nested(unit, module) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    /// Runs `unit` inside the current execution, leaving outer frames
    /// intact. Used by import hooks to execute a module body mid-run;
    /// errors propagate without resetting the VM.
    pub fn exec_nested(&mut self, unit: Arc<CodeUnit>, module: Value) -> VmResult<Value> {
        self.push_frame(unit, None, module, Vec::new())?;
        match self.run_frame()? {
            FrameOutcome::Returned(v) => Ok(v),
            FrameOutcome::Yielded(_) => {
                self.pop_frame();
                Err(VmError::Internal("yield outside a generator frame".into()))
            }
        }
    }

    /// Installs the fallback consulted when an import names a module the
    /// registry does not know.
    pub fn set_import_hook(&mut self, hook: ImportHook) {
        self.import_hook = Some(hook);
    }

    /// Drops all execution state. Called after a fatal error escapes.
    pub fn reset(&mut self) {
        while let Some(idx) = self.call_stack.pop() {
            self.frames.dealloc(idx);
        }
        self.stack.clear();
        self.cur_exception = None;
        self.reraising = false;
        self.clear_interrupt();
    }

    /// Current operand depth; exposed for stack-balance assertions.
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn call_depth(&self) -> usize {
        self.call_stack.len()
    }

    // ---- frame management ---------------------------------------------

    pub(crate) fn push_frame(
        &mut self,
        code: Arc<CodeUnit>,
        callable: Option<Value>,
        module: Value,
        locals: Vec<Value>,
    ) -> VmResult<()> {
        if self.call_stack.len() >= self.max_call_depth {
            return Err(VmError::RecursionLimit);
        }
        let base = self.stack.len();
        let count = code.local_count();
        for i in 0..count {
            let v = locals.get(i).copied().unwrap_or(Value::None);
            self.stack.push(v)?;
        }
        let idx = self.frames.alloc(Frame::new(code, callable, module, base));
        self.call_stack.push(idx);
        Ok(())
    }

    /// Pops the top frame and releases its stack region.
    pub(crate) fn pop_frame(&mut self) -> Frame {
        let idx = self.call_stack.pop().expect("no frame to pop");
        let frame = self.frames.dealloc(idx);
        self.stack.truncate(frame.base);
        frame
    }

    #[inline]
    pub(crate) fn cur_frame(&self) -> &Frame {
        let idx = *self.call_stack.last().expect("no active frame");
        self.frames.get(idx).expect("frame slot vacated")
    }

    #[inline]
    pub(crate) fn cur_frame_mut(&mut self) -> &mut Frame {
        let idx = *self.call_stack.last().expect("no active frame");
        self.frames.get_mut(idx).expect("frame slot vacated")
    }

    // ---- the dispatch loop --------------------------------------------

    /// Executes the top frame until it returns or yields. Exceptions
    /// raised inside are offered to the frame's try blocks; an unhandled
    /// one pops the frame and propagates.
    pub(crate) fn run_frame(&mut self) -> VmResult<FrameOutcome> {
        loop {
            self.safepoint()?;
            let instr = {
                let frame = self.cur_frame_mut();
                if frame.ip >= frame.code.instrs.len() {
                    // Falling off the end returns None.
                    self.pop_frame();
                    return Ok(FrameOutcome::Returned(Value::None));
                }
                let instr = frame.code.instrs[frame.ip];
                frame.ip += 1;
                instr
            };
            match self.step(instr) {
                Ok(Dispatch::Continue) => {}
                Ok(Dispatch::Jump(target)) => self.cur_frame_mut().ip = target,
                Ok(Dispatch::Return(v)) => {
                    self.pop_frame();
                    return Ok(FrameOutcome::Returned(v));
                }
                Ok(Dispatch::Yield(v)) => return Ok(FrameOutcome::Yielded(v)),
                Err(e) => self.handle_error(e)?,
            }
        }
    }

    fn safepoint(&mut self) -> VmResult<()> {
        if self.interrupt.load(Ordering::Relaxed) {
            return Err(VmError::Interrupted);
        }
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        Ok(())
    }

    /// Offers an in-flight error to the current frame. Returns `Ok(())`
    /// with the instruction pointer moved to a handler, or propagates
    /// after popping the frame.
    fn handle_error(&mut self, err: VmError) -> VmResult<()> {
        let mut exc = match err {
            VmError::Exception(e) => e,
            fatal => {
                self.pop_frame();
                return Err(fatal);
            }
        };
        // A bare re-raise unwinds out of a frame the trace already
        // records; pushing again would list the handler frame twice.
        if !std::mem::take(&mut self.reraising) {
            let frame = self.cur_frame();
            exc.trace.push(TraceEntry {
                source: frame.code.source.clone(),
                func: frame.func_name(),
                line: frame.current_line(),
            });
        }
        loop {
            let (target, block) = {
                let frame = self.cur_frame_mut();
                match frame.unwind.pop() {
                    None => break,
                    Some(t) => {
                        let block = *frame
                            .code
                            .block(t.block)
                            .expect("unwind target names a missing block");
                        (t, block)
                    }
                }
            };
            let restore = self.cur_frame().operand_base() + target.depth;
            self.stack.truncate(restore);
            if block.kind == BlockKind::TryExcept {
                let exc_val = self.exception_to_value(&exc);
                self.stack.push(exc_val)?;
                self.cur_exception = Some(exc_val);
                self.cur_frame_mut().ip = block.handler as usize;
                return Ok(());
            }
            // Loop and with blocks just release their stack state while
            // an exception passes through.
        }
        self.pop_frame();
        Err(VmError::Exception(exc))
    }

    fn step(&mut self, instr: Instr) -> VmResult<Dispatch> {
        match instr.op {
            Op::Nop => Ok(Dispatch::Continue),

            Op::LoadConst => {
                let c = self.cur_frame().code.consts[instr.arg as usize].clone();
                let v = self.const_value(&c);
                self.stack.push(v)?;
                Ok(Dispatch::Continue)
            }
            Op::LoadNone => {
                self.stack.push(Value::None)?;
                Ok(Dispatch::Continue)
            }
            Op::LoadTrue => {
                self.stack.push(Value::Bool(true))?;
                Ok(Dispatch::Continue)
            }
            Op::LoadFalse => {
                self.stack.push(Value::Bool(false))?;
                Ok(Dispatch::Continue)
            }
            Op::LoadSmallInt => {
                self.stack.push(Value::Int(instr.arg_i16() as i64))?;
                Ok(Dispatch::Continue)
            }
            Op::PushNull => {
                self.stack.push(Value::Null)?;
                Ok(Dispatch::Continue)
            }
            Op::Dup => {
                let v = self.stack.peek();
                self.stack.push(v)?;
                Ok(Dispatch::Continue)
            }
            Op::Pop => {
                self.stack.pop();
                Ok(Dispatch::Continue)
            }

            Op::LoadLocal => {
                let slot = self.cur_frame().local_slot(instr.arg as usize);
                let v = self.stack.get(slot);
                self.stack.push(v)?;
                Ok(Dispatch::Continue)
            }
            Op::StoreLocal => {
                let v = self.stack.pop();
                let slot = self.cur_frame().local_slot(instr.arg as usize);
                self.stack.set(slot, v);
                Ok(Dispatch::Continue)
            }
            Op::LoadGlobal => {
                let name = self.const_name(instr.arg)?;
                let module = self.cur_frame().module;
                let v = self
                    .module_value_attr(module, name)
                    .or_else(|| self.module_value_attr(self.builtins_module, name));
                match v {
                    Some(v) => {
                        self.stack.push(v)?;
                        Ok(Dispatch::Continue)
                    }
                    None => Err(VmError::name_error(format!(
                        "name '{name}' is not defined"
                    ))),
                }
            }
            Op::StoreGlobal => {
                let name = self.const_name(instr.arg)?;
                let v = self.stack.pop();
                let module = self.cur_frame().module;
                let r = module
                    .as_ref()
                    .ok_or_else(|| VmError::Internal("frame module is not an object".into()))?;
                self.heap
                    .get_mut(r.handle)
                    .ok_or_else(|| VmError::Internal("frame module vanished".into()))?
                    .set_attr(name, v);
                Ok(Dispatch::Continue)
            }

            Op::LoadAttr => {
                let obj = self.stack.pop();
                let name = self.const_name(instr.arg)?;
                let v = self.getattr(obj, name)?;
                self.stack.push(v)?;
                Ok(Dispatch::Continue)
            }
            Op::StoreAttr => {
                let value = self.stack.pop();
                let obj = self.stack.pop();
                let name = self.const_name(instr.arg)?;
                self.setattr(obj, name, value)?;
                Ok(Dispatch::Continue)
            }
            Op::LoadMethod => {
                let obj = self.stack.pop();
                let name = self.const_name(instr.arg)?;
                let (callee, receiver) = self.load_method(obj, name)?;
                self.stack.push(callee)?;
                self.stack.push(receiver)?;
                Ok(Dispatch::Continue)
            }

            Op::LoadItem => {
                let index = self.stack.pop();
                let obj = self.stack.pop();
                let hook = self
                    .resolve_binary(obj.type_id(), |ops| ops.getitem)
                    .ok_or_else(|| {
                        VmError::type_error(format!(
                            "'{}' object is not subscriptable",
                            self.type_name(obj)
                        ))
                    })?;
                let v = hook(self, obj, index)?;
                self.stack.push(v)?;
                Ok(Dispatch::Continue)
            }
            Op::StoreItem => {
                let index = self.stack.pop();
                let obj = self.stack.pop();
                let value = self.stack.pop();
                let hook = self
                    .resolve_ternary(obj.type_id(), |ops| ops.setitem)
                    .ok_or_else(|| {
                        VmError::type_error(format!(
                            "'{}' object does not support item assignment",
                            self.type_name(obj)
                        ))
                    })?;
                hook(self, obj, index, value)?;
                Ok(Dispatch::Continue)
            }

            Op::BuildList => {
                let n = instr.arg as usize;
                let items = self.stack.drain_from(self.stack.len() - n);
                let v = self.new_list(items);
                self.stack.push(v)?;
                Ok(Dispatch::Continue)
            }
            Op::BuildTuple => {
                let n = instr.arg as usize;
                let items = self.stack.drain_from(self.stack.len() - n);
                let v = self.new_tuple(items);
                self.stack.push(v)?;
                Ok(Dispatch::Continue)
            }
            Op::BuildDict => {
                let n = instr.arg as usize;
                let flat = self.stack.drain_from(self.stack.len() - 2 * n);
                let mut pairs = Vec::with_capacity(n);
                let mut it = flat.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    pairs.push((k, v));
                }
                let v = self.new_dict(pairs);
                self.stack.push(v)?;
                Ok(Dispatch::Continue)
            }

            Op::Add => self.binary_op(|ops| ops.add, "+"),
            Op::Sub => self.binary_op(|ops| ops.sub, "-"),
            Op::Mul => self.binary_op(|ops| ops.mul, "*"),
            Op::Div => self.binary_op(|ops| ops.div, "/"),
            Op::FloorDiv => self.binary_op(|ops| ops.floordiv, "//"),
            Op::Mod => self.binary_op(|ops| ops.rem, "%"),
            Op::Neg => {
                let v = self.stack.pop();
                let hook = self
                    .resolve_unary(v.type_id(), |ops| ops.neg)
                    .ok_or_else(|| {
                        VmError::type_error(format!(
                            "bad operand type for unary -: '{}'",
                            self.type_name(v)
                        ))
                    })?;
                let r = hook(self, v)?;
                self.stack.push(r)?;
                Ok(Dispatch::Continue)
            }
            Op::Not => {
                let v = self.stack.pop();
                let b = self.truthy(v)?;
                self.stack.push(Value::Bool(!b))?;
                Ok(Dispatch::Continue)
            }

            Op::Eq => {
                let r = self.stack.pop();
                let l = self.stack.pop();
                let b = self.values_equal(l, r)?;
                self.stack.push(Value::Bool(b))?;
                Ok(Dispatch::Continue)
            }
            Op::Ne => {
                let r = self.stack.pop();
                let l = self.stack.pop();
                let b = self.values_equal(l, r)?;
                self.stack.push(Value::Bool(!b))?;
                Ok(Dispatch::Continue)
            }
            Op::Lt => self.compare(|vm, l, r| vm.value_lt(l, r)),
            Op::Le => self.compare(|vm, l, r| Ok(vm.value_lt(l, r)? || vm.values_equal(l, r)?)),
            Op::Gt => self.compare(|vm, l, r| vm.value_lt(r, l)),
            Op::Ge => self.compare(|vm, l, r| Ok(vm.value_lt(r, l)? || vm.values_equal(l, r)?)),
            Op::Is => {
                let r = self.stack.pop();
                let l = self.stack.pop();
                self.stack.push(Value::Bool(l == r))?;
                Ok(Dispatch::Continue)
            }

            Op::Jump => Ok(Dispatch::Jump(instr.arg as usize)),
            Op::PopJumpIfFalse => {
                let v = self.stack.pop();
                if !self.truthy(v)? {
                    Ok(Dispatch::Jump(instr.arg as usize))
                } else {
                    Ok(Dispatch::Continue)
                }
            }
            Op::PopJumpIfTrue => {
                let v = self.stack.pop();
                if self.truthy(v)? {
                    Ok(Dispatch::Jump(instr.arg as usize))
                } else {
                    Ok(Dispatch::Continue)
                }
            }

            Op::Call | Op::CallMethod => {
                self.vectorcall(instr.argc(), instr.kwargc())?;
                Ok(Dispatch::Continue)
            }
            Op::MakeFunction => {
                let (decl, module) = {
                    let frame = self.cur_frame();
                    let decl = frame.code.funcs[instr.arg as usize].clone();
                    (Arc::new(decl), frame.module)
                };
                let v = self.new_function(decl, module);
                self.stack.push(v)?;
                Ok(Dispatch::Continue)
            }

            Op::GetIter => {
                let v = self.stack.pop();
                let hook = self
                    .resolve_unary(v.type_id(), |ops| ops.iter)
                    .ok_or_else(|| {
                        VmError::type_error(format!(
                            "'{}' object is not iterable",
                            self.type_name(v)
                        ))
                    })?;
                let it = hook(self, v)?;
                self.stack.push(it)?;
                Ok(Dispatch::Continue)
            }
            Op::ForIter => {
                let iterator = self.stack.peek();
                let hook = self
                    .resolve_unary(iterator.type_id(), |ops| ops.next)
                    .ok_or_else(|| {
                        VmError::type_error(format!(
                            "'{}' object is not an iterator",
                            self.type_name(iterator)
                        ))
                    })?;
                match hook(self, iterator) {
                    Ok(v) => {
                        self.stack.push(v)?;
                        Ok(Dispatch::Continue)
                    }
                    Err(e) if e.is_stop_iteration() => {
                        self.stack.pop();
                        self.cur_frame_mut()
                            .unwind
                            .pop()
                            .expect("loop without an unwind target");
                        Ok(Dispatch::Jump(instr.arg as usize))
                    }
                    Err(e) => Err(e),
                }
            }
            Op::PushLoop => {
                let depth = self.operand_depth() - 1;
                self.cur_frame_mut().unwind.push(UnwindTarget {
                    block: instr.arg,
                    depth,
                });
                Ok(Dispatch::Continue)
            }
            Op::Break => self.break_to(instr.arg),
            Op::Continue => self.continue_to(instr.arg),

            Op::EnterTry => {
                let depth = self.operand_depth();
                self.cur_frame_mut().unwind.push(UnwindTarget {
                    block: instr.arg,
                    depth,
                });
                Ok(Dispatch::Continue)
            }
            Op::ExitTry => {
                self.cur_frame_mut()
                    .unwind
                    .pop()
                    .expect("try exit without an unwind target");
                Ok(Dispatch::Continue)
            }
            Op::PopException => {
                self.cur_exception = None;
                Ok(Dispatch::Continue)
            }
            Op::Raise => {
                let v = self.stack.pop();
                self.raise_value(v)
            }
            Op::Reraise => match self.cur_exception {
                Some(v) => {
                    self.reraising = true;
                    self.raise_value(v)
                }
                None => Err(VmError::exception(
                    "RuntimeError",
                    "No active exception to reraise",
                )),
            },

            Op::EnterWith => {
                let depth = self.operand_depth() - 1;
                self.cur_frame_mut().unwind.push(UnwindTarget {
                    block: instr.arg,
                    depth,
                });
                Ok(Dispatch::Continue)
            }
            Op::ExitWith => {
                self.cur_frame_mut()
                    .unwind
                    .pop()
                    .expect("with exit without an unwind target");
                let resource = self.stack.pop();
                self.call_exit_hook(resource)?;
                Ok(Dispatch::Continue)
            }

            Op::Return => Ok(Dispatch::Return(self.stack.pop())),
            Op::Yield => Ok(Dispatch::Yield(self.stack.pop())),

            Op::ImportName => {
                let name = self.const_name(instr.arg)?;
                let module = match self.modules.get(name) {
                    Some(module) => Some(module),
                    None => self.run_import_hook(name)?,
                };
                match module {
                    Some(module) => {
                        self.stack.push(module)?;
                        Ok(Dispatch::Continue)
                    }
                    None => Err(VmError::import_error(format!(
                        "No module named '{name}'"
                    ))),
                }
            }
        }
    }

    fn run_import_hook(&mut self, name: Name) -> VmResult<Option<Value>> {
        let Some(hook) = self.import_hook.clone() else {
            return Ok(None);
        };
        hook(self, &name.as_str())
    }

    // ---- structured control flow --------------------------------------

    /// Operand depth of the current frame, relative to its operand base.
    fn operand_depth(&self) -> usize {
        self.stack.len() - self.cur_frame().operand_base()
    }

    /// Leaves every block up to and including loop `block_idx`, running
    /// each one's exit semantics, then jumps past the loop.
    fn break_to(&mut self, block_idx: u16) -> VmResult<Dispatch> {
        loop {
            let (target, block) = self.pop_unwind_target()?;
            let restore = self.cur_frame().operand_base() + target.depth;
            if block.kind == BlockKind::With {
                let resource = self.stack.get(restore);
                self.stack.truncate(restore);
                self.call_exit_hook(resource)?;
            } else {
                self.stack.truncate(restore);
            }
            if target.block == block_idx {
                return Ok(Dispatch::Jump(block.end as usize));
            }
        }
    }

    /// Leaves every block inside loop `block_idx`, keeps the loop's own
    /// target and iterator, and jumps back to the loop head.
    fn continue_to(&mut self, block_idx: u16) -> VmResult<Dispatch> {
        loop {
            let top = *self
                .cur_frame()
                .unwind
                .last()
                .ok_or_else(|| VmError::Internal("continue outside a loop".into()))?;
            if top.block == block_idx {
                let block = *self
                    .cur_frame()
                    .code
                    .block(block_idx)
                    .expect("continue names a missing block");
                // Keep the iterator, which sits just above the recorded depth.
                let restore = self.cur_frame().operand_base() + top.depth + 1;
                self.stack.truncate(restore);
                return Ok(Dispatch::Jump(block.start as usize));
            }
            let (target, block) = self.pop_unwind_target()?;
            let restore = self.cur_frame().operand_base() + target.depth;
            if block.kind == BlockKind::With {
                let resource = self.stack.get(restore);
                self.stack.truncate(restore);
                self.call_exit_hook(resource)?;
            } else {
                self.stack.truncate(restore);
            }
        }
    }

    fn pop_unwind_target(&mut self) -> VmResult<(UnwindTarget, pyrite_vm_bytecode::Block)> {
        let frame = self.cur_frame_mut();
        let target = frame
            .unwind
            .pop()
            .ok_or_else(|| VmError::Internal("unwind past the frame's block stack".into()))?;
        let block = *frame
            .code
            .block(target.block)
            .expect("unwind target names a missing block");
        Ok((target, block))
    }

    /// Looks up and invokes a resource's exit hook, tolerating resources
    /// that do not define one.
    fn call_exit_hook(&mut self, resource: Value) -> VmResult<()> {
        let name = Name::intern("__exit__");
        match self.getattr(resource, name) {
            Ok(hook) => {
                self.call_function(hook, Value::Null, &[], &[])?;
                Ok(())
            }
            Err(e) if matches!(&e, VmError::Exception(exc) if exc.type_name == "AttributeError") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // ---- raising -------------------------------------------------------

    fn raise_value(&mut self, v: Value) -> VmResult<Dispatch> {
        match self.value_to_exception(v) {
            Some(exc) => Err(VmError::Exception(Box::new(exc))),
            None => Err(VmError::type_error(
                "exceptions must derive from BaseException",
            )),
        }
    }

    pub(crate) fn exception_to_value(&mut self, exc: &PyException) -> Value {
        self.alloc(HeapObject::new(
            TypeId::EXCEPTION,
            ObjPayload::Exception(Box::new(ExcData {
                type_name: exc.type_name.clone(),
                message: exc.message.clone(),
                trace: exc.trace.clone(),
            })),
        ))
    }

    pub(crate) fn value_to_exception(&self, v: Value) -> Option<PyException> {
        let r = v.as_ref()?;
        let obj = self.heap.get(r.handle)?;
        match &obj.payload {
            ObjPayload::Exception(data) => Some(PyException {
                type_name: data.type_name.clone(),
                message: data.message.clone(),
                trace: data.trace.clone(),
            }),
            _ => None,
        }
    }

    // ---- operators ------------------------------------------------------

    fn binary_op(
        &mut self,
        pick: fn(&TypeOps) -> Option<BinaryHook>,
        symbol: &str,
    ) -> VmResult<Dispatch> {
        let r = self.stack.pop();
        let l = self.stack.pop();
        let hook = self.resolve_binary(l.type_id(), pick).ok_or_else(|| {
            VmError::type_error(format!(
                "unsupported operand type(s) for {symbol}: '{}' and '{}'",
                self.type_name(l),
                self.type_name(r)
            ))
        })?;
        let v = hook(self, l, r)?;
        self.stack.push(v)?;
        Ok(Dispatch::Continue)
    }

    fn compare(
        &mut self,
        cmp: fn(&mut Vm, Value, Value) -> VmResult<bool>,
    ) -> VmResult<Dispatch> {
        let r = self.stack.pop();
        let l = self.stack.pop();
        let b = cmp(self, l, r)?;
        self.stack.push(Value::Bool(b))?;
        Ok(Dispatch::Continue)
    }

    pub(crate) fn resolve_unary(
        &self,
        tid: TypeId,
        pick: fn(&TypeOps) -> Option<UnaryHook>,
    ) -> Option<UnaryHook> {
        let mut cur = Some(tid);
        while let Some(t) = cur {
            let desc = self.types.get(t);
            if let Some(hook) = pick(&desc.ops) {
                return Some(hook);
            }
            cur = desc.base;
        }
        None
    }

    pub(crate) fn resolve_binary(
        &self,
        tid: TypeId,
        pick: fn(&TypeOps) -> Option<BinaryHook>,
    ) -> Option<BinaryHook> {
        let mut cur = Some(tid);
        while let Some(t) = cur {
            let desc = self.types.get(t);
            if let Some(hook) = pick(&desc.ops) {
                return Some(hook);
            }
            cur = desc.base;
        }
        None
    }

    fn resolve_ternary(
        &self,
        tid: TypeId,
        pick: fn(&TypeOps) -> Option<crate::types::TernaryHook>,
    ) -> Option<crate::types::TernaryHook> {
        let mut cur = Some(tid);
        while let Some(t) = cur {
            let desc = self.types.get(t);
            if let Some(hook) = pick(&desc.ops) {
                return Some(hook);
            }
            cur = desc.base;
        }
        None
    }

    fn resolve_attr_get(&self, tid: TypeId) -> Option<crate::types::AttrGetHook> {
        let mut cur = Some(tid);
        while let Some(t) = cur {
            let desc = self.types.get(t);
            if let Some(hook) = desc.ops.getattr {
                return Some(hook);
            }
            cur = desc.base;
        }
        None
    }

    fn resolve_attr_set(&self, tid: TypeId) -> Option<crate::types::AttrSetHook> {
        let mut cur = Some(tid);
        while let Some(t) = cur {
            let desc = self.types.get(t);
            if let Some(hook) = desc.ops.setattr {
                return Some(hook);
            }
            cur = desc.base;
        }
        None
    }

    /// Guest-level equality: numeric kinds compare by value across int
    /// and float, everything else goes through the type's hook, falling
    /// back to identity.
    pub fn values_equal(&mut self, l: Value, r: Value) -> VmResult<bool> {
        if let (Some(a), Some(b)) = (l.as_float(), r.as_float()) {
            if matches!(l, Value::Int(_) | Value::Float(_))
                && matches!(r, Value::Int(_) | Value::Float(_))
            {
                return Ok(a == b);
            }
        }
        if l == r {
            return Ok(true);
        }
        if let Some(hook) = self.resolve_binary(l.type_id(), |ops| ops.eq) {
            let v = hook(self, l, r)?;
            return self.truthy(v);
        }
        Ok(false)
    }

    pub fn value_lt(&mut self, l: Value, r: Value) -> VmResult<bool> {
        let hook = self
            .resolve_binary(l.type_id(), |ops| ops.lt)
            .ok_or_else(|| {
                VmError::type_error(format!(
                    "'<' not supported between instances of '{}' and '{}'",
                    self.type_name(l),
                    self.type_name(r)
                ))
            })?;
        let v = hook(self, l, r)?;
        self.truthy(v)
    }

    pub fn truthy(&mut self, v: Value) -> VmResult<bool> {
        if let Some(b) = v.inline_truthy() {
            return Ok(b);
        }
        if v.is_null() {
            return Err(VmError::Internal("truth test on the null marker".into()));
        }
        let mut cur = Some(v.type_id());
        while let Some(t) = cur {
            let desc = self.types.get(t);
            if let Some(len_hook) = desc.ops.len {
                return Ok(len_hook(self, v)? > 0);
            }
            cur = desc.base;
        }
        Ok(true)
    }

    pub fn value_len(&mut self, v: Value) -> VmResult<usize> {
        let mut cur = Some(v.type_id());
        while let Some(t) = cur {
            let desc = self.types.get(t);
            if let Some(hook) = desc.ops.len {
                return hook(self, v);
            }
            cur = desc.base;
        }
        Err(VmError::type_error(format!(
            "object of type '{}' has no len()",
            self.type_name(v)
        )))
    }

    /// Printable representation of `v`, via the type's repr hook.
    pub fn repr_value(&mut self, v: Value) -> VmResult<String> {
        let mut cur = Some(v.type_id());
        while let Some(t) = cur {
            let desc = self.types.get(t);
            if let Some(hook) = desc.ops.repr {
                return hook(self, v);
            }
            cur = desc.base;
        }
        Ok(format!("<{} object>", self.type_name(v)))
    }

    /// Display form of `v`, via the type's str hook, falling back to the
    /// repr. Strings render raw here and quoted through [`Vm::repr_value`].
    pub fn str_value(&mut self, v: Value) -> VmResult<String> {
        let mut cur = Some(v.type_id());
        while let Some(t) = cur {
            let desc = self.types.get(t);
            if let Some(hook) = desc.ops.str {
                return hook(self, v);
            }
            cur = desc.base;
        }
        self.repr_value(v)
    }

    /// Hash of `v` via the type's hash hook. A type without one is
    /// unhashable.
    pub fn hash_value(&mut self, v: Value) -> VmResult<i64> {
        let mut cur = Some(v.type_id());
        while let Some(t) = cur {
            let desc = self.types.get(t);
            if let Some(hook) = desc.ops.hash {
                return hook(self, v);
            }
            cur = desc.base;
        }
        Err(VmError::type_error(format!(
            "unhashable type: '{}'",
            self.type_name(v)
        )))
    }

    pub fn type_name(&self, v: Value) -> String {
        self.types.name_of(v.type_id()).to_string()
    }

    // ---- attribute resolution ------------------------------------------

    /// Full attribute lookup: data descriptors on the type chain win,
    /// then the instance's own storage, then remaining type-chain entries
    /// (functions bind to the receiver).
    pub fn getattr(&mut self, obj: Value, name: Name) -> VmResult<Value> {
        let tid = obj.type_id();

        // A getattr hook on the type chain sees the lookup first; a
        // declined lookup continues through the default resolution.
        if let Some(hook) = self.resolve_attr_get(tid) {
            if let Some(v) = hook(self, obj, name)? {
                return Ok(v);
            }
        }

        // Type and module objects are pure namespaces.
        if let Some(r) = obj.as_ref() {
            let payload_kind = {
                let heap_obj = self
                    .heap
                    .get(r.handle)
                    .ok_or_else(|| VmError::Internal("attribute access on a dead object".into()))?;
                match &heap_obj.payload {
                    ObjPayload::Type(t) => Some(Ok(*t)),
                    ObjPayload::Module(m) => Some(Err(*m)),
                    _ => None,
                }
            };
            match payload_kind {
                Some(Ok(described)) => {
                    return self.types.lookup(described, name).ok_or_else(|| {
                        VmError::attribute_error(format!(
                            "type object '{}' has no attribute '{name}'",
                            self.types.name_of(described)
                        ))
                    });
                }
                Some(Err(module_name)) => {
                    let heap_obj = self.heap.get(r.handle).expect("checked above");
                    return heap_obj.attr(name).ok_or_else(|| {
                        VmError::attribute_error(format!(
                            "module '{module_name}' has no attribute '{name}'"
                        ))
                    });
                }
                None => {}
            }
        }

        let descriptor = self.types.lookup(tid, name);

        // Data descriptors take precedence over instance storage.
        if let Some(d) = descriptor {
            if let Some(getter) = self.property_getter(d) {
                return self.call_function(getter, obj, &[], &[]);
            }
        }

        if let Some(r) = obj.as_ref() {
            if let Some(v) = self.heap.get(r.handle).and_then(|o| o.attr(name)) {
                return Ok(v);
            }
        }

        if let Some(d) = descriptor {
            return Ok(match d.type_id() {
                TypeId::FUNCTION | TypeId::NATIVE_FUNC => self.alloc(HeapObject::new(
                    TypeId::BOUND_METHOD,
                    ObjPayload::BoundMethod {
                        func: d,
                        receiver: obj,
                    },
                )),
                _ => d,
            });
        }

        Err(VmError::attribute_error(format!(
            "'{}' object has no attribute '{name}'",
            self.type_name(obj)
        )))
    }

    pub fn setattr(&mut self, obj: Value, name: Name, value: Value) -> VmResult<()> {
        if let Some(hook) = self.resolve_attr_set(obj.type_id()) {
            if hook(self, obj, name, value)? {
                return Ok(());
            }
        }
        // A property setter on the type chain intercepts the store.
        if let Some(d) = self.types.lookup(obj.type_id(), name) {
            if let Some(setter) = self.property_setter(d) {
                self.call_function(setter, obj, &[value], &[])?;
                return Ok(());
            }
            if self.property_getter(d).is_some() {
                return Err(VmError::attribute_error(format!(
                    "property '{name}' of '{}' object has no setter",
                    self.type_name(obj)
                )));
            }
        }
        let Some(r) = obj.as_ref() else {
            return Err(VmError::attribute_error(format!(
                "'{}' object has no attribute '{name}'",
                self.type_name(obj)
            )));
        };
        let type_target = {
            let heap_obj = self
                .heap
                .get(r.handle)
                .ok_or_else(|| VmError::Internal("attribute store on a dead object".into()))?;
            match &heap_obj.payload {
                ObjPayload::Type(t) => Some(*t),
                _ => None,
            }
        };
        if let Some(t) = type_target {
            self.types.get_mut(t).attrs.insert(name, value);
            return Ok(());
        }
        self.heap
            .get_mut(r.handle)
            .expect("checked above")
            .set_attr(name, value);
        Ok(())
    }

    /// Method-call fast path: a plain function found on the type chain is
    /// returned unbound together with the receiver, skipping the bound
    /// method allocation. Anything else degrades to a full `getattr`.
    pub fn load_method(&mut self, obj: Value, name: Name) -> VmResult<(Value, Value)> {
        let tid = obj.type_id();
        let descriptor = self.types.lookup(tid, name);

        // Data descriptors and shadowing instance attributes disable the
        // fast path.
        let shadowed = obj
            .as_ref()
            .and_then(|r| self.heap.get(r.handle))
            .map(|o| o.attr(name).is_some())
            .unwrap_or(false);

        if !shadowed && self.resolve_attr_get(tid).is_none() {
            if let Some(d) = descriptor {
                if matches!(d.type_id(), TypeId::FUNCTION | TypeId::NATIVE_FUNC) {
                    return Ok((d, obj));
                }
            }
        }
        let resolved = self.getattr(obj, name)?;
        Ok((resolved, Value::Null))
    }

    fn property_getter(&self, d: Value) -> Option<Value> {
        let r = d.as_ref()?;
        if r.type_id != TypeId::PROPERTY {
            return None;
        }
        match &self.heap.get(r.handle)?.payload {
            ObjPayload::Property { getter, .. } => Some(*getter),
            _ => None,
        }
    }

    fn property_setter(&self, d: Value) -> Option<Value> {
        let r = d.as_ref()?;
        if r.type_id != TypeId::PROPERTY {
            return None;
        }
        match &self.heap.get(r.handle)?.payload {
            ObjPayload::Property { setter, .. } => {
                if setter.is_null() {
                    None
                } else {
                    Some(*setter)
                }
            }
            _ => None,
        }
    }

    // ---- constants ------------------------------------------------------

    pub(crate) fn const_value(&mut self, c: &Constant) -> Value {
        match c {
            Constant::None => Value::None,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => {
                let s = s.clone();
                self.new_str(s)
            }
        }
    }

    fn const_name(&self, idx: u16) -> VmResult<Name> {
        let frame = self.cur_frame();
        match frame.code.consts.get(idx as usize) {
            Some(Constant::Str(s)) => Ok(Name::intern(s)),
            _ => Err(VmError::Internal(format!(
                "constant {idx} is not a name string"
            ))),
        }
    }

    fn module_value_attr(&self, module: Value, name: Name) -> Option<Value> {
        let r = module.as_ref()?;
        self.heap.get(r.handle)?.attr(name)
    }

    // ---- garbage collection ---------------------------------------------

    /// Collects now, rooting the operand stack, every frame, the module
    /// registry, the active exception, and all type namespaces.
    pub fn collect_garbage(&mut self) -> usize {
        let mut roots: Vec<Handle> = Vec::new();
        {
            let mut mark = |h: Handle| roots.push(h);
            for v in self.stack.iter() {
                v.trace(&mut mark);
            }
            for &idx in &self.call_stack {
                if let Some(frame) = self.frames.get(idx) {
                    frame.module.trace(&mut mark);
                    if let Some(callable) = frame.callable {
                        callable.trace(&mut mark);
                    }
                }
            }
            for v in self.modules.values() {
                v.trace(&mut mark);
            }
            self.builtins_module.trace(&mut mark);
            if let Some(exc) = self.cur_exception {
                exc.trace(&mut mark);
            }
            for (_, desc) in self.types.iter() {
                for v in desc.attrs.values() {
                    v.trace(&mut mark);
                }
            }
        }
        self.heap.collect(roots)
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}
