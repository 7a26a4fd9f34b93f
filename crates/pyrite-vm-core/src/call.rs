//! The calling convention.
//!
//! Every call site, guest or host, stages the same stack layout:
//!
//! ```text
//! [callable, self_or_null, arg0..argN, kw_name0, kw_val0, ..]
//! ```
//!
//! [`Vm::vectorcall`] dispatches on the callable's type and always leaves
//! exactly one result value where the callable used to be. Bound methods
//! and callable instances rewrite the first two slots in place and
//! re-dispatch, so forwarding never copies the argument window.

use std::sync::Arc;

use pyrite_vm_bytecode::{Constant, FuncDecl};

use crate::error::{VmError, VmResult};
use crate::frame::Frame;
use crate::generator::{GenState, GeneratorObj, ResumeResult};
use crate::intern::Name;
use crate::object::{HeapObject, NativeSig, ObjPayload};
use crate::types::TypeId;
use crate::value::{ObjRef, Value};
use crate::vm::{FrameOutcome, Vm};

impl Vm {
    /// Invokes the staged call described above. `argc` positional values
    /// and `kwargc` name/value pairs sit on top of the stack.
    pub fn vectorcall(&mut self, argc: usize, kwargc: usize) -> VmResult<()> {
        let base = self.stack.len() - 2 - argc - 2 * kwargc;
        let callable = self.stack.get(base);
        match callable.type_id() {
            TypeId::FUNCTION => self.call_guest(base, argc, kwargc),
            TypeId::NATIVE_FUNC => self.call_native(base, argc, kwargc),
            TypeId::BOUND_METHOD => {
                let (func, receiver) = {
                    let r = callable.as_ref().expect("bound method is heap-backed");
                    match &self.heap.get(r.handle).expect("dead bound method").payload {
                        ObjPayload::BoundMethod { func, receiver } => (*func, *receiver),
                        _ => unreachable!("type id says bound method"),
                    }
                };
                self.stack.set(base, func);
                self.stack.set(base + 1, receiver);
                self.vectorcall(argc, kwargc)
            }
            TypeId::TYPE => self.call_type(base, argc, kwargc),
            other => {
                let call_name = Name::intern("__call__");
                if let Some(func) = self.types.lookup(other, call_name) {
                    self.stack.set(base, func);
                    self.stack.set(base + 1, callable);
                    self.vectorcall(argc, kwargc)
                } else {
                    Err(VmError::type_error(format!(
                        "'{}' object is not callable",
                        self.type_name(callable)
                    )))
                }
            }
        }
    }

    /// Stages a call from Rust: pushes the layout, runs it, pops the
    /// result. `self_val` is `Value::Null` for receiver-less calls.
    pub fn call_function(
        &mut self,
        callable: Value,
        self_val: Value,
        args: &[Value],
        kwargs: &[(Value, Value)],
    ) -> VmResult<Value> {
        self.stack.push(callable)?;
        self.stack.push(self_val)?;
        for &a in args {
            self.stack.push(a)?;
        }
        for &(k, v) in kwargs {
            self.stack.push(k)?;
            self.stack.push(v)?;
        }
        self.vectorcall(args.len(), kwargs.len())?;
        Ok(self.stack.pop())
    }

    fn call_guest(&mut self, base: usize, argc: usize, kwargc: usize) -> VmResult<()> {
        let (decl, module, callable) = {
            let callable = self.stack.get(base);
            let r = callable.as_ref().expect("function is heap-backed");
            match &self.heap.get(r.handle).expect("dead function object").payload {
                ObjPayload::Function(f) => (Arc::clone(&f.decl), f.module, callable),
                _ => unreachable!("type id says function"),
            }
        };
        let self_val = self.stack.get(base + 1);
        let args_start = base + 2;

        let mut positional = Vec::with_capacity(argc + 1);
        if !self_val.is_null() {
            positional.push(self_val);
        }
        for i in 0..argc {
            positional.push(self.stack.get(args_start + i));
        }

        let locals = if kwargc == 0 && decl.is_simple() && positional.len() == decl.params.len() {
            // Fast path: arity matches exactly and no binding logic applies.
            positional
        } else {
            let keywords = self.collect_keywords(args_start + argc, kwargc)?;
            self.bind_args(&decl, positional, keywords)?
        };

        self.stack.truncate(base);

        if decl.is_generator {
            let mut span = locals;
            span.resize(decl.code.local_count(), Value::None);
            let frame = Frame::new(Arc::clone(&decl.code), Some(callable), module, 0);
            let generator = self.alloc(HeapObject::new(
                TypeId::GENERATOR,
                ObjPayload::Generator(Box::new(GeneratorObj::new(frame, span))),
            ));
            return self.stack.push(generator);
        }

        self.push_frame(Arc::clone(&decl.code), Some(callable), module, locals)?;
        match self.run_frame()? {
            FrameOutcome::Returned(v) => self.stack.push(v),
            FrameOutcome::Yielded(_) => Err(VmError::Internal(
                "yield outside a generator frame".into(),
            )),
        }
    }

    fn call_native(&mut self, base: usize, argc: usize, kwargc: usize) -> VmResult<()> {
        let (func, sig, fname) = {
            let callable = self.stack.get(base);
            let r = callable.as_ref().expect("native function is heap-backed");
            match &self.heap.get(r.handle).expect("dead native object").payload {
                ObjPayload::NativeFunc(n) => (Arc::clone(&n.func), n.sig.clone(), n.name),
                _ => unreachable!("type id says native function"),
            }
        };
        let self_val = self.stack.get(base + 1);
        let args_start = base + 2;

        let mut args = Vec::with_capacity(argc + 1);
        if !self_val.is_null() {
            args.push(self_val);
        }
        for i in 0..argc {
            args.push(self.stack.get(args_start + i));
        }

        match sig {
            NativeSig::Fixed(n) => {
                if kwargc != 0 {
                    return Err(VmError::type_error(format!(
                        "{fname}() takes no keyword arguments"
                    )));
                }
                if args.len() != n {
                    return Err(VmError::type_error(format!(
                        "{fname}() takes exactly {n} argument{} ({} given)",
                        if n == 1 { "" } else { "s" },
                        args.len()
                    )));
                }
            }
            NativeSig::Decl(decl) => {
                let keywords = self.collect_keywords(args_start + argc, kwargc)?;
                args = self.bind_args(&decl, args, keywords)?;
            }
        }

        // Keep the bound values rooted while the native body runs; it may
        // re-enter the VM and trigger a collection.
        let staged = self.stack.len();
        self.stack.extend(&args)?;
        let result = func(self, &args);
        self.stack.truncate(staged);
        self.stack.truncate(base);
        let v = result?;
        self.stack.push(v)
    }

    /// Calling a type object constructs an instance: allocate, then run
    /// `__init__` from the type's namespace if it defines one.
    fn call_type(&mut self, base: usize, argc: usize, kwargc: usize) -> VmResult<()> {
        let described = {
            let callable = self.stack.get(base);
            let r = callable.as_ref().expect("type object is heap-backed");
            match &self.heap.get(r.handle).expect("dead type object").payload {
                ObjPayload::Type(t) => *t,
                _ => unreachable!("type id says type object"),
            }
        };
        let instance = self.new_instance(described);
        let init = self.types.lookup(described, Name::intern("__init__"));
        match init {
            Some(init_func) => {
                // The instance takes the receiver slot, which also keeps
                // it rooted for the duration of the initializer.
                self.stack.set(base, init_func);
                self.stack.set(base + 1, instance);
                self.vectorcall(argc, kwargc)?;
                self.stack.pop();
            }
            None => {
                if argc != 0 || kwargc != 0 {
                    return Err(VmError::type_error(format!(
                        "{}() takes no arguments",
                        self.types.name_of(described)
                    )));
                }
                self.stack.truncate(base);
            }
        }
        self.stack.push(instance)
    }

    fn collect_keywords(&self, start: usize, kwargc: usize) -> VmResult<Vec<(String, Value)>> {
        let mut out = Vec::with_capacity(kwargc);
        for i in 0..kwargc {
            let key = self.stack.get(start + 2 * i);
            let value = self.stack.get(start + 2 * i + 1);
            let name = key
                .as_ref()
                .and_then(|r| self.heap.get(r.handle))
                .and_then(|o| o.as_str())
                .ok_or_else(|| VmError::type_error("keywords must be strings"))?
                .to_string();
            out.push((name, value));
        }
        Ok(out)
    }

    /// General parameter binding: positionals fill slots left to right,
    /// keywords fill by name, defaults fill the remaining trailing slots,
    /// and variadic slots absorb the excess. Returns the callee's initial
    /// local values.
    fn bind_args(
        &mut self,
        decl: &FuncDecl,
        positional: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> VmResult<Vec<Value>> {
        let fname = &decl.name;
        let nparams = decl.params.len();
        let given = positional.len();

        let mut slots: Vec<Option<Value>> = vec![None; nparams];
        let mut extra_pos: Vec<Value> = Vec::new();
        for (i, v) in positional.into_iter().enumerate() {
            if i < nparams {
                slots[i] = Some(v);
            } else {
                extra_pos.push(v);
            }
        }
        if !extra_pos.is_empty() && !decl.has_star_args {
            return Err(VmError::type_error(format!(
                "{fname}() takes {nparams} positional argument{} but {given} {} given",
                if nparams == 1 { "" } else { "s" },
                if given == 1 { "was" } else { "were" }
            )));
        }

        let mut extra_kw: Vec<(String, Value)> = Vec::new();
        for (name, v) in keywords {
            match decl.params.iter().position(|p| p == &name) {
                Some(idx) => {
                    if slots[idx].is_some() {
                        return Err(VmError::type_error(format!(
                            "{fname}() got multiple values for argument '{name}'"
                        )));
                    }
                    slots[idx] = Some(v);
                }
                None => {
                    if decl.has_star_kwargs {
                        extra_kw.push((name, v));
                    } else {
                        return Err(VmError::type_error(format!(
                            "{fname}() got an unexpected keyword argument '{name}'"
                        )));
                    }
                }
            }
        }

        let first_default = nparams - decl.defaults.len();
        let mut missing: Vec<&str> = Vec::new();
        for i in 0..nparams {
            if slots[i].is_none() {
                if i >= first_default {
                    let c: &Constant = &decl.defaults[i - first_default];
                    let c = c.clone();
                    slots[i] = Some(self.const_value(&c));
                } else {
                    missing.push(&decl.params[i]);
                }
            }
        }
        if !missing.is_empty() {
            let listed = match missing.len() {
                1 => format!("'{}'", missing[0]),
                2 => format!("'{}' and '{}'", missing[0], missing[1]),
                _ => {
                    let head: Vec<String> = missing[..missing.len() - 1]
                        .iter()
                        .map(|m| format!("'{m}'"))
                        .collect();
                    format!("{} and '{}'", head.join(", "), missing[missing.len() - 1])
                }
            };
            return Err(VmError::type_error(format!(
                "{fname}() missing {} required positional argument{}: {listed}",
                missing.len(),
                if missing.len() == 1 { "" } else { "s" }
            )));
        }

        let mut out: Vec<Value> = slots.into_iter().map(|s| s.expect("slot filled")).collect();
        if decl.has_star_args {
            let tuple = self.new_tuple(extra_pos);
            out.push(tuple);
        }
        if decl.has_star_kwargs {
            let mut pairs = Vec::with_capacity(extra_kw.len());
            for (name, v) in extra_kw {
                let key = self.new_str(name);
                pairs.push((key, v));
            }
            let dict = self.new_dict(pairs);
            out.push(dict);
        }
        Ok(out)
    }

    // ---- generators ----------------------------------------------------

    /// Resumes a generator, sending `sent` as the value of the suspended
    /// yield expression. The retained frame is re-attached to the live
    /// stack for the duration of the step and detached again on yield.
    pub fn resume_generator(&mut self, r#gen: ObjRef, sent: Value) -> VmResult<ResumeResult> {
        let (mut frame, saved, first) = {
            let obj = self
                .heap
                .get_mut(r#gen.handle)
                .ok_or_else(|| VmError::Internal("resume of a dead generator".into()))?;
            let ObjPayload::Generator(g) = &mut obj.payload else {
                return Err(VmError::Internal("resume target is not a generator".into()));
            };
            match g.state {
                GenState::Exhausted => return Err(VmError::stop_iteration()),
                GenState::Running => {
                    return Err(VmError::value_error("generator already executing"));
                }
                GenState::Created | GenState::Suspended => {}
            }
            let first = g.state == GenState::Created;
            g.state = GenState::Running;
            let frame = g.frame.take().expect("suspended generator has a frame");
            let saved = std::mem::take(&mut g.saved_stack);
            (frame, saved, first)
        };

        if first && !(sent.is_none() || sent.is_null()) {
            self.restore_generator(r#gen, frame, saved, GenState::Created);
            return Err(VmError::type_error(
                "can't send non-None value to a just-started generator",
            ));
        }

        if self.call_stack.len() >= self.max_call_depth {
            self.restore_generator(r#gen, frame, saved, if first { GenState::Created } else { GenState::Suspended });
            return Err(VmError::RecursionLimit);
        }

        frame.base = self.stack.len();
        if let Err(e) = self.stack.extend(&saved) {
            self.stack.truncate(frame.base);
            self.restore_generator(r#gen, frame, saved, if first { GenState::Created } else { GenState::Suspended });
            return Err(e);
        }
        if !first {
            self.stack.push(sent)?;
        }
        let idx = self.frames.alloc(*frame);
        self.call_stack.push(idx);

        match self.run_frame() {
            Ok(FrameOutcome::Yielded(v)) => {
                // Detach: pull the frame back out and copy its span away.
                let idx = self.call_stack.pop().expect("generator frame on stack");
                let frame = self.frames.dealloc(idx);
                let span = self.stack.drain_from(frame.base);
                self.restore_generator(r#gen, Box::new(frame), span, GenState::Suspended);
                Ok(ResumeResult::Yielded(v))
            }
            Ok(FrameOutcome::Returned(v)) => {
                self.exhaust_generator(r#gen);
                Ok(ResumeResult::Done(v))
            }
            Err(e) => {
                self.exhaust_generator(r#gen);
                Err(e)
            }
        }
    }

    fn restore_generator(
        &mut self,
        r#gen: ObjRef,
        frame: Box<Frame>,
        saved: Vec<Value>,
        state: GenState,
    ) {
        if let Some(obj) = self.heap.get_mut(r#gen.handle) {
            if let ObjPayload::Generator(g) = &mut obj.payload {
                g.frame = Some(frame);
                g.saved_stack = saved;
                g.state = state;
            }
        }
    }

    fn exhaust_generator(&mut self, r#gen: ObjRef) {
        if let Some(obj) = self.heap.get_mut(r#gen.handle) {
            if let ObjPayload::Generator(g) = &mut obj.payload {
                g.exhaust();
            }
        }
    }
}
