//! The engine: one explicit instance owning all runtime state.
//!
//! An [`Engine`] wraps a [`Vm`] together with the module registry, the
//! host output writers, the import hook, and the pluggable compiler.
//! Nothing lives in process-wide statics except the interned-name table;
//! two engines in one process do not observe each other.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use parking_lot::{Mutex, RwLock};

use pyrite_vm_bytecode::{CodeUnit, CodeUnitBuilder, FuncDecl};
use pyrite_vm_core::builtins::make_native;
use pyrite_vm_core::{
    Name, NativeSig, ObjPayload, TypeId, TypeOps, Value, Vm, VmError, VmResult,
};
use pyrite_vm_gc::HeapStats;

use crate::compiler::Compiler;
use crate::error::{EngineError, EngineResult};

/// Output writer shared with natives installed into the VM. Replacing
/// the writer through [`Engine::set_stdout`] swaps the boxed target in
/// place, so captured clones observe the change.
type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

#[cfg(feature = "host-threads")]
fn entry_guard() -> parking_lot::MutexGuard<'static, ()> {
    static ENTRY: parking_lot::Mutex<()> = parking_lot::Mutex::new(());
    ENTRY.lock()
}

pub struct Engine {
    vm: Vm,
    stdout: SharedWriter,
    stderr: SharedWriter,
    /// Shared slot so the import hook sees a compiler installed later.
    compiler: Arc<RwLock<Option<Arc<dyn Compiler>>>>,
}

impl Engine {
    pub fn new() -> Engine {
        let mut engine = Engine {
            vm: Vm::new(),
            stdout: Arc::new(Mutex::new(Box::new(std::io::stdout()))),
            stderr: Arc::new(Mutex::new(Box::new(std::io::stderr()))),
            compiler: Arc::new(RwLock::new(None)),
        };
        engine.install_print();
        engine
    }

    /// Installs the `print` builtin, writing through the engine's stdout.
    fn install_print(&mut self) {
        let decl = Arc::new(
            FuncDecl::new(
                "print",
                CodeUnitBuilder::new("print", "<builtin>").build(),
                vec![],
            )
            .with_star_args(),
        );
        let out = Arc::clone(&self.stdout);
        let print_fn = make_native(
            &mut self.vm,
            "print",
            NativeSig::Decl(decl),
            move |vm, args| {
                let items = tuple_items(vm, args[0])?;
                let mut line = String::new();
                for (i, item) in items.into_iter().enumerate() {
                    if i > 0 {
                        line.push(' ');
                    }
                    line.push_str(&vm.str_value(item)?);
                }
                line.push('\n');
                out.lock()
                    .write_all(line.as_bytes())
                    .map_err(|e| VmError::exception("OSError", e.to_string()))?;
                Ok(Value::None)
            },
        );
        let builtins = self.vm.builtins_module();
        self.vm.set_module_attr(builtins, "print", print_fn);
    }

    // ---- host configuration -------------------------------------------

    pub fn set_stdout(&mut self, writer: Box<dyn Write + Send>) {
        *self.stdout.lock() = writer;
    }

    pub fn set_stderr(&mut self, writer: Box<dyn Write + Send>) {
        *self.stderr.lock() = writer;
    }

    pub fn set_compiler(&mut self, compiler: Arc<dyn Compiler>) {
        *self.compiler.write() = Some(compiler);
    }

    /// Installs the import fallback: `fetch` maps a module name to its
    /// source text. On a miss in the module registry the source is
    /// compiled, its body is run, and the resulting module is registered
    /// before the importing code continues. Registration happens before
    /// the body runs, so import cycles see the partially built module
    /// rather than recursing forever.
    pub fn set_import_hook(
        &mut self,
        fetch: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) {
        let compiler = Arc::clone(&self.compiler);
        self.vm.set_import_hook(Arc::new(move |vm, name| {
            let Some(source) = fetch(name) else {
                return Ok(None);
            };
            let Some(compiler) = compiler.read().clone() else {
                return Err(VmError::import_error(format!(
                    "cannot import '{name}': no compiler configured"
                )));
            };
            let unit = compiler
                .compile(&source, name)
                .map_err(|e| VmError::import_error(e.to_string()))?;
            let module = vm.new_module(name);
            vm.register_module(name, module);
            vm.exec_nested(Arc::new(unit), module)?;
            Ok(Some(module))
        }));
    }

    // ---- registration --------------------------------------------------

    /// Creates a module and registers it under `name`. Registering the
    /// same name twice is a fatal host error.
    pub fn new_module(&mut self, name: &str) -> Value {
        let module = self.vm.new_module(name);
        self.vm.register_module(name, module);
        module
    }

    /// Installs a native function as an attribute of `module`.
    pub fn register_native(
        &mut self,
        module: Value,
        name: &str,
        sig: NativeSig,
        f: impl Fn(&mut Vm, &[Value]) -> VmResult<Value> + 'static,
    ) -> Value {
        let native = make_native(&mut self.vm, name, sig, f);
        self.vm.set_module_attr(module, name, native);
        native
    }

    /// Registers a host-defined type with its operator table.
    pub fn register_type(&mut self, name: &str, base: Option<TypeId>, ops: TypeOps) -> TypeId {
        self.vm.types.register(name, base, ops)
    }

    /// Installs a native method into a type's namespace. The receiver
    /// arrives as the first argument.
    pub fn register_method(
        &mut self,
        type_id: TypeId,
        name: &str,
        sig: NativeSig,
        f: impl Fn(&mut Vm, &[Value]) -> VmResult<Value> + 'static,
    ) {
        let native = make_native(&mut self.vm, name, sig, f);
        self.vm
            .types
            .get_mut(type_id)
            .attrs
            .insert(Name::intern(name), native);
    }

    /// Binds a type object for `type_id` into `module`, making the type
    /// constructible from guest code.
    pub fn bind_type(&mut self, module: Value, name: &str, type_id: TypeId) -> Value {
        let type_obj = self.vm.new_type_object(type_id);
        self.vm.set_module_attr(module, name, type_obj);
        type_obj
    }

    // ---- execution entry points ----------------------------------------

    /// Compiles `source` through the configured compiler.
    pub fn compile(&mut self, source: &str, source_name: &str) -> EngineResult<Arc<CodeUnit>> {
        #[cfg(feature = "host-threads")]
        let _entry = entry_guard();
        let compiler = self.compiler.read().clone().ok_or(EngineError::NoCompiler)?;
        let unit = compiler.compile(source, source_name)?;
        Ok(Arc::new(unit))
    }

    /// Runs `unit` as the body of `module`. An uncaught guest exception
    /// is reported to the stderr writer as a traceback and returned.
    pub fn exec(&mut self, unit: Arc<CodeUnit>, module: Value) -> EngineResult<Value> {
        #[cfg(feature = "host-threads")]
        let _entry = entry_guard();
        match self.vm.exec(unit, module) {
            Ok(v) => Ok(v),
            Err(e) => {
                if let VmError::Exception(exc) = &e {
                    let mut report = exc.format_traceback();
                    report.push('\n');
                    let _ = self.stderr.lock().write_all(report.as_bytes());
                }
                Err(e.into())
            }
        }
    }

    /// Compiles and runs `source` in one step.
    pub fn exec_source(
        &mut self,
        source: &str,
        source_name: &str,
        module: Value,
    ) -> EngineResult<Value> {
        let unit = self.compile(source, source_name)?;
        self.exec(unit, module)
    }

    /// Runs `unit` and renders its result as a printable string.
    pub fn eval(&mut self, unit: Arc<CodeUnit>, module: Value) -> EngineResult<String> {
        let result = self.exec(unit, module)?;
        #[cfg(feature = "host-threads")]
        let _entry = entry_guard();
        Ok(self.vm.repr_value(result)?)
    }

    // ---- runtime services ----------------------------------------------

    /// Shared flag that cancels execution at the next dispatch step.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.vm.interrupt_handle()
    }

    pub fn collect_garbage(&mut self) -> usize {
        #[cfg(feature = "host-threads")]
        let _entry = entry_guard();
        self.vm.collect_garbage()
    }

    /// Runs `f` with automatic collection suspended. Used while staging
    /// heap values the VM cannot yet see from any root; a collection
    /// that comes due inside the scope fires at the next safepoint
    /// after it ends. Nestable.
    pub fn with_gc_paused<R>(&mut self, f: impl FnOnce(&mut Engine) -> R) -> R {
        self.vm.heap.gc_lock();
        let out = f(self);
        self.vm.heap.gc_unlock();
        out
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.vm.heap_stats()
    }

    /// Direct access to the VM, for hosts that outgrow the facade.
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

impl Default for Engine {
    fn default() -> Engine {
        Engine::new()
    }
}

fn tuple_items(vm: &Vm, v: Value) -> VmResult<Vec<Value>> {
    let r = v
        .as_ref()
        .ok_or_else(|| VmError::Internal("variadic arguments are not a tuple".into()))?;
    let obj = vm
        .heap
        .get(r.handle)
        .ok_or_else(|| VmError::Internal("variadic tuple vanished".into()))?;
    match &obj.payload {
        ObjPayload::Tuple(items) => Ok(items.to_vec()),
        _ => Err(VmError::Internal("variadic arguments are not a tuple".into())),
    }
}
