// Croc virtual machine.
// Owns the heap, the thread set, the global namespace, and the per-type
// metatables; exposes the stack-based embedding surface.

mod activation_record;
mod croc_error;
mod eh_frame;
pub(crate) mod execute;
pub mod limits;
pub mod opcode;
mod vm_options;

pub use activation_record::ActivationRecord;
pub use croc_error::{CrocError, CrocResult, ErrorKind, TracebackEntry};
pub use eh_frame::EhFrame;
pub use execute::metamethod::{MetaMethod, NUM_METAMETHODS};
pub use vm_options::VmOptions;

use crate::croc_value::{
    Array, CrocType, FuncDef, FuncKind, Function, Namespace, Thread, Value, NUM_TYPES,
};
use crate::gc::{FuncDefId, GcHeap, GcId, NamespaceId, StringId, ThreadId};

/// A host function callable from script. Parameters are read through the
/// VM's native-frame accessors; results are pushed and their count
/// returned.
pub type NativeFn = fn(&mut CrocVm) -> CrocResult<usize>;

/// Global VM state: every heap object, every thread, and the shared
/// tables live here. No hidden singletons; dropping the VM drops it all.
pub struct CrocVm {
    pub(crate) heap: GcHeap,
    pub(crate) globals: NamespaceId,
    pub(crate) main_thread: ThreadId,
    pub(crate) cur_thread: ThreadId,
    pub(crate) type_metatables: [Option<NamespaceId>; NUM_TYPES],
    /// The in-flight exception while a finally block runs.
    pub(crate) pending_ex: Option<CrocError>,
    pub(crate) options: VmOptions,
    /// Host-pinned values, traced as GC roots.
    pub(crate) temp_roots: Vec<Value>,
    /// Pre-interned metamethod names, indexed by `MetaMethod`.
    pub(crate) mm_names: [StringId; NUM_METAMETHODS],
    pub(crate) ctor_name: StringId,
}

impl CrocVm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let mut heap = GcHeap::new();

        let g_name = heap.intern("_G");
        let globals = heap.alloc_namespace(Namespace::new(g_name, None));
        let main_thread = heap.alloc_thread(Thread::new(None, options.initial_stack_size));

        let mut mm_names = [StringId(0); NUM_METAMETHODS];
        for mm in MetaMethod::ALL {
            mm_names[mm as usize] = heap.intern(mm.name());
        }
        let ctor_name = heap.intern("constructor");

        heap.fix(GcId::Namespace(globals));
        heap.fix(GcId::Thread(main_thread));
        heap.fix(GcId::String(g_name));
        heap.fix(GcId::String(ctor_name));
        for name in mm_names {
            heap.fix(GcId::String(name));
        }

        Self {
            heap,
            globals,
            main_thread,
            cur_thread: main_thread,
            type_metatables: [None; NUM_TYPES],
            pending_ex: None,
            options,
            temp_roots: Vec::new(),
            mm_names,
            ctor_name,
        }
    }

    // ============ Values ============

    pub fn new_string(&mut self, s: &str) -> Value {
        Value::string(self.heap.intern(s))
    }

    pub fn get_string(&self, v: Value) -> Option<&str> {
        v.as_string_id().map(|id| self.heap.str(id))
    }

    pub fn new_table(&mut self) -> Value {
        Value::table(self.heap.alloc_table())
    }

    pub fn new_array(&mut self, len: usize) -> Value {
        Value::array(self.heap.alloc_array(Array::new(len)))
    }

    pub fn new_array_from(&mut self, values: Vec<Value>) -> Value {
        Value::array(self.heap.alloc_array(Array::from_values(values)))
    }

    pub fn new_namespace(&mut self, name: &str, parent: Option<Value>) -> CrocResult<Value> {
        let name = self.heap.intern(name);
        let parent = match parent {
            None => None,
            Some(v) => Some(v.as_namespace_id().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Namespace parent must be a namespace, not a '{}'",
                    v.type_name()
                ))
            })?),
        };
        Ok(Value::namespace(self.heap.alloc_namespace(Namespace::new(name, parent))))
    }

    pub fn new_native_function(&mut self, name: &str, func: NativeFn) -> Value {
        let name = self.heap.intern(name);
        let id = self.heap.alloc_function(Function { name, kind: FuncKind::Native { func } });
        Value::function(id)
    }

    /// Registers a compiled function definition on the heap.
    pub fn new_funcdef(&mut self, def: FuncDef) -> FuncDefId {
        self.heap.alloc_funcdef(def)
    }

    /// Instantiates a top-level `FuncDef` into a closure bound to `env`
    /// (the global namespace by default). Top-level functions capture no
    /// upvalues.
    pub fn new_script_function(&mut self, def_id: FuncDefId, env: Option<Value>) -> CrocResult<Value> {
        let env = match env {
            None => self.globals,
            Some(v) => v.as_namespace_id().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Function environment must be a namespace, not a '{}'",
                    v.type_name()
                ))
            })?,
        };
        let name = self.heap[def_id].name;
        let id = self.heap.alloc_function(Function {
            name,
            kind: FuncKind::Script { def: def_id, env, upvals: Vec::new() },
        });
        Ok(Value::function(id))
    }

    /// Display form of a value; for Int/Float/Bool/Null/String this
    /// round-trips through `parse_scalar`.
    pub fn value_to_string(&self, v: Value) -> String {
        match v.kind() {
            CrocType::Null => "null".to_string(),
            CrocType::Bool => if v.is_true() { "true" } else { "false" }.to_string(),
            CrocType::Int => format!("{}", v.secondary as i64),
            CrocType::Float => {
                let f = f64::from_bits(v.secondary);
                if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{:.1}", f)
                } else {
                    format!("{}", f)
                }
            }
            CrocType::String => match v.as_string_id() {
                Some(id) => self.heap.str(id).to_string(),
                None => String::new(),
            },
            CrocType::Function => {
                let name = match v.as_function_id() {
                    Some(id) => self.heap.str(self.heap[id].name).to_string(),
                    None => String::new(),
                };
                format!("function {}", name)
            }
            k => format!("{} 0x{:08x}", k.name(), v.primary & crate::croc_value::value::ID_MASK),
        }
    }

    /// Parses the display form of a scalar back into a value; anything
    /// else interns as a string.
    pub fn parse_scalar(&mut self, s: &str) -> Value {
        match s {
            "null" => Value::null(),
            "true" => Value::bool(true),
            "false" => Value::bool(false),
            _ => {
                if let Ok(i) = s.parse::<i64>() {
                    Value::int(i)
                } else if let Ok(f) = s.parse::<f64>() {
                    Value::float(f)
                } else {
                    self.new_string(s)
                }
            }
        }
    }

    // ============ Globals ============

    pub fn globals(&self) -> Value {
        Value::namespace(self.globals)
    }

    pub(crate) fn new_global_impl(
        &mut self,
        env: NamespaceId,
        name: StringId,
        val: Value,
    ) -> CrocResult<()> {
        if self.heap[env].contains(name) {
            let n = self.heap.str(name).to_string();
            return Err(CrocError::name_error(format!(
                "Attempting to create a global '{}' that already exists",
                n
            )));
        }
        self.heap.barrier_back(GcId::Namespace(env));
        self.heap[env].set(name, val);
        Ok(())
    }

    pub(crate) fn get_global_impl(&self, env: NamespaceId, name: StringId) -> CrocResult<Value> {
        let mut cur = Some(env);
        while let Some(ns) = cur {
            if let Some(v) = self.heap[ns].get(name) {
                return Ok(v);
            }
            cur = self.heap[ns].parent;
        }
        let n = self.heap.str(name).to_string();
        Err(CrocError::name_error(format!(
            "Attempting to get a nonexistent global '{}'",
            n
        )))
    }

    pub(crate) fn set_global_impl(
        &mut self,
        env: NamespaceId,
        name: StringId,
        val: Value,
    ) -> CrocResult<()> {
        let mut cur = Some(env);
        while let Some(ns) = cur {
            if self.heap[ns].contains(name) {
                self.heap.barrier_back(GcId::Namespace(ns));
                self.heap[ns].set(name, val);
                return Ok(());
            }
            cur = self.heap[ns].parent;
        }
        let n = self.heap.str(name).to_string();
        Err(CrocError::name_error(format!(
            "Attempting to set a nonexistent global '{}'",
            n
        )))
    }

    /// Defines a global in the global namespace, overwriting silently.
    pub fn set_global(&mut self, name: &str, val: Value) {
        let name = self.heap.intern(name);
        let g = self.globals;
        self.heap.barrier_back(GcId::Namespace(g));
        self.heap[g].set(name, val);
    }

    pub fn get_global(&mut self, name: &str) -> CrocResult<Value> {
        let name = self.heap.intern(name);
        self.get_global_impl(self.globals, name)
    }

    // ============ Fields and indexing (host surface) ============

    pub fn get_index(&mut self, container: Value, key: Value) -> CrocResult<Value> {
        let tid = self.cur_thread;
        let slot = self.heap[tid].stack_index;
        self.heap[tid].ensure_stack(slot + 1);
        execute::ops::idx(self, tid, slot, container, key)?;
        Ok(self.heap[tid].stack[slot])
    }

    pub fn set_index(&mut self, container: Value, key: Value, val: Value) -> CrocResult<()> {
        let tid = self.cur_thread;
        execute::ops::idxa(self, tid, container, key, val)
    }

    pub fn get_field(&mut self, obj: Value, name: &str) -> CrocResult<Value> {
        let tid = self.cur_thread;
        let name = self.heap.intern(name);
        execute::ops::field_value(self, tid, obj, name)
    }

    pub fn set_field(&mut self, obj: Value, name: &str, val: Value) -> CrocResult<()> {
        let tid = self.cur_thread;
        let name = self.heap.intern(name);
        execute::ops::fielda(self, tid, obj, name, val)
    }

    // ============ Calls ============

    /// Calls `func` with an explicit receiver and arguments, returning
    /// every result. Exceptions surface as `Err` with the taxonomy kind
    /// and any script-thrown value attached; this is the protected-call
    /// surface.
    pub fn call_function(
        &mut self,
        func: Value,
        this: Value,
        args: &[Value],
    ) -> CrocResult<Vec<Value>> {
        let tid = self.cur_thread;
        let slot = {
            let t = &mut self.heap[tid];
            let s = t.stack_index;
            t.ensure_stack(s + 2 + args.len());
            t.stack[s] = func;
            t.stack[s + 1] = this;
            for (i, a) in args.iter().enumerate() {
                t.stack[s + 2 + i] = *a;
            }
            t.stack_index = s + 2 + args.len();
            s
        };

        let result = execute::call::call_and_run(self, tid, slot, 1 + args.len(), -1);
        match result {
            Ok(()) => {
                let t = &mut self.heap[tid];
                let vals = t.stack[slot..t.stack_index.min(t.stack.len())].to_vec();
                t.stack_index = slot;
                Ok(vals)
            }
            Err(e) => {
                let t = &mut self.heap[tid];
                t.stack_index = slot.min(t.stack_index);
                Err(e)
            }
        }
    }

    // ============ Native frame accessors ============

    /// Parameter `i` of the running native frame; 0 is `this`.
    pub fn native_param(&self, i: usize) -> Value {
        let t = &self.heap[self.cur_thread];
        match t.ars.last() {
            Some(ar) if ar.is_native => {
                let abs = ar.stack_base + i;
                if abs < ar.saved_top {
                    t.stack.get(abs).copied().unwrap_or(Value::null())
                } else {
                    Value::null()
                }
            }
            _ => Value::null(),
        }
    }

    /// Parameter count of the running native frame, including `this`.
    pub fn native_num_params(&self) -> usize {
        let t = &self.heap[self.cur_thread];
        match t.ars.last() {
            Some(ar) if ar.is_native => ar.saved_top - ar.stack_base,
            _ => 0,
        }
    }

    pub fn push_value(&mut self, v: Value) {
        let t = &mut self.heap[self.cur_thread];
        let s = t.stack_index;
        t.ensure_stack(s + 1);
        t.stack[s] = v;
        t.stack_index = s + 1;
    }

    pub fn pop_value(&mut self) -> CrocResult<Value> {
        let t = &mut self.heap[self.cur_thread];
        if t.stack_index == 0 {
            return Err(CrocError::vm_error("pop from an empty stack"));
        }
        t.stack_index -= 1;
        Ok(t.stack[t.stack_index])
    }

    // ============ Classes and objects ============

    pub fn new_class(&mut self, name: &str) -> Value {
        let name = self.heap.intern(name);
        Value::class(self.heap.alloc_class(crate::croc_value::Class::new(name)))
    }

    pub fn class_add_method(
        &mut self,
        cls: Value,
        name: &str,
        val: Value,
        is_override: bool,
    ) -> CrocResult<()> {
        let id = cls.as_class_id().ok_or_else(|| {
            CrocError::type_error(format!("Cannot add a method to a '{}'", cls.type_name()))
        })?;
        let name = self.heap.intern(name);
        self.heap.barrier_back(GcId::Class(id));
        if self.heap[id].add_method(name, val, is_override) {
            Ok(())
        } else {
            let n = self.heap.str(name).to_string();
            Err(CrocError::field_error(format!(
                "Attempting to add a method '{}' which already exists",
                n
            )))
        }
    }

    pub fn class_add_field(
        &mut self,
        cls: Value,
        name: &str,
        val: Value,
        is_override: bool,
    ) -> CrocResult<()> {
        let id = cls.as_class_id().ok_or_else(|| {
            CrocError::type_error(format!("Cannot add a field to a '{}'", cls.type_name()))
        })?;
        let name = self.heap.intern(name);
        self.heap.barrier_back(GcId::Class(id));
        if self.heap[id].add_field(name, val, is_override) {
            Ok(())
        } else {
            let n = self.heap.str(name).to_string();
            Err(CrocError::field_error(format!(
                "Attempting to add a field '{}' which already exists",
                n
            )))
        }
    }

    /// Creates an instance without running any constructor; calling the
    /// class value instead runs `constructor`.
    pub fn new_instance(&mut self, cls: Value) -> CrocResult<Value> {
        let id = cls.as_class_id().ok_or_else(|| {
            CrocError::type_error(format!("Cannot instantiate a '{}'", cls.type_name()))
        })?;
        let inst = {
            let c = &self.heap[id];
            crate::croc_value::Instance::new(id, c)
        };
        Ok(Value::instance(self.heap.alloc_instance(inst)))
    }

    pub fn new_weakref(&mut self, target: Value) -> CrocResult<Value> {
        let id = target.gc_id().ok_or_else(|| {
            CrocError::type_error(format!(
                "Cannot make a weak reference to a '{}'",
                target.type_name()
            ))
        })?;
        Ok(Value::weakref(self.heap.alloc_weakref(crate::croc_value::WeakRef::new(id))))
    }

    /// Null once the referent has been collected.
    pub fn weakref_target(&self, wr: Value) -> CrocResult<Value> {
        let id = wr.as_weakref_id().ok_or_else(|| {
            CrocError::type_error(format!("Cannot dereference a '{}'", wr.type_name()))
        })?;
        Ok(match self.heap[id].target {
            Some(GcId::Table(t)) => Value::table(t),
            Some(GcId::Array(a)) => Value::array(a),
            Some(GcId::Namespace(n)) => Value::namespace(n),
            Some(GcId::Function(f)) => Value::function(f),
            Some(GcId::FuncDef(d)) => Value::funcdef(d),
            Some(GcId::Class(c)) => Value::class(c),
            Some(GcId::Instance(i)) => Value::instance(i),
            Some(GcId::Thread(t)) => Value::thread(t),
            Some(GcId::String(s)) => Value::string(s),
            Some(GcId::Memblock(m)) => Value::memblock(m),
            Some(GcId::NativeObj(o)) => Value::nativeobj(o),
            Some(GcId::WeakRef(w)) => Value::weakref(w),
            Some(GcId::Upvalue(_)) | None => Value::null(),
        })
    }

    pub fn new_memblock(&mut self, size: usize) -> Value {
        Value::memblock(self.heap.alloc_memblock(crate::croc_value::Memblock::new(size)))
    }

    /// Snapshot of an array's contents.
    pub fn array_values(&self, v: Value) -> CrocResult<Vec<Value>> {
        let id = v.as_array_id().ok_or_else(|| {
            CrocError::type_error(format!("Expected an array, got a '{}'", v.type_name()))
        })?;
        Ok(self.heap[id].values().to_vec())
    }

    // ============ Threads ============

    pub fn new_thread(&mut self, func: Value) -> CrocResult<Value> {
        let func_id = func.as_function_id().ok_or_else(|| {
            CrocError::type_error(format!(
                "Thread body must be a function, not a '{}'",
                func.type_name()
            ))
        })?;
        let initial_stack = self.options.initial_stack_size;
        let id = self.heap.alloc_thread(Thread::new(Some(func_id), initial_stack));
        Ok(Value::thread(id))
    }

    pub fn resume_thread(&mut self, thread: Value, args: &[Value]) -> CrocResult<Vec<Value>> {
        let target = thread.as_thread_id().ok_or_else(|| {
            CrocError::type_error(format!("Cannot resume a '{}'", thread.type_name()))
        })?;
        execute::thread_ops::resume(self, target, Value::null(), args)
    }

    pub fn thread_state(&self, thread: Value) -> CrocResult<&'static str> {
        let id = thread.as_thread_id().ok_or_else(|| {
            CrocError::type_error(format!("Cannot get the state of a '{}'", thread.type_name()))
        })?;
        Ok(self.heap[id].state.as_str())
    }

    /// Requests cancellation; the flag is sampled at the top of every
    /// dispatch iteration and raises `HaltException` in that thread.
    pub fn halt_thread(&mut self, thread: Value) -> CrocResult<()> {
        let id = thread.as_thread_id().ok_or_else(|| {
            CrocError::type_error(format!("Cannot halt a '{}'", thread.type_name()))
        })?;
        self.heap[id].should_halt = true;
        Ok(())
    }

    pub fn is_main_thread(&self, thread: Value) -> bool {
        thread.as_thread_id() == Some(self.main_thread)
    }

    // ============ Hooks ============

    /// Installs (or clears, with mask 0) the debug hook on a thread.
    pub fn set_hook(&mut self, thread: Value, mask: u8, delay: u32, func: Option<Value>) -> CrocResult<()> {
        let id = thread.as_thread_id().ok_or_else(|| {
            CrocError::type_error(format!("Cannot set a hook on a '{}'", thread.type_name()))
        })?;
        let t = &mut self.heap[id];
        t.hooks = mask;
        t.hook_delay = delay;
        t.hook_counter = delay;
        t.hook_func = func;
        Ok(())
    }

    // ============ Type metatables ============

    pub fn set_type_metatable(&mut self, ty: CrocType, ns: Option<Value>) -> CrocResult<()> {
        let id = match ns {
            None => None,
            Some(v) => Some(v.as_namespace_id().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Type metatable must be a namespace, not a '{}'",
                    v.type_name()
                ))
            })?),
        };
        self.type_metatables[ty as usize] = id;
        Ok(())
    }

    pub fn type_metatable(&self, ty: CrocType) -> Option<Value> {
        self.type_metatables[ty as usize].map(Value::namespace)
    }

    // ============ GC ============

    /// Pins a value as a GC root for the host.
    pub fn pin(&mut self, v: Value) {
        self.temp_roots.push(v);
    }

    pub fn unpin(&mut self, v: Value) {
        if let Some(pos) = self.temp_roots.iter().rposition(|r| r.identical(&v)) {
            self.temp_roots.remove(pos);
        }
    }

    /// Collects if allocation debt says a cycle is due. Called by the
    /// dispatch loop at every allocating opcode.
    pub fn maybe_collect(&mut self) {
        if self.heap.needs_collect() {
            self.collect_garbage();
        }
    }

    /// Stop-the-world collection; returns objects reclaimed.
    pub fn collect_garbage(&mut self) -> usize {
        let mut roots: Vec<GcId> = Vec::with_capacity(8 + self.temp_roots.len());
        roots.push(GcId::Namespace(self.globals));
        roots.push(GcId::Thread(self.main_thread));
        roots.push(GcId::Thread(self.cur_thread));
        for mt in self.type_metatables.iter().flatten() {
            roots.push(GcId::Namespace(*mt));
        }
        for v in &self.temp_roots {
            if let Some(id) = v.gc_id() {
                roots.push(id);
            }
        }
        if let Some(ex) = &self.pending_ex {
            if let Some(v) = ex.value {
                if let Some(id) = v.gc_id() {
                    roots.push(id);
                }
            }
        }
        self.heap.collect(&roots)
    }

    pub fn heap_bytes(&self) -> usize {
        self.heap.total_bytes()
    }

    // ============ Doc introspection ============

    #[cfg(feature = "docs")]
    pub fn funcdef_docs(&self, def: FuncDefId) -> Option<&str> {
        self.heap[def].docs.as_deref()
    }
}

impl Default for CrocVm {
    fn default() -> Self {
        Self::new()
    }
}
