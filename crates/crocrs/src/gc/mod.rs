// Managed heap for the Croc VM.
//
// The interpreter core needs three things from this module: allocate,
// write barrier, maybe-collect. The collector behind them is a
// stop-the-world mark-sweep driven by an allocation-debt counter; the
// back barrier records owners mutated since the last cycle so a future
// incremental mode can re-scan them without a full root walk.

mod gc_id;
mod object_pool;
mod string_interner;

pub use gc_id::*;
pub use object_pool::Pool;
pub use string_interner::{CrocString, StringInterner};

use crate::croc_value::{
    Array, Class, FuncDef, FuncKind, Function, Instance, Memblock, Namespace, NativeObj, Table,
    Thread, Upvalue, Value, WeakRef,
};
use ahash::RandomState;
use std::collections::HashSet;
use std::rc::Rc;

/// Allocation credit before the first collection, and after each one.
const INITIAL_DEBT: isize = -(64 * 1024);

pub struct GcHeap {
    pub strings: Pool<CrocString>,
    pub tables: Pool<Table>,
    pub arrays: Pool<Array>,
    pub namespaces: Pool<Namespace>,
    pub functions: Pool<Function>,
    pub funcdefs: Pool<Rc<FuncDef>>,
    pub classes: Pool<Class>,
    pub instances: Pool<Instance>,
    pub upvalues: Pool<Upvalue>,
    pub threads: Pool<Thread>,
    pub weakrefs: Pool<WeakRef>,
    pub memblocks: Pool<Memblock>,
    pub nativeobjs: Pool<NativeObj>,

    interner: StringInterner,

    /// Bytes allocated since the last collection, minus credit.
    gc_debt: isize,
    total_bytes: usize,
    /// Owners mutated since the last cycle (back barrier).
    grayagain: Vec<GcId>,
    /// Objects never collected (globals, pre-interned names).
    fixed: Vec<GcId>,

    pub collection_count: usize,
}

impl GcHeap {
    pub fn new() -> Self {
        Self {
            strings: Pool::new(),
            tables: Pool::new(),
            arrays: Pool::new(),
            namespaces: Pool::new(),
            functions: Pool::new(),
            funcdefs: Pool::new(),
            classes: Pool::new(),
            instances: Pool::new(),
            upvalues: Pool::new(),
            threads: Pool::new(),
            weakrefs: Pool::new(),
            memblocks: Pool::new(),
            nativeobjs: Pool::new(),
            interner: StringInterner::new(),
            gc_debt: INITIAL_DEBT,
            total_bytes: 0,
            grayagain: Vec::new(),
            fixed: Vec::new(),
            collection_count: 0,
        }
    }

    // ============ Allocation ============

    #[inline]
    fn track(&mut self, size: usize) {
        self.total_bytes += size;
        self.gc_debt += size as isize;
    }

    pub fn intern(&mut self, s: &str) -> StringId {
        let before = self.strings.len();
        let id = self.interner.intern(s, &mut self.strings);
        if self.strings.len() > before {
            self.track(std::mem::size_of::<CrocString>() + s.len());
        }
        id
    }

    #[inline(always)]
    pub fn str(&self, id: StringId) -> &str {
        self.strings.get(id.0).map(|s| &*s.data).unwrap_or("")
    }

    pub fn alloc_table(&mut self) -> TableId {
        self.track(std::mem::size_of::<Table>() + 64);
        TableId(self.tables.alloc(Table::new()))
    }

    pub fn alloc_array(&mut self, arr: Array) -> ArrayId {
        self.track(std::mem::size_of::<Array>() + arr.len() * std::mem::size_of::<Value>());
        ArrayId(self.arrays.alloc(arr))
    }

    pub fn alloc_namespace(&mut self, ns: Namespace) -> NamespaceId {
        self.track(std::mem::size_of::<Namespace>() + 64);
        NamespaceId(self.namespaces.alloc(ns))
    }

    pub fn alloc_function(&mut self, f: Function) -> FunctionId {
        self.track(std::mem::size_of::<Function>() + 32);
        FunctionId(self.functions.alloc(f))
    }

    pub fn alloc_funcdef(&mut self, def: FuncDef) -> FuncDefId {
        let size = std::mem::size_of::<FuncDef>()
            + def.code.len() * 16
            + def.constants.len() * std::mem::size_of::<Value>();
        self.track(size);
        FuncDefId(self.funcdefs.alloc(Rc::new(def)))
    }

    pub fn alloc_class(&mut self, cls: Class) -> ClassId {
        self.track(std::mem::size_of::<Class>() + 64);
        ClassId(self.classes.alloc(cls))
    }

    pub fn alloc_instance(&mut self, inst: Instance) -> InstanceId {
        self.track(std::mem::size_of::<Instance>() + 64);
        InstanceId(self.instances.alloc(inst))
    }

    pub fn alloc_upvalue(&mut self, uv: Upvalue) -> UpvalueId {
        self.track(std::mem::size_of::<Upvalue>());
        UpvalueId(self.upvalues.alloc(uv))
    }

    pub fn alloc_thread(&mut self, t: Thread) -> ThreadId {
        self.track(std::mem::size_of::<Thread>() + 1024);
        ThreadId(self.threads.alloc(t))
    }

    pub fn alloc_weakref(&mut self, w: WeakRef) -> WeakRefId {
        self.track(std::mem::size_of::<WeakRef>());
        WeakRefId(self.weakrefs.alloc(w))
    }

    pub fn alloc_memblock(&mut self, m: Memblock) -> MemblockId {
        self.track(std::mem::size_of::<Memblock>() + m.data.len());
        MemblockId(self.memblocks.alloc(m))
    }

    pub fn alloc_nativeobj(&mut self, o: NativeObj) -> NativeObjId {
        self.track(std::mem::size_of::<NativeObj>() + 32);
        NativeObjId(self.nativeobjs.alloc(o))
    }

    // ============ Barrier and pacing ============

    /// Back barrier: record a heap owner about to receive a publishable
    /// write (upvalue store, namespace store, class member set, table set,
    /// array set).
    #[inline(always)]
    pub fn barrier_back(&mut self, owner: GcId) {
        self.grayagain.push(owner);
    }

    /// Pin an object for the lifetime of the VM.
    pub fn fix(&mut self, id: GcId) {
        self.fixed.push(id);
    }

    /// True once allocation debt says a collection is due.
    #[inline(always)]
    pub fn needs_collect(&self) -> bool {
        self.gc_debt > 0
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    // ============ Collection ============

    /// Full mark-sweep from `roots` plus the fixed set and barrier log.
    /// Returns the number of objects reclaimed. Safe to call with nothing
    /// to reclaim.
    pub fn collect(&mut self, roots: &[GcId]) -> usize {
        let mut marked: HashSet<GcId, RandomState> =
            HashSet::with_capacity_and_hasher(256, RandomState::new());
        let mut gray: Vec<GcId> = Vec::with_capacity(roots.len() + self.fixed.len());

        for &r in roots {
            if marked.insert(r) {
                gray.push(r);
            }
        }
        for &r in &self.fixed {
            if marked.insert(r) {
                gray.push(r);
            }
        }
        for &r in &self.grayagain {
            if marked.insert(r) {
                gray.push(r);
            }
        }
        self.grayagain.clear();

        while let Some(id) = gray.pop() {
            self.trace(id, &mut marked, &mut gray);
        }

        // Clear weak references to dead objects before the sweep.
        let weak_ids: Vec<u32> = self.weakrefs.live_ids().collect();
        for wid in weak_ids {
            if let Some(w) = self.weakrefs.get_mut(wid) {
                if let Some(target) = w.target {
                    if !marked.contains(&target) {
                        w.target = None;
                    }
                }
            }
        }

        let reclaimed = self.sweep(&marked);
        self.collection_count += 1;
        self.gc_debt = INITIAL_DEBT;
        reclaimed
    }

    fn trace(&self, id: GcId, marked: &mut HashSet<GcId, RandomState>, gray: &mut Vec<GcId>) {
        let mark_id = |id: GcId, marked: &mut HashSet<GcId, RandomState>, gray: &mut Vec<GcId>| {
            if marked.insert(id) {
                gray.push(id);
            }
        };
        let mark_val = |v: &Value, marked: &mut HashSet<GcId, RandomState>, gray: &mut Vec<GcId>| {
            if let Some(id) = v.gc_id() {
                if marked.insert(id) {
                    gray.push(id);
                }
            }
        };

        match id {
            GcId::String(_) | GcId::Memblock(_) | GcId::NativeObj(_) | GcId::WeakRef(_) => {}
            GcId::Table(tid) => {
                if let Some(t) = self.tables.get(tid.0) {
                    for (k, v) in t.iter() {
                        mark_val(k, marked, gray);
                        mark_val(v, marked, gray);
                    }
                }
            }
            GcId::Array(aid) => {
                if let Some(a) = self.arrays.get(aid.0) {
                    for v in a.values() {
                        mark_val(v, marked, gray);
                    }
                }
            }
            GcId::Namespace(nid) => {
                if let Some(ns) = self.namespaces.get(nid.0) {
                    mark_id(GcId::String(ns.name), marked, gray);
                    if let Some(parent) = ns.parent {
                        mark_id(GcId::Namespace(parent), marked, gray);
                    }
                    for (k, v) in ns.iter() {
                        mark_id(GcId::String(*k), marked, gray);
                        mark_val(v, marked, gray);
                    }
                }
            }
            GcId::Function(fid) => {
                if let Some(f) = self.functions.get(fid.0) {
                    mark_id(GcId::String(f.name), marked, gray);
                    if let FuncKind::Script { def, env, upvals } = &f.kind {
                        mark_id(GcId::FuncDef(*def), marked, gray);
                        mark_id(GcId::Namespace(*env), marked, gray);
                        for uv in upvals {
                            mark_id(GcId::Upvalue(*uv), marked, gray);
                        }
                    }
                }
            }
            GcId::FuncDef(did) => {
                if let Some(def) = self.funcdefs.get(did.0) {
                    mark_id(GcId::String(def.name), marked, gray);
                    for c in &def.constants {
                        mark_val(c, marked, gray);
                    }
                    for inner in &def.inner_funcs {
                        mark_id(GcId::FuncDef(*inner), marked, gray);
                    }
                    for st in &def.switch_tables {
                        for k in st.offsets.keys() {
                            mark_val(k, marked, gray);
                        }
                    }
                }
            }
            GcId::Class(cid) => {
                if let Some(c) = self.classes.get(cid.0) {
                    mark_id(GcId::String(c.name), marked, gray);
                    if let Some(base) = c.base {
                        mark_id(GcId::Class(base), marked, gray);
                    }
                    for (k, v) in c.methods() {
                        mark_id(GcId::String(*k), marked, gray);
                        mark_val(v, marked, gray);
                    }
                    for (k, v) in c.field_defaults() {
                        mark_id(GcId::String(*k), marked, gray);
                        mark_val(v, marked, gray);
                    }
                }
            }
            GcId::Instance(iid) => {
                if let Some(i) = self.instances.get(iid.0) {
                    mark_id(GcId::Class(i.class), marked, gray);
                    for (k, v) in i.fields() {
                        mark_id(GcId::String(*k), marked, gray);
                        mark_val(v, marked, gray);
                    }
                }
            }
            GcId::Upvalue(uid) => {
                if let Some(uv) = self.upvalues.get(uid.0) {
                    match uv {
                        // The slot an open upvalue points at stays live
                        // through the owning thread's stack.
                        Upvalue::Open { thread, .. } => {
                            mark_id(GcId::Thread(*thread), marked, gray)
                        }
                        Upvalue::Closed(v) => mark_val(v, marked, gray),
                    }
                }
            }
            GcId::Thread(tid) => {
                if let Some(t) = self.threads.get(tid.0) {
                    for v in &t.stack[..t.stack_index.min(t.stack.len())] {
                        mark_val(v, marked, gray);
                    }
                    for v in &t.results {
                        mark_val(v, marked, gray);
                    }
                    for v in &t.transfer {
                        mark_val(v, marked, gray);
                    }
                    for ar in &t.ars {
                        mark_id(GcId::Function(ar.func), marked, gray);
                    }
                    for uv in &t.open_upvalues {
                        mark_id(GcId::Upvalue(*uv), marked, gray);
                    }
                    if let Some(f) = t.main_func {
                        mark_id(GcId::Function(f), marked, gray);
                    }
                    if let Some(h) = &t.hook_func {
                        mark_val(h, marked, gray);
                    }
                    if let Some(p) = t.parent {
                        mark_id(GcId::Thread(p), marked, gray);
                    }
                }
            }
        }
    }

    fn sweep(&mut self, marked: &HashSet<GcId, RandomState>) -> usize {
        let mut reclaimed = 0;

        macro_rules! sweep_pool {
            ($pool:ident, $variant:ident, $idty:ident) => {{
                let dead: Vec<u32> = self
                    .$pool
                    .live_ids()
                    .filter(|&i| !marked.contains(&GcId::$variant($idty(i))))
                    .collect();
                for i in dead {
                    self.$pool.remove(i);
                    reclaimed += 1;
                }
            }};
        }

        // Strings also drop their interner bucket entries.
        let dead_strings: Vec<u32> = self
            .strings
            .live_ids()
            .filter(|&i| !marked.contains(&GcId::String(StringId(i))))
            .collect();
        for i in dead_strings {
            if let Some(s) = self.strings.remove(i) {
                self.interner.remove_dead(StringId(i), s.hash);
                reclaimed += 1;
            }
        }

        sweep_pool!(tables, Table, TableId);
        sweep_pool!(arrays, Array, ArrayId);
        sweep_pool!(namespaces, Namespace, NamespaceId);
        sweep_pool!(functions, Function, FunctionId);
        sweep_pool!(funcdefs, FuncDef, FuncDefId);
        sweep_pool!(classes, Class, ClassId);
        sweep_pool!(instances, Instance, InstanceId);
        sweep_pool!(upvalues, Upvalue, UpvalueId);
        sweep_pool!(threads, Thread, ThreadId);
        sweep_pool!(weakrefs, WeakRef, WeakRefId);
        sweep_pool!(memblocks, Memblock, MemblockId);
        sweep_pool!(nativeobjs, NativeObj, NativeObjId);

        reclaimed
    }
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new()
    }
}

// Direct indexing by typed id. Ids are only minted by the pools and never
// escape a live object's lifetime, so a miss is a VM bug.
macro_rules! impl_heap_index {
    ($idty:ty, $pool:ident, $out:ty, $what:literal) => {
        impl std::ops::Index<$idty> for GcHeap {
            type Output = $out;
            #[inline(always)]
            fn index(&self, id: $idty) -> &Self::Output {
                self.$pool.get(id.0).expect(concat!("stale ", $what, " id"))
            }
        }
        impl std::ops::IndexMut<$idty> for GcHeap {
            #[inline(always)]
            fn index_mut(&mut self, id: $idty) -> &mut Self::Output {
                self.$pool.get_mut(id.0).expect(concat!("stale ", $what, " id"))
            }
        }
    };
}

impl_heap_index!(TableId, tables, Table, "table");
impl_heap_index!(ArrayId, arrays, Array, "array");
impl_heap_index!(NamespaceId, namespaces, Namespace, "namespace");
impl_heap_index!(FunctionId, functions, Function, "function");
impl_heap_index!(FuncDefId, funcdefs, Rc<FuncDef>, "funcdef");
impl_heap_index!(ClassId, classes, Class, "class");
impl_heap_index!(InstanceId, instances, Instance, "instance");
impl_heap_index!(UpvalueId, upvalues, Upvalue, "upvalue");
impl_heap_index!(ThreadId, threads, Thread, "thread");
impl_heap_index!(WeakRefId, weakrefs, WeakRef, "weakref");
impl_heap_index!(MemblockId, memblocks, Memblock, "memblock");
impl_heap_index!(NativeObjId, nativeobjs, NativeObj, "nativeobj");
