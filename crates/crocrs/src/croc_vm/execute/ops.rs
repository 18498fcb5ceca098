// Generic index/field/slice/length/concatenation operations, with
// metamethod fallback where a container type has no built-in behavior.

use crate::croc_value::{Array, CrocType, Value};
use crate::croc_vm::execute::metamethod::{call_metamethod, get_metamethod, MetaMethod};
use crate::croc_vm::{CrocError, CrocResult, CrocVm};
use crate::gc::{GcId, StringId, ThreadId};

/// Negative indices wrap once; anything still out of range is None.
fn resolve_index(idx: i64, len: usize) -> Option<usize> {
    let idx = if idx < 0 { idx + len as i64 } else { idx };
    if idx < 0 || idx as usize >= len {
        None
    } else {
        Some(idx as usize)
    }
}

/// Slice bounds: null means the end it sits at, negatives wrap, and the
/// resolved pair must satisfy `lo <= hi <= len`.
fn resolve_slice(lo: Value, hi: Value, len: usize, what: &str) -> CrocResult<(usize, usize)> {
    let lo_i = match lo.kind() {
        CrocType::Null => 0,
        CrocType::Int => lo.secondary as i64,
        _ => {
            return Err(CrocError::type_error(format!(
                "Attempting to slice a {} with a '{}' low index",
                what,
                lo.type_name()
            )))
        }
    };
    let hi_i = match hi.kind() {
        CrocType::Null => len as i64,
        CrocType::Int => hi.secondary as i64,
        _ => {
            return Err(CrocError::type_error(format!(
                "Attempting to slice a {} with a '{}' high index",
                what,
                hi.type_name()
            )))
        }
    };

    let lo_i = if lo_i < 0 { lo_i + len as i64 } else { lo_i };
    let hi_i = if hi_i < 0 { hi_i + len as i64 } else { hi_i };

    if lo_i < 0 || hi_i < lo_i || hi_i > len as i64 {
        return Err(CrocError::bounds_error(format!(
            "Invalid {} slice indices: {} .. {} (length {})",
            what, lo_i, hi_i, len
        )));
    }
    Ok((lo_i as usize, hi_i as usize))
}

pub fn idx(vm: &mut CrocVm, tid: ThreadId, dest: usize, container: Value, key: Value) -> CrocResult<()> {
    let result = match container.kind() {
        CrocType::Array => {
            let aid = container.as_array_id().ok_or_else(|| CrocError::vm_error("bad array"))?;
            let key_i = key.as_int().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Attempting to index an array with a '{}'",
                    key.type_name()
                ))
            })?;
            let arr = &vm.heap[aid];
            match resolve_index(key_i, arr.len()) {
                Some(i) => arr.get(i).unwrap_or(Value::null()),
                None => {
                    return Err(CrocError::bounds_error(format!(
                        "Invalid array index {} (length {})",
                        key_i,
                        arr.len()
                    )))
                }
            }
        }
        CrocType::Memblock => {
            let mid = container.as_memblock_id().ok_or_else(|| CrocError::vm_error("bad memblock"))?;
            let key_i = key.as_int().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Attempting to index a memblock with a '{}'",
                    key.type_name()
                ))
            })?;
            let mb = &vm.heap[mid];
            match resolve_index(key_i, mb.data.len()) {
                Some(i) => Value::int(mb.data[i] as i64),
                None => {
                    return Err(CrocError::bounds_error(format!(
                        "Invalid memblock index {} (length {})",
                        key_i,
                        mb.data.len()
                    )))
                }
            }
        }
        CrocType::Table => {
            if key.is_null() {
                return Err(CrocError::type_error("Attempting to index a table with a null key"));
            }
            let id = container.as_table_id().ok_or_else(|| CrocError::vm_error("bad table"))?;
            vm.heap[id].get(&key)
        }
        CrocType::String => {
            let sid = container.as_string_id().ok_or_else(|| CrocError::vm_error("bad string"))?;
            let key_i = key.as_int().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Attempting to index a string with a '{}'",
                    key.type_name()
                ))
            })?;
            let (ch, len) = {
                let s = vm.heap.str(sid);
                (resolve_index(key_i, s.len()).map(|i| s.as_bytes()[i]), s.len())
            };
            match ch {
                Some(b) => {
                    let s = (b as char).to_string();
                    vm.new_string(&s)
                }
                None => {
                    return Err(CrocError::bounds_error(format!(
                        "Invalid string index {} (length {})",
                        key_i, len
                    )))
                }
            }
        }
        _ => match get_metamethod(vm, container, MetaMethod::Index) {
            Some(method) => call_metamethod(vm, tid, method, container, &[key])?,
            None => {
                return Err(CrocError::type_error(format!(
                    "Attempting to index a value of type '{}'",
                    container.type_name()
                )))
            }
        },
    };

    vm.heap[tid].stack[dest] = result;
    Ok(())
}

pub fn idxa(vm: &mut CrocVm, tid: ThreadId, container: Value, key: Value, val: Value) -> CrocResult<()> {
    match container.kind() {
        CrocType::Array => {
            let aid = container.as_array_id().ok_or_else(|| CrocError::vm_error("bad array"))?;
            let key_i = key.as_int().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Attempting to index-assign an array with a '{}'",
                    key.type_name()
                ))
            })?;
            let len = vm.heap[aid].len();
            match resolve_index(key_i, len) {
                Some(i) => {
                    vm.heap.barrier_back(GcId::Array(aid));
                    vm.heap[aid].set(i, val);
                    Ok(())
                }
                None => Err(CrocError::bounds_error(format!(
                    "Invalid array index {} (length {})",
                    key_i, len
                ))),
            }
        }
        CrocType::Memblock => {
            let mid = container.as_memblock_id().ok_or_else(|| CrocError::vm_error("bad memblock"))?;
            let key_i = key.as_int().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Attempting to index-assign a memblock with a '{}'",
                    key.type_name()
                ))
            })?;
            let byte = val.as_int().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Attempting to store a '{}' in a memblock",
                    val.type_name()
                ))
            })?;
            if !(0..=255).contains(&byte) {
                return Err(CrocError::value_error(format!(
                    "Memblock value {} out of byte range",
                    byte
                )));
            }
            let len = vm.heap[mid].data.len();
            match resolve_index(key_i, len) {
                Some(i) => {
                    vm.heap[mid].data[i] = byte as u8;
                    Ok(())
                }
                None => Err(CrocError::bounds_error(format!(
                    "Invalid memblock index {} (length {})",
                    key_i, len
                ))),
            }
        }
        CrocType::Table => {
            if key.is_null() {
                return Err(CrocError::type_error(
                    "Attempting to index-assign a table with a null key",
                ));
            }
            let id = container.as_table_id().ok_or_else(|| CrocError::vm_error("bad table"))?;
            vm.heap.barrier_back(GcId::Table(id));
            vm.heap[id].set(key, val);
            Ok(())
        }
        _ => match get_metamethod(vm, container, MetaMethod::IndexAssign) {
            Some(method) => {
                call_metamethod(vm, tid, method, container, &[key, val])?;
                Ok(())
            }
            None => Err(CrocError::type_error(format!(
                "Attempting to index-assign a value of type '{}'",
                container.type_name()
            ))),
        },
    }
}

pub fn field(vm: &mut CrocVm, tid: ThreadId, dest: usize, obj: Value, name: StringId) -> CrocResult<()> {
    let result = field_value(vm, tid, obj, name)?;
    vm.heap[tid].stack[dest] = result;
    Ok(())
}

pub fn field_value(vm: &mut CrocVm, tid: ThreadId, obj: Value, name: StringId) -> CrocResult<Value> {
    match obj.kind() {
        CrocType::Table => {
            let id = obj.as_table_id().ok_or_else(|| CrocError::vm_error("bad table"))?;
            Ok(vm.heap[id].get(&Value::string(name)))
        }
        CrocType::Namespace => {
            let id = obj.as_namespace_id().ok_or_else(|| CrocError::vm_error("bad namespace"))?;
            match vm.heap[id].get(name) {
                Some(v) => Ok(v),
                None => {
                    let field_name = vm.heap.str(name).to_string();
                    let ns_name = vm.heap.str(vm.heap[id].name).to_string();
                    Err(CrocError::field_error(format!(
                        "Attempting to access nonexistent field '{}' from namespace '{}'",
                        field_name, ns_name
                    )))
                }
            }
        }
        CrocType::Class => {
            let id = obj.as_class_id().ok_or_else(|| CrocError::vm_error("bad class"))?;
            let cls = &vm.heap[id];
            if let Some(v) = cls.get_method(name).or_else(|| cls.get_field(name)) {
                return Ok(v);
            }
            let field_name = vm.heap.str(name).to_string();
            let cls_name = vm.heap.str(vm.heap[id].name).to_string();
            Err(CrocError::field_error(format!(
                "Attempting to access nonexistent field '{}' from class '{}'",
                field_name, cls_name
            )))
        }
        CrocType::Instance => {
            let id = obj.as_instance_id().ok_or_else(|| CrocError::vm_error("bad instance"))?;
            let inst = &vm.heap[id];
            if let Some(v) = inst.get_field(name) {
                return Ok(v);
            }
            let cls_id = inst.class;
            if let Some(v) = vm.heap[cls_id].get_method(name) {
                return Ok(v);
            }
            if let Some(method) = get_metamethod(vm, obj, MetaMethod::Field) {
                let name_val = Value::string(name);
                return call_metamethod(vm, tid, method, obj, &[name_val]);
            }
            let field_name = vm.heap.str(name).to_string();
            let cls_name = vm.heap.str(vm.heap[cls_id].name).to_string();
            Err(CrocError::field_error(format!(
                "Attempting to access nonexistent field '{}' from instance of class '{}'",
                field_name, cls_name
            )))
        }
        _ => match get_metamethod(vm, obj, MetaMethod::Field) {
            Some(method) => {
                let name_val = Value::string(name);
                call_metamethod(vm, tid, method, obj, &[name_val])
            }
            None => {
                let field_name = vm.heap.str(name).to_string();
                Err(CrocError::type_error(format!(
                    "Attempting to access field '{}' from a value of type '{}'",
                    field_name,
                    obj.type_name()
                )))
            }
        },
    }
}

pub fn fielda(vm: &mut CrocVm, tid: ThreadId, obj: Value, name: StringId, val: Value) -> CrocResult<()> {
    match obj.kind() {
        CrocType::Table => {
            let id = obj.as_table_id().ok_or_else(|| CrocError::vm_error("bad table"))?;
            vm.heap.barrier_back(GcId::Table(id));
            vm.heap[id].set(Value::string(name), val);
            Ok(())
        }
        CrocType::Namespace => {
            let id = obj.as_namespace_id().ok_or_else(|| CrocError::vm_error("bad namespace"))?;
            vm.heap.barrier_back(GcId::Namespace(id));
            vm.heap[id].set(name, val);
            Ok(())
        }
        CrocType::Class => {
            let id = obj.as_class_id().ok_or_else(|| CrocError::vm_error("bad class"))?;
            vm.heap.barrier_back(GcId::Class(id));
            if vm.heap[id].set_field(name, val) {
                return Ok(());
            }
            let field_name = vm.heap.str(name).to_string();
            let cls_name = vm.heap.str(vm.heap[id].name).to_string();
            Err(CrocError::field_error(format!(
                "Attempting to assign to nonexistent field '{}' in class '{}'",
                field_name, cls_name
            )))
        }
        CrocType::Instance => {
            let id = obj.as_instance_id().ok_or_else(|| CrocError::vm_error("bad instance"))?;
            vm.heap.barrier_back(GcId::Instance(id));
            if vm.heap[id].set_field(name, val) {
                return Ok(());
            }
            if let Some(method) = get_metamethod(vm, obj, MetaMethod::FieldAssign) {
                let name_val = Value::string(name);
                call_metamethod(vm, tid, method, obj, &[name_val, val])?;
                return Ok(());
            }
            let field_name = vm.heap.str(name).to_string();
            Err(CrocError::field_error(format!(
                "Attempting to assign to nonexistent field '{}'",
                field_name
            )))
        }
        _ => match get_metamethod(vm, obj, MetaMethod::FieldAssign) {
            Some(method) => {
                let name_val = Value::string(name);
                call_metamethod(vm, tid, method, obj, &[name_val, val])?;
                Ok(())
            }
            None => {
                let field_name = vm.heap.str(name).to_string();
                Err(CrocError::type_error(format!(
                    "Attempting to assign field '{}' into a value of type '{}'",
                    field_name,
                    obj.type_name()
                )))
            }
        },
    }
}

pub fn length(vm: &mut CrocVm, tid: ThreadId, dest: usize, src: Value) -> CrocResult<()> {
    let len = match src.kind() {
        CrocType::String => {
            let id = src.as_string_id().ok_or_else(|| CrocError::vm_error("bad string"))?;
            vm.heap.str(id).len() as i64
        }
        CrocType::Array => {
            let id = src.as_array_id().ok_or_else(|| CrocError::vm_error("bad array"))?;
            vm.heap[id].len() as i64
        }
        CrocType::Table => {
            let id = src.as_table_id().ok_or_else(|| CrocError::vm_error("bad table"))?;
            vm.heap[id].len() as i64
        }
        CrocType::Namespace => {
            let id = src.as_namespace_id().ok_or_else(|| CrocError::vm_error("bad namespace"))?;
            vm.heap[id].len() as i64
        }
        CrocType::Memblock => {
            let id = src.as_memblock_id().ok_or_else(|| CrocError::vm_error("bad memblock"))?;
            vm.heap[id].data.len() as i64
        }
        _ => match get_metamethod(vm, src, MetaMethod::Length) {
            Some(method) => {
                let r = call_metamethod(vm, tid, method, src, &[])?;
                vm.heap[tid].stack[dest] = r;
                return Ok(());
            }
            None => {
                return Err(CrocError::type_error(format!(
                    "Cannot get the length of a '{}'",
                    src.type_name()
                )))
            }
        },
    };
    vm.heap[tid].stack[dest] = Value::int(len);
    Ok(())
}

pub fn length_assign(vm: &mut CrocVm, tid: ThreadId, obj: Value, len_val: Value) -> CrocResult<()> {
    match obj.kind() {
        CrocType::Array => {
            let new_len = len_val.as_int().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Attempting to set an array's length to a '{}'",
                    len_val.type_name()
                ))
            })?;
            if new_len < 0 {
                return Err(CrocError::value_error(format!("Invalid array length: {}", new_len)));
            }
            let id = obj.as_array_id().ok_or_else(|| CrocError::vm_error("bad array"))?;
            vm.heap.barrier_back(GcId::Array(id));
            vm.heap[id].set_len(new_len as usize);
            Ok(())
        }
        CrocType::Memblock => {
            let new_len = len_val.as_int().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Attempting to set a memblock's length to a '{}'",
                    len_val.type_name()
                ))
            })?;
            if new_len < 0 {
                return Err(CrocError::value_error(format!("Invalid memblock length: {}", new_len)));
            }
            let id = obj.as_memblock_id().ok_or_else(|| CrocError::vm_error("bad memblock"))?;
            vm.heap[id].data.resize(new_len as usize, 0);
            Ok(())
        }
        _ => match get_metamethod(vm, obj, MetaMethod::LengthAssign) {
            Some(method) => {
                call_metamethod(vm, tid, method, obj, &[len_val])?;
                Ok(())
            }
            None => Err(CrocError::type_error(format!(
                "Cannot set the length of a '{}'",
                obj.type_name()
            ))),
        },
    }
}

/// `Slice` reads a 3-slot window: container, lo, hi.
pub fn slice(vm: &mut CrocVm, tid: ThreadId, dest: usize, src_slot: usize) -> CrocResult<()> {
    let (container, lo, hi) = {
        let t = &vm.heap[tid];
        (t.stack[src_slot], t.stack[src_slot + 1], t.stack[src_slot + 2])
    };

    let result = match container.kind() {
        CrocType::String => {
            let id = container.as_string_id().ok_or_else(|| CrocError::vm_error("bad string"))?;
            let (lo_i, hi_i) = {
                let s = vm.heap.str(id);
                resolve_slice(lo, hi, s.len(), "string")?
            };
            let sub = vm.heap.str(id)[lo_i..hi_i].to_string();
            vm.new_string(&sub)
        }
        CrocType::Array => {
            let id = container.as_array_id().ok_or_else(|| CrocError::vm_error("bad array"))?;
            let (lo_i, hi_i) = resolve_slice(lo, hi, vm.heap[id].len(), "array")?;
            let values = vm.heap[id].slice(lo_i, hi_i);
            let new_id = vm.heap.alloc_array(Array::from_values(values));
            Value::array(new_id)
        }
        CrocType::Memblock => {
            let id = container.as_memblock_id().ok_or_else(|| CrocError::vm_error("bad memblock"))?;
            let (lo_i, hi_i) = resolve_slice(lo, hi, vm.heap[id].data.len(), "memblock")?;
            let bytes = vm.heap[id].data[lo_i..hi_i].to_vec();
            let new_id = vm.heap.alloc_memblock(crate::croc_value::Memblock::from_bytes(bytes));
            Value::memblock(new_id)
        }
        _ => match get_metamethod(vm, container, MetaMethod::Slice) {
            Some(method) => call_metamethod(vm, tid, method, container, &[lo, hi])?,
            None => {
                return Err(CrocError::type_error(format!(
                    "Attempting to slice a value of type '{}'",
                    container.type_name()
                )))
            }
        },
    };

    vm.heap[tid].stack[dest] = result;
    Ok(())
}

/// `SliceAssign`: rd is the 3-slot window (container, lo, hi); RS is the
/// replacement. Array targets require equal lengths.
pub fn slice_assign(vm: &mut CrocVm, tid: ThreadId, base_slot: usize, src: Value) -> CrocResult<()> {
    let (container, lo, hi) = {
        let t = &vm.heap[tid];
        (t.stack[base_slot], t.stack[base_slot + 1], t.stack[base_slot + 2])
    };

    match container.kind() {
        CrocType::Array => {
            let id = container.as_array_id().ok_or_else(|| CrocError::vm_error("bad array"))?;
            let (lo_i, hi_i) = resolve_slice(lo, hi, vm.heap[id].len(), "array")?;
            let src_id = src.as_array_id().ok_or_else(|| {
                CrocError::type_error(format!(
                    "Attempting to slice-assign a '{}' into an array",
                    src.type_name()
                ))
            })?;
            let values = vm.heap[src_id].values().to_vec();
            if values.len() != hi_i - lo_i {
                return Err(CrocError::value_error(format!(
                    "Slice-assign length mismatch: {} into {}",
                    values.len(),
                    hi_i - lo_i
                )));
            }
            vm.heap.barrier_back(GcId::Array(id));
            vm.heap[id].set_slice(lo_i, &values);
            Ok(())
        }
        _ => match get_metamethod(vm, container, MetaMethod::SliceAssign) {
            Some(method) => {
                call_metamethod(vm, tid, method, container, &[lo, hi, src])?;
                Ok(())
            }
            None => Err(CrocError::type_error(format!(
                "Attempting to slice-assign a value of type '{}'",
                container.type_name()
            ))),
        },
    }
}

fn cat_pair(vm: &mut CrocVm, tid: ThreadId, lhs: Value, rhs: Value) -> CrocResult<Value> {
    match (lhs.kind(), rhs.kind()) {
        (CrocType::String, CrocType::String) => {
            let (a, b) = (
                lhs.as_string_id().ok_or_else(|| CrocError::vm_error("bad string"))?,
                rhs.as_string_id().ok_or_else(|| CrocError::vm_error("bad string"))?,
            );
            let mut s = vm.heap.str(a).to_string();
            s.push_str(vm.heap.str(b));
            Ok(vm.new_string(&s))
        }
        (CrocType::Array, _) => {
            let aid = lhs.as_array_id().ok_or_else(|| CrocError::vm_error("bad array"))?;
            let mut values = vm.heap[aid].values().to_vec();
            if let Some(rid) = rhs.as_array_id() {
                values.extend_from_slice(vm.heap[rid].values());
            } else {
                values.push(rhs);
            }
            let new_id = vm.heap.alloc_array(Array::from_values(values));
            Ok(Value::array(new_id))
        }
        _ => match crate::croc_vm::execute::metamethod::try_binary_mm(vm, tid, MetaMethod::Cat, lhs, rhs)? {
            Some(v) => Ok(v),
            None => Err(CrocError::type_error(format!(
                "Attempting to concatenate a '{}' and a '{}'",
                lhs.type_name(),
                rhs.type_name()
            ))),
        },
    }
}

/// `Cat`: left fold of `num_vals` registers starting at `first_slot`.
/// The accumulator is pinned while metamethods run; a nested call may
/// trigger a collection and the intermediate lives only here.
pub fn cat(vm: &mut CrocVm, tid: ThreadId, dest: usize, first_slot: usize, num_vals: usize) -> CrocResult<()> {
    let mut acc = vm.heap[tid].stack[first_slot];
    for i in 1..num_vals {
        let next = vm.heap[tid].stack[first_slot + i];
        vm.temp_roots.push(acc);
        let result = cat_pair(vm, tid, acc, next);
        vm.temp_roots.pop();
        acc = result?;
    }
    vm.heap[tid].stack[dest] = acc;
    Ok(())
}

/// `CatEq`: in-place append for arrays, rebuilt value otherwise.
pub fn cat_eq(vm: &mut CrocVm, tid: ThreadId, dest: usize, first_slot: usize, num_vals: usize) -> CrocResult<()> {
    let target = vm.heap[tid].stack[dest];

    if let Some(aid) = target.as_array_id() {
        vm.heap.barrier_back(GcId::Array(aid));
        for i in 0..num_vals {
            let v = vm.heap[tid].stack[first_slot + i];
            if let Some(rid) = v.as_array_id() {
                let values = vm.heap[rid].values().to_vec();
                vm.heap[aid].extend_from(&values);
            } else {
                vm.heap[aid].append(v);
            }
        }
        return Ok(());
    }

    if target.is_string() {
        let mut acc = target;
        for i in 0..num_vals {
            let v = vm.heap[tid].stack[first_slot + i];
            vm.temp_roots.push(acc);
            let result = cat_pair(vm, tid, acc, v);
            vm.temp_roots.pop();
            acc = result?;
        }
        vm.heap[tid].stack[dest] = acc;
        return Ok(());
    }

    if let Some(method) = get_metamethod(vm, target, MetaMethod::CatAssign) {
        let args: Vec<Value> = {
            let t = &vm.heap[tid];
            t.stack[first_slot..first_slot + num_vals].to_vec()
        };
        call_metamethod(vm, tid, method, target, &args)?;
        return Ok(());
    }

    Err(CrocError::type_error(format!(
        "Attempting to concatenate-assign into a '{}'",
        target.type_name()
    )))
}

/// `superOf`: class of an instance, first base of a class, parent of a
/// namespace.
pub fn super_of(vm: &CrocVm, val: Value) -> CrocResult<Value> {
    match val.kind() {
        CrocType::Instance => {
            let id = val.as_instance_id().ok_or_else(|| CrocError::vm_error("bad instance"))?;
            Ok(Value::class(vm.heap[id].class))
        }
        CrocType::Class => {
            let id = val.as_class_id().ok_or_else(|| CrocError::vm_error("bad class"))?;
            Ok(match vm.heap[id].base {
                Some(base) => Value::class(base),
                None => Value::null(),
            })
        }
        CrocType::Namespace => {
            let id = val.as_namespace_id().ok_or_else(|| CrocError::vm_error("bad namespace"))?;
            Ok(match vm.heap[id].parent {
                Some(parent) => Value::namespace(parent),
                None => Value::null(),
            })
        }
        _ => Err(CrocError::type_error(format!(
            "Cannot get the super of a '{}'",
            val.type_name()
        ))),
    }
}
