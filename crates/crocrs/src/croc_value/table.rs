use crate::croc_value::Value;
use ahash::RandomState;
use indexmap::IndexMap;

/// Hash table object built on indexmap + ahash: fast hashing plus stable
/// insertion order for iteration.
///
/// Null keys are rejected by the VM layer before reaching here; storing a
/// null value removes the key.
pub struct Table {
    map: IndexMap<Value, Value, RandomState>,
}

impl Table {
    pub fn new() -> Self {
        Self { map: IndexMap::with_capacity_and_hasher(0, RandomState::new()) }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Missing keys read as null.
    #[inline(always)]
    pub fn get(&self, key: &Value) -> Value {
        self.map.get(key).copied().unwrap_or(Value::null())
    }

    #[inline(always)]
    pub fn contains(&self, key: &Value) -> bool {
        self.map.contains_key(key)
    }

    pub fn set(&mut self, key: Value, val: Value) {
        if val.is_null() {
            self.map.shift_remove(&key);
        } else {
            self.map.insert(key, val);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.map.iter()
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}
