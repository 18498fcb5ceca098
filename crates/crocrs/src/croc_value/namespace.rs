use crate::croc_value::Value;
use crate::gc::{NamespaceId, StringId};
use ahash::RandomState;
use indexmap::IndexMap;

/// Module-like binding scope: a name, an optional parent for lookup
/// chaining, and an ordered binding map.
pub struct Namespace {
    pub name: StringId,
    pub parent: Option<NamespaceId>,
    bindings: IndexMap<StringId, Value, RandomState>,
}

impl Namespace {
    pub fn new(name: StringId, parent: Option<NamespaceId>) -> Self {
        Self {
            name,
            parent,
            bindings: IndexMap::with_capacity_and_hasher(0, RandomState::new()),
        }
    }

    #[inline(always)]
    pub fn get(&self, name: StringId) -> Option<Value> {
        self.bindings.get(&name).copied()
    }

    #[inline(always)]
    pub fn contains(&self, name: StringId) -> bool {
        self.bindings.contains_key(&name)
    }

    pub fn set(&mut self, name: StringId, val: Value) {
        self.bindings.insert(name, val);
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StringId, &Value)> {
        self.bindings.iter()
    }
}
