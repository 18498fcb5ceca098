use crate::croc_value::Value;
use crate::gc::{ClassId, StringId};
use ahash::RandomState;
use indexmap::IndexMap;

/// Class object: named method and field maps plus a base-class link.
/// Deriving copies the base's members so lookup never walks the chain;
/// the chain is kept for `derivesFrom` and `superOf`.
pub struct Class {
    pub name: StringId,
    pub base: Option<ClassId>,
    methods: IndexMap<StringId, Value, RandomState>,
    fields: IndexMap<StringId, Value, RandomState>,
}

impl Class {
    pub fn new(name: StringId) -> Self {
        Self {
            name,
            base: None,
            methods: IndexMap::with_capacity_and_hasher(0, RandomState::new()),
            fields: IndexMap::with_capacity_and_hasher(0, RandomState::new()),
        }
    }

    /// Succeeds iff the name's presence matches the override flag.
    pub fn add_method(&mut self, name: StringId, val: Value, is_override: bool) -> bool {
        if self.methods.contains_key(&name) != is_override {
            return false;
        }
        self.methods.insert(name, val);
        true
    }

    /// Succeeds iff the name's presence matches the override flag.
    pub fn add_field(&mut self, name: StringId, val: Value, is_override: bool) -> bool {
        if self.fields.contains_key(&name) != is_override {
            return false;
        }
        self.fields.insert(name, val);
        true
    }

    #[inline(always)]
    pub fn get_method(&self, name: StringId) -> Option<Value> {
        self.methods.get(&name).copied()
    }

    #[inline(always)]
    pub fn get_field(&self, name: StringId) -> Option<Value> {
        self.fields.get(&name).copied()
    }

    pub fn set_field(&mut self, name: StringId, val: Value) -> bool {
        match self.fields.get_mut(&name) {
            Some(slot) => {
                *slot = val;
                true
            }
            None => false,
        }
    }

    pub fn has_member(&self, name: StringId) -> bool {
        self.methods.contains_key(&name) || self.fields.contains_key(&name)
    }

    /// Copies the base's members in and records the derivation link.
    pub fn derive_from(&mut self, base_id: ClassId, base: &Class) {
        for (k, v) in base.methods.iter() {
            self.methods.insert(*k, *v);
        }
        for (k, v) in base.fields.iter() {
            self.fields.insert(*k, *v);
        }
        self.base = Some(base_id);
    }

    pub fn field_defaults(&self) -> impl Iterator<Item = (&StringId, &Value)> {
        self.fields.iter()
    }

    pub fn methods(&self) -> impl Iterator<Item = (&StringId, &Value)> {
        self.methods.iter()
    }
}

/// Instance: a class pointer plus its own copy of the field map.
pub struct Instance {
    pub class: ClassId,
    fields: IndexMap<StringId, Value, RandomState>,
}

impl Instance {
    pub fn new(class_id: ClassId, class: &Class) -> Self {
        let mut fields = IndexMap::with_capacity_and_hasher(0, RandomState::new());
        for (k, v) in class.field_defaults() {
            fields.insert(*k, *v);
        }
        Self { class: class_id, fields }
    }

    #[inline(always)]
    pub fn get_field(&self, name: StringId) -> Option<Value> {
        self.fields.get(&name).copied()
    }

    pub fn set_field(&mut self, name: StringId, val: Value) -> bool {
        match self.fields.get_mut(&name) {
            Some(slot) => {
                *slot = val;
                true
            }
            None => false,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&StringId, &Value)> {
        self.fields.iter()
    }
}
