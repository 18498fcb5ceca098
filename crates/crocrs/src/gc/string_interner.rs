use crate::gc::object_pool::Pool;
use crate::gc::StringId;
use ahash::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash, Hasher};

/// Interned string payload.
pub struct CrocString {
    pub data: Box<str>,
    pub hash: u64,
}

/// Complete string interner - every string is interned, so StringId
/// identity is content equality.
/// Content-hash buckets hold candidate ids; the pool holds the payloads.
pub struct StringInterner {
    buckets: HashMap<u64, Vec<StringId>, RandomState>,
    hash_builder: RandomState,
}

impl StringInterner {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::with_capacity_and_hasher(256, RandomState::new()),
            hash_builder: RandomState::new(),
        }
    }

    pub fn intern(&mut self, s: &str, pool: &mut Pool<CrocString>) -> StringId {
        let hash = self.hash_str(s);

        if let Some(ids) = self.buckets.get(&hash) {
            for &id in ids {
                if let Some(existing) = pool.get(id.0) {
                    if &*existing.data == s {
                        return id;
                    }
                }
            }
        }

        let id = StringId(pool.alloc(CrocString { data: s.into(), hash }));
        self.buckets.entry(hash).or_default().push(id);
        id
    }

    /// Drops a dead string's bucket entry. Called by the sweep phase.
    pub fn remove_dead(&mut self, id: StringId, hash: u64) {
        if let Some(ids) = self.buckets.get_mut(&hash) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                self.buckets.remove(&hash);
            }
        }
    }

    #[inline(always)]
    fn hash_str(&self, s: &str) -> u64 {
        let mut hasher = self.hash_builder.build_hasher();
        s.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}
