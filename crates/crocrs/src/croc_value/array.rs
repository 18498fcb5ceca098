use crate::croc_value::Value;

/// Mutable value vector. Bounds and type policing happens at the VM layer
/// so the error messages can name the operation; these methods only do the
/// storage work.
pub struct Array {
    data: Vec<Value>,
}

impl Array {
    pub fn new(size: usize) -> Self {
        Self { data: vec![Value::null(); size] }
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self { data: values }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Truncates or extends with null.
    pub fn set_len(&mut self, new_len: usize) {
        self.data.resize(new_len, Value::null());
    }

    #[inline(always)]
    pub fn get(&self, idx: usize) -> Option<Value> {
        self.data.get(idx).copied()
    }

    #[inline(always)]
    pub fn set(&mut self, idx: usize, val: Value) -> bool {
        match self.data.get_mut(idx) {
            Some(slot) => {
                *slot = val;
                true
            }
            None => false,
        }
    }

    pub fn append(&mut self, val: Value) {
        self.data.push(val);
    }

    pub fn extend_from(&mut self, values: &[Value]) {
        self.data.extend_from_slice(values);
    }

    /// Writes `values` starting at element `offset`, growing as needed.
    /// Used by array literal construction (`SetArray`).
    pub fn set_block(&mut self, offset: usize, values: &[Value]) {
        let end = offset + values.len();
        if end > self.data.len() {
            self.data.resize(end, Value::null());
        }
        self.data[offset..end].copy_from_slice(values);
    }

    pub fn slice(&self, lo: usize, hi: usize) -> Vec<Value> {
        self.data[lo..hi].to_vec()
    }

    /// Replaces `lo..hi` with `values`; caller guarantees equal lengths.
    pub fn set_slice(&mut self, lo: usize, values: &[Value]) {
        self.data[lo..lo + values.len()].copy_from_slice(values);
    }

    pub fn contains(&self, val: Value) -> bool {
        self.data.iter().any(|v| v.identical(&val))
    }

    pub fn values(&self) -> &[Value] {
        &self.data
    }
}
