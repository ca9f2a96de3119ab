use crate::errors::PolicyError;
use crate::value::value::{TableKey, TableRef, Value};
use indexmap::IndexMap;

/// Two-part container: a dense array part for the integer prefix `1..=n`
/// and an insertion-ordered hash part for everything else. Insertion order
/// makes `next` deterministic, which the chain relies on for replay.
#[derive(Debug, Default)]
pub struct TableObject {
    array: Vec<Value>,
    hash: IndexMap<TableKey, Value>,
    metatable: Option<TableRef>,
    read_only: bool,
}

impl TableObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(array: usize, hash: usize) -> Self {
        Self {
            array: Vec::with_capacity(array),
            hash: IndexMap::with_capacity(hash),
            metatable: None,
            read_only: false,
        }
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable
    }

    pub fn set_metatable(&mut self, metatable: Option<TableRef>) {
        self.metatable = metatable;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn raw_get(&self, key: &TableKey) -> Value {
        if let TableKey::Integer(i) = key {
            if *i >= 1 && (*i as usize) <= self.array.len() {
                return self.array[*i as usize - 1];
            }
        }
        self.hash.get(key).copied().unwrap_or(Value::Nil)
    }

    /// Raw slot assignment. The read-only flag is enforced here so no code
    /// path, metamethod-driven or not, can bypass it.
    pub fn raw_set(&mut self, key: TableKey, value: Value) -> Result<(), PolicyError> {
        if self.read_only {
            return Err(PolicyError::ReadOnlyTableWrite);
        }
        self.raw_set_unchecked(key, value);
        Ok(())
    }

    /// Assignment that ignores the read-only flag. Reserved for the
    /// registry while it assembles contract tables, before sealing them.
    pub fn raw_set_unchecked(&mut self, key: TableKey, value: Value) {
        if let TableKey::Integer(i) = key {
            let i = i;
            if i >= 1 && (i as usize) <= self.array.len() {
                self.array[i as usize - 1] = value;
                if value.is_nil() && i as usize == self.array.len() {
                    while matches!(self.array.last(), Some(Value::Nil)) {
                        self.array.pop();
                    }
                }
                return;
            }
            if i >= 1 && i as usize == self.array.len() + 1 && !value.is_nil() {
                self.array.push(value);
                // pull any hash-resident continuation into the array part
                loop {
                    let next = TableKey::Integer(self.array.len() as i64 + 1);
                    match self.hash.shift_remove(&next) {
                        Some(v) if !v.is_nil() => self.array.push(v),
                        Some(_) | None => break,
                    }
                }
                return;
            }
        }
        if value.is_nil() {
            self.hash.shift_remove(&key);
        } else {
            self.hash.insert(key, value);
        }
    }

    /// The `#` border: an `n` with `t[n] ~= nil` and `t[n+1] == nil`.
    pub fn length(&self) -> i64 {
        if let Some(last) = self.array.last() {
            if !last.is_nil() {
                // array part is full; the border may continue in the hash
                let mut n = self.array.len() as i64;
                while !self.hash.get(&TableKey::Integer(n + 1)).map_or(true, Value::is_nil) {
                    n += 1;
                }
                return n;
            }
            // a nil hole inside the array part: binary search for a border
            let mut lo = 0usize; // t[lo] ~= nil or lo == 0
            let mut hi = self.array.len(); // t[hi] == nil
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                if self.array[mid - 1].is_nil() {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            return lo as i64;
        }
        if self.hash.get(&TableKey::Integer(1)).map_or(true, Value::is_nil) {
            return 0;
        }
        let mut n = 1i64;
        while !self.hash.get(&TableKey::Integer(n + 1)).map_or(true, Value::is_nil) {
            n += 1;
        }
        n
    }

    /// Deterministic traversal for `next`: the array prefix first, then the
    /// hash part in insertion order. `None` key starts the traversal.
    pub fn next_entry(&self, key: Option<&TableKey>) -> Option<(TableKey, Value)> {
        let hash_start = match key {
            None => {
                for (i, v) in self.array.iter().enumerate() {
                    if !v.is_nil() {
                        return Some((TableKey::Integer(i as i64 + 1), *v));
                    }
                }
                0
            }
            Some(TableKey::Integer(i)) if *i >= 1 && (*i as usize) <= self.array.len() => {
                for (j, v) in self.array.iter().enumerate().skip(*i as usize) {
                    if !v.is_nil() {
                        return Some((TableKey::Integer(j as i64 + 1), *v));
                    }
                }
                0
            }
            Some(k) => match self.hash.get_index_of(k) {
                Some(i) => i + 1,
                None => return None,
            },
        };
        self.hash
            .get_index(hash_start)
            .map(|(k, v)| (*k, *v))
    }

    pub fn array_part(&self) -> &[Value] {
        &self.array
    }

    pub fn hash_part(&self) -> &IndexMap<TableKey, Value> {
        &self.hash
    }

    /// True when the key set is exactly `1..=n`, i.e. the table is a
    /// sequence and serialises as an array.
    pub fn is_sequence(&self) -> bool {
        self.hash.is_empty() && self.array.iter().all(|v| !v.is_nil())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Value {
        Value::Integer(i)
    }

    #[test]
    fn test_array_part_growth_and_migration() {
        let mut t = TableObject::new();
        // out-of-order insertion: 2 goes to hash, then 1 pulls it in
        t.raw_set(TableKey::Integer(2), int(20)).unwrap();
        assert_eq!(t.array_part().len(), 0);
        t.raw_set(TableKey::Integer(1), int(10)).unwrap();
        assert_eq!(t.array_part().len(), 2);
        assert_eq!(t.raw_get(&TableKey::Integer(2)), int(20));
        assert_eq!(t.length(), 2);
    }

    #[test]
    fn test_nil_assignment_shrinks_border() {
        let mut t = TableObject::new();
        for i in 1..=4 {
            t.raw_set(TableKey::Integer(i), int(i * 10)).unwrap();
        }
        t.raw_set(TableKey::Integer(4), Value::Nil).unwrap();
        assert_eq!(t.length(), 3);
        // a hole keeps some valid border
        t.raw_set(TableKey::Integer(2), Value::Nil).unwrap();
        let n = t.length();
        assert!(n == 1 || n == 3, "any border is acceptable, got {}", n);
    }

    #[test]
    fn test_non_integer_keys_live_in_hash() {
        let mut t = TableObject::new();
        t.raw_set(TableKey::Bool(true), int(1)).unwrap();
        t.raw_set(TableKey::Integer(-5), int(2)).unwrap();
        assert_eq!(t.raw_get(&TableKey::Bool(true)), int(1));
        assert_eq!(t.raw_get(&TableKey::Integer(-5)), int(2));
        assert_eq!(t.length(), 0);
    }

    #[test]
    fn test_read_only_rejected() {
        let mut t = TableObject::new();
        t.raw_set(TableKey::Integer(1), int(1)).unwrap();
        t.set_read_only(true);
        assert_eq!(
            t.raw_set(TableKey::Integer(1), int(2)),
            Err(PolicyError::ReadOnlyTableWrite)
        );
        assert_eq!(t.raw_get(&TableKey::Integer(1)), int(1));
    }

    #[test]
    fn test_next_entry_traversal() {
        let mut t = TableObject::new();
        t.raw_set(TableKey::Integer(1), int(10)).unwrap();
        t.raw_set(TableKey::Integer(2), int(20)).unwrap();
        t.raw_set(TableKey::Bool(false), int(30)).unwrap();

        let mut seen = Vec::new();
        let mut key = None;
        while let Some((k, v)) = t.next_entry(key.as_ref()) {
            seen.push((k, v));
            key = Some(k);
        }
        assert_eq!(
            seen,
            vec![
                (TableKey::Integer(1), int(10)),
                (TableKey::Integer(2), int(20)),
                (TableKey::Bool(false), int(30)),
            ]
        );
    }
}
