//! Open-addressed hash table keyed by `Value`
//!
//! Linear probing, 75% max load, power-of-two capacities. A never-used slot
//! is `key = Empty, value = Nil`; a tombstone is `key = Empty, value = true`
//! and keeps probe chains intact until the next resize drops it. Tables back
//! globals, instance fields, dict entries, method tables, and the VM-wide
//! string-intern set (via `find_string`).

use crate::heap::Objects;
use crate::object::{ObjKind, ObjRef};
use crate::value::Value;

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

/// FNV-1a, the same hash precomputed on interned strings.
pub fn hash_str(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

fn hash_bits(bits: u64) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in bits.to_le_bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Hash a key. Strings use their precomputed content hash, so two interned
/// values of equal content always land on the same probe chain; every other
/// object hashes by identity.
pub fn hash_value(objects: &Objects, value: Value) -> u32 {
    match value {
        Value::Nil => 7,
        Value::Bool(true) => 3,
        Value::Bool(false) => 5,
        Value::Empty => 0,
        Value::Number(n) => {
            // Normalise -0.0 so it shares a slot with 0.0.
            let n = if n == 0.0 { 0.0 } else { n };
            hash_bits(n.to_bits())
        }
        Value::Obj(r) | Value::Error(r) => match &objects.get(r).kind {
            ObjKind::String(s) => s.hash,
            _ => hash_bits(r.index() as u64),
        },
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Value,
    value: Value,
}

impl Entry {
    const FREE: Entry = Entry {
        key: Value::Empty,
        value: Value::Nil,
    };

    fn is_tombstone(&self) -> bool {
        matches!(self.key, Value::Empty) && !matches!(self.value, Value::Nil)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<Entry>,
    /// Occupied slots including tombstones (drives the load factor)
    count: usize,
    /// Live entries only
    live: usize,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn find_slot(entries: &[Entry], objects: &Objects, key: Value) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash_value(objects, key) as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if matches!(entry.key, Value::Empty) {
                if entry.is_tombstone() {
                    tombstone.get_or_insert(index);
                } else {
                    return tombstone.unwrap_or(index);
                }
            } else if entry.key == key {
                return index;
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self, objects: &Objects) {
        let capacity = if self.entries.len() < 8 {
            8
        } else {
            self.entries.len() * 2
        };
        let old = std::mem::replace(&mut self.entries, vec![Entry::FREE; capacity]);
        self.count = 0;
        for entry in old {
            if !matches!(entry.key, Value::Empty) {
                let slot = Self::find_slot(&self.entries, objects, entry.key);
                self.entries[slot] = entry;
                self.count += 1;
            }
        }
    }

    /// Insert or overwrite. Returns true when the key was not present.
    pub fn set(&mut self, objects: &Objects, key: Value, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            self.grow(objects);
        }
        let slot = Self::find_slot(&self.entries, objects, key);
        let entry = &mut self.entries[slot];
        let is_new = matches!(entry.key, Value::Empty);
        if is_new {
            // Reusing a tombstone does not raise the load.
            if !entry.is_tombstone() {
                self.count += 1;
            }
            self.live += 1;
        }
        *entry = Entry { key, value };
        is_new
    }

    pub fn get(&self, objects: &Objects, key: Value) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let slot = Self::find_slot(&self.entries, objects, key);
        let entry = &self.entries[slot];
        if matches!(entry.key, Value::Empty) {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Remove a key, leaving a tombstone. Returns true if it was present.
    pub fn delete(&mut self, objects: &Objects, key: Value) -> bool {
        if self.count == 0 {
            return false;
        }
        let slot = Self::find_slot(&self.entries, objects, key);
        let entry = &mut self.entries[slot];
        if matches!(entry.key, Value::Empty) {
            return false;
        }
        *entry = Entry {
            key: Value::Empty,
            value: Value::Bool(true),
        };
        self.live -= 1;
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.count = 0;
        self.live = 0;
    }

    /// Live entries, in slot order. Slot order is also the dict visitation
    /// order exposed through `__index__`; it is deliberately unspecified to
    /// the language.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !matches!(e.key, Value::Empty))
            .map(|e| (e.key, e.value))
    }

    /// Content-addressed probe used for string interning: find an existing
    /// string object with these exact bytes.
    pub fn find_string(&self, objects: &Objects, chars: &str, hash: u32) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            if matches!(entry.key, Value::Empty) {
                if !entry.is_tombstone() {
                    return None;
                }
            } else if let Value::Obj(r) = entry.key
                && let ObjKind::String(s) = &objects.get(r).kind
                && s.hash == hash
                && &*s.chars == chars
            {
                return Some(r);
            }
            index = (index + 1) & mask;
        }
    }

    /// Drop entries whose key object did not survive the current mark phase.
    /// Run on the intern set between trace and sweep so no interned string
    /// dangles.
    pub fn remove_white(&mut self, objects: &Objects, live_mark: bool) {
        for entry in &mut self.entries {
            if let Value::Obj(r) = entry.key
                && objects.get(r).marked != live_mark
            {
                *entry = Entry {
                    key: Value::Empty,
                    value: Value::Bool(true),
                };
                self.live -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn test_set_get_overwrite() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let key = Value::Obj(heap.intern("answer"));
        assert!(table.set(&heap.objects, key, Value::Number(41.0)));
        assert!(!table.set(&heap.objects, key, Value::Number(42.0)));
        assert_eq!(table.get(&heap.objects, key), Some(Value::Number(42.0)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_delete_leaves_probe_chain_intact() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        let keys: Vec<Value> = (0..32)
            .map(|i| Value::Obj(heap.intern(&format!("k{i}"))))
            .collect();
        for (i, key) in keys.iter().enumerate() {
            table.set(&heap.objects, *key, Value::Number(i as f64));
        }
        assert!(table.delete(&heap.objects, keys[7]));
        assert!(!table.delete(&heap.objects, keys[7]));
        assert_eq!(table.get(&heap.objects, keys[7]), None);
        // Every other key is still reachable through the tombstone.
        for (i, key) in keys.iter().enumerate() {
            if i != 7 {
                assert_eq!(table.get(&heap.objects, *key), Some(Value::Number(i as f64)));
            }
        }
        assert_eq!(table.len(), 31);
    }

    #[test]
    fn test_number_and_bool_keys() {
        let heap = Heap::new();
        let mut table = Table::new();
        table.set(&heap.objects, Value::Number(1.0), Value::Bool(true));
        table.set(&heap.objects, Value::Number(-0.0), Value::Nil);
        table.set(&heap.objects, Value::Bool(false), Value::Number(9.0));
        // -0.0 == 0.0, so it must collide with an existing 0.0 key.
        assert_eq!(table.get(&heap.objects, Value::Number(0.0)), Some(Value::Nil));
        assert_eq!(
            table.get(&heap.objects, Value::Bool(false)),
            Some(Value::Number(9.0))
        );
    }

    #[test]
    fn test_find_string_matches_content() {
        let mut heap = Heap::new();
        let r = heap.intern("needle");
        let hash = hash_str("needle");
        let found = heap.strings.find_string(&heap.objects, "needle", hash);
        assert_eq!(found, Some(r));
        assert_eq!(heap.strings.find_string(&heap.objects, "missing", hash_str("missing")), None);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut heap = Heap::new();
        let mut table = Table::new();
        for i in 0..200 {
            table.set(&heap.objects, Value::Number(i as f64), Value::Number(-(i as f64)));
        }
        assert_eq!(table.len(), 200);
        for i in 0..200 {
            assert_eq!(
                table.get(&heap.objects, Value::Number(i as f64)),
                Some(Value::Number(-(i as f64)))
            );
        }
    }
}
