//! Attribute tables.
//!
//! A [`NameDict`] maps interned names to values and backs every namespace
//! in the VM: instance storage, class namespaces, and module globals. It
//! is a flat open-addressed table with linear probing; the interned id is
//! already a well-distributed small integer, so hashing is a single
//! Fibonacci multiply. Deletion uses backward shifting rather than
//! tombstones, which keeps probe chains short on the churn-heavy module
//! namespaces.

use crate::intern::Name;
use crate::value::Value;

const INITIAL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy)]
struct Entry {
    name: Name,
    value: Value,
}

#[derive(Debug, Clone, Default)]
pub struct NameDict {
    // Length is always zero or a power of two.
    slots: Vec<Option<Entry>>,
    len: usize,
}

#[inline]
fn slot_of(name: Name, mask: usize) -> usize {
    // Fibonacci hashing of the interned id.
    (name.id().wrapping_mul(0x9e37_79b9) as usize) & mask
}

impl NameDict {
    /// Creates an empty table. No storage is allocated until the first
    /// insert, so value kinds that never grow attributes pay nothing.
    pub fn new() -> NameDict {
        NameDict {
            slots: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, name: Name) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.slots.len() - 1;
        let mut i = slot_of(name, mask);
        loop {
            match &self.slots[i] {
                None => return None,
                Some(e) if e.name == name => return Some(e.value),
                Some(_) => i = (i + 1) & mask,
            }
        }
    }

    pub fn contains(&self, name: Name) -> bool {
        self.get(name).is_some()
    }

    /// Inserts or overwrites `name`, returning the previous value if any.
    pub fn insert(&mut self, name: Name, value: Value) -> Option<Value> {
        if self.slots.is_empty() {
            self.slots.resize(INITIAL_CAPACITY, None);
        } else if (self.len + 1) * 4 > self.slots.len() * 3 {
            self.grow();
        }
        let mask = self.slots.len() - 1;
        let mut i = slot_of(name, mask);
        loop {
            match self.slots[i] {
                None => {
                    self.slots[i] = Some(Entry { name, value });
                    self.len += 1;
                    return None;
                }
                Some(e) if e.name == name => {
                    self.slots[i] = Some(Entry { name, value });
                    return Some(e.value);
                }
                Some(_) => i = (i + 1) & mask,
            }
        }
    }

    /// Removes `name` and backward-shifts the probe chain so that lookups
    /// never have to step over tombstones.
    pub fn remove(&mut self, name: Name) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.slots.len() - 1;
        let mut i = slot_of(name, mask);
        loop {
            match &self.slots[i] {
                None => return None,
                Some(e) if e.name == name => break,
                Some(_) => i = (i + 1) & mask,
            }
        }
        let removed = self.slots[i].take().map(|e| e.value);
        self.len -= 1;
        // Shift any displaced successors back into the hole.
        let mut hole = i;
        let mut j = (i + 1) & mask;
        while let Some(e) = self.slots[j] {
            let home = slot_of(e.name, mask);
            // `e` may move into the hole only if the hole does not sit
            // between its home slot and its current slot.
            let between = if hole <= j {
                home > hole && home <= j
            } else {
                home > hole || home <= j
            };
            if !between {
                self.slots[hole] = Some(e);
                self.slots[j] = None;
                hole = j;
            }
            j = (j + 1) & mask;
        }
        removed
    }

    fn grow(&mut self) {
        let new_len = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![None; new_len]);
        let mask = self.slots.len() - 1;
        for entry in old.into_iter().flatten() {
            let mut i = slot_of(entry.name, mask);
            while self.slots[i].is_some() {
                i = (i + 1) & mask;
            }
            self.slots[i] = Some(entry);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Name, Value)> + '_ {
        self.slots.iter().flatten().map(|e| (e.name, e.value))
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.slots.iter().flatten().map(|e| e.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(s: &str) -> Name {
        Name::intern(s)
    }

    #[test]
    fn test_insert_get_overwrite() {
        let mut d = NameDict::new();
        assert_eq!(d.insert(n("x"), Value::Int(1)), None);
        assert_eq!(d.insert(n("y"), Value::Int(2)), None);
        assert_eq!(d.get(n("x")), Some(Value::Int(1)));
        assert_eq!(d.insert(n("x"), Value::Int(9)), Some(Value::Int(1)));
        assert_eq!(d.get(n("x")), Some(Value::Int(9)));
        assert_eq!(d.len(), 2);
    }

    #[test]
    fn test_missing_name() {
        let d = NameDict::new();
        assert_eq!(d.get(n("absent")), None);
        let mut d = NameDict::new();
        d.insert(n("present"), Value::None);
        assert_eq!(d.get(n("absent_too")), None);
    }

    #[test]
    fn test_remove_and_backward_shift() {
        let mut d = NameDict::new();
        let names: Vec<Name> = (0..32).map(|i| n(&format!("attr_{i}"))).collect();
        for (i, &name) in names.iter().enumerate() {
            d.insert(name, Value::Int(i as i64));
        }
        // Remove every other entry, then verify the survivors still probe
        // correctly through the shifted chains.
        for (i, &name) in names.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(d.remove(name), Some(Value::Int(i as i64)));
            }
        }
        for (i, &name) in names.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(d.get(name), None);
            } else {
                assert_eq!(d.get(name), Some(Value::Int(i as i64)));
            }
        }
        assert_eq!(d.len(), 16);
    }

    #[test]
    fn test_growth_preserves_entries() {
        let mut d = NameDict::new();
        let names: Vec<Name> = (0..200).map(|i| n(&format!("g_{i}"))).collect();
        for (i, &name) in names.iter().enumerate() {
            d.insert(name, Value::Int(i as i64));
        }
        assert_eq!(d.len(), 200);
        for (i, &name) in names.iter().enumerate() {
            assert_eq!(d.get(name), Some(Value::Int(i as i64)));
        }
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut d = NameDict::new();
        d.insert(n("kept"), Value::Int(1));
        assert_eq!(d.remove(n("never_there")), None);
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_iter_sees_all_entries() {
        let mut d = NameDict::new();
        d.insert(n("a"), Value::Int(1));
        d.insert(n("b"), Value::Int(2));
        let mut pairs: Vec<(String, i64)> = d
            .iter()
            .map(|(name, v)| (name.to_string(), v.as_int().unwrap()))
            .collect();
        pairs.sort();
        assert_eq!(pairs, vec![("a".into(), 1), ("b".into(), 2)]);
    }
}
